use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domains::layer::reader::FeatureReader;
use crate::domains::layer::types::LayerFile;
use crate::domains::upload::types::{LayerUploadSession, SessionStatus};
use crate::errors::DomainResult;

const UNKNOWN_COUNTRY: &str = "Unknown";

/// Candidate key as sent by clients: an existing entity id or a generated uuid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CandidateKey {
    Id(i64),
    Key(String),
}

/// One country the uploader chose to submit for validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryUploadRequest {
    pub id: CandidateKey,
    #[serde(default)]
    pub layer0_id: Option<String>,
    /// Approved root entity being revised; `None` for a new country
    #[serde(default)]
    pub country_entity_id: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_level")]
    pub max_level: Option<i64>,
    #[serde(default)]
    pub country: Option<String>,
    pub upload_id: i64,
    #[serde(default)]
    pub admin_level_names: Option<Value>,
}

/// Levels arrive either as numbers or as numeric strings
fn deserialize_level<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid level {}", n))),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid level '{}'", s))),
        Some(other) => Err(serde::de::Error::custom(format!("invalid level {}", other))),
    }
}

/// Country offered to the uploader, one per level-0 feature
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountryCandidate {
    pub id: String,
    pub country: String,
    pub layer0_id: Option<String>,
    pub country_entity_id: Option<i64>,
    pub layer0_file: String,
    pub revision: Option<i64>,
    pub max_level: Option<i64>,
}

/// List the countries found in the session's level-0 layer. Canceled
/// sessions and sessions without a level-0 file have none.
pub fn retrieve_layer0_default_codes(
    session: &LayerUploadSession,
    layer0: Option<&LayerFile>,
    reader: &dyn FeatureReader,
    default_max_level: Option<i64>,
) -> DomainResult<Vec<CountryCandidate>> {
    if session.status == SessionStatus::Canceled {
        return Ok(Vec::new());
    }
    let Some(layer0) = layer0.filter(|l| l.level == 0) else {
        return Ok(Vec::new());
    };

    let id_field = layer0.default_id_field();
    let name_field = layer0.default_name_field();
    let features = reader.read(&layer0.source())?;

    let candidates = features
        .iter()
        .map(|feature| CountryCandidate {
            id: Uuid::new_v4().to_string(),
            country: name_field
                .and_then(|f| feature.value_of(f))
                .unwrap_or_else(|| UNKNOWN_COUNTRY.to_string()),
            layer0_id: id_field.and_then(|f| feature.value_of(f)),
            country_entity_id: None,
            layer0_file: layer0.file_name().to_string(),
            revision: None,
            max_level: default_max_level,
        })
        .collect::<Vec<_>>();

    log::debug!("session {}: {} country candidates in {}", session.id, candidates.len(), layer0.path);
    Ok(candidates)
}
