use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::domains::entity::geometry::{BoundingBox, Geometry};
use crate::errors::{DomainError, DomainResult};
use crate::types::{parse_optional_timestamp, parse_timestamp, parse_uuid};

/// One boundary feature of one revision.
///
/// `uuid` is the concept identity shared across revisions, `uuid_revision`
/// identifies this particular row. Parent and ancestor are plain row ids of
/// entities in the same revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeographicalEntity {
    pub id: i64,
    pub uuid: Uuid,
    pub uuid_revision: Uuid,
    pub internal_code: Option<String>,
    pub unique_code: Option<String>,
    pub unique_code_version: Option<f64>,
    pub label: Option<String>,
    pub level: i64,
    pub geometry: Option<Value>,
    pub simplified_geometry: Option<Value>,
    pub bbox: Option<BoundingBox>,
    pub revision_number: i64,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    /// `None` while pending review
    pub is_approved: Option<bool>,
    pub is_latest: bool,
    pub privacy_level: i64,
    pub parent_id: Option<i64>,
    pub ancestor_id: Option<i64>,
    pub dataset_id: i64,
    pub layer_file_id: Option<i64>,
    pub entity_upload_id: Option<i64>,
    pub boundary_type: Option<String>,
    /// Parent reference as read from the layer file
    pub parent_code: Option<String>,
    pub admin_level_name: Option<String>,
}

impl GeographicalEntity {
    pub fn parsed_geometry(&self) -> Option<Geometry> {
        self.geometry.as_ref().and_then(|g| Geometry::from_geojson(g).ok())
    }
}

/// Attributes of a feature accepted by validation
#[derive(Debug, Clone)]
pub struct NewGeographicalEntity {
    pub uuid: Uuid,
    pub revision_number: i64,
    pub level: i64,
    pub dataset_id: i64,
    pub layer_file_id: Option<i64>,
    pub entity_upload_id: Option<i64>,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub boundary_type: Option<String>,
    pub label: String,
    pub internal_code: String,
    pub geometry: Value,
    pub privacy_level: i64,
    pub parent_code: Option<String>,
    pub admin_level_name: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct GeographicalEntityRow {
    pub id: i64,
    pub uuid: String,
    pub uuid_revision: String,
    pub internal_code: Option<String>,
    pub unique_code: Option<String>,
    pub unique_code_version: Option<f64>,
    pub label: Option<String>,
    pub level: i64,
    pub geometry: Option<String>,
    pub simplified_geometry: Option<String>,
    pub bbox: Option<String>,
    pub revision_number: i64,
    pub start_date: String,
    pub end_date: Option<String>,
    pub is_approved: Option<i64>,
    pub is_latest: i64,
    pub privacy_level: i64,
    pub parent_id: Option<i64>,
    pub ancestor_id: Option<i64>,
    pub dataset_id: i64,
    pub layer_file_id: Option<i64>,
    pub entity_upload_id: Option<i64>,
    pub boundary_type: Option<String>,
    pub parent_code: Option<String>,
    pub admin_level_name: Option<String>,
}

fn parse_optional_json<T: serde::de::DeserializeOwned>(value: &Option<String>) -> DomainResult<Option<T>> {
    value
        .as_deref()
        .map(|text| serde_json::from_str(text).map_err(DomainError::from))
        .transpose()
}

impl GeographicalEntityRow {
    pub fn into_entity(self) -> DomainResult<GeographicalEntity> {
        Ok(GeographicalEntity {
            id: self.id,
            uuid: parse_uuid(&self.uuid, "uuid")?,
            uuid_revision: parse_uuid(&self.uuid_revision, "uuid_revision")?,
            internal_code: self.internal_code,
            unique_code: self.unique_code,
            unique_code_version: self.unique_code_version,
            label: self.label,
            level: self.level,
            geometry: parse_optional_json(&self.geometry)?,
            simplified_geometry: parse_optional_json(&self.simplified_geometry)?,
            bbox: parse_optional_json(&self.bbox)?,
            revision_number: self.revision_number,
            start_date: parse_timestamp(&self.start_date, "start_date")?,
            end_date: parse_optional_timestamp(&self.end_date, "end_date")?,
            is_approved: self.is_approved.map(|v| v != 0),
            is_latest: self.is_latest != 0,
            privacy_level: self.privacy_level,
            parent_id: self.parent_id,
            ancestor_id: self.ancestor_id,
            dataset_id: self.dataset_id,
            layer_file_id: self.layer_file_id,
            entity_upload_id: self.entity_upload_id,
            boundary_type: self.boundary_type,
            parent_code: self.parent_code,
            admin_level_name: self.admin_level_name,
        })
    }
}

/// Nearest approved entity in time, used to place a new revision's version
#[derive(Debug, Clone, FromRow)]
pub struct ApprovedNeighbor {
    pub id: i64,
    pub start_date: String,
    pub unique_code_version: Option<f64>,
}

/// Approved, latest entity of a prior revision that a new entity may continue
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub id: i64,
    pub uuid: Uuid,
    pub unique_code: Option<String>,
    pub internal_code: Option<String>,
    pub parent_uuid: Option<Uuid>,
    pub geometry: Option<Geometry>,
}

#[derive(Debug, Clone, FromRow)]
pub struct MatchCandidateRow {
    pub id: i64,
    pub uuid: String,
    pub unique_code: Option<String>,
    pub internal_code: Option<String>,
    pub parent_uuid: Option<String>,
    pub geometry: Option<String>,
}

impl MatchCandidateRow {
    pub fn into_candidate(self) -> DomainResult<MatchCandidate> {
        let geometry = match self.geometry.as_deref() {
            Some(text) => Some(Geometry::from_geojson_str(text)?),
            None => None,
        };
        Ok(MatchCandidate {
            id: self.id,
            uuid: parse_uuid(&self.uuid, "uuid")?,
            unique_code: self.unique_code,
            internal_code: self.internal_code,
            parent_uuid: self.parent_uuid.as_deref().map(|u| parse_uuid(u, "parent_uuid")).transpose()?,
            geometry,
        })
    }
}

/// Typed external identifier attached to an entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EntityId {
    pub id: i64,
    pub geographical_entity_id: i64,
    pub id_type_id: i64,
    pub value: String,
    pub is_default: bool,
}

/// Localized name attached to an entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EntityName {
    pub id: i64,
    pub geographical_entity_id: i64,
    pub name: String,
    pub language_id: Option<i64>,
    pub is_default: bool,
    pub idx: i64,
}
