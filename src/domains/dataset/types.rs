use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use chrono::{DateTime, Utc};

use crate::errors::{DomainError, DomainResult, ValidationError};
use crate::types::parse_timestamp;
use crate::validation::{Validate, ValidationBuilder};

/// A versioned boundary dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: i64,
    pub label: String,
    pub min_privacy_level: i64,
    pub max_privacy_level: i64,
    pub created_at: DateTime<Utc>,
}

impl Dataset {
    /// Raise a privacy level below the dataset floor up to it.
    pub fn clamp_privacy_level(&self, level: i64) -> i64 {
        level.max(self.min_privacy_level)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDataset {
    pub label: String,
    pub min_privacy_level: i64,
    pub max_privacy_level: i64,
}

impl Validate for NewDataset {
    fn validate(&self) -> DomainResult<()> {
        ValidationBuilder::new("label", Some(self.label.clone()))
            .required()
            .not_blank()
            .validate()?;
        ValidationBuilder::new("min_privacy_level", Some(self.min_privacy_level))
            .range(1, 4)
            .validate()?;
        ValidationBuilder::new("max_privacy_level", Some(self.max_privacy_level))
            .range(1, 4)
            .validate()?;
        if self.min_privacy_level > self.max_privacy_level {
            return Err(DomainError::Validation(ValidationError::custom(
                "min_privacy_level cannot exceed max_privacy_level",
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DatasetRow {
    pub id: i64,
    pub label: String,
    pub min_privacy_level: i64,
    pub max_privacy_level: i64,
    pub created_at: String,
}

impl DatasetRow {
    pub fn into_entity(self) -> DomainResult<Dataset> {
        Ok(Dataset {
            id: self.id,
            label: self.label,
            min_privacy_level: self.min_privacy_level,
            max_privacy_level: self.max_privacy_level,
            created_at: parse_timestamp(&self.created_at, "created_at")?,
        })
    }
}

/// Dataset-scoped mapping from a raw feature value to a boundary type label
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BoundaryType {
    pub id: i64,
    pub dataset_id: i64,
    pub value: String,
    pub type_label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IdType {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Language {
    pub id: i64,
    pub code: String,
    pub name: Option<String>,
    pub order_idx: i64,
}
