use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

use crate::errors::{DomainError, DomainResult, ValidationError};
use crate::types::{parse_optional_timestamp, parse_timestamp};

/// Lifecycle of a whole upload session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Started,
    Pending,
    Validating,
    Valid,
    Error,
    Reviewing,
    Done,
    Canceled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Started => "STARTED",
            SessionStatus::Pending => "PENDING",
            SessionStatus::Validating => "VALIDATING",
            SessionStatus::Valid => "VALID",
            SessionStatus::Error => "ERROR",
            SessionStatus::Reviewing => "REVIEWING",
            SessionStatus::Done => "DONE",
            SessionStatus::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Done | SessionStatus::Canceled)
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        if *self == next {
            return !self.is_terminal();
        }
        match (self, next) {
            (Done, _) | (Canceled, _) => false,
            (_, Canceled) => true,
            (Started, Pending) | (Started, Validating) => true,
            (Pending, Validating) => true,
            (Validating, Valid) | (Validating, Error) | (Validating, Pending) => true,
            (Valid, Reviewing) | (Valid, Validating) | (Valid, Pending) => true,
            // Errors that are all allowable may still be reviewed
            (Error, Validating) | (Error, Pending) | (Error, Reviewing) => true,
            // Reset sends a session under review back to matching
            (Reviewing, Done) | (Reviewing, Pending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTED" => Ok(SessionStatus::Started),
            "PENDING" => Ok(SessionStatus::Pending),
            "VALIDATING" => Ok(SessionStatus::Validating),
            "VALID" => Ok(SessionStatus::Valid),
            "ERROR" => Ok(SessionStatus::Error),
            "REVIEWING" => Ok(SessionStatus::Reviewing),
            "DONE" => Ok(SessionStatus::Done),
            "CANCELED" => Ok(SessionStatus::Canceled),
            other => Err(DomainError::Validation(ValidationError::invalid_value(
                "status",
                &format!("unknown session status '{}'", other),
            ))),
        }
    }
}

/// Lifecycle of one country's unit of work. `New` is stored as the empty string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UploadStatus {
    #[serde(rename = "")]
    New,
    #[serde(rename = "STARTED")]
    Started,
    #[serde(rename = "PROCESSING")]
    Processing,
    #[serde(rename = "VALID")]
    Valid,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "REVIEWING")]
    Reviewing,
    #[serde(rename = "APPROVED")]
    Approved,
    #[serde(rename = "REJECTED")]
    Rejected,
    #[serde(rename = "CANCELED")]
    Canceled,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::New => "",
            UploadStatus::Started => "STARTED",
            UploadStatus::Processing => "PROCESSING",
            UploadStatus::Valid => "VALID",
            UploadStatus::Error => "ERROR",
            UploadStatus::Reviewing => "REVIEWING",
            UploadStatus::Approved => "APPROVED",
            UploadStatus::Rejected => "REJECTED",
            UploadStatus::Canceled => "CANCELED",
        }
    }

    /// Decided uploads no longer hold their session open
    pub fn is_decided(&self) -> bool {
        matches!(self, UploadStatus::Approved | UploadStatus::Rejected | UploadStatus::Canceled)
    }

    /// Transitions driven by submission, validation and review. Resetting a
    /// session blanks uploads outside this table.
    pub fn can_transition_to(&self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        match (self, next) {
            // (Re)submission supersedes any in-flight job
            (New, Started) | (Error, Started) | (Started, Started) | (Processing, Started) | (Valid, Started) => true,
            (Started, Processing) | (Started, Valid) | (Started, Error) => true,
            (Processing, Valid) | (Processing, Error) => true,
            // ERROR is only promoted when importable with warnings or by a superuser
            (Valid, Reviewing) | (Error, Reviewing) => true,
            (Reviewing, Approved) | (Reviewing, Rejected) => true,
            (Approved, Canceled) | (Canceled, Canceled) => false,
            (_, Canceled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(UploadStatus::New),
            "STARTED" => Ok(UploadStatus::Started),
            "PROCESSING" => Ok(UploadStatus::Processing),
            "VALID" => Ok(UploadStatus::Valid),
            "ERROR" => Ok(UploadStatus::Error),
            "REVIEWING" => Ok(UploadStatus::Reviewing),
            "APPROVED" => Ok(UploadStatus::Approved),
            "REJECTED" => Ok(UploadStatus::Rejected),
            "CANCELED" => Ok(UploadStatus::Canceled),
            other => Err(DomainError::Validation(ValidationError::invalid_value(
                "status",
                &format!("unknown upload status '{}'", other),
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerUploadSession {
    pub id: i64,
    pub dataset_id: i64,
    pub status: SessionStatus,
    pub auto_matched_parent_ready: bool,
    pub is_historical_upload: bool,
    pub started_at: DateTime<Utc>,
    pub historical_start_date: Option<DateTime<Utc>>,
    pub historical_end_date: Option<DateTime<Utc>>,
    pub task_id: Option<String>,
    pub progress: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl LayerUploadSession {
    /// Validity window applied to every entity created by the session
    pub fn entity_dates(&self) -> (DateTime<Utc>, Option<DateTime<Utc>>) {
        if self.is_historical_upload {
            (self.historical_start_date.unwrap_or(self.started_at), self.historical_end_date)
        } else {
            (self.started_at, None)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewLayerUploadSession {
    pub dataset_id: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub is_historical_upload: bool,
    pub historical_start_date: Option<DateTime<Utc>>,
    pub historical_end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct LayerUploadSessionRow {
    pub id: i64,
    pub dataset_id: i64,
    pub status: String,
    pub auto_matched_parent_ready: i64,
    pub is_historical_upload: i64,
    pub started_at: String,
    pub historical_start_date: Option<String>,
    pub historical_end_date: Option<String>,
    pub task_id: Option<String>,
    pub progress: Option<String>,
    pub updated_at: String,
}

impl LayerUploadSessionRow {
    pub fn into_entity(self) -> DomainResult<LayerUploadSession> {
        Ok(LayerUploadSession {
            id: self.id,
            dataset_id: self.dataset_id,
            status: SessionStatus::from_str(&self.status)?,
            auto_matched_parent_ready: self.auto_matched_parent_ready != 0,
            is_historical_upload: self.is_historical_upload != 0,
            started_at: parse_timestamp(&self.started_at, "started_at")?,
            historical_start_date: parse_optional_timestamp(&self.historical_start_date, "historical_start_date")?,
            historical_end_date: parse_optional_timestamp(&self.historical_end_date, "historical_end_date")?,
            task_id: self.task_id.filter(|t| !t.is_empty()),
            progress: self.progress,
            updated_at: parse_timestamp(&self.updated_at, "updated_at")?,
        })
    }
}

/// Per-country unit of work inside a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityUploadStatus {
    pub id: i64,
    pub session_id: i64,
    /// Approved root entity this upload revises; `None` for a new country
    pub original_geographical_entity_id: Option<i64>,
    pub revised_entity_id: Option<String>,
    pub revised_entity_name: Option<String>,
    pub max_level: Option<i64>,
    pub status: UploadStatus,
    /// Per-level error counts, as written by validation
    pub summaries: Option<Value>,
    pub error_report: Option<String>,
    pub logs: String,
    pub progress: Option<String>,
    pub task_id: Option<String>,
    pub revision_number: Option<i64>,
    pub unique_code_version: Option<f64>,
    pub admin_level_names: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewEntityUpload {
    pub session_id: i64,
    pub original_geographical_entity_id: Option<i64>,
    pub revised_entity_id: Option<String>,
    pub revised_entity_name: Option<String>,
    pub max_level: Option<i64>,
}

#[derive(Debug, Clone, FromRow)]
pub struct EntityUploadStatusRow {
    pub id: i64,
    pub session_id: i64,
    pub original_geographical_entity_id: Option<i64>,
    pub revised_entity_id: Option<String>,
    pub revised_entity_name: Option<String>,
    pub max_level: Option<i64>,
    pub status: String,
    pub summaries: Option<String>,
    pub error_report: Option<String>,
    pub logs: String,
    pub progress: Option<String>,
    pub task_id: Option<String>,
    pub revision_number: Option<i64>,
    pub unique_code_version: Option<f64>,
    pub admin_level_names: Option<String>,
    pub updated_at: String,
}

impl EntityUploadStatusRow {
    pub fn into_entity(self) -> DomainResult<EntityUploadStatus> {
        let parse_json = |text: Option<String>| -> DomainResult<Option<Value>> {
            match text.filter(|t| !t.is_empty()) {
                Some(t) => Ok(Some(serde_json::from_str(&t)?)),
                None => Ok(None),
            }
        };
        Ok(EntityUploadStatus {
            id: self.id,
            session_id: self.session_id,
            original_geographical_entity_id: self.original_geographical_entity_id,
            revised_entity_id: self.revised_entity_id,
            revised_entity_name: self.revised_entity_name,
            max_level: self.max_level,
            status: UploadStatus::from_str(&self.status)?,
            summaries: parse_json(self.summaries)?,
            error_report: self.error_report.filter(|p| !p.is_empty()),
            logs: self.logs,
            progress: self.progress,
            task_id: self.task_id.filter(|t| !t.is_empty()),
            revision_number: self.revision_number,
            unique_code_version: self.unique_code_version,
            admin_level_names: parse_json(self.admin_level_names)?,
            updated_at: parse_timestamp(&self.updated_at, "updated_at")?,
        })
    }
}

/// Level-1 entity recorded during parent matching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct EntityUploadChildLv1 {
    pub id: i64,
    pub entity_upload_id: i64,
    pub entity_id: String,
    pub entity_name: Option<String>,
    /// Level-0 code this child now belongs to
    pub parent_entity_id: Option<String>,
    /// True when the child moved away from the parent declared in its layer
    pub is_parent_rematched: bool,
}

#[derive(Debug, Clone, Default)]
pub struct NewEntityUploadChildLv1 {
    pub entity_upload_id: i64,
    pub entity_id: String,
    pub entity_name: Option<String>,
    pub parent_entity_id: Option<String>,
    pub is_parent_rematched: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SessionActionLog {
    pub id: i64,
    pub session_id: i64,
    pub action: String,
    pub state_from: String,
    pub state_to: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EntityUploadStatusLog {
    pub id: i64,
    pub entity_upload_id: Option<i64>,
    pub session_id: Option<i64>,
    pub parent_log_id: Option<i64>,
    pub logs: String,
    pub created_at: String,
}
