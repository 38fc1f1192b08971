use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{DomainError, DomainResult, ValidationError};

/// Timestamps are stored as fixed-width RFC3339 text so that lexical
/// comparison in SQL matches chronological order.
pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str, field_name: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| DomainError::Validation(ValidationError::format(
            field_name,
            &format!("Invalid RFC3339 format: {}", value),
        )))
}

pub fn parse_optional_timestamp(value: &Option<String>, field_name: &str) -> DomainResult<Option<DateTime<Utc>>> {
    value.as_deref().map(|v| parse_timestamp(v, field_name)).transpose()
}

pub fn parse_uuid(value: &str, field_name: &str) -> DomainResult<Uuid> {
    Uuid::parse_str(value).map_err(|_| DomainError::Validation(ValidationError::format(
        field_name,
        &format!("Invalid UUID format: {}", value),
    )))
}

/// Size of the keyset pages used when walking large entity sets.
pub const DEFAULT_CHUNK_SIZE: i64 = 200;

/// Keyset cursor over integer primary keys (`WHERE id > ? ORDER BY id LIMIT ?`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkCursor {
    pub after_id: i64,
    pub limit: i64,
}

impl ChunkCursor {
    pub fn start(limit: i64) -> Self {
        Self { after_id: 0, limit: limit.max(1) }
    }

    /// Move past the last id of a page. Returns false once the page was short,
    /// meaning the walk is finished.
    pub fn advance(&mut self, last_id: Option<i64>, page_len: usize) -> bool {
        match last_id {
            Some(id) => {
                self.after_id = id;
                page_len as i64 >= self.limit
            }
            None => false,
        }
    }
}

impl Default for ChunkCursor {
    fn default() -> Self {
        Self::start(DEFAULT_CHUNK_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_ordering_is_lexical() {
        let earlier = Utc.with_ymd_and_hms(2023, 1, 9, 8, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2023, 10, 1, 0, 0, 0).unwrap();
        assert!(format_timestamp(&earlier) < format_timestamp(&later));
        let parsed = parse_timestamp(&format_timestamp(&later), "started_at").unwrap();
        assert_eq!(parsed, later);
    }

    #[test]
    fn test_parse_timestamp_rejects_garbage() {
        assert!(parse_timestamp("yesterday", "start_date").is_err());
        assert!(parse_optional_timestamp(&None, "end_date").unwrap().is_none());
    }

    #[test]
    fn test_chunk_cursor() {
        let mut cursor = ChunkCursor::start(2);
        assert!(cursor.advance(Some(5), 2));
        assert_eq!(cursor.after_id, 5);
        assert!(!cursor.advance(Some(9), 1));
        assert!(!cursor.advance(None, 0));
    }
}
