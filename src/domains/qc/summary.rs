use std::collections::BTreeMap;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::domains::qc::error_type::ErrorType;
use crate::errors::{DomainError, DomainResult};

pub const LEVEL_KEY: &str = "Level";
pub const BOUNDARY_LINES_KEY: &str = "Boundary Lines";

/// Error counts of one admin level. Every error type is present, zero when
/// nothing was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelSummary {
    pub level: i64,
    counts: BTreeMap<ErrorType, u64>,
}

impl LevelSummary {
    pub fn new(level: i64) -> Self {
        Self {
            level,
            counts: ErrorType::ALL.iter().map(|e| (*e, 0)).collect(),
        }
    }

    pub fn record(&mut self, error_type: ErrorType) {
        *self.counts.entry(error_type).or_insert(0) += 1;
    }

    pub fn count(&self, error_type: ErrorType) -> u64 {
        self.counts.get(&error_type).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Read back a stored summary; keys missing from older rows count as zero
    pub fn from_value(value: &Value) -> DomainResult<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| DomainError::Serialization("level summary is not an object".to_string()))?;
        let level = object
            .get(LEVEL_KEY)
            .and_then(Value::as_i64)
            .ok_or_else(|| DomainError::Serialization("level summary has no Level".to_string()))?;
        let mut summary = Self::new(level);
        for (key, count) in object {
            if let (Some(error_type), Some(count)) = (ErrorType::from_key(key), count.as_u64()) {
                summary.counts.insert(error_type, count);
            }
        }
        Ok(summary)
    }
}

impl Serialize for LevelSummary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(ErrorType::ALL.len() + 2))?;
        map.serialize_entry(LEVEL_KEY, &self.level)?;
        map.serialize_entry(BOUNDARY_LINES_KEY, &format!("Level {}", self.level))?;
        for error_type in ErrorType::ALL {
            map.serialize_entry(error_type.as_str(), &self.count(error_type))?;
        }
        map.end()
    }
}

/// Parse the stored `summaries` array of an upload
pub fn parse_summaries(value: &Value) -> DomainResult<Vec<LevelSummary>> {
    match value {
        Value::Array(items) => items.iter().map(LevelSummary::from_value).collect(),
        Value::Null => Ok(Vec::new()),
        _ => Err(DomainError::Serialization("summaries must be an array".to_string())),
    }
}

/// Totals of the three policy buckets over a set of summaries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorTally {
    pub allowable: u64,
    pub blocking: u64,
    pub superadmin_bypass: u64,
    pub superadmin_blocking: u64,
}

impl ErrorTally {
    pub fn from_summaries(summaries: &[LevelSummary]) -> Self {
        let mut tally = Self::default();
        for summary in summaries {
            for error_type in ErrorType::ALL {
                let count = summary.count(error_type);
                if error_type.is_allowable() {
                    tally.allowable += count;
                } else {
                    tally.blocking += count;
                }
                if error_type.is_superadmin_bypassable() {
                    tally.superadmin_bypass += count;
                } else {
                    tally.superadmin_blocking += count;
                }
            }
        }
        tally
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_summary_is_zero_filled() {
        let mut summary = LevelSummary::new(1);
        summary.record(ErrorType::BoundaryTypeError);
        summary.record(ErrorType::BoundaryTypeError);

        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["Level"], json!(1));
        assert_eq!(value["Boundary Lines"], json!("Level 1"));
        assert_eq!(value["BOUNDARY_TYPE_ERROR"], json!(2));
        for error_type in ErrorType::ALL {
            assert!(value.get(error_type.as_str()).is_some(), "{} missing", error_type);
        }

        assert_eq!(LevelSummary::from_value(&value).unwrap(), summary);
    }

    #[test]
    fn test_missing_keys_read_as_zero() {
        let parsed = parse_summaries(&json!([{"Level": 0, "DUPLICATE_NODES": 3}])).unwrap();
        assert_eq!(parsed[0].count(ErrorType::DuplicateNodes), 3);
        assert_eq!(parsed[0].count(ErrorType::ParentNotFound), 0);
        assert!(parse_summaries(&json!({"Level": 0})).is_err());
    }

    #[test]
    fn test_tally_buckets() {
        let mut level = LevelSummary::new(0);
        level.record(ErrorType::DuplicateNodes);
        level.record(ErrorType::SelfIntersects);
        let tally = ErrorTally::from_summaries(&[level]);
        assert_eq!(tally.allowable, 1);
        assert_eq!(tally.blocking, 1);
        assert_eq!(tally.superadmin_bypass, 2);
        assert_eq!(tally.superadmin_blocking, 0);
    }
}
