use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::domains::qc::error_type::ErrorType;
use crate::domains::qc::summary::LEVEL_KEY;
use crate::errors::{DomainError, DomainResult};

const ERROR_CHECK: &str = "1";

/// Row type that knows its own CSV layout
pub trait CsvRecord {
    fn headers() -> Vec<&'static str>;
    fn to_csv(&self) -> Vec<String>;
}

/// One failing feature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureErrorRow {
    pub level: i64,
    pub label: String,
    pub errors: BTreeSet<ErrorType>,
}

impl FeatureErrorRow {
    pub fn new(level: i64, label: impl Into<String>) -> Self {
        Self { level, label: label.into(), errors: BTreeSet::new() }
    }

    pub fn flag(&mut self, error_type: ErrorType) {
        self.errors.insert(error_type);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

impl CsvRecord for FeatureErrorRow {
    fn headers() -> Vec<&'static str> {
        let mut headers = vec![LEVEL_KEY, "Label"];
        headers.extend(ErrorType::ALL.iter().map(ErrorType::as_str));
        headers
    }

    fn to_csv(&self) -> Vec<String> {
        let mut row = vec![self.level.to_string(), self.label.clone()];
        row.extend(ErrorType::ALL.iter().map(|e| {
            if self.errors.contains(e) { ERROR_CHECK.to_string() } else { String::new() }
        }));
        row
    }
}

pub fn error_report_path(dir: &Path, upload_id: i64) -> PathBuf {
    dir.join(format!("error-report-{}.csv", upload_id))
}

/// Write the per-feature error table for an upload and return its path
pub fn write_error_report(dir: &Path, upload_id: i64, rows: &[FeatureErrorRow]) -> DomainResult<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = error_report_path(dir, upload_id);
    let mut writer = csv::WriterBuilder::new()
        .from_path(&path)
        .map_err(|e| DomainError::File(format!("{}: {}", path.display(), e)))?;

    writer
        .write_record(FeatureErrorRow::headers())
        .map_err(|e| DomainError::Serialization(e.to_string()))?;
    for row in rows {
        writer
            .write_record(row.to_csv())
            .map_err(|e| DomainError::Serialization(e.to_string()))?;
    }
    writer.flush()?;

    log::info!("upload {}: wrote {} error rows to {}", upload_id, rows.len(), path.display());
    Ok(path)
}
