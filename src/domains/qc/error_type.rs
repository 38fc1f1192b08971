use serde::{Deserialize, Serialize};
use std::fmt;

/// Every problem validation can report on a feature.
///
/// Classification is two independent predicates rather than membership
/// lists: `is_allowable` errors never block an import (they only raise a
/// warning), `is_superadmin_bypassable` errors block ordinary users but not
/// superusers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    BoundaryTypeError,
    PrivacyLevelError,
    InvalidPrivacyLevel,
    InvalidGeometry,
    SelfIntersects,
    DuplicateNodes,
    DefaultCodeMissing,
    DuplicateCode,
    ParentNotFound,
}

impl ErrorType {
    /// Declaration order; used for summary keys and report columns
    pub const ALL: [ErrorType; 9] = [
        ErrorType::BoundaryTypeError,
        ErrorType::PrivacyLevelError,
        ErrorType::InvalidPrivacyLevel,
        ErrorType::InvalidGeometry,
        ErrorType::SelfIntersects,
        ErrorType::DuplicateNodes,
        ErrorType::DefaultCodeMissing,
        ErrorType::DuplicateCode,
        ErrorType::ParentNotFound,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::BoundaryTypeError => "BOUNDARY_TYPE_ERROR",
            ErrorType::PrivacyLevelError => "PRIVACY_LEVEL_ERROR",
            ErrorType::InvalidPrivacyLevel => "INVALID_PRIVACY_LEVEL",
            ErrorType::InvalidGeometry => "INVALID_GEOMETRY",
            ErrorType::SelfIntersects => "SELF_INTERSECTS",
            ErrorType::DuplicateNodes => "DUPLICATE_NODES",
            ErrorType::DefaultCodeMissing => "DEFAULT_CODE_MISSING",
            ErrorType::DuplicateCode => "DUPLICATE_CODE",
            ErrorType::ParentNotFound => "PARENT_NOT_FOUND",
        }
    }

    pub fn from_key(key: &str) -> Option<ErrorType> {
        Self::ALL.iter().copied().find(|e| e.as_str() == key)
    }

    pub fn is_allowable(&self) -> bool {
        matches!(self, ErrorType::DuplicateNodes)
    }

    pub fn is_superadmin_bypassable(&self) -> bool {
        matches!(
            self,
            ErrorType::SelfIntersects | ErrorType::DuplicateNodes | ErrorType::DuplicateCode
        )
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error types split into blocking (`error`) and allowable (`warning`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorTypesOverview {
    pub error: Vec<&'static str>,
    pub warning: Vec<&'static str>,
}

pub fn error_types_overview() -> ErrorTypesOverview {
    let (warning, error): (Vec<ErrorType>, Vec<ErrorType>) =
        ErrorType::ALL.iter().copied().partition(ErrorType::is_allowable);
    ErrorTypesOverview {
        error: error.iter().map(ErrorType::as_str).collect(),
        warning: warning.iter().map(ErrorType::as_str).collect(),
    }
}
