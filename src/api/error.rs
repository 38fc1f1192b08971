use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{DbError, DomainError, ServiceError, ValidationError};

pub const BAD_REQUEST: u16 = 400;
pub const FORBIDDEN: u16 = 403;
pub const NOT_FOUND: u16 = 404;
pub const INTERNAL_SERVER_ERROR: u16 = 500;

/// Error as reported to API callers: an HTTP-like status and a readable detail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub status: u16,
    pub detail: String,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.detail)
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    pub fn new(status: u16, detail: impl Into<String>) -> Self {
        Self { status, detail: detail.into() }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(BAD_REQUEST, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(INTERNAL_SERVER_ERROR, detail)
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(entity, id) => Self::new(NOT_FOUND, format!("{} {} not found", entity, id)),
            DbError::Conflict(msg) => Self::bad_request(msg),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Database(db_err) => db_err.into(),
            DomainError::EntityNotFound(entity, id) => Self::new(NOT_FOUND, format!("{} {} not found", entity, id)),
            DomainError::Validation(val_err) => val_err.into(),
            // Conflict messages are shown to uploaders verbatim
            DomainError::Conflict(msg) => Self::bad_request(msg),
            err @ DomainError::InvalidTransition { .. } => Self::bad_request(err.to_string()),
            DomainError::Serialization(msg) => Self::bad_request(format!("Invalid payload: {}", msg)),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Domain(domain_err) => domain_err.into(),
            ServiceError::PermissionDenied(msg) => Self::new(FORBIDDEN, msg),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::bad_request(format!("Invalid payload: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let conflict: ApiError = ServiceError::Domain(DomainError::Conflict("There is ongoing review for Pakistan".into())).into();
        assert_eq!(conflict, ApiError::bad_request("There is ongoing review for Pakistan"));

        let missing: ApiError = DomainError::not_found("layer_upload_session", 12).into();
        assert_eq!(missing.status, NOT_FOUND);

        let transition: ApiError = DomainError::InvalidTransition {
            entity_type: "upload".into(),
            from: "APPROVED".into(),
            to: "STARTED".into(),
        }
        .into();
        assert_eq!(transition.status, BAD_REQUEST);

        let denied: ApiError = ServiceError::PermissionDenied("ApproveUpload".into()).into();
        assert_eq!(denied.status, FORBIDDEN);

        let db: ApiError = DomainError::Database(DbError::Transaction("begin failed".into())).into();
        assert_eq!(db.status, INTERNAL_SERVER_ERROR);
    }
}
