//! JSON entry points. Each call takes one JSON payload carrying the request
//! data and an `auth` object, and answers with a status plus a JSON body.
//! Failures carry `{"detail": ...}`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::auth::{AuthContext, UserRole};

pub mod error;
pub mod upload;

pub use error::{ApiError, ApiResult};
pub use upload::UploadApi;

pub const OK: u16 = 200;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        self.status < 300
    }
}

impl From<ApiError> for ApiResponse {
    fn from(err: ApiError) -> Self {
        Self { status: err.status, body: json!({ "detail": err.detail }) }
    }
}

/// Turn a handler result into a response
pub fn respond<T: Serialize>(result: ApiResult<T>) -> ApiResponse {
    match result.and_then(|value| serde_json::to_value(value).map_err(ApiError::from)) {
        Ok(body) => ApiResponse { status: OK, body },
        Err(err) => {
            if err.status >= error::INTERNAL_SERVER_ERROR {
                log::error!("[API] {}", err);
            } else {
                log::debug!("[API] {}", err);
            }
            err.into()
        }
    }
}

/// Caller identity as sent by clients
#[derive(Debug, Clone, Deserialize)]
pub struct AuthDto {
    pub user_id: i64,
    pub role: String,
}

impl TryFrom<AuthDto> for AuthContext {
    type Error = ApiError;

    fn try_from(value: AuthDto) -> Result<Self, Self::Error> {
        let role = match value.role.to_ascii_lowercase().as_str() {
            "superuser" => UserRole::Superuser,
            "manager" => UserRole::Manager,
            "uploader" => UserRole::Uploader,
            "viewer" => UserRole::Viewer,
            other => return Err(ApiError::bad_request(format!("Unknown role '{}'", other))),
        };
        Ok(AuthContext::new(value.user_id, role))
    }
}
