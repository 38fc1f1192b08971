use serde::{Deserialize, Serialize};
use crate::errors::ServiceError;

/// Roles a caller may hold within a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserRole {
    Superuser,
    Manager,
    Uploader,
    Viewer,
}

/// Individual operations guarded by the upload workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    UploadData,
    ReviewUpload,
    ApproveUpload,
    ResetValidation,
}

impl UserRole {
    pub fn has_permission(&self, permission: Permission) -> bool {
        match self {
            UserRole::Superuser => true,
            UserRole::Manager => true,
            UserRole::Uploader => matches!(
                permission,
                Permission::UploadData | Permission::ReviewUpload | Permission::ResetValidation
            ),
            UserRole::Viewer => false,
        }
    }
}

/// Represents the authentication context for the current operation
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// The ID of the authenticated user
    pub user_id: i64,

    /// The role of the authenticated user
    pub role: UserRole,
}

impl AuthContext {
    pub fn new(user_id: i64, role: UserRole) -> Self {
        Self { user_id, role }
    }

    /// Context used by background jobs
    pub fn internal_system_context() -> Self {
        Self {
            user_id: 0,
            role: UserRole::Superuser,
        }
    }

    /// Superusers may import uploads whose only errors are bypassable.
    pub fn is_superuser(&self) -> bool {
        matches!(self.role, UserRole::Superuser)
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.role.has_permission(permission)
    }

    /// Authorize a specific permission, returning an error if not allowed
    pub fn authorize(&self, permission: Permission) -> Result<(), ServiceError> {
        if self.has_permission(permission) {
            Ok(())
        } else {
            Err(ServiceError::PermissionDenied(format!(
                "User does not have permission: {:?}",
                permission
            )))
        }
    }
}
