pub mod types;
pub mod repository;
pub mod service;

pub use types::{
    EntityUploadChildLv1, EntityUploadStatus, EntityUploadStatusLog, LayerUploadSession, NewEntityUpload,
    NewEntityUploadChildLv1, NewLayerUploadSession, SessionActionLog, SessionStatus, UploadStatus,
};
pub use repository::{SqliteUploadRepository, UploadRepository, UploadStart};
pub use service::{UploadService, UploadServiceImpl, PENDING_BOUNDARY_MATCHING};
