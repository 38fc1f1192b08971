use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::errors::ServiceResult;

/// Background work the crate knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    ValidateUpload { upload_id: i64 },
    ParentMatching { session_id: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "UPPERCASE")]
pub enum JobState {
    Running,
    Finished,
    Failed(String),
    Revoked,
    /// Task id never issued by this worker, or already forgotten
    Unknown,
}

impl JobState {
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Running)
    }
}

/// Messages accepted by the job worker loop
#[derive(Debug)]
pub enum JobControlMessage {
    Submit {
        kind: JobKind,
        response: oneshot::Sender<String>,
    },
    Revoke {
        task_id: String,
        response: oneshot::Sender<bool>,
    },
    Status {
        task_id: String,
        response: oneshot::Sender<JobState>,
    },
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

/// Executes one job to completion. Errors are reported back as `JobState::Failed`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, kind: JobKind) -> ServiceResult<()>;
}

/// Submit and revoke jobs without knowing how they are run
#[async_trait]
pub trait JobControl: Send + Sync {
    /// Queue a job and return its task id
    async fn submit(&self, kind: JobKind) -> ServiceResult<String>;

    /// Abort a job. Returns false when it was no longer running.
    async fn revoke(&self, task_id: &str) -> ServiceResult<bool>;

    async fn status(&self, task_id: &str) -> ServiceResult<JobState>;
}
