pub mod types;
pub mod worker;
pub mod runner;

pub use types::{JobControl, JobControlMessage, JobHandler, JobKind, JobState};
pub use worker::{JobWorker, JobWorkerHandle};
pub use runner::UploadJobRunner;
