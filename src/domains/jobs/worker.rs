//! Background worker running validation and parent-matching jobs under message control

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::domains::jobs::types::{JobControl, JobControlMessage, JobHandler, JobKind, JobState};
use crate::errors::{ServiceError, ServiceResult};

const REAP_INTERVAL: Duration = Duration::from_secs(30);
/// How long a finished, failed or revoked job stays queryable
const STATE_RETENTION: Duration = Duration::from_secs(600);

struct TrackedState {
    state: JobState,
    since: Instant,
}

impl TrackedState {
    fn new(state: JobState) -> Self {
        Self { state, since: Instant::now() }
    }
}

/// Owns the running jobs. Each submitted job becomes one tokio task; revoking
/// a job aborts that task.
pub struct JobWorker {
    handler: Arc<dyn JobHandler>,
    receiver: mpsc::Receiver<JobControlMessage>,
    active_jobs: HashMap<String, JoinHandle<()>>,
    states: Arc<Mutex<HashMap<String, TrackedState>>>,
    state_retention: Duration,
}

impl JobWorker {
    pub fn new(handler: Arc<dyn JobHandler>, queue_size: usize) -> (Self, JobWorkerHandle) {
        let (sender, receiver) = mpsc::channel(queue_size.max(1));
        let worker = Self {
            handler,
            receiver,
            active_jobs: HashMap::new(),
            states: Arc::new(Mutex::new(HashMap::new())),
            state_retention: STATE_RETENTION,
        };
        (worker, JobWorkerHandle { sender })
    }

    pub fn with_state_retention(mut self, retention: Duration) -> Self {
        self.state_retention = retention;
        self
    }

    pub fn start(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
            log::info!("[JOB_WORKER] shut down");
        })
    }

    async fn run(&mut self) {
        let mut reap = tokio::time::interval(REAP_INTERVAL);
        log::info!("[JOB_WORKER] started");

        loop {
            tokio::select! {
                message = self.receiver.recv() => {
                    match message {
                        Some(JobControlMessage::Submit { kind, response }) => {
                            let task_id = self.submit(kind).await;
                            let _ = response.send(task_id);
                        }
                        Some(JobControlMessage::Revoke { task_id, response }) => {
                            let revoked = self.revoke(&task_id).await;
                            let _ = response.send(revoked);
                        }
                        Some(JobControlMessage::Status { task_id, response }) => {
                            let state = self.state_of(&task_id).await;
                            let _ = response.send(state);
                        }
                        Some(JobControlMessage::Shutdown { response }) => {
                            self.abort_all().await;
                            let _ = response.send(());
                            break;
                        }
                        None => {
                            log::debug!("[JOB_WORKER] all handles dropped");
                            self.abort_all().await;
                            break;
                        }
                    }
                }
                _ = reap.tick() => {
                    self.reap().await;
                }
            }
        }
    }

    /// Forget finished tasks, and settled states once they outlive the retention window
    async fn reap(&mut self) {
        self.active_jobs.retain(|_, handle| !handle.is_finished());
        let retention = self.state_retention;
        let mut states = self.states.lock().await;
        let before = states.len();
        states.retain(|_, tracked| tracked.state.is_active() || tracked.since.elapsed() < retention);
        if states.len() < before {
            log::debug!("[JOB_WORKER] pruned {} settled job states", before - states.len());
        }
    }

    async fn submit(&mut self, kind: JobKind) -> String {
        let task_id = Uuid::new_v4().to_string();
        self.states.lock().await.insert(task_id.clone(), TrackedState::new(JobState::Running));

        let handler = self.handler.clone();
        let states = self.states.clone();
        let id = task_id.clone();
        let handle = tokio::spawn(async move {
            let outcome = match handler.handle(kind).await {
                Ok(()) => JobState::Finished,
                Err(e) => {
                    log::error!("[JOB_WORKER] job {} ({:?}) failed: {}", id, kind, e);
                    JobState::Failed(e.to_string())
                }
            };
            states.lock().await.insert(id, TrackedState::new(outcome));
        });

        log::debug!("[JOB_WORKER] job {} submitted: {:?}", task_id, kind);
        self.active_jobs.insert(task_id.clone(), handle);
        task_id
    }

    async fn revoke(&mut self, task_id: &str) -> bool {
        let mut states = self.states.lock().await;
        let running = states.get(task_id).map_or(false, |t| t.state.is_active());
        if let Some(handle) = self.active_jobs.remove(task_id) {
            handle.abort();
        }
        if running {
            states.insert(task_id.to_string(), TrackedState::new(JobState::Revoked));
            log::info!("[JOB_WORKER] job {} revoked", task_id);
        }
        running
    }

    async fn state_of(&self, task_id: &str) -> JobState {
        self.states
            .lock()
            .await
            .get(task_id)
            .map(|t| t.state.clone())
            .unwrap_or(JobState::Unknown)
    }

    async fn abort_all(&mut self) {
        let handles: Vec<(String, JoinHandle<()>)> = self.active_jobs.drain().collect();
        if handles.is_empty() {
            return;
        }
        log::info!("[JOB_WORKER] aborting {} jobs", handles.len());

        let mut states = self.states.lock().await;
        for (task_id, handle) in &handles {
            handle.abort();
            if states.get(task_id).map_or(false, |t| t.state.is_active()) {
                states.insert(task_id.clone(), TrackedState::new(JobState::Revoked));
            }
        }
        drop(states);
        join_all(handles.into_iter().map(|(_, handle)| handle)).await;
    }
}

/// Cloneable sender side of the worker
#[derive(Clone)]
pub struct JobWorkerHandle {
    sender: mpsc::Sender<JobControlMessage>,
}

impl JobWorkerHandle {
    async fn request<T>(&self, message: JobControlMessage, reply: oneshot::Receiver<T>) -> ServiceResult<T> {
        self.sender
            .send(message)
            .await
            .map_err(|_| ServiceError::JobControl("job worker is not running".to_string()))?;
        reply
            .await
            .map_err(|_| ServiceError::JobControl("job worker dropped the reply".to_string()))
    }

    /// Abort every running job and stop the worker loop
    pub async fn shutdown(&self) -> ServiceResult<()> {
        let (response, reply) = oneshot::channel();
        self.request(JobControlMessage::Shutdown { response }, reply).await
    }
}

#[async_trait]
impl JobControl for JobWorkerHandle {
    async fn submit(&self, kind: JobKind) -> ServiceResult<String> {
        let (response, reply) = oneshot::channel();
        self.request(JobControlMessage::Submit { kind, response }, reply).await
    }

    async fn revoke(&self, task_id: &str) -> ServiceResult<bool> {
        let (response, reply) = oneshot::channel();
        self.request(JobControlMessage::Revoke { task_id: task_id.to_string(), response }, reply)
            .await
    }

    async fn status(&self, task_id: &str) -> ServiceResult<JobState> {
        let (response, reply) = oneshot::channel();
        self.request(JobControlMessage::Status { task_id: task_id.to_string(), response }, reply)
            .await
    }
}
