use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::task::JoinHandle;

use crate::db_migration;
use crate::domains::dataset::{DatasetRepository, SqliteDatasetRepository};
use crate::domains::entity::{EntityRepository, SqliteEntityRepository};
use crate::domains::jobs::{JobWorker, JobWorkerHandle, UploadJobRunner};
use crate::domains::layer::{FeatureReader, GeoJsonFeatureReader, LayerFileRepository, SqliteLayerFileRepository};
use crate::domains::matching::{MatchingService, MatchingServiceImpl, ParentMatcher};
use crate::domains::qc::{QcService, QcServiceImpl, ValidationOptions};
use crate::domains::upload::{SqliteUploadRepository, UploadRepository, UploadService, UploadServiceImpl};
use crate::errors::{DbError, ServiceError, ServiceResult};

const DEFAULT_DATABASE_URL: &str = "sqlite://georepo.db";
const DEFAULT_JOB_QUEUE_SIZE: usize = 64;

/// Process settings, read from the environment (and `.env` when present)
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub error_report_dir: PathBuf,
    pub job_queue_size: usize,
    pub simplify_tolerance: f64,
}

impl Default for Settings {
    fn default() -> Self {
        let validation = ValidationOptions::default();
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            error_report_dir: validation.error_report_dir,
            job_queue_size: DEFAULT_JOB_QUEUE_SIZE,
            simplify_tolerance: validation.simplify_tolerance,
        }
    }
}

impl Settings {
    pub fn from_env() -> ServiceResult<Self> {
        if let Err(e) = dotenv::dotenv() {
            log::debug!("no .env loaded: {}", e);
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ServiceResult<Self> {
        let mut settings = Settings::default();
        if let Some(url) = lookup("GEOREPO_DATABASE_URL") {
            settings.database_url = url;
        }
        if let Some(dir) = lookup("GEOREPO_ERROR_REPORT_DIR") {
            settings.error_report_dir = PathBuf::from(dir);
        }
        if let Some(size) = lookup("GEOREPO_JOB_QUEUE_SIZE") {
            settings.job_queue_size = parse_setting("GEOREPO_JOB_QUEUE_SIZE", &size)?;
        }
        if let Some(tolerance) = lookup("GEOREPO_SIMPLIFY_TOLERANCE") {
            settings.simplify_tolerance = parse_setting("GEOREPO_SIMPLIFY_TOLERANCE", &tolerance)?;
        }
        Ok(settings)
    }
}

fn parse_setting<T: FromStr>(key: &str, value: &str) -> ServiceResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ServiceError::Configuration(format!("{} has an invalid value '{}'", key, value)))
}

lazy_static! {
    static ref INIT_MUTEX: tokio::sync::Mutex<()> = tokio::sync::Mutex::new(());
    static ref INITIALIZED: AtomicBool = AtomicBool::new(false);

    static ref DB_POOL: Mutex<Option<SqlitePool>> = Mutex::new(None);
    static ref SETTINGS: Mutex<Option<Settings>> = Mutex::new(None);

    // Repositories
    static ref UPLOAD_REPO: Mutex<Option<Arc<dyn UploadRepository>>> = Mutex::new(None);
    static ref ENTITY_REPO: Mutex<Option<Arc<dyn EntityRepository>>> = Mutex::new(None);
    static ref DATASET_REPO: Mutex<Option<Arc<dyn DatasetRepository>>> = Mutex::new(None);
    static ref LAYER_REPO: Mutex<Option<Arc<dyn LayerFileRepository>>> = Mutex::new(None);

    // Services
    static ref QC_SERVICE: Mutex<Option<Arc<dyn QcService>>> = Mutex::new(None);
    static ref MATCHING_SERVICE: Mutex<Option<Arc<dyn MatchingService>>> = Mutex::new(None);
    static ref UPLOAD_SERVICE: Mutex<Option<Arc<dyn UploadService>>> = Mutex::new(None);

    // Jobs
    static ref JOB_WORKER: Mutex<Option<JobWorkerHandle>> = Mutex::new(None);
    static ref JOB_WORKER_TASK: Mutex<Option<JoinHandle<()>>> = Mutex::new(None);
}

fn store<T>(slot: &Mutex<Option<T>>, name: &str, value: T) -> ServiceResult<()> {
    let mut guard = slot
        .lock()
        .map_err(|_| ServiceError::Configuration(format!("{} lock poisoned", name)))?;
    *guard = Some(value);
    Ok(())
}

fn load<T: Clone>(slot: &Mutex<Option<T>>, name: &str) -> ServiceResult<T> {
    slot.lock()
        .map_err(|_| ServiceError::Configuration(format!("{} lock poisoned", name)))?
        .clone()
        .ok_or_else(|| ServiceError::Configuration(format!("{} not initialized", name)))
}

pub fn get_db_pool() -> ServiceResult<SqlitePool> {
    load(&DB_POOL, "DB_POOL")
}
pub fn get_settings() -> ServiceResult<Settings> {
    load(&SETTINGS, "SETTINGS")
}
pub fn get_upload_repo() -> ServiceResult<Arc<dyn UploadRepository>> {
    load(&UPLOAD_REPO, "UploadRepository")
}
pub fn get_entity_repo() -> ServiceResult<Arc<dyn EntityRepository>> {
    load(&ENTITY_REPO, "EntityRepository")
}
pub fn get_dataset_repo() -> ServiceResult<Arc<dyn DatasetRepository>> {
    load(&DATASET_REPO, "DatasetRepository")
}
pub fn get_layer_repo() -> ServiceResult<Arc<dyn LayerFileRepository>> {
    load(&LAYER_REPO, "LayerFileRepository")
}
pub fn get_qc_service() -> ServiceResult<Arc<dyn QcService>> {
    load(&QC_SERVICE, "QcService")
}
pub fn get_matching_service() -> ServiceResult<Arc<dyn MatchingService>> {
    load(&MATCHING_SERVICE, "MatchingService")
}
pub fn get_upload_service() -> ServiceResult<Arc<dyn UploadService>> {
    load(&UPLOAD_SERVICE, "UploadService")
}
pub fn get_job_worker() -> ServiceResult<JobWorkerHandle> {
    load(&JOB_WORKER, "JobWorker")
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// Connect, migrate and wire every service. Safe to call more than once.
pub async fn initialize(settings: Settings) -> ServiceResult<()> {
    let _guard = INIT_MUTEX.lock().await;
    if INITIALIZED.load(Ordering::Acquire) {
        return Ok(());
    }

    let result = initialize_internal(settings).await;
    if result.is_ok() {
        INITIALIZED.store(true, Ordering::Release);
    }
    result
}

async fn initialize_internal(settings: Settings) -> ServiceResult<()> {
    crate::init_logging();
    log::info!("Starting initialization");
    log::debug!("Database URL: {}", settings.database_url);

    let options = SqliteConnectOptions::from_str(&settings.database_url)
        .map_err(|e| ServiceError::Configuration(format!("Invalid database URL: {}", e)))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(DbError::from)?;
    db_migration::initialize_database(&pool).await?;

    let upload_repo: Arc<dyn UploadRepository> = Arc::new(SqliteUploadRepository::new(pool.clone()));
    let entity_repo: Arc<dyn EntityRepository> = Arc::new(SqliteEntityRepository::new(pool.clone()));
    let dataset_repo: Arc<dyn DatasetRepository> = Arc::new(SqliteDatasetRepository::new(pool.clone()));
    let layer_repo: Arc<dyn LayerFileRepository> = Arc::new(SqliteLayerFileRepository::new(pool.clone()));
    let reader: Arc<dyn FeatureReader> = Arc::new(GeoJsonFeatureReader::new());

    let qc_service: Arc<dyn QcService> = Arc::new(QcServiceImpl::new(
        upload_repo.clone(),
        entity_repo.clone(),
        dataset_repo.clone(),
        layer_repo.clone(),
        reader.clone(),
        ValidationOptions {
            error_report_dir: settings.error_report_dir.clone(),
            simplify_tolerance: settings.simplify_tolerance,
        },
    ));
    let parent_matcher = Arc::new(ParentMatcher::new(
        upload_repo.clone(),
        entity_repo.clone(),
        layer_repo.clone(),
        reader.clone(),
    ));

    log::debug!("Starting job worker (queue size {})", settings.job_queue_size);
    let runner = Arc::new(UploadJobRunner::new(upload_repo.clone(), qc_service.clone(), parent_matcher));
    let (worker, job_handle) = JobWorker::new(runner, settings.job_queue_size);
    let worker_task = worker.start();

    let matching_service: Arc<dyn MatchingService> = Arc::new(MatchingServiceImpl::new(
        upload_repo.clone(),
        layer_repo.clone(),
        reader,
        Arc::new(job_handle.clone()),
    ));
    let upload_service: Arc<dyn UploadService> = Arc::new(UploadServiceImpl::new(
        pool.clone(),
        upload_repo.clone(),
        entity_repo.clone(),
        qc_service.clone(),
        Arc::new(job_handle.clone()),
    ));

    store(&DB_POOL, "DB_POOL", pool)?;
    store(&SETTINGS, "SETTINGS", settings)?;
    store(&UPLOAD_REPO, "UploadRepository", upload_repo)?;
    store(&ENTITY_REPO, "EntityRepository", entity_repo)?;
    store(&DATASET_REPO, "DatasetRepository", dataset_repo)?;
    store(&LAYER_REPO, "LayerFileRepository", layer_repo)?;
    store(&QC_SERVICE, "QcService", qc_service)?;
    store(&MATCHING_SERVICE, "MatchingService", matching_service)?;
    store(&UPLOAD_SERVICE, "UploadService", upload_service)?;
    store(&JOB_WORKER, "JobWorker", job_handle)?;
    store(&JOB_WORKER_TASK, "JobWorkerTask", worker_task)?;

    log::info!("Initialization complete");
    Ok(())
}

/// Stop the job worker, aborting running jobs
pub async fn shutdown() -> ServiceResult<()> {
    let handle = get_job_worker()?;
    handle.shutdown().await?;

    let task = JOB_WORKER_TASK
        .lock()
        .map_err(|_| ServiceError::Configuration("JobWorkerTask lock poisoned".to_string()))?
        .take();
    if let Some(task) = task {
        if let Err(e) = task.await {
            log::warn!("job worker ended abnormally: {}", e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_settings_defaults_and_overrides() {
        let defaults = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(defaults.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(defaults.job_queue_size, DEFAULT_JOB_QUEUE_SIZE);

        let settings = Settings::from_lookup(lookup(&[
            ("GEOREPO_DATABASE_URL", "sqlite://other.db"),
            ("GEOREPO_ERROR_REPORT_DIR", "/var/reports"),
            ("GEOREPO_JOB_QUEUE_SIZE", "8"),
            ("GEOREPO_SIMPLIFY_TOLERANCE", "0.01"),
        ]))
        .unwrap();
        assert_eq!(settings.database_url, "sqlite://other.db");
        assert_eq!(settings.error_report_dir, PathBuf::from("/var/reports"));
        assert_eq!(settings.job_queue_size, 8);
        assert_eq!(settings.simplify_tolerance, 0.01);
    }

    #[test]
    fn test_invalid_setting_is_a_configuration_error() {
        let result = Settings::from_lookup(lookup(&[("GEOREPO_JOB_QUEUE_SIZE", "many")]));
        assert!(matches!(result, Err(ServiceError::Configuration(_))));
    }
}
