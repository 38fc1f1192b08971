use std::sync::Arc;

use async_trait::async_trait;

use crate::auth::{AuthContext, Permission};
use crate::domains::core::repository::FindById;
use crate::domains::jobs::{JobControl, JobKind};
use crate::domains::layer::hierarchy::{validate_level_admin_1, validate_level_country, LayerHierarchyCache};
use crate::domains::layer::reader::FeatureReader;
use crate::domains::layer::repository::LayerFileRepository;
use crate::domains::matching::candidates::{retrieve_layer0_default_codes, CountryCandidate, CountryUploadRequest};
use crate::domains::upload::repository::{UploadRepository, UploadStart};
use crate::domains::upload::types::{EntityUploadStatus, LayerUploadSession, SessionStatus, UploadStatus};
use crate::errors::{DomainError, ServiceResult, ValidationError};

/// Country selection and submission of a session's uploads
#[async_trait]
pub trait MatchingService: Send + Sync {
    async fn country_candidates(
        &self,
        session_id: i64,
        default_max_level: Option<i64>,
        auth: &AuthContext,
    ) -> ServiceResult<Vec<CountryCandidate>>;

    /// Whether the upload's country has features down to `level` in the session's layers
    async fn has_level(&self, session_id: i64, upload_id: i64, level: i64, auth: &AuthContext) -> ServiceResult<bool>;

    /// Start the chosen countries and queue one validation job each. Either
    /// every candidate starts or none does.
    async fn validate_upload_session(
        &self,
        session_id: i64,
        requests: &[CountryUploadRequest],
        auth: &AuthContext,
    ) -> ServiceResult<Vec<EntityUploadStatus>>;

    /// Queue auto parent matching for the session; returns the task id
    async fn layer_upload_preprocess(&self, session_id: i64, auth: &AuthContext) -> ServiceResult<String>;
}

pub struct MatchingServiceImpl {
    upload_repo: Arc<dyn UploadRepository>,
    layer_repo: Arc<dyn LayerFileRepository>,
    reader: Arc<dyn FeatureReader>,
    job_control: Arc<dyn JobControl>,
}

impl MatchingServiceImpl {
    pub fn new(
        upload_repo: Arc<dyn UploadRepository>,
        layer_repo: Arc<dyn LayerFileRepository>,
        reader: Arc<dyn FeatureReader>,
        job_control: Arc<dyn JobControl>,
    ) -> Self {
        Self { upload_repo, layer_repo, reader, job_control }
    }

    fn ensure_can_enter(session: &LayerUploadSession, next: SessionStatus) -> Result<(), DomainError> {
        if session.status == next || session.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::InvalidTransition {
                entity_type: "upload session".to_string(),
                from: session.status.to_string(),
                to: next.to_string(),
            })
        }
    }
}

#[async_trait]
impl MatchingService for MatchingServiceImpl {
    async fn country_candidates(
        &self,
        session_id: i64,
        default_max_level: Option<i64>,
        auth: &AuthContext,
    ) -> ServiceResult<Vec<CountryCandidate>> {
        auth.authorize(Permission::UploadData)?;
        let session = self.upload_repo.find_session(session_id).await?;
        let layer0 = self.layer_repo.find_by_session_and_level(session_id, 0).await?;
        let candidates = retrieve_layer0_default_codes(&session, layer0.as_ref(), self.reader.as_ref(), default_max_level)?;
        Ok(candidates)
    }

    async fn has_level(&self, session_id: i64, upload_id: i64, level: i64, auth: &AuthContext) -> ServiceResult<bool> {
        auth.authorize(Permission::UploadData)?;
        let upload = self.upload_repo.find_by_id(upload_id).await?;
        let layers: Vec<_> = self
            .layer_repo
            .find_by_session(session_id)
            .await?
            .into_iter()
            .filter(|l| l.level <= level)
            .collect();
        let cache = LayerHierarchyCache::build(&layers, self.reader.as_ref())?;

        if layers.iter().any(|l| l.level == 0) {
            let Some(country) = upload.revised_entity_id.as_deref() else {
                return Ok(false);
            };
            return Ok(validate_level_country(&cache, country, level));
        }

        let children = self.upload_repo.find_children_lv1(upload_id).await?;
        let codes: Vec<&str> = children.iter().map(|c| c.entity_id.as_str()).collect();
        Ok(validate_level_admin_1(&cache, &codes, level))
    }

    async fn validate_upload_session(
        &self,
        session_id: i64,
        requests: &[CountryUploadRequest],
        auth: &AuthContext,
    ) -> ServiceResult<Vec<EntityUploadStatus>> {
        auth.authorize(Permission::UploadData)?;
        if requests.is_empty() {
            return Err(DomainError::Validation(ValidationError::required("entities")).into());
        }
        let session = self.upload_repo.find_session(session_id).await?;
        Self::ensure_can_enter(&session, SessionStatus::Validating)?;

        // Tasks still running from an earlier submission; revoked once the new start is accepted
        let mut in_flight = Vec::new();
        for request in requests {
            let upload = self.upload_repo.find_by_id(request.upload_id).await?;
            if !matches!(upload.status, UploadStatus::Started | UploadStatus::Processing) {
                continue;
            }
            if let Some(task_id) = upload.task_id {
                in_flight.push((upload.id, task_id));
            }
        }

        let starts: Vec<UploadStart> = requests
            .iter()
            .map(|r| UploadStart {
                upload_id: r.upload_id,
                original_geographical_entity_id: r.country_entity_id,
                max_level: r.max_level,
                admin_level_names: r.admin_level_names.clone(),
            })
            .collect();
        let mut started = self.upload_repo.start_entity_uploads(session_id, &starts).await?;
        for (upload_id, task_id) in &in_flight {
            let revoked = self.job_control.revoke(task_id).await?;
            log::info!("upload {}: previous task {} revoked ({})", upload_id, task_id, revoked);
        }
        self.upload_repo
            .update_session_status(session_id, SessionStatus::Validating, "validate_upload_session")
            .await?;

        for upload in started.iter_mut() {
            let task_id = self.job_control.submit(JobKind::ValidateUpload { upload_id: upload.id }).await?;
            self.upload_repo.set_task_id(upload.id, Some(&task_id)).await?;
            upload.task_id = Some(task_id);
        }
        log::info!("session {}: {} uploads queued for validation", session_id, started.len());
        Ok(started)
    }

    async fn layer_upload_preprocess(&self, session_id: i64, auth: &AuthContext) -> ServiceResult<String> {
        auth.authorize(Permission::UploadData)?;
        let session = self.upload_repo.find_session(session_id).await?;
        Self::ensure_can_enter(&session, SessionStatus::Pending)?;

        if let Some(previous) = session.task_id.as_deref() {
            self.job_control.revoke(previous).await?;
        }
        let task_id = self.job_control.submit(JobKind::ParentMatching { session_id }).await?;
        self.upload_repo.set_session_task_id(session_id, Some(&task_id)).await?;
        Ok(task_id)
    }
}
