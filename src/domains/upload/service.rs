use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::auth::{AuthContext, Permission};
use crate::domains::core::repository::FindById;
use crate::domains::entity::repository::EntityRepository;
use crate::domains::jobs::JobControl;
use crate::domains::qc::service::QcService;
use crate::domains::upload::repository::UploadRepository;
use crate::domains::upload::types::{EntityUploadStatus, LayerUploadSession, SessionStatus, UploadStatus};
use crate::errors::{DbError, DomainError, DomainResult, ServiceResult, ValidationError};

pub const PENDING_BOUNDARY_MATCHING: &str = "Pending Boundary Matching";

/// Review and decision steps of an upload session
#[async_trait]
pub trait UploadService: Send + Sync {
    async fn get_session(&self, session_id: i64, auth: &AuthContext) -> ServiceResult<LayerUploadSession>;

    async fn list_uploads(&self, session_id: i64, auth: &AuthContext) -> ServiceResult<Vec<EntityUploadStatus>>;

    /// Send importable uploads to review. Returns how many moved.
    async fn ready_to_review(&self, session_id: i64, upload_ids: &[i64], auth: &AuthContext) -> ServiceResult<u64>;

    /// Throw away everything validation produced for the session. Returns the
    /// number of entities deleted.
    async fn reset_qc_validation(&self, session_id: i64, auth: &AuthContext) -> ServiceResult<u64>;

    async fn approve_upload(&self, upload_id: i64, auth: &AuthContext) -> ServiceResult<EntityUploadStatus>;

    async fn reject_upload(&self, upload_id: i64, auth: &AuthContext) -> ServiceResult<EntityUploadStatus>;

    async fn cancel_session(&self, session_id: i64, auth: &AuthContext) -> ServiceResult<LayerUploadSession>;
}

pub struct UploadServiceImpl {
    pool: SqlitePool,
    upload_repo: Arc<dyn UploadRepository>,
    entity_repo: Arc<dyn EntityRepository>,
    qc_service: Arc<dyn QcService>,
    job_control: Arc<dyn JobControl>,
}

impl UploadServiceImpl {
    pub fn new(
        pool: SqlitePool,
        upload_repo: Arc<dyn UploadRepository>,
        entity_repo: Arc<dyn EntityRepository>,
        qc_service: Arc<dyn QcService>,
        job_control: Arc<dyn JobControl>,
    ) -> Self {
        Self { pool, upload_repo, entity_repo, qc_service, job_control }
    }

    async fn revoke_session_tasks(&self, session: &LayerUploadSession, uploads: &[EntityUploadStatus]) -> ServiceResult<()> {
        let task_ids = uploads
            .iter()
            .filter_map(|u| u.task_id.as_deref())
            .chain(session.task_id.as_deref());
        for task_id in task_ids {
            if self.job_control.revoke(task_id).await? {
                log::info!("session {}: task {} revoked", session.id, task_id);
            }
        }
        Ok(())
    }

    async fn decide(&self, upload_id: i64, decision: UploadStatus) -> ServiceResult<EntityUploadStatus> {
        let upload = self.upload_repo.find_by_id(upload_id).await?;

        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        self.upload_repo.decide_upload_with_tx(upload_id, decision, &mut tx).await?;
        let touched = match decision {
            UploadStatus::Approved => self.entity_repo.approve_upload_with_tx(upload_id, &mut tx).await?,
            _ => self.entity_repo.reject_upload_with_tx(upload_id, &mut tx).await?,
        };
        tx.commit().await.map_err(DbError::from)?;
        log::info!("upload {}: {} ({} entities)", upload_id, decision, touched);

        self.complete_session(upload.session_id).await?;
        Ok(self.upload_repo.find_by_id(upload_id).await?)
    }

    /// DONE once every submitted upload of the session has been decided
    async fn complete_session(&self, session_id: i64) -> DomainResult<()> {
        let uploads = self.upload_repo.find_uploads_by_session(session_id).await?;
        let all_decided = {
            let mut submitted = uploads.iter().filter(|u| u.status != UploadStatus::New).peekable();
            submitted.peek().is_some() && submitted.all(|u| u.status.is_decided())
        };
        if !all_decided {
            return Ok(());
        }
        let session = self.upload_repo.find_session(session_id).await?;
        if session.status.can_transition_to(SessionStatus::Done) {
            self.upload_repo.update_session_status(session_id, SessionStatus::Done, "review finished").await?;
        }
        Ok(())
    }
}

#[async_trait]
impl UploadService for UploadServiceImpl {
    async fn get_session(&self, session_id: i64, auth: &AuthContext) -> ServiceResult<LayerUploadSession> {
        auth.authorize(Permission::UploadData)?;
        Ok(self.upload_repo.find_session(session_id).await?)
    }

    async fn list_uploads(&self, session_id: i64, auth: &AuthContext) -> ServiceResult<Vec<EntityUploadStatus>> {
        auth.authorize(Permission::UploadData)?;
        Ok(self.upload_repo.find_uploads_by_session(session_id).await?)
    }

    async fn ready_to_review(&self, session_id: i64, upload_ids: &[i64], auth: &AuthContext) -> ServiceResult<u64> {
        auth.authorize(Permission::ReviewUpload)?;
        if upload_ids.is_empty() {
            return Err(DomainError::Validation(ValidationError::required("upload_ids")).into());
        }
        let session = self.upload_repo.find_session(session_id).await?;
        if !session.status.can_transition_to(SessionStatus::Reviewing) {
            return Err(DomainError::InvalidTransition {
                entity_type: "upload session".to_string(),
                from: session.status.to_string(),
                to: SessionStatus::Reviewing.to_string(),
            }
            .into());
        }

        for &upload_id in upload_ids {
            let upload = self.upload_repo.find_by_id(upload_id).await?;
            if upload.session_id != session_id {
                return Err(DomainError::Conflict(format!("Upload {} does not belong to session {}", upload_id, session_id)).into());
            }
            let (importable, warning) = self.qc_service.is_importable(upload_id, auth.is_superuser()).await?;
            if !importable {
                return Err(DomainError::Validation(ValidationError::custom(&format!(
                    "Upload {} has blocking errors and cannot be reviewed",
                    upload_id
                )))
                .into());
            }
            // ERROR uploads skipped versioning during validation
            if upload.unique_code_version.is_none() {
                let version = self.qc_service.assign_versions(upload_id).await?;
                log::debug!("upload {}: version {} assigned before review (warning = {})", upload_id, version, warning);
            }
        }

        let moved = self.upload_repo.start_review(session_id, upload_ids, PENDING_BOUNDARY_MATCHING).await?;
        self.upload_repo
            .update_session_status(session_id, SessionStatus::Reviewing, "ready_to_review")
            .await?;
        Ok(moved)
    }

    async fn reset_qc_validation(&self, session_id: i64, auth: &AuthContext) -> ServiceResult<u64> {
        auth.authorize(Permission::ResetValidation)?;
        let session = self.upload_repo.find_session(session_id).await?;
        let uploads = self.upload_repo.find_uploads_by_session(session_id).await?;
        if session.status.is_terminal() || uploads.iter().any(|u| u.status == UploadStatus::Approved) {
            return Err(DomainError::Conflict(format!(
                "Session {} is {} and can no longer be reset",
                session_id, session.status
            ))
            .into());
        }

        self.revoke_session_tasks(&session, &uploads).await?;
        self.upload_repo.set_session_task_id(session_id, None).await?;

        let deleted = self.entity_repo.delete_by_session(session_id).await?;
        let reset = self.upload_repo.reset_uploads(session_id).await?;
        self.upload_repo
            .update_session_status(session_id, SessionStatus::Pending, "reset_qc_validation")
            .await?;
        log::info!("session {}: reset {} uploads, deleted {} entities", session_id, reset, deleted);
        Ok(deleted)
    }

    async fn approve_upload(&self, upload_id: i64, auth: &AuthContext) -> ServiceResult<EntityUploadStatus> {
        auth.authorize(Permission::ApproveUpload)?;
        self.decide(upload_id, UploadStatus::Approved).await
    }

    async fn reject_upload(&self, upload_id: i64, auth: &AuthContext) -> ServiceResult<EntityUploadStatus> {
        auth.authorize(Permission::ApproveUpload)?;
        self.decide(upload_id, UploadStatus::Rejected).await
    }

    async fn cancel_session(&self, session_id: i64, auth: &AuthContext) -> ServiceResult<LayerUploadSession> {
        auth.authorize(Permission::UploadData)?;
        let session = self.upload_repo.find_session(session_id).await?;
        let uploads = self.upload_repo.find_uploads_by_session(session_id).await?;
        self.revoke_session_tasks(&session, &uploads).await?;

        for upload in uploads.iter().filter(|u| u.status.can_transition_to(UploadStatus::Canceled)) {
            self.upload_repo.update_status(upload.id, UploadStatus::Canceled).await?;
        }
        Ok(self
            .upload_repo
            .update_session_status(session_id, SessionStatus::Canceled, "cancel_session")
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserRole;
    use crate::db_migration::test_pool;
    use crate::domains::entity::repository::SqliteEntityRepository;
    use crate::domains::layer::repository::{LayerFileRepository, SqliteLayerFileRepository};
    use crate::domains::upload::repository::SqliteUploadRepository;
    use crate::domains::upload::types::NewEntityUpload;
    use crate::errors::ServiceError;
    use crate::testing::{insert_entity, new_layer_file, seed_dataset, seed_session, set_upload_status, RecordingJobControl};
    use chrono::Utc;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Importability decided per upload; records which uploads got versions
    #[derive(Default)]
    struct StubQc {
        blocked: Mutex<HashSet<i64>>,
        versioned: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl QcService for StubQc {
        async fn run_validation(&self, _upload_id: i64) -> DomainResult<bool> {
            Ok(true)
        }

        async fn assign_versions(&self, upload_id: i64) -> DomainResult<f64> {
            self.versioned.lock().unwrap().push(upload_id);
            Ok(2.0)
        }

        async fn is_importable(&self, upload_id: i64, _is_superuser: bool) -> DomainResult<(bool, bool)> {
            Ok((!self.blocked.lock().unwrap().contains(&upload_id), false))
        }
    }

    struct Fixture {
        pool: SqlitePool,
        service: UploadServiceImpl,
        upload_repo: Arc<SqliteUploadRepository>,
        entity_repo: Arc<SqliteEntityRepository>,
        qc: Arc<StubQc>,
        jobs: Arc<RecordingJobControl>,
        dataset_id: i64,
        session_id: i64,
    }

    async fn fixture() -> Fixture {
        let pool = test_pool().await;
        let dataset = seed_dataset(&pool).await;
        let session_id = seed_session(&pool, dataset.id).await;
        let upload_repo = Arc::new(SqliteUploadRepository::new(pool.clone()));
        let entity_repo = Arc::new(SqliteEntityRepository::new(pool.clone()));
        let qc = Arc::new(StubQc::default());
        let jobs = Arc::new(RecordingJobControl::default());
        let service = UploadServiceImpl::new(pool.clone(), upload_repo.clone(), entity_repo.clone(), qc.clone(), jobs.clone());
        Fixture { pool, service, upload_repo, entity_repo, qc, jobs, dataset_id: dataset.id, session_id }
    }

    impl Fixture {
        async fn upload(&self, code: &str, status: &str) -> i64 {
            let upload = self
                .upload_repo
                .create_upload(&NewEntityUpload {
                    session_id: self.session_id,
                    revised_entity_id: Some(code.into()),
                    ..Default::default()
                })
                .await
                .unwrap();
            set_upload_status(&self.pool, upload.id, status).await;
            upload.id
        }

        async fn set_session_status(&self, status: &str) {
            sqlx::query("UPDATE layer_upload_sessions SET status = ? WHERE id = ?")
                .bind(status)
                .bind(self.session_id)
                .execute(&self.pool)
                .await
                .unwrap();
        }

        async fn entity_for(&self, upload_id: i64, code: &str) -> i64 {
            let id = insert_entity(&self.pool, self.dataset_id, 0, code, None, Utc::now()).await;
            sqlx::query("UPDATE geographical_entities SET entity_upload_id = ? WHERE id = ?")
                .bind(upload_id)
                .bind(id)
                .execute(&self.pool)
                .await
                .unwrap();
            id
        }
    }

    fn manager() -> AuthContext {
        AuthContext::new(1, UserRole::Manager)
    }

    #[tokio::test]
    async fn test_ready_to_review_versions_error_uploads() {
        let f = fixture().await;
        f.set_session_status("ERROR").await;
        let valid = f.upload("PAK", "VALID").await;
        f.upload_repo.set_unique_code_version(valid, 1.0).await.unwrap();
        let warned = f.upload("IND", "ERROR").await;

        let moved = f.service.ready_to_review(f.session_id, &[valid, warned], &manager()).await.unwrap();
        assert_eq!(moved, 2);
        assert_eq!(*f.qc.versioned.lock().unwrap(), vec![warned]);

        let uploads = f.upload_repo.find_uploads_by_session(f.session_id).await.unwrap();
        assert!(uploads.iter().all(|u| u.status == UploadStatus::Reviewing));
        assert!(uploads.iter().all(|u| u.progress.as_deref() == Some(PENDING_BOUNDARY_MATCHING)));
        assert_eq!(f.upload_repo.find_session(f.session_id).await.unwrap().status, SessionStatus::Reviewing);
    }

    #[tokio::test]
    async fn test_blocking_errors_keep_upload_out_of_review() {
        let f = fixture().await;
        f.set_session_status("ERROR").await;
        let upload = f.upload("PAK", "ERROR").await;
        f.qc.blocked.lock().unwrap().insert(upload);

        let result = f.service.ready_to_review(f.session_id, &[upload], &manager()).await;
        assert!(matches!(result, Err(ServiceError::Domain(DomainError::Validation(_)))));
        assert_eq!(f.upload_repo.find_by_id(upload).await.unwrap().status, UploadStatus::Error);
        assert_eq!(f.upload_repo.find_session(f.session_id).await.unwrap().status, SessionStatus::Error);
    }

    #[tokio::test]
    async fn test_session_done_once_every_upload_decided() {
        let f = fixture().await;
        f.set_session_status("REVIEWING").await;
        let pak = f.upload("PAK", "REVIEWING").await;
        let ind = f.upload("IND", "REVIEWING").await;
        f.upload("AFG", "").await;
        let pak_entity = f.entity_for(pak, "PAK").await;
        let ind_entity = f.entity_for(ind, "IND").await;

        let approved = f.service.approve_upload(pak, &manager()).await.unwrap();
        assert_eq!(approved.status, UploadStatus::Approved);
        let entity = f.entity_repo.find_by_id(pak_entity).await.unwrap();
        assert_eq!(entity.is_approved, Some(true));
        assert!(entity.is_latest);
        assert_eq!(f.upload_repo.find_session(f.session_id).await.unwrap().status, SessionStatus::Reviewing);

        f.service.reject_upload(ind, &manager()).await.unwrap();
        assert_eq!(f.entity_repo.find_by_id(ind_entity).await.unwrap().is_approved, Some(false));
        assert_eq!(f.upload_repo.find_session(f.session_id).await.unwrap().status, SessionStatus::Done);

        // Decisions are final
        assert!(f.service.reject_upload(pak, &manager()).await.is_err());
        let uploader = AuthContext::new(2, UserRole::Uploader);
        assert!(matches!(f.service.approve_upload(ind, &uploader).await, Err(ServiceError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_reset_clears_session() {
        let f = fixture().await;
        f.set_session_status("REVIEWING").await;
        let pak = f.upload("PAK", "REVIEWING").await;
        f.upload_repo.set_task_id(pak, Some("validate-pak")).await.unwrap();
        f.upload_repo.set_unique_code_version(pak, 1.0).await.unwrap();
        f.upload_repo.set_revision_number(pak, 2).await.unwrap();

        let layer = SqliteLayerFileRepository::new(f.pool.clone())
            .create(&new_layer_file(f.session_id, 0, "/uploads/level_0.geojson", None))
            .await
            .unwrap();
        let entity = f.entity_for(pak, "PAK").await;
        sqlx::query("UPDATE geographical_entities SET layer_file_id = ? WHERE id = ?")
            .bind(layer.id)
            .bind(entity)
            .execute(&f.pool)
            .await
            .unwrap();

        let deleted = f.service.reset_qc_validation(f.session_id, &manager()).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(*f.jobs.revoked.lock().unwrap(), vec!["validate-pak".to_string()]);

        let upload = f.upload_repo.find_by_id(pak).await.unwrap();
        assert_eq!(upload.status, UploadStatus::New);
        assert!(upload.task_id.is_none() && upload.summaries.is_none() && upload.error_report.is_none());
        assert_eq!(upload.logs, "");
        assert_eq!(upload.unique_code_version, None);
        assert_eq!(upload.revision_number, None);
        assert_eq!(f.upload_repo.find_session(f.session_id).await.unwrap().status, SessionStatus::Pending);
        assert!(f.entity_repo.find_by_id(entity).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_session_cancels_open_uploads() {
        let f = fixture().await;
        let pak = f.upload("PAK", "STARTED").await;
        f.upload_repo.set_task_id(pak, Some("validate-pak")).await.unwrap();

        let session = f.service.cancel_session(f.session_id, &manager()).await.unwrap();
        assert_eq!(session.status, SessionStatus::Canceled);
        assert_eq!(f.upload_repo.find_by_id(pak).await.unwrap().status, UploadStatus::Canceled);
        assert_eq!(f.jobs.revoked.lock().unwrap().len(), 1);
        assert!(f.service.reset_qc_validation(f.session_id, &manager()).await.is_err());
    }
}
