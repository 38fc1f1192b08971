use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::domains::jobs::types::{JobHandler, JobKind};
use crate::domains::matching::parent::ParentMatcher;
use crate::domains::qc::service::QcService;
use crate::domains::upload::repository::UploadRepository;
use crate::domains::upload::types::{SessionStatus, UploadStatus};
use crate::errors::{DomainResult, ServiceResult};

/// Runs the crate's background jobs on behalf of the job worker
pub struct UploadJobRunner {
    upload_repo: Arc<dyn UploadRepository>,
    qc_service: Arc<dyn QcService>,
    parent_matcher: Arc<ParentMatcher>,
}

impl UploadJobRunner {
    pub fn new(
        upload_repo: Arc<dyn UploadRepository>,
        qc_service: Arc<dyn QcService>,
        parent_matcher: Arc<ParentMatcher>,
    ) -> Self {
        Self { upload_repo, qc_service, parent_matcher }
    }

    /// A failing run leaves the upload in ERROR with the message in `logs`
    async fn validate_upload(&self, upload_id: i64) -> DomainResult<()> {
        let upload = self.upload_repo.update_status(upload_id, UploadStatus::Processing).await?;

        match self.qc_service.run_validation(upload_id).await {
            Ok(valid) => log::info!("upload {}: validation finished, valid = {}", upload_id, valid),
            Err(e) => {
                log::error!("upload {}: validation failed: {}", upload_id, e);
                self.upload_repo.mark_failed(upload_id, &e.to_string()).await?;
                self.upload_repo
                    .add_status_log(Some(upload_id), Some(upload.session_id), None, &json!({ "error": e.to_string() }))
                    .await?;
            }
        }

        self.settle_session(upload.session_id).await
    }

    /// Once no submitted upload is still running, the session becomes VALID
    /// when all of them passed and ERROR otherwise.
    async fn settle_session(&self, session_id: i64) -> DomainResult<()> {
        let session = self.upload_repo.find_session(session_id).await?;
        if session.status != SessionStatus::Validating {
            return Ok(());
        }

        let uploads = self.upload_repo.find_uploads_by_session(session_id).await?;
        let submitted: Vec<UploadStatus> = uploads
            .iter()
            .map(|u| u.status)
            .filter(|s| !matches!(s, UploadStatus::New | UploadStatus::Canceled))
            .collect();
        if submitted.iter().any(|s| matches!(s, UploadStatus::Started | UploadStatus::Processing)) {
            return Ok(());
        }

        let next = if submitted.iter().all(|s| *s == UploadStatus::Valid) {
            SessionStatus::Valid
        } else {
            SessionStatus::Error
        };
        self.upload_repo.update_session_status(session_id, next, "validation finished").await?;
        Ok(())
    }

    async fn match_parents(&self, session_id: i64) -> DomainResult<()> {
        self.upload_repo.set_session_progress(session_id, "Auto parent matching").await?;
        let report = self.parent_matcher.preprocess(session_id).await?;
        self.upload_repo
            .add_status_log(None, Some(session_id), None, &serde_json::to_value(&report)?)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for UploadJobRunner {
    async fn handle(&self, kind: JobKind) -> ServiceResult<()> {
        match kind {
            JobKind::ValidateUpload { upload_id } => self.validate_upload(upload_id).await?,
            JobKind::ParentMatching { session_id } => self.match_parents(session_id).await?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_migration::test_pool;
    use crate::domains::core::repository::FindById;
    use crate::domains::entity::repository::SqliteEntityRepository;
    use crate::domains::layer::reader::GeoJsonFeatureReader;
    use crate::domains::layer::repository::SqliteLayerFileRepository;
    use crate::domains::upload::repository::{SqliteUploadRepository, UploadStart};
    use crate::domains::upload::types::NewEntityUpload;
    use crate::errors::DomainError;
    use crate::testing::{seed_dataset, seed_session};

    /// Upload 1 validates, anything else blows up
    struct ScriptedQc {
        upload_repo: Arc<SqliteUploadRepository>,
        valid_upload: i64,
    }

    #[async_trait]
    impl QcService for ScriptedQc {
        async fn run_validation(&self, upload_id: i64) -> DomainResult<bool> {
            if upload_id != self.valid_upload {
                return Err(DomainError::File("level_1.geojson: unexpected end of file".into()));
            }
            self.upload_repo
                .update_validation_result(upload_id, UploadStatus::Valid, &json!([]), None)
                .await?;
            Ok(true)
        }

        async fn assign_versions(&self, _upload_id: i64) -> DomainResult<f64> {
            Ok(1.0)
        }

        async fn is_importable(&self, _upload_id: i64, _is_superuser: bool) -> DomainResult<(bool, bool)> {
            Ok((true, false))
        }
    }

    #[tokio::test]
    async fn test_session_settles_after_last_upload() {
        let pool = test_pool().await;
        let dataset = seed_dataset(&pool).await;
        let session_id = seed_session(&pool, dataset.id).await;
        let upload_repo = Arc::new(SqliteUploadRepository::new(pool.clone()));

        let mut starts = Vec::new();
        for code in ["PAK", "IND"] {
            let upload = upload_repo
                .create_upload(&NewEntityUpload { session_id, revised_entity_id: Some(code.into()), ..Default::default() })
                .await
                .unwrap();
            starts.push(UploadStart { upload_id: upload.id, original_geographical_entity_id: None, max_level: None, admin_level_names: None });
        }
        upload_repo.start_entity_uploads(session_id, &starts).await.unwrap();
        upload_repo.update_session_status(session_id, SessionStatus::Validating, "test").await.unwrap();

        let (pak, ind) = (starts[0].upload_id, starts[1].upload_id);
        let runner = UploadJobRunner::new(
            upload_repo.clone(),
            Arc::new(ScriptedQc { upload_repo: upload_repo.clone(), valid_upload: pak }),
            Arc::new(ParentMatcher::new(
                upload_repo.clone(),
                Arc::new(SqliteEntityRepository::new(pool.clone())),
                Arc::new(SqliteLayerFileRepository::new(pool.clone())),
                Arc::new(GeoJsonFeatureReader::new()),
            )),
        );

        runner.handle(JobKind::ValidateUpload { upload_id: pak }).await.unwrap();
        assert_eq!(upload_repo.find_by_id(pak).await.unwrap().status, UploadStatus::Valid);
        assert_eq!(upload_repo.find_session(session_id).await.unwrap().status, SessionStatus::Validating);

        // The failure is captured on the upload rather than returned
        runner.handle(JobKind::ValidateUpload { upload_id: ind }).await.unwrap();
        let ind = upload_repo.find_by_id(ind).await.unwrap();
        assert_eq!(ind.status, UploadStatus::Error);
        assert!(ind.logs.contains("unexpected end of file"));
        assert_eq!(upload_repo.find_status_logs(ind.id).await.unwrap().len(), 1);
        assert_eq!(upload_repo.find_session(session_id).await.unwrap().status, SessionStatus::Error);
    }

    #[tokio::test]
    async fn test_parent_matching_moves_session_to_pending() {
        let pool = test_pool().await;
        let dataset = seed_dataset(&pool).await;
        let session_id = seed_session(&pool, dataset.id).await;
        let upload_repo = Arc::new(SqliteUploadRepository::new(pool.clone()));
        let runner = UploadJobRunner::new(
            upload_repo.clone(),
            Arc::new(ScriptedQc { upload_repo: upload_repo.clone(), valid_upload: 0 }),
            Arc::new(ParentMatcher::new(
                upload_repo.clone(),
                Arc::new(SqliteEntityRepository::new(pool.clone())),
                Arc::new(SqliteLayerFileRepository::new(pool.clone())),
                Arc::new(GeoJsonFeatureReader::new()),
            )),
        );

        runner.handle(JobKind::ParentMatching { session_id }).await.unwrap();
        let session = upload_repo.find_session(session_id).await.unwrap();
        assert!(session.auto_matched_parent_ready);
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.progress.as_deref(), Some("Auto parent matching"));
    }
}
