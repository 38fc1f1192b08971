// JSON contracts (every payload also carries `"auth": {"user_id": 1, "role": "manager"}`):
//   country_candidates       {"session_id": 1, "max_level": 2}
//   has_level                {"session_id": 1, "upload_id": 4, "level": 2}
//   validate_upload_session  {"session_id": 1, "entities": [CountryUploadRequest, ...]}
//   layer_upload_preprocess  {"session_id": 1}
//   session_status           {"session_id": 1}
//   ready_to_review          {"session_id": 1, "upload_ids": [4, 5]}
//   reset_qc_validation      {"session_id": 1}
//   cancel_session           {"session_id": 1}
//   approve_upload           {"upload_id": 4}
//   reject_upload            {"upload_id": 4}

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api::{respond, ApiError, ApiResponse, ApiResult, AuthDto};
use crate::auth::AuthContext;
use crate::domains::matching::{CountryUploadRequest, MatchingService};
use crate::domains::qc::error_types_overview;
use crate::domains::upload::{EntityUploadStatus, UploadService, UploadStatus};
use crate::globals;

#[derive(Deserialize)]
struct SessionPayload {
    session_id: i64,
    auth: AuthDto,
}

#[derive(Deserialize)]
struct CandidatesPayload {
    session_id: i64,
    #[serde(default)]
    max_level: Option<i64>,
    auth: AuthDto,
}

#[derive(Deserialize)]
struct LevelPayload {
    session_id: i64,
    upload_id: i64,
    level: i64,
    auth: AuthDto,
}

#[derive(Deserialize)]
struct ValidatePayload {
    session_id: i64,
    entities: Vec<CountryUploadRequest>,
    auth: AuthDto,
}

#[derive(Deserialize)]
struct ReviewPayload {
    session_id: i64,
    upload_ids: Vec<i64>,
    auth: AuthDto,
}

#[derive(Deserialize)]
struct UploadPayload {
    upload_id: i64,
    auth: AuthDto,
}

/// What the uploader sees for each submitted country
#[derive(Debug, Serialize)]
struct UploadStatusView {
    id: i64,
    revised_entity_id: Option<String>,
    revised_entity_name: Option<String>,
    status: UploadStatus,
    task_id: Option<String>,
}

impl From<EntityUploadStatus> for UploadStatusView {
    fn from(upload: EntityUploadStatus) -> Self {
        Self {
            id: upload.id,
            revised_entity_id: upload.revised_entity_id,
            revised_entity_name: upload.revised_entity_name,
            status: upload.status,
            task_id: upload.task_id,
        }
    }
}

fn parse<T: DeserializeOwned>(payload: &str) -> ApiResult<T> {
    Ok(serde_json::from_str(payload)?)
}

fn auth_context(dto: AuthDto) -> ApiResult<AuthContext> {
    AuthContext::try_from(dto)
}

/// Upload workflow entry points
#[derive(Clone)]
pub struct UploadApi {
    matching: Arc<dyn MatchingService>,
    uploads: Arc<dyn UploadService>,
}

impl UploadApi {
    pub fn new(matching: Arc<dyn MatchingService>, uploads: Arc<dyn UploadService>) -> Self {
        Self { matching, uploads }
    }

    /// Uses the services set up by [`globals::initialize`]
    pub fn from_globals() -> ApiResult<Self> {
        Ok(Self::new(globals::get_matching_service()?, globals::get_upload_service()?))
    }

    pub async fn country_candidates(&self, payload: &str) -> ApiResponse {
        respond(async {
            let p: CandidatesPayload = parse(payload)?;
            let auth = auth_context(p.auth)?;
            Ok::<_, ApiError>(self.matching.country_candidates(p.session_id, p.max_level, &auth).await?)
        }
        .await)
    }

    pub async fn has_level(&self, payload: &str) -> ApiResponse {
        respond(async {
            let p: LevelPayload = parse(payload)?;
            let auth = auth_context(p.auth)?;
            let valid = self.matching.has_level(p.session_id, p.upload_id, p.level, &auth).await?;
            Ok::<_, ApiError>(json!({ "valid": valid }))
        }
        .await)
    }

    /// 200 with one status per country, or 400 with `detail` when any of them
    /// is already under review elsewhere
    pub async fn validate_upload_session(&self, payload: &str) -> ApiResponse {
        respond(async {
            let p: ValidatePayload = parse(payload)?;
            let auth = auth_context(p.auth)?;
            let started = self.matching.validate_upload_session(p.session_id, &p.entities, &auth).await?;
            Ok::<_, ApiError>(started.into_iter().map(UploadStatusView::from).collect::<Vec<_>>())
        }
        .await)
    }

    pub async fn layer_upload_preprocess(&self, payload: &str) -> ApiResponse {
        respond(async {
            let p: SessionPayload = parse(payload)?;
            let auth = auth_context(p.auth)?;
            let task_id = self.matching.layer_upload_preprocess(p.session_id, &auth).await?;
            Ok::<_, ApiError>(json!({ "task_id": task_id }))
        }
        .await)
    }

    pub async fn session_status(&self, payload: &str) -> ApiResponse {
        respond(async {
            let p: SessionPayload = parse(payload)?;
            let auth = auth_context(p.auth)?;
            let session = self.uploads.get_session(p.session_id, &auth).await?;
            let uploads = self.uploads.list_uploads(p.session_id, &auth).await?;
            Ok::<_, ApiError>(json!({ "session": session, "uploads": uploads }))
        }
        .await)
    }

    pub async fn ready_to_review(&self, payload: &str) -> ApiResponse {
        respond(async {
            let p: ReviewPayload = parse(payload)?;
            let auth = auth_context(p.auth)?;
            let moved = self.uploads.ready_to_review(p.session_id, &p.upload_ids, &auth).await?;
            Ok::<_, ApiError>(json!({ "moved": moved }))
        }
        .await)
    }

    pub async fn reset_qc_validation(&self, payload: &str) -> ApiResponse {
        respond(async {
            let p: SessionPayload = parse(payload)?;
            let auth = auth_context(p.auth)?;
            let deleted = self.uploads.reset_qc_validation(p.session_id, &auth).await?;
            Ok::<_, ApiError>(json!({ "deleted_entities": deleted }))
        }
        .await)
    }

    pub async fn cancel_session(&self, payload: &str) -> ApiResponse {
        respond(async {
            let p: SessionPayload = parse(payload)?;
            let auth = auth_context(p.auth)?;
            Ok::<_, ApiError>(self.uploads.cancel_session(p.session_id, &auth).await?)
        }
        .await)
    }

    pub async fn approve_upload(&self, payload: &str) -> ApiResponse {
        respond(async {
            let p: UploadPayload = parse(payload)?;
            let auth = auth_context(p.auth)?;
            Ok::<_, ApiError>(UploadStatusView::from(self.uploads.approve_upload(p.upload_id, &auth).await?))
        }
        .await)
    }

    pub async fn reject_upload(&self, payload: &str) -> ApiResponse {
        respond(async {
            let p: UploadPayload = parse(payload)?;
            let auth = auth_context(p.auth)?;
            Ok::<_, ApiError>(UploadStatusView::from(self.uploads.reject_upload(p.upload_id, &auth).await?))
        }
        .await)
    }

    pub fn error_types(&self) -> ApiResponse {
        respond(Ok(error_types_overview()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_migration::test_pool;
    use crate::domains::dataset::SqliteDatasetRepository;
    use crate::domains::entity::SqliteEntityRepository;
    use crate::domains::layer::{GeoJsonFeatureReader, SqliteLayerFileRepository};
    use crate::domains::matching::MatchingServiceImpl;
    use crate::domains::qc::{QcServiceImpl, ValidationOptions};
    use crate::domains::upload::{NewEntityUpload, SqliteUploadRepository, UploadRepository, UploadServiceImpl};
    use crate::testing::{approve_entity, insert_entity, seed_dataset, seed_session, RecordingJobControl};
    use chrono::Utc;
    use serde_json::Value;

    async fn api(pool: &sqlx::SqlitePool) -> (UploadApi, Arc<SqliteUploadRepository>) {
        let upload_repo = Arc::new(SqliteUploadRepository::new(pool.clone()));
        let entity_repo = Arc::new(SqliteEntityRepository::new(pool.clone()));
        let layer_repo = Arc::new(SqliteLayerFileRepository::new(pool.clone()));
        let reader = Arc::new(GeoJsonFeatureReader::new());
        let jobs = Arc::new(RecordingJobControl::default());
        let qc = Arc::new(QcServiceImpl::new(
            upload_repo.clone(),
            entity_repo.clone(),
            Arc::new(SqliteDatasetRepository::new(pool.clone())),
            layer_repo.clone(),
            reader.clone(),
            ValidationOptions::default(),
        ));
        let matching = Arc::new(MatchingServiceImpl::new(upload_repo.clone(), layer_repo, reader, jobs.clone()));
        let uploads = Arc::new(UploadServiceImpl::new(pool.clone(), upload_repo.clone(), entity_repo, qc, jobs));
        (UploadApi::new(matching, uploads), upload_repo)
    }

    async fn upload_for(repo: &SqliteUploadRepository, session_id: i64) -> i64 {
        repo.create_upload(&NewEntityUpload {
            session_id,
            revised_entity_id: Some("PAK".into()),
            revised_entity_name: Some("Pakistan".into()),
            ..Default::default()
        })
        .await
        .unwrap()
        .id
    }

    fn payload(session_id: i64, upload_id: i64, country_entity_id: i64) -> String {
        json!({
            "session_id": session_id,
            "entities": [{
                "id": country_entity_id,
                "layer0_id": "PAK",
                "country_entity_id": country_entity_id,
                "max_level": "1",
                "country": "Pakistan",
                "upload_id": upload_id,
                "admin_level_names": {"0": "Country"}
            }],
            "auth": {"user_id": 1, "role": "uploader"}
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_validate_upload_session_conflict_and_success() {
        let pool = test_pool().await;
        let dataset = seed_dataset(&pool).await;
        let pak = insert_entity(&pool, dataset.id, 0, "PAK", None, Utc::now()).await;
        approve_entity(&pool, pak, Some(1.0)).await;
        let (api, upload_repo) = api(&pool).await;

        let reviewing_session = seed_session(&pool, dataset.id).await;
        let in_review = upload_for(&upload_repo, reviewing_session).await;
        sqlx::query("UPDATE entity_upload_status SET status = 'REVIEWING', original_geographical_entity_id = ? WHERE id = ?")
            .bind(pak)
            .bind(in_review)
            .execute(&pool)
            .await
            .unwrap();

        let session_id = seed_session(&pool, dataset.id).await;
        let upload_id = upload_for(&upload_repo, session_id).await;

        let response = api.validate_upload_session(&payload(session_id, upload_id, pak)).await;
        assert_eq!(response.status, 400);
        let detail = response.body["detail"].as_str().unwrap();
        assert!(detail.contains("ongoing review for Pakistan"));

        // Once the other review is decided the same submission goes through
        sqlx::query("UPDATE entity_upload_status SET status = 'APPROVED' WHERE id = ?")
            .bind(in_review)
            .execute(&pool)
            .await
            .unwrap();
        let response = api.validate_upload_session(&payload(session_id, upload_id, pak)).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body[0]["status"], Value::from("STARTED"));
        assert_eq!(response.body[0]["task_id"], Value::from("task-1"));
        assert_eq!(upload_repo.find_session(session_id).await.unwrap().status.as_str(), "VALIDATING");
    }

    #[tokio::test]
    async fn test_bad_payloads_and_missing_records() {
        let pool = test_pool().await;
        let (api, _) = api(&pool).await;

        let response = api.validate_upload_session("{\"session_id\": 1").await;
        assert_eq!(response.status, 400);

        let response = api
            .session_status(&json!({"session_id": 99, "auth": {"user_id": 1, "role": "viewer"}}).to_string())
            .await;
        assert_eq!(response.status, 403);

        let response = api
            .session_status(&json!({"session_id": 99, "auth": {"user_id": 1, "role": "manager"}}).to_string())
            .await;
        assert_eq!(response.status, 404);

        let overview = api.error_types();
        assert!(overview.body["error"].as_array().unwrap().len() > 0);
    }
}
