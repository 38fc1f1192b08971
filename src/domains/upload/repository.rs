use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::{query, query_as, query_scalar, Pool, Sqlite, Transaction};

use crate::domains::core::repository::{FindById, FindByIdWithTx};
use crate::domains::upload::types::{
    EntityUploadChildLv1, EntityUploadStatus, EntityUploadStatusLog, EntityUploadStatusRow, LayerUploadSession,
    LayerUploadSessionRow, NewEntityUpload, NewEntityUploadChildLv1, NewLayerUploadSession, SessionActionLog,
    SessionStatus, UploadStatus,
};
use crate::errors::{DbError, DomainError, DomainResult};
use crate::types::format_timestamp;

/// One accepted country candidate, applied by [`UploadRepository::start_entity_uploads`]
#[derive(Debug, Clone, PartialEq)]
pub struct UploadStart {
    pub upload_id: i64,
    pub original_geographical_entity_id: Option<i64>,
    pub max_level: Option<i64>,
    pub admin_level_names: Option<Value>,
}

/// Sessions, their per-country uploads and the logs around them
#[async_trait]
pub trait UploadRepository: FindById<EntityUploadStatus> + FindByIdWithTx<EntityUploadStatus> + Send + Sync {
    async fn create_session(&self, new_session: &NewLayerUploadSession) -> DomainResult<LayerUploadSession>;

    async fn find_session(&self, session_id: i64) -> DomainResult<LayerUploadSession>;

    /// Move the session along its lifecycle and record the step in the action log
    async fn update_session_status(&self, session_id: i64, next: SessionStatus, action: &str) -> DomainResult<LayerUploadSession>;

    async fn set_session_progress(&self, session_id: i64, progress: &str) -> DomainResult<()>;

    async fn set_session_task_id(&self, session_id: i64, task_id: Option<&str>) -> DomainResult<()>;

    /// Parent matching finished: flag the session and make it PENDING
    async fn mark_parent_matching_ready(&self, session_id: i64) -> DomainResult<LayerUploadSession>;

    async fn find_action_logs(&self, session_id: i64) -> DomainResult<Vec<SessionActionLog>>;

    async fn create_upload(&self, new_upload: &NewEntityUpload) -> DomainResult<EntityUploadStatus>;

    async fn find_uploads_by_session(&self, session_id: i64) -> DomainResult<Vec<EntityUploadStatus>>;

    async fn find_upload_by_revised_entity(&self, session_id: i64, revised_entity_id: &str) -> DomainResult<Option<EntityUploadStatus>>;

    /// Bind every candidate and set it STARTED, or change nothing when one of
    /// them conflicts with a review already running for the same country.
    async fn start_entity_uploads(&self, session_id: i64, starts: &[UploadStart]) -> DomainResult<Vec<EntityUploadStatus>>;

    /// Move uploads into review under the same single-review rule
    async fn start_review(&self, session_id: i64, upload_ids: &[i64], progress: &str) -> DomainResult<u64>;

    async fn update_status(&self, upload_id: i64, next: UploadStatus) -> DomainResult<EntityUploadStatus>;

    async fn set_task_id(&self, upload_id: i64, task_id: Option<&str>) -> DomainResult<()>;

    async fn set_progress(&self, upload_id: i64, progress: &str) -> DomainResult<()>;

    async fn set_revision_number(&self, upload_id: i64, revision_number: i64) -> DomainResult<()>;

    async fn set_unique_code_version(&self, upload_id: i64, version: f64) -> DomainResult<()>;

    /// Store the outcome of a validation run
    async fn update_validation_result(
        &self,
        upload_id: i64,
        status: UploadStatus,
        summaries: &Value,
        error_report: Option<&str>,
    ) -> DomainResult<EntityUploadStatus>;

    /// Background failure: ERROR with the diagnostic kept in `logs`
    async fn mark_failed(&self, upload_id: i64, logs: &str) -> DomainResult<()>;

    async fn decide_upload_with_tx<'t>(
        &self,
        upload_id: i64,
        status: UploadStatus,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;

    /// Blank status, logs, summaries, error report and task of every upload in the session
    async fn reset_uploads(&self, session_id: i64) -> DomainResult<u64>;

    async fn add_child_lv1(&self, child: &NewEntityUploadChildLv1) -> DomainResult<EntityUploadChildLv1>;

    async fn find_children_lv1(&self, upload_id: i64) -> DomainResult<Vec<EntityUploadChildLv1>>;

    async fn clear_children_lv1(&self, upload_id: i64) -> DomainResult<u64>;

    async fn add_status_log(
        &self,
        upload_id: Option<i64>,
        session_id: Option<i64>,
        parent_log_id: Option<i64>,
        logs: &Value,
    ) -> DomainResult<i64>;

    async fn find_status_logs(&self, upload_id: i64) -> DomainResult<Vec<EntityUploadStatusLog>>;
}

pub struct SqliteUploadRepository {
    pool: Pool<Sqlite>,
}

impl SqliteUploadRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    fn entity_name(&self) -> &'static str {
        "entity_upload_status"
    }

    fn now() -> String {
        format_timestamp(&Utc::now())
    }

    async fn current_upload_status(&self, upload_id: i64) -> DomainResult<UploadStatus> {
        Ok(self.find_by_id(upload_id).await?.status)
    }

    fn invalid_upload_transition(from: UploadStatus, to: UploadStatus) -> DomainError {
        DomainError::InvalidTransition {
            entity_type: "entity upload".to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Upload id of a REVIEWING upload, other than `upload_id`, on the same
    /// original entity anywhere in the dataset
    async fn conflicting_review<'t>(
        tx: &mut Transaction<'t, Sqlite>,
        dataset_id: i64,
        upload_id: i64,
        original_entity_id: i64,
    ) -> DomainResult<Option<i64>> {
        let other: Option<i64> = query_scalar(
            "SELECT u.id FROM entity_upload_status u
             JOIN layer_upload_sessions s ON s.id = u.session_id
             WHERE u.status = 'REVIEWING' AND u.original_geographical_entity_id = ?
               AND u.id != ? AND s.dataset_id = ?
             LIMIT 1"
        )
        .bind(original_entity_id)
        .bind(upload_id)
        .bind(dataset_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(DbError::from)?;
        Ok(other)
    }

    /// First write of the transaction; SQLite hands out the write lock here,
    /// so concurrent submitters serialize before their conflict checks.
    async fn lock_session<'t>(tx: &mut Transaction<'t, Sqlite>, session_id: i64) -> DomainResult<i64> {
        let dataset_id: Option<i64> = query_scalar(
            "UPDATE layer_upload_sessions SET updated_at = ? WHERE id = ? RETURNING dataset_id"
        )
        .bind(Self::now())
        .bind(session_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(DbError::from)?;
        dataset_id.ok_or_else(|| DomainError::not_found("layer_upload_session", session_id))
    }
}

#[async_trait]
impl FindById<EntityUploadStatus> for SqliteUploadRepository {
    async fn find_by_id(&self, id: i64) -> DomainResult<EntityUploadStatus> {
        query_as::<_, EntityUploadStatusRow>("SELECT * FROM entity_upload_status WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DomainError::not_found(self.entity_name(), id))?
            .into_entity()
    }
}

#[async_trait]
impl FindByIdWithTx<EntityUploadStatus> for SqliteUploadRepository {
    async fn find_by_id_with_tx<'t>(&self, id: i64, tx: &mut Transaction<'t, Sqlite>) -> DomainResult<EntityUploadStatus> {
        query_as::<_, EntityUploadStatusRow>("SELECT * FROM entity_upload_status WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DomainError::not_found(self.entity_name(), id))?
            .into_entity()
    }
}

#[async_trait]
impl UploadRepository for SqliteUploadRepository {
    async fn create_session(&self, new_session: &NewLayerUploadSession) -> DomainResult<LayerUploadSession> {
        let now = Utc::now();
        let result = query(
            "INSERT INTO layer_upload_sessions (
                dataset_id, status, is_historical_upload, started_at, historical_start_date,
                historical_end_date, updated_at
             ) VALUES (?, 'STARTED', ?, ?, ?, ?, ?)"
        )
        .bind(new_session.dataset_id)
        .bind(new_session.is_historical_upload)
        .bind(format_timestamp(&new_session.started_at.unwrap_or(now)))
        .bind(new_session.historical_start_date.as_ref().map(format_timestamp))
        .bind(new_session.historical_end_date.as_ref().map(format_timestamp))
        .bind(format_timestamp(&now))
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        self.find_session(result.last_insert_rowid()).await
    }

    async fn find_session(&self, session_id: i64) -> DomainResult<LayerUploadSession> {
        query_as::<_, LayerUploadSessionRow>("SELECT * FROM layer_upload_sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DomainError::not_found("layer_upload_session", session_id))?
            .into_entity()
    }

    async fn update_session_status(&self, session_id: i64, next: SessionStatus, action: &str) -> DomainResult<LayerUploadSession> {
        let session = self.find_session(session_id).await?;
        if session.status == next {
            return Ok(session);
        }
        if !session.status.can_transition_to(next) {
            return Err(DomainError::InvalidTransition {
                entity_type: "upload session".to_string(),
                from: session.status.to_string(),
                to: next.to_string(),
            });
        }

        let now = Self::now();
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        query("UPDATE layer_upload_sessions SET status = ?, updated_at = ? WHERE id = ?")
            .bind(next.as_str())
            .bind(&now)
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::from)?;
        query(
            "INSERT INTO layer_upload_session_action_logs (session_id, action, state_from, state_to, started_at, finished_at)
             VALUES (?, ?, ?, ?, ?, ?)"
        )
        .bind(session_id)
        .bind(action)
        .bind(session.status.as_str())
        .bind(next.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(DbError::from)?;
        tx.commit().await.map_err(DbError::from)?;

        log::info!("session {}: {} -> {} ({})", session_id, session.status, next, action);
        self.find_session(session_id).await
    }

    async fn set_session_progress(&self, session_id: i64, progress: &str) -> DomainResult<()> {
        query("UPDATE layer_upload_sessions SET progress = ?, updated_at = ? WHERE id = ?")
            .bind(progress)
            .bind(Self::now())
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    async fn set_session_task_id(&self, session_id: i64, task_id: Option<&str>) -> DomainResult<()> {
        query("UPDATE layer_upload_sessions SET task_id = ?, updated_at = ? WHERE id = ?")
            .bind(task_id)
            .bind(Self::now())
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    async fn mark_parent_matching_ready(&self, session_id: i64) -> DomainResult<LayerUploadSession> {
        query("UPDATE layer_upload_sessions SET auto_matched_parent_ready = 1, updated_at = ? WHERE id = ?")
            .bind(Self::now())
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        self.update_session_status(session_id, SessionStatus::Pending, "parent_matching").await
    }

    async fn find_action_logs(&self, session_id: i64) -> DomainResult<Vec<SessionActionLog>> {
        let logs = query_as::<_, SessionActionLog>(
            "SELECT * FROM layer_upload_session_action_logs WHERE session_id = ? ORDER BY id"
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(logs)
    }

    async fn create_upload(&self, new_upload: &NewEntityUpload) -> DomainResult<EntityUploadStatus> {
        let result = query(
            "INSERT INTO entity_upload_status (
                session_id, original_geographical_entity_id, revised_entity_id, revised_entity_name,
                max_level, status, updated_at
             ) VALUES (?, ?, ?, ?, ?, '', ?)"
        )
        .bind(new_upload.session_id)
        .bind(new_upload.original_geographical_entity_id)
        .bind(&new_upload.revised_entity_id)
        .bind(&new_upload.revised_entity_name)
        .bind(new_upload.max_level)
        .bind(Self::now())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        self.find_by_id(result.last_insert_rowid()).await
    }

    async fn find_uploads_by_session(&self, session_id: i64) -> DomainResult<Vec<EntityUploadStatus>> {
        let rows = query_as::<_, EntityUploadStatusRow>(
            "SELECT * FROM entity_upload_status WHERE session_id = ? ORDER BY id"
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;
        rows.into_iter().map(EntityUploadStatusRow::into_entity).collect()
    }

    async fn find_upload_by_revised_entity(&self, session_id: i64, revised_entity_id: &str) -> DomainResult<Option<EntityUploadStatus>> {
        let row = query_as::<_, EntityUploadStatusRow>(
            "SELECT * FROM entity_upload_status WHERE session_id = ? AND revised_entity_id = ? ORDER BY id LIMIT 1"
        )
        .bind(session_id)
        .bind(revised_entity_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;
        row.map(EntityUploadStatusRow::into_entity).transpose()
    }

    async fn start_entity_uploads(&self, session_id: i64, starts: &[UploadStart]) -> DomainResult<Vec<EntityUploadStatus>> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        let dataset_id = Self::lock_session(&mut tx, session_id).await?;
        let now = Self::now();

        for start in starts {
            let current = self.find_by_id_with_tx(start.upload_id, &mut tx).await?;
            if current.session_id != session_id {
                return Err(DomainError::Conflict(format!(
                    "Upload {} does not belong to session {}",
                    start.upload_id, session_id
                )));
            }
            if !current.status.can_transition_to(UploadStatus::Started) {
                return Err(Self::invalid_upload_transition(current.status, UploadStatus::Started));
            }

            if let Some(original_id) = start.original_geographical_entity_id {
                if let Some(other) = Self::conflicting_review(&mut tx, dataset_id, start.upload_id, original_id).await? {
                    log::warn!(
                        "session {}: upload {} blocked, upload {} is already in review for entity {}",
                        session_id, start.upload_id, other, original_id
                    );
                    // Dropping the transaction rolls back every candidate
                    return Err(DomainError::Conflict(format!(
                        "There is ongoing review for {}, please try again once the review is finished",
                        current.revised_entity_name.as_deref().or(current.revised_entity_id.as_deref()).unwrap_or("this country")
                    )));
                }
            }

            let admin_level_names = start.admin_level_names.as_ref().map(serde_json::to_string).transpose()?;
            query(
                "UPDATE entity_upload_status SET
                    original_geographical_entity_id = ?, max_level = ?, admin_level_names = ?,
                    status = 'STARTED', summaries = NULL, logs = '', error_report = NULL, task_id = NULL,
                    progress = NULL, unique_code_version = NULL, revision_number = NULL, updated_at = ?
                 WHERE id = ?"
            )
            .bind(start.original_geographical_entity_id)
            .bind(start.max_level)
            .bind(admin_level_names)
            .bind(&now)
            .bind(start.upload_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::from)?;
        }

        tx.commit().await.map_err(DbError::from)?;

        let mut started = Vec::with_capacity(starts.len());
        for start in starts {
            started.push(self.find_by_id(start.upload_id).await?);
        }
        Ok(started)
    }

    async fn start_review(&self, session_id: i64, upload_ids: &[i64], progress: &str) -> DomainResult<u64> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        let dataset_id = Self::lock_session(&mut tx, session_id).await?;
        let now = Self::now();
        let mut moved = 0;

        for &upload_id in upload_ids {
            let current = self.find_by_id_with_tx(upload_id, &mut tx).await?;
            if !current.status.can_transition_to(UploadStatus::Reviewing) {
                return Err(Self::invalid_upload_transition(current.status, UploadStatus::Reviewing));
            }
            if let Some(original_id) = current.original_geographical_entity_id {
                if Self::conflicting_review(&mut tx, dataset_id, upload_id, original_id).await?.is_some() {
                    return Err(DomainError::Conflict(format!(
                        "There is ongoing review for {}",
                        current.revised_entity_name.as_deref().or(current.revised_entity_id.as_deref()).unwrap_or("this country")
                    )));
                }
            }
            let result = query(
                "UPDATE entity_upload_status SET status = 'REVIEWING', progress = ?, updated_at = ? WHERE id = ?"
            )
            .bind(progress)
            .bind(&now)
            .bind(upload_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::from)?;
            moved += result.rows_affected();
        }

        tx.commit().await.map_err(DbError::from)?;
        Ok(moved)
    }

    async fn update_status(&self, upload_id: i64, next: UploadStatus) -> DomainResult<EntityUploadStatus> {
        let current = self.current_upload_status(upload_id).await?;
        if !current.can_transition_to(next) {
            return Err(Self::invalid_upload_transition(current, next));
        }
        query("UPDATE entity_upload_status SET status = ?, updated_at = ? WHERE id = ?")
            .bind(next.as_str())
            .bind(Self::now())
            .bind(upload_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        self.find_by_id(upload_id).await
    }

    async fn set_task_id(&self, upload_id: i64, task_id: Option<&str>) -> DomainResult<()> {
        query("UPDATE entity_upload_status SET task_id = ?, updated_at = ? WHERE id = ?")
            .bind(task_id)
            .bind(Self::now())
            .bind(upload_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    async fn set_progress(&self, upload_id: i64, progress: &str) -> DomainResult<()> {
        query("UPDATE entity_upload_status SET progress = ?, updated_at = ? WHERE id = ?")
            .bind(progress)
            .bind(Self::now())
            .bind(upload_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    async fn set_revision_number(&self, upload_id: i64, revision_number: i64) -> DomainResult<()> {
        query("UPDATE entity_upload_status SET revision_number = ?, updated_at = ? WHERE id = ?")
            .bind(revision_number)
            .bind(Self::now())
            .bind(upload_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    async fn set_unique_code_version(&self, upload_id: i64, version: f64) -> DomainResult<()> {
        query("UPDATE entity_upload_status SET unique_code_version = ?, updated_at = ? WHERE id = ?")
            .bind(version)
            .bind(Self::now())
            .bind(upload_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    async fn update_validation_result(
        &self,
        upload_id: i64,
        status: UploadStatus,
        summaries: &Value,
        error_report: Option<&str>,
    ) -> DomainResult<EntityUploadStatus> {
        let current = self.current_upload_status(upload_id).await?;
        if !current.can_transition_to(status) {
            return Err(Self::invalid_upload_transition(current, status));
        }
        query(
            "UPDATE entity_upload_status SET status = ?, summaries = ?, error_report = ?, updated_at = ? WHERE id = ?"
        )
        .bind(status.as_str())
        .bind(serde_json::to_string(summaries)?)
        .bind(error_report)
        .bind(Self::now())
        .bind(upload_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        self.find_by_id(upload_id).await
    }

    async fn mark_failed(&self, upload_id: i64, logs: &str) -> DomainResult<()> {
        query(
            "UPDATE entity_upload_status SET status = 'ERROR', logs = ?, updated_at = ?
             WHERE id = ? AND status NOT IN ('APPROVED', 'REJECTED', 'CANCELED')"
        )
        .bind(logs)
        .bind(Self::now())
        .bind(upload_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(())
    }

    async fn decide_upload_with_tx<'t>(
        &self,
        upload_id: i64,
        status: UploadStatus,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        let current = self.find_by_id_with_tx(upload_id, tx).await?;
        if !current.status.can_transition_to(status) {
            return Err(Self::invalid_upload_transition(current.status, status));
        }
        query("UPDATE entity_upload_status SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Self::now())
            .bind(upload_id)
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    async fn reset_uploads(&self, session_id: i64) -> DomainResult<u64> {
        let result = query(
            "UPDATE entity_upload_status SET
                status = '', logs = '', summaries = NULL, error_report = NULL, task_id = NULL,
                progress = NULL, unique_code_version = NULL, revision_number = NULL, updated_at = ?
             WHERE session_id = ?"
        )
        .bind(Self::now())
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(result.rows_affected())
    }

    async fn add_child_lv1(&self, child: &NewEntityUploadChildLv1) -> DomainResult<EntityUploadChildLv1> {
        let result = query(
            "INSERT INTO entity_upload_children_lv1 (entity_upload_id, entity_id, entity_name, parent_entity_id, is_parent_rematched)
             VALUES (?, ?, ?, ?, ?)"
        )
        .bind(child.entity_upload_id)
        .bind(&child.entity_id)
        .bind(&child.entity_name)
        .bind(&child.parent_entity_id)
        .bind(child.is_parent_rematched)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(EntityUploadChildLv1 {
            id: result.last_insert_rowid(),
            entity_upload_id: child.entity_upload_id,
            entity_id: child.entity_id.clone(),
            entity_name: child.entity_name.clone(),
            parent_entity_id: child.parent_entity_id.clone(),
            is_parent_rematched: child.is_parent_rematched,
        })
    }

    async fn find_children_lv1(&self, upload_id: i64) -> DomainResult<Vec<EntityUploadChildLv1>> {
        let children = query_as::<_, EntityUploadChildLv1>(
            "SELECT * FROM entity_upload_children_lv1 WHERE entity_upload_id = ? ORDER BY id"
        )
        .bind(upload_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(children)
    }

    async fn clear_children_lv1(&self, upload_id: i64) -> DomainResult<u64> {
        let result = query("DELETE FROM entity_upload_children_lv1 WHERE entity_upload_id = ?")
            .bind(upload_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(result.rows_affected())
    }

    async fn add_status_log(
        &self,
        upload_id: Option<i64>,
        session_id: Option<i64>,
        parent_log_id: Option<i64>,
        logs: &Value,
    ) -> DomainResult<i64> {
        let result = query(
            "INSERT INTO entity_upload_status_logs (entity_upload_id, session_id, parent_log_id, logs, created_at)
             VALUES (?, ?, ?, ?, ?)"
        )
        .bind(upload_id)
        .bind(session_id)
        .bind(parent_log_id)
        .bind(serde_json::to_string(logs)?)
        .bind(Self::now())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(result.last_insert_rowid())
    }

    async fn find_status_logs(&self, upload_id: i64) -> DomainResult<Vec<EntityUploadStatusLog>> {
        let logs = query_as::<_, EntityUploadStatusLog>(
            "SELECT * FROM entity_upload_status_logs WHERE entity_upload_id = ? ORDER BY id"
        )
        .bind(upload_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_migration::test_pool;
    use crate::testing::{insert_entity, seed_dataset, seed_session, set_upload_status};
    use chrono::TimeZone;
    use serde_json::json;

    async fn upload(repo: &SqliteUploadRepository, session_id: i64, code: &str) -> EntityUploadStatus {
        repo.create_upload(&NewEntityUpload {
            session_id,
            revised_entity_id: Some(code.to_string()),
            revised_entity_name: Some(format!("{} name", code)),
            ..Default::default()
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_clears_previous_results() {
        let pool = test_pool().await;
        let dataset = seed_dataset(&pool).await;
        let session_id = seed_session(&pool, dataset.id).await;
        let repo = SqliteUploadRepository::new(pool.clone());
        let pak = upload(&repo, session_id, "PAK").await;

        set_upload_status(&pool, pak.id, "ERROR").await;
        sqlx::query("UPDATE entity_upload_status SET summaries = '[]', logs = 'boom', error_report = '/tmp/r.csv', task_id = 't1' WHERE id = ?")
            .bind(pak.id)
            .execute(&pool)
            .await
            .unwrap();

        let started = repo
            .start_entity_uploads(session_id, &[UploadStart {
                upload_id: pak.id,
                original_geographical_entity_id: None,
                max_level: Some(2),
                admin_level_names: Some(json!({"0": "Country", "1": "Province"})),
            }])
            .await
            .unwrap();

        let pak = &started[0];
        assert_eq!(pak.status, UploadStatus::Started);
        assert_eq!(pak.max_level, Some(2));
        assert!(pak.summaries.is_none());
        assert!(pak.error_report.is_none());
        assert!(pak.task_id.is_none());
        assert_eq!(pak.logs, "");
        assert_eq!(pak.admin_level_names, Some(json!({"0": "Country", "1": "Province"})));
    }

    #[tokio::test]
    async fn test_conflicting_review_rolls_back_whole_submission() {
        let pool = test_pool().await;
        let dataset = seed_dataset(&pool).await;
        let start = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let pakistan = insert_entity(&pool, dataset.id, 0, "PAK", None, start).await;

        let repo = SqliteUploadRepository::new(pool.clone());
        let other_session = seed_session(&pool, dataset.id).await;
        let in_review = upload(&repo, other_session, "PAK").await;
        sqlx::query("UPDATE entity_upload_status SET status = 'REVIEWING', original_geographical_entity_id = ? WHERE id = ?")
            .bind(pakistan)
            .bind(in_review.id)
            .execute(&pool)
            .await
            .unwrap();

        let session_id = seed_session(&pool, dataset.id).await;
        let afg = upload(&repo, session_id, "AFG").await;
        let pak = upload(&repo, session_id, "PAK").await;
        let result = repo
            .start_entity_uploads(session_id, &[
                UploadStart { upload_id: afg.id, original_geographical_entity_id: None, max_level: Some(1), admin_level_names: None },
                UploadStart { upload_id: pak.id, original_geographical_entity_id: Some(pakistan), max_level: Some(1), admin_level_names: None },
            ])
            .await;

        match result {
            Err(DomainError::Conflict(detail)) => assert!(detail.contains("ongoing review")),
            other => panic!("expected conflict, got {:?}", other),
        }
        // The accepted first candidate was rolled back too
        assert_eq!(repo.find_by_id(afg.id).await.unwrap().status, UploadStatus::New);
    }

    #[tokio::test]
    async fn test_session_status_writes_action_log() {
        let pool = test_pool().await;
        let dataset = seed_dataset(&pool).await;
        let session_id = seed_session(&pool, dataset.id).await;
        let repo = SqliteUploadRepository::new(pool);

        let session = repo.mark_parent_matching_ready(session_id).await.unwrap();
        assert!(session.auto_matched_parent_ready);
        assert_eq!(session.status, SessionStatus::Pending);

        assert!(repo.update_session_status(session_id, SessionStatus::Done, "approve").await.is_err());

        let logs = repo.find_action_logs(session_id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].state_from, "STARTED");
        assert_eq!(logs[0].state_to, "PENDING");
    }

    #[tokio::test]
    async fn test_reset_blanks_uploads() {
        let pool = test_pool().await;
        let dataset = seed_dataset(&pool).await;
        let session_id = seed_session(&pool, dataset.id).await;
        let repo = SqliteUploadRepository::new(pool.clone());
        let pak = upload(&repo, session_id, "PAK").await;
        set_upload_status(&pool, pak.id, "VALID").await;
        repo.set_task_id(pak.id, Some("task")).await.unwrap();

        assert_eq!(repo.reset_uploads(session_id).await.unwrap(), 1);
        let pak = repo.find_by_id(pak.id).await.unwrap();
        assert_eq!(pak.status, UploadStatus::New);
        assert!(pak.task_id.is_none());
    }

    #[tokio::test]
    async fn test_children_and_logs() {
        let pool = test_pool().await;
        let dataset = seed_dataset(&pool).await;
        let session_id = seed_session(&pool, dataset.id).await;
        let repo = SqliteUploadRepository::new(pool);
        let pak = upload(&repo, session_id, "PAK").await;

        repo.add_child_lv1(&NewEntityUploadChildLv1 {
            entity_upload_id: pak.id,
            entity_id: "PAK001".into(),
            entity_name: Some("Punjab".into()),
            parent_entity_id: Some("PAQ".into()),
            is_parent_rematched: true,
        })
        .await
        .unwrap();
        let children = repo.find_children_lv1(pak.id).await.unwrap();
        assert_eq!(children.len(), 1);
        assert!(children[0].is_parent_rematched);
        assert_eq!(repo.clear_children_lv1(pak.id).await.unwrap(), 1);

        let parent = repo.add_status_log(Some(pak.id), Some(session_id), None, &json!({"step": "read"})).await.unwrap();
        repo.add_status_log(Some(pak.id), None, Some(parent), &json!({"step": "level 1"})).await.unwrap();
        let logs = repo.find_status_logs(pak.id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].parent_log_id, Some(parent));
    }
}
