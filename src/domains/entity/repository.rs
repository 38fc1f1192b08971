use async_trait::async_trait;
use serde_json::Value;
use sqlx::{query, query_as, query_scalar, Pool, Sqlite, Transaction};
use uuid::Uuid;

use crate::domains::core::repository::FindById;
use crate::domains::entity::geometry::Geometry;
use crate::domains::entity::types::{
    ApprovedNeighbor, EntityId, EntityName, GeographicalEntity, GeographicalEntityRow, MatchCandidate,
    MatchCandidateRow, NewGeographicalEntity,
};
use crate::errors::{DbError, DomainError, DomainResult};
use crate::types::{format_timestamp, ChunkCursor};

/// Persistence for revisioned boundary entities
#[async_trait]
pub trait EntityRepository: FindById<GeographicalEntity> + Send + Sync {
    /// Create or update the pending row keyed on (no parent, uuid, revision, level)
    async fn upsert_pending(&self, new_entity: &NewGeographicalEntity) -> DomainResult<GeographicalEntity>;

    async fn set_simplified_geometry(&self, id: i64, geometry: &Value) -> DomainResult<()>;

    /// Returns false when the (entity, id type) pair already existed
    async fn add_entity_id(&self, entity_id: i64, id_type_id: i64, value: &str, is_default: bool) -> DomainResult<bool>;

    async fn add_entity_name(
        &self,
        entity_id: i64,
        name: &str,
        language_id: Option<i64>,
        is_default: bool,
        idx: i64,
    ) -> DomainResult<()>;

    async fn find_entity_ids(&self, entity_id: i64) -> DomainResult<Vec<EntityId>>;

    async fn find_entity_names(&self, entity_id: i64) -> DomainResult<Vec<EntityName>>;

    async fn max_approved_revision(&self, dataset_id: i64) -> DomainResult<Option<i64>>;

    /// Earliest approved entity starting strictly after `start_date`
    async fn next_approved_after(&self, dataset_id: i64, start_date: &str) -> DomainResult<Option<ApprovedNeighbor>>;

    /// Latest approved entity starting strictly before `start_date`
    async fn previous_approved_before(&self, dataset_id: i64, start_date: &str) -> DomainResult<Option<ApprovedNeighbor>>;

    /// One keyset page of an upload's entities, ordered by id
    async fn find_by_upload_chunk(&self, upload_id: i64, cursor: ChunkCursor) -> DomainResult<Vec<GeographicalEntity>>;

    async fn find_by_upload_at_level(&self, upload_id: i64, level: i64) -> DomainResult<Vec<GeographicalEntity>>;

    async fn count_by_upload(&self, upload_id: i64) -> DomainResult<i64>;

    async fn set_parent(&self, id: i64, parent_id: Option<i64>, ancestor_id: Option<i64>) -> DomainResult<()>;

    async fn set_unique_code(&self, id: i64, unique_code: &str) -> DomainResult<()>;

    async fn set_unique_code_version(&self, id: i64, version: f64) -> DomainResult<()>;

    /// Highest `_NNNN` suffix used under `parent_code` at `level`, across all revisions
    async fn max_child_sequence(&self, dataset_id: i64, parent_code: &str, level: i64) -> DomainResult<Option<u32>>;

    /// Approved, latest entities at a level with their parent's concept uuid
    async fn find_latest_approved_at_level(&self, dataset_id: i64, level: i64) -> DomainResult<Vec<MatchCandidate>>;

    /// Approved, latest level-0 entity carrying the given internal code
    async fn find_latest_approved_root(&self, dataset_id: i64, internal_code: &str) -> DomainResult<Option<GeographicalEntity>>;

    /// Continue an existing concept: take over its uuid and unique code
    async fn inherit_concept(&self, id: i64, uuid: Uuid, unique_code: Option<&str>) -> DomainResult<()>;

    async fn delete_by_session(&self, session_id: i64) -> DomainResult<u64>;

    /// Drop rows a previous run of the upload left pending
    async fn delete_pending_by_upload(&self, upload_id: i64) -> DomainResult<u64>;

    /// Promote an upload's entities and demote the previous latest rows of the same concepts
    async fn approve_upload_with_tx<'t>(&self, upload_id: i64, tx: &mut Transaction<'t, Sqlite>) -> DomainResult<u64>;

    async fn reject_upload_with_tx<'t>(&self, upload_id: i64, tx: &mut Transaction<'t, Sqlite>) -> DomainResult<u64>;
}

pub struct SqliteEntityRepository {
    pool: Pool<Sqlite>,
}

impl SqliteEntityRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    fn entity_name(&self) -> &'static str {
        "geographical_entity"
    }

    fn map_rows(rows: Vec<GeographicalEntityRow>) -> DomainResult<Vec<GeographicalEntity>> {
        rows.into_iter().map(GeographicalEntityRow::into_entity).collect()
    }
}

#[async_trait]
impl FindById<GeographicalEntity> for SqliteEntityRepository {
    async fn find_by_id(&self, id: i64) -> DomainResult<GeographicalEntity> {
        let row = query_as::<_, GeographicalEntityRow>("SELECT * FROM geographical_entities WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DomainError::not_found(self.entity_name(), id))?;

        row.into_entity()
    }
}

#[async_trait]
impl EntityRepository for SqliteEntityRepository {
    async fn upsert_pending(&self, new_entity: &NewGeographicalEntity) -> DomainResult<GeographicalEntity> {
        let geometry = Geometry::from_geojson(&new_entity.geometry)?;
        let bbox = geometry.bbox().map(|b| serde_json::to_string(&b)).transpose()?;
        let geometry_text = serde_json::to_string(&new_entity.geometry)?;
        let start_date = format_timestamp(&new_entity.start_date);
        let end_date = new_entity.end_date.as_ref().map(format_timestamp);

        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let existing: Option<i64> = query_scalar(
            "SELECT id FROM geographical_entities
             WHERE parent_id IS NULL AND uuid = ? AND revision_number = ? AND level = ?"
        )
        .bind(new_entity.uuid.to_string())
        .bind(new_entity.revision_number)
        .bind(new_entity.level)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DbError::from)?;

        let id = match existing {
            Some(id) => {
                query(
                    "UPDATE geographical_entities SET
                        layer_file_id = ?, entity_upload_id = ?, dataset_id = ?, start_date = ?, end_date = ?,
                        boundary_type = ?, label = ?, internal_code = ?, geometry = ?, bbox = ?,
                        is_approved = NULL, is_latest = 0, ancestor_id = NULL, admin_level_name = ?,
                        privacy_level = ?, parent_code = ?
                     WHERE id = ?"
                )
                .bind(new_entity.layer_file_id)
                .bind(new_entity.entity_upload_id)
                .bind(new_entity.dataset_id)
                .bind(&start_date)
                .bind(&end_date)
                .bind(&new_entity.boundary_type)
                .bind(&new_entity.label)
                .bind(&new_entity.internal_code)
                .bind(&geometry_text)
                .bind(&bbox)
                .bind(&new_entity.admin_level_name)
                .bind(new_entity.privacy_level)
                .bind(&new_entity.parent_code)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(DbError::from)?;
                id
            }
            None => {
                let result = query(
                    "INSERT INTO geographical_entities (
                        uuid, uuid_revision, internal_code, label, level, geometry, bbox,
                        revision_number, start_date, end_date, is_approved, is_latest, privacy_level,
                        dataset_id, layer_file_id, entity_upload_id, boundary_type, parent_code, admin_level_name
                     ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, 0, ?, ?, ?, ?, ?, ?, ?)"
                )
                .bind(new_entity.uuid.to_string())
                .bind(Uuid::new_v4().to_string())
                .bind(&new_entity.internal_code)
                .bind(&new_entity.label)
                .bind(new_entity.level)
                .bind(&geometry_text)
                .bind(&bbox)
                .bind(new_entity.revision_number)
                .bind(&start_date)
                .bind(&end_date)
                .bind(new_entity.privacy_level)
                .bind(new_entity.dataset_id)
                .bind(new_entity.layer_file_id)
                .bind(new_entity.entity_upload_id)
                .bind(&new_entity.boundary_type)
                .bind(&new_entity.parent_code)
                .bind(&new_entity.admin_level_name)
                .execute(&mut *tx)
                .await
                .map_err(DbError::from)?;
                result.last_insert_rowid()
            }
        };

        tx.commit().await.map_err(DbError::from)?;
        self.find_by_id(id).await
    }

    async fn set_simplified_geometry(&self, id: i64, geometry: &Value) -> DomainResult<()> {
        query("UPDATE geographical_entities SET simplified_geometry = ? WHERE id = ?")
            .bind(serde_json::to_string(geometry)?)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    async fn add_entity_id(&self, entity_id: i64, id_type_id: i64, value: &str, is_default: bool) -> DomainResult<bool> {
        let result = query(
            "INSERT INTO entity_ids (geographical_entity_id, id_type_id, value, is_default) VALUES (?, ?, ?, ?)"
        )
        .bind(entity_id)
        .bind(id_type_id)
        .bind(value)
        .bind(is_default)
        .execute(&self.pool)
        .await
        .map_err(DbError::from);

        match result {
            Ok(_) => Ok(true),
            Err(err) if err.is_unique_violation() => {
                log::debug!("entity {} already has id type {}, skipping", entity_id, id_type_id);
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn add_entity_name(
        &self,
        entity_id: i64,
        name: &str,
        language_id: Option<i64>,
        is_default: bool,
        idx: i64,
    ) -> DomainResult<()> {
        query(
            "INSERT INTO entity_names (geographical_entity_id, name, language_id, is_default, idx) VALUES (?, ?, ?, ?, ?)"
        )
        .bind(entity_id)
        .bind(name)
        .bind(language_id)
        .bind(is_default)
        .bind(idx)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(())
    }

    async fn find_entity_ids(&self, entity_id: i64) -> DomainResult<Vec<EntityId>> {
        let ids = query_as::<_, EntityId>(
            "SELECT * FROM entity_ids WHERE geographical_entity_id = ? ORDER BY id"
        )
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(ids)
    }

    async fn find_entity_names(&self, entity_id: i64) -> DomainResult<Vec<EntityName>> {
        let names = query_as::<_, EntityName>(
            "SELECT * FROM entity_names WHERE geographical_entity_id = ? ORDER BY idx, id"
        )
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(names)
    }

    async fn max_approved_revision(&self, dataset_id: i64) -> DomainResult<Option<i64>> {
        let max: Option<i64> = query_scalar(
            "SELECT MAX(revision_number) FROM geographical_entities WHERE dataset_id = ? AND is_approved = 1"
        )
        .bind(dataset_id)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(max)
    }

    async fn next_approved_after(&self, dataset_id: i64, start_date: &str) -> DomainResult<Option<ApprovedNeighbor>> {
        let neighbor = query_as::<_, ApprovedNeighbor>(
            "SELECT id, start_date, unique_code_version FROM geographical_entities
             WHERE dataset_id = ? AND is_approved = 1 AND start_date > ?
             ORDER BY start_date ASC, id ASC LIMIT 1"
        )
        .bind(dataset_id)
        .bind(start_date)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(neighbor)
    }

    async fn previous_approved_before(&self, dataset_id: i64, start_date: &str) -> DomainResult<Option<ApprovedNeighbor>> {
        let neighbor = query_as::<_, ApprovedNeighbor>(
            "SELECT id, start_date, unique_code_version FROM geographical_entities
             WHERE dataset_id = ? AND is_approved = 1 AND start_date < ?
             ORDER BY start_date DESC, id DESC LIMIT 1"
        )
        .bind(dataset_id)
        .bind(start_date)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(neighbor)
    }

    async fn find_by_upload_chunk(&self, upload_id: i64, cursor: ChunkCursor) -> DomainResult<Vec<GeographicalEntity>> {
        let rows = query_as::<_, GeographicalEntityRow>(
            "SELECT * FROM geographical_entities WHERE entity_upload_id = ? AND id > ? ORDER BY id LIMIT ?"
        )
        .bind(upload_id)
        .bind(cursor.after_id)
        .bind(cursor.limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;
        Self::map_rows(rows)
    }

    async fn find_by_upload_at_level(&self, upload_id: i64, level: i64) -> DomainResult<Vec<GeographicalEntity>> {
        let rows = query_as::<_, GeographicalEntityRow>(
            "SELECT * FROM geographical_entities WHERE entity_upload_id = ? AND level = ? ORDER BY id"
        )
        .bind(upload_id)
        .bind(level)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;
        Self::map_rows(rows)
    }

    async fn count_by_upload(&self, upload_id: i64) -> DomainResult<i64> {
        let count: i64 = query_scalar("SELECT COUNT(*) FROM geographical_entities WHERE entity_upload_id = ?")
            .bind(upload_id)
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(count)
    }

    async fn set_parent(&self, id: i64, parent_id: Option<i64>, ancestor_id: Option<i64>) -> DomainResult<()> {
        query("UPDATE geographical_entities SET parent_id = ?, ancestor_id = ? WHERE id = ?")
            .bind(parent_id)
            .bind(ancestor_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    async fn set_unique_code(&self, id: i64, unique_code: &str) -> DomainResult<()> {
        query("UPDATE geographical_entities SET unique_code = ? WHERE id = ?")
            .bind(unique_code)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    async fn set_unique_code_version(&self, id: i64, version: f64) -> DomainResult<()> {
        query("UPDATE geographical_entities SET unique_code_version = ? WHERE id = ?")
            .bind(version)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    async fn max_child_sequence(&self, dataset_id: i64, parent_code: &str, level: i64) -> DomainResult<Option<u32>> {
        let prefix = format!("{}_", parent_code);
        let codes: Vec<String> = query_scalar(
            "SELECT DISTINCT unique_code FROM geographical_entities
             WHERE dataset_id = ? AND level = ? AND unique_code IS NOT NULL AND substr(unique_code, 1, ?) = ?"
        )
        .bind(dataset_id)
        .bind(level)
        .bind(prefix.chars().count() as i64)
        .bind(&prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        // Only direct children: the remainder must be a bare number
        Ok(codes
            .iter()
            .filter_map(|code| code.strip_prefix(prefix.as_str()).and_then(|rest| rest.parse::<u32>().ok()))
            .max())
    }

    async fn find_latest_approved_at_level(&self, dataset_id: i64, level: i64) -> DomainResult<Vec<MatchCandidate>> {
        let rows = query_as::<_, MatchCandidateRow>(
            "SELECT e.id, e.uuid, e.unique_code, e.internal_code, p.uuid AS parent_uuid, e.geometry
             FROM geographical_entities e
             LEFT JOIN geographical_entities p ON p.id = e.parent_id
             WHERE e.dataset_id = ? AND e.level = ? AND e.is_approved = 1 AND e.is_latest = 1
             ORDER BY e.id"
        )
        .bind(dataset_id)
        .bind(level)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter().map(MatchCandidateRow::into_candidate).collect()
    }

    async fn find_latest_approved_root(&self, dataset_id: i64, internal_code: &str) -> DomainResult<Option<GeographicalEntity>> {
        let row = query_as::<_, GeographicalEntityRow>(
            "SELECT * FROM geographical_entities
             WHERE dataset_id = ? AND level = 0 AND is_approved = 1 AND is_latest = 1 AND internal_code = ?
             ORDER BY id DESC LIMIT 1"
        )
        .bind(dataset_id)
        .bind(internal_code)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;

        row.map(GeographicalEntityRow::into_entity).transpose()
    }

    async fn inherit_concept(&self, id: i64, uuid: Uuid, unique_code: Option<&str>) -> DomainResult<()> {
        query("UPDATE geographical_entities SET uuid = ?, unique_code = COALESCE(?, unique_code) WHERE id = ?")
            .bind(uuid.to_string())
            .bind(unique_code)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    async fn delete_by_session(&self, session_id: i64) -> DomainResult<u64> {
        let result = query(
            "DELETE FROM geographical_entities
             WHERE layer_file_id IN (SELECT id FROM layer_files WHERE session_id = ?)"
        )
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(result.rows_affected())
    }

    async fn delete_pending_by_upload(&self, upload_id: i64) -> DomainResult<u64> {
        let result = query("DELETE FROM geographical_entities WHERE entity_upload_id = ? AND is_approved IS NULL")
            .bind(upload_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(result.rows_affected())
    }

    async fn approve_upload_with_tx<'t>(&self, upload_id: i64, tx: &mut Transaction<'t, Sqlite>) -> DomainResult<u64> {
        query(
            "UPDATE geographical_entities
             SET is_latest = 0,
                 end_date = COALESCE(end_date, (
                     SELECT MIN(n.start_date) FROM geographical_entities n
                     WHERE n.entity_upload_id = ? AND n.uuid = geographical_entities.uuid
                 ))
             WHERE is_approved = 1 AND is_latest = 1
               AND (entity_upload_id IS NULL OR entity_upload_id != ?)
               AND uuid IN (SELECT uuid FROM geographical_entities WHERE entity_upload_id = ?)"
        )
        .bind(upload_id)
        .bind(upload_id)
        .bind(upload_id)
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;

        let result = query(
            "UPDATE geographical_entities SET is_approved = 1, is_latest = 1 WHERE entity_upload_id = ?"
        )
        .bind(upload_id)
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;

        Ok(result.rows_affected())
    }

    async fn reject_upload_with_tx<'t>(&self, upload_id: i64, tx: &mut Transaction<'t, Sqlite>) -> DomainResult<u64> {
        let result = query(
            "UPDATE geographical_entities SET is_approved = 0, is_latest = 0 WHERE entity_upload_id = ?"
        )
        .bind(upload_id)
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_migration::test_pool;
    use crate::domains::dataset::{DatasetRepository, SqliteDatasetRepository};
    use crate::testing::{seed_dataset, seed_upload, square};
    use chrono::{DateTime, TimeZone, Utc};

    fn pending(uuid: Uuid, revision: i64, dataset_id: i64, upload_id: i64, start: DateTime<Utc>) -> NewGeographicalEntity {
        NewGeographicalEntity {
            uuid,
            revision_number: revision,
            level: 0,
            dataset_id,
            layer_file_id: None,
            entity_upload_id: Some(upload_id),
            start_date: start,
            end_date: None,
            boundary_type: Some("Country".into()),
            label: "Pakistan".into(),
            internal_code: "PAK".into(),
            geometry: square(0.0, 0.0, 10.0),
            privacy_level: 4,
            parent_code: None,
            admin_level_name: None,
        }
    }

    async fn approve(pool: &Pool<Sqlite>, repo: &SqliteEntityRepository, upload_id: i64) -> u64 {
        let mut tx = pool.begin().await.unwrap();
        let approved = repo.approve_upload_with_tx(upload_id, &mut tx).await.unwrap();
        tx.commit().await.unwrap();
        approved
    }

    #[tokio::test]
    async fn test_approving_a_revision_demotes_previous_latest() {
        let pool = test_pool().await;
        let dataset = seed_dataset(&pool).await;
        let (_, first_upload) = seed_upload(&pool, dataset.id).await;
        let (_, second_upload) = seed_upload(&pool, dataset.id).await;
        let repo = SqliteEntityRepository::new(pool.clone());
        let concept = Uuid::new_v4();
        let jan = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let jun = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();

        let first = repo.upsert_pending(&pending(concept, 1, dataset.id, first_upload, jan)).await.unwrap();
        assert_eq!(first.is_approved, None);
        assert_eq!(approve(&pool, &repo, first_upload).await, 1);

        let second = repo.upsert_pending(&pending(concept, 2, dataset.id, second_upload, jun)).await.unwrap();
        assert_ne!(first.id, second.id);
        approve(&pool, &repo, second_upload).await;

        let first = repo.find_by_id(first.id).await.unwrap();
        assert_eq!(first.is_approved, Some(true));
        assert!(!first.is_latest);
        assert_eq!(first.end_date, Some(jun));

        let second = repo.find_by_id(second.id).await.unwrap();
        assert_eq!(second.is_approved, Some(true));
        assert!(second.is_latest);
        assert_eq!(second.end_date, None);
        assert_eq!(repo.max_approved_revision(dataset.id).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_upsert_pending_reuses_the_pending_row() {
        let pool = test_pool().await;
        let dataset = seed_dataset(&pool).await;
        let (_, upload_id) = seed_upload(&pool, dataset.id).await;
        let repo = SqliteEntityRepository::new(pool.clone());
        let concept = Uuid::new_v4();

        let first = repo.upsert_pending(&pending(concept, 1, dataset.id, upload_id, Utc::now())).await.unwrap();
        let mut renamed = pending(concept, 1, dataset.id, upload_id, Utc::now());
        renamed.label = "Islamic Republic of Pakistan".into();
        let second = repo.upsert_pending(&renamed).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.label.as_deref(), Some("Islamic Republic of Pakistan"));
        assert_eq!(repo.count_by_upload(upload_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_entity_id_is_skipped() {
        let pool = test_pool().await;
        let dataset = seed_dataset(&pool).await;
        let (_, upload_id) = seed_upload(&pool, dataset.id).await;
        let repo = SqliteEntityRepository::new(pool.clone());
        let entity = repo.upsert_pending(&pending(Uuid::new_v4(), 1, dataset.id, upload_id, Utc::now())).await.unwrap();
        let pcode = SqliteDatasetRepository::new(pool.clone()).get_or_create_id_type("PCode").await.unwrap();

        assert!(repo.add_entity_id(entity.id, pcode.id, "PAK", true).await.unwrap());
        assert!(!repo.add_entity_id(entity.id, pcode.id, "PAK-2", false).await.unwrap());
        let ids = repo.find_entity_ids(entity.id).await.unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].value, "PAK");
    }
}
