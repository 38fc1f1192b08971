use async_trait::async_trait;
use sqlx::{query, query_as, Pool, Sqlite};

use crate::domains::core::repository::FindById;
use crate::domains::layer::types::{LayerFile, LayerFileRow, NewLayerFile};
use crate::errors::{DbError, DomainError, DomainResult};
use crate::validation::Validate;

#[async_trait]
pub trait LayerFileRepository: FindById<LayerFile> + Send + Sync {
    async fn create(&self, new_layer: &NewLayerFile) -> DomainResult<LayerFile>;

    /// Layer files of a session, shallowest level first
    async fn find_by_session(&self, session_id: i64) -> DomainResult<Vec<LayerFile>>;

    async fn find_by_session_and_level(&self, session_id: i64, level: i64) -> DomainResult<Option<LayerFile>>;
}

pub struct SqliteLayerFileRepository {
    pool: Pool<Sqlite>,
}

impl SqliteLayerFileRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FindById<LayerFile> for SqliteLayerFileRepository {
    async fn find_by_id(&self, id: i64) -> DomainResult<LayerFile> {
        query_as::<_, LayerFileRow>("SELECT * FROM layer_files WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DomainError::not_found("layer_file", id))?
            .into_entity()
    }
}

#[async_trait]
impl LayerFileRepository for SqliteLayerFileRepository {
    async fn create(&self, new_layer: &NewLayerFile) -> DomainResult<LayerFile> {
        new_layer.validate()?;

        let result = query(
            "INSERT INTO layer_files (
                session_id, level, path, layer_type, entity_type, id_fields, name_fields,
                parent_id_field, boundary_type, privacy_level, privacy_level_field
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        )
        .bind(new_layer.session_id)
        .bind(new_layer.level)
        .bind(&new_layer.path)
        .bind(new_layer.layer_type.as_str())
        .bind(&new_layer.entity_type)
        .bind(serde_json::to_string(&new_layer.id_fields)?)
        .bind(serde_json::to_string(&new_layer.name_fields)?)
        .bind(&new_layer.parent_id_field)
        .bind(&new_layer.boundary_type)
        .bind(new_layer.privacy_level)
        .bind(&new_layer.privacy_level_field)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        self.find_by_id(result.last_insert_rowid()).await
    }

    async fn find_by_session(&self, session_id: i64) -> DomainResult<Vec<LayerFile>> {
        let rows = query_as::<_, LayerFileRow>("SELECT * FROM layer_files WHERE session_id = ? ORDER BY level, id")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;

        rows.into_iter().map(LayerFileRow::into_entity).collect()
    }

    async fn find_by_session_and_level(&self, session_id: i64, level: i64) -> DomainResult<Option<LayerFile>> {
        let row = query_as::<_, LayerFileRow>(
            "SELECT * FROM layer_files WHERE session_id = ? AND level = ? ORDER BY id LIMIT 1"
        )
        .bind(session_id)
        .bind(level)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;

        row.map(LayerFileRow::into_entity).transpose()
    }
}
