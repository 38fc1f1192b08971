use async_trait::async_trait;
use chrono::Utc;
use sqlx::{query, query_as, Pool, Sqlite};

use crate::domains::core::repository::FindById;
use crate::domains::dataset::types::{BoundaryType, Dataset, DatasetRow, IdType, Language, NewDataset};
use crate::errors::{DbError, DomainError, DomainResult};
use crate::types::format_timestamp;
use crate::validation::Validate;

/// Datasets and the read-mostly vocabularies scoped to them
#[async_trait]
pub trait DatasetRepository: FindById<Dataset> + Send + Sync {
    async fn create(&self, new_dataset: &NewDataset) -> DomainResult<Dataset>;

    /// Resolve a raw boundary-type value within one dataset
    async fn find_boundary_type(&self, dataset_id: i64, value: &str) -> DomainResult<Option<BoundaryType>>;

    async fn add_boundary_type(&self, dataset_id: i64, value: &str, type_label: &str) -> DomainResult<BoundaryType>;

    async fn find_id_type(&self, name: &str) -> DomainResult<Option<IdType>>;

    async fn get_or_create_id_type(&self, name: &str) -> DomainResult<IdType>;

    async fn find_language(&self, code: &str) -> DomainResult<Option<Language>>;

    async fn create_language(&self, code: &str, name: Option<&str>, order_idx: i64) -> DomainResult<Language>;
}

pub struct SqliteDatasetRepository {
    pool: Pool<Sqlite>,
}

impl SqliteDatasetRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    fn entity_name(&self) -> &'static str {
        "dataset"
    }
}

#[async_trait]
impl FindById<Dataset> for SqliteDatasetRepository {
    async fn find_by_id(&self, id: i64) -> DomainResult<Dataset> {
        let row = query_as::<_, DatasetRow>("SELECT * FROM datasets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DomainError::not_found(self.entity_name(), id))?;

        row.into_entity()
    }
}

#[async_trait]
impl DatasetRepository for SqliteDatasetRepository {
    async fn create(&self, new_dataset: &NewDataset) -> DomainResult<Dataset> {
        new_dataset.validate()?;

        let result = query(
            "INSERT INTO datasets (label, min_privacy_level, max_privacy_level, created_at) VALUES (?, ?, ?, ?)"
        )
        .bind(&new_dataset.label)
        .bind(new_dataset.min_privacy_level)
        .bind(new_dataset.max_privacy_level)
        .bind(format_timestamp(&Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        self.find_by_id(result.last_insert_rowid()).await
    }

    async fn find_boundary_type(&self, dataset_id: i64, value: &str) -> DomainResult<Option<BoundaryType>> {
        let boundary_type = query_as::<_, BoundaryType>(
            "SELECT * FROM boundary_types WHERE dataset_id = ? AND value = ? LIMIT 1"
        )
        .bind(dataset_id)
        .bind(value)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(boundary_type)
    }

    async fn add_boundary_type(&self, dataset_id: i64, value: &str, type_label: &str) -> DomainResult<BoundaryType> {
        let result = query("INSERT INTO boundary_types (dataset_id, value, type_label) VALUES (?, ?, ?)")
            .bind(dataset_id)
            .bind(value)
            .bind(type_label)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;

        Ok(BoundaryType {
            id: result.last_insert_rowid(),
            dataset_id,
            value: value.to_string(),
            type_label: type_label.to_string(),
        })
    }

    async fn find_id_type(&self, name: &str) -> DomainResult<Option<IdType>> {
        let id_type = query_as::<_, IdType>("SELECT * FROM id_types WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?;

        Ok(id_type)
    }

    async fn get_or_create_id_type(&self, name: &str) -> DomainResult<IdType> {
        query("INSERT INTO id_types (name) VALUES (?) ON CONFLICT(name) DO NOTHING")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;

        self.find_id_type(name)
            .await?
            .ok_or_else(|| DomainError::not_found("id_type", name))
    }

    async fn find_language(&self, code: &str) -> DomainResult<Option<Language>> {
        let language = query_as::<_, Language>("SELECT * FROM languages WHERE code = ?")
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?;

        Ok(language)
    }

    async fn create_language(&self, code: &str, name: Option<&str>, order_idx: i64) -> DomainResult<Language> {
        let result = query("INSERT INTO languages (code, name, order_idx) VALUES (?, ?, ?)")
            .bind(code)
            .bind(name)
            .bind(order_idx)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;

        Ok(Language {
            id: result.last_insert_rowid(),
            code: code.to_string(),
            name: name.map(str::to_string),
            order_idx,
        })
    }
}
