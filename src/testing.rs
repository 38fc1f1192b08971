//! Fixtures shared by module tests.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domains::dataset::{Dataset, DatasetRepository, NewDataset, SqliteDatasetRepository};
use crate::domains::jobs::{JobControl, JobKind, JobState};
use crate::domains::layer::types::{IdFieldMapping, LayerFile, LayerType, NameFieldMapping, NewLayerFile};
use crate::errors::ServiceResult;
use crate::types::format_timestamp;

/// Dataset "World" (privacy 1..4) with boundary types 0 → Country,
/// 1 → Region, 2 → District
pub async fn seed_dataset(pool: &SqlitePool) -> Dataset {
    let repo = SqliteDatasetRepository::new(pool.clone());
    let dataset = repo
        .create(&NewDataset { label: "World".into(), min_privacy_level: 1, max_privacy_level: 4 })
        .await
        .unwrap();
    for (value, label) in [("0", "Country"), ("1", "Region"), ("2", "District")] {
        repo.add_boundary_type(dataset.id, value, label).await.unwrap();
    }
    dataset
}

pub async fn seed_session(pool: &SqlitePool, dataset_id: i64) -> i64 {
    let now = format_timestamp(&Utc::now());
    sqlx::query("INSERT INTO layer_upload_sessions (dataset_id, started_at, updated_at) VALUES (?, ?, ?)")
        .bind(dataset_id)
        .bind(&now)
        .bind(&now)
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid()
}

/// New session with one blank upload; returns `(session_id, upload_id)`
pub async fn seed_upload(pool: &SqlitePool, dataset_id: i64) -> (i64, i64) {
    let session_id = seed_session(pool, dataset_id).await;
    let upload_id = sqlx::query("INSERT INTO entity_upload_status (session_id, updated_at) VALUES (?, ?)")
        .bind(session_id)
        .bind(format_timestamp(&Utc::now()))
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid();
    (session_id, upload_id)
}

pub async fn set_upload_status(pool: &SqlitePool, upload_id: i64, status: &str) {
    sqlx::query("UPDATE entity_upload_status SET status = ? WHERE id = ?")
        .bind(status)
        .bind(upload_id)
        .execute(pool)
        .await
        .unwrap();
}

/// Closed square polygon with its lower-left corner at `(x, y)`
pub fn square(x: f64, y: f64, size: f64) -> Value {
    json!({
        "type": "Polygon",
        "coordinates": [[[x, y], [x + size, y], [x + size, y + size], [x, y + size], [x, y]]]
    })
}

/// Pending entity with a unit square geometry
pub async fn insert_entity(
    pool: &SqlitePool,
    dataset_id: i64,
    level: i64,
    internal_code: &str,
    parent_id: Option<i64>,
    start: DateTime<Utc>,
) -> i64 {
    sqlx::query(
        "INSERT INTO geographical_entities (
            uuid, uuid_revision, internal_code, label, level, geometry, revision_number,
            start_date, privacy_level, parent_id, dataset_id
         ) VALUES (?, ?, ?, ?, ?, ?, 1, ?, 4, ?, ?)"
    )
    .bind(Uuid::new_v4().to_string())
    .bind(Uuid::new_v4().to_string())
    .bind(internal_code)
    .bind(internal_code)
    .bind(level)
    .bind(square(0.0, 0.0, 1.0).to_string())
    .bind(format_timestamp(&start))
    .bind(parent_id)
    .bind(dataset_id)
    .execute(pool)
    .await
    .unwrap()
    .last_insert_rowid()
}

pub async fn approve_entity(pool: &SqlitePool, id: i64, version: Option<f64>) {
    sqlx::query("UPDATE geographical_entities SET is_approved = 1, is_latest = 1, unique_code_version = ? WHERE id = ?")
        .bind(version)
        .bind(id)
        .execute(pool)
        .await
        .unwrap();
}

/// Write a FeatureCollection built from `(properties, geometry)` pairs
pub fn write_layer(dir: &Path, file_name: &str, features: &[(Value, Value)]) -> PathBuf {
    let collection = json!({
        "type": "FeatureCollection",
        "features": features
            .iter()
            .map(|(properties, geometry)| json!({"type": "Feature", "properties": properties, "geometry": geometry}))
            .collect::<Vec<_>>(),
    });
    let path = dir.join(file_name);
    std::fs::write(&path, collection.to_string()).unwrap();
    path
}

/// GeoJSON layer keyed on `code`, named by `name`, typed by `type`
pub fn new_layer_file(session_id: i64, level: i64, path: &str, parent_field: Option<&str>) -> NewLayerFile {
    NewLayerFile {
        session_id,
        level,
        path: path.to_string(),
        layer_type: LayerType::Geojson,
        entity_type: None,
        id_fields: vec![IdFieldMapping { field: "code".into(), id_type: Some("PCode".into()), default: true }],
        name_fields: vec![NameFieldMapping { field: "name".into(), language: None, default: true }],
        parent_id_field: parent_field.map(str::to_string),
        boundary_type: Some("type".into()),
        privacy_level: None,
        privacy_level_field: None,
    }
}

pub fn layer_file(id: i64, new_layer: &NewLayerFile) -> LayerFile {
    LayerFile {
        id,
        session_id: new_layer.session_id,
        level: new_layer.level,
        path: new_layer.path.clone(),
        layer_type: new_layer.layer_type,
        entity_type: new_layer.entity_type.clone(),
        id_fields: new_layer.id_fields.clone(),
        name_fields: new_layer.name_fields.clone(),
        parent_id_field: new_layer.parent_id_field.clone(),
        boundary_type: new_layer.boundary_type.clone(),
        privacy_level: new_layer.privacy_level,
        privacy_level_field: new_layer.privacy_level_field.clone(),
    }
}

/// Job control that only records what it was asked to do
#[derive(Default)]
pub struct RecordingJobControl {
    pub submitted: Mutex<Vec<JobKind>>,
    pub revoked: Mutex<Vec<String>>,
}

#[async_trait]
impl JobControl for RecordingJobControl {
    async fn submit(&self, kind: JobKind) -> ServiceResult<String> {
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(kind);
        Ok(format!("task-{}", submitted.len()))
    }

    async fn revoke(&self, task_id: &str) -> ServiceResult<bool> {
        self.revoked.lock().unwrap().push(task_id.to_string());
        Ok(true)
    }

    async fn status(&self, _task_id: &str) -> ServiceResult<JobState> {
        Ok(JobState::Running)
    }
}
