use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::domains::entity::repository::EntityRepository;
use crate::domains::entity::types::{ApprovedNeighbor, GeographicalEntity};
use crate::domains::layer::hierarchy::MAX_ADMIN_DEPTH;
use crate::errors::{DomainError, DomainResult};
use crate::types::{format_timestamp, ChunkCursor};

/// Digits in each child segment of a unique code (`PAK_0001_0012`)
pub const CODE_SEQUENCE_DIGITS: usize = 4;

/// Place a new revision between its approved neighbours in time.
///
/// Repeated insertion between the same two neighbours halves the gap each
/// time and eventually runs out of f64 precision; that limit is accepted.
/// A neighbour that carries no version leaves the result at 1.
pub fn interpolate_version(previous: Option<&ApprovedNeighbor>, next: Option<&ApprovedNeighbor>) -> f64 {
    match (previous, next) {
        (None, Some(next)) => next.unique_code_version.map(|v| v / 2.0).unwrap_or(1.0),
        (Some(previous), None) => previous.unique_code_version.map(|v| v + 1.0).unwrap_or(1.0),
        (Some(previous), Some(next)) => match (previous.unique_code_version, next.unique_code_version) {
            (Some(p), Some(n)) => (p + n) / 2.0,
            _ => 1.0,
        },
        (None, None) => 1.0,
    }
}

/// Code of a root entity: its internal code, upper-cased and restricted to
/// `[A-Z0-9-]`.
pub fn root_unique_code(entity: &GeographicalEntity) -> Option<String> {
    let source = entity
        .internal_code
        .as_deref()
        .or(entity.label.as_deref())
        .map(str::trim)
        .filter(|s| !s.is_empty())?;

    Some(
        source
            .chars()
            .map(|c| {
                let upper = c.to_ascii_uppercase();
                if upper.is_ascii_alphanumeric() || upper == '-' { upper } else { '-' }
            })
            .collect(),
    )
}

pub fn child_unique_code(parent_code: &str, sequence: u32) -> String {
    format!("{}_{:0width$}", parent_code, sequence, width = CODE_SEQUENCE_DIGITS)
}

/// Stamps `(unique_code, unique_code_version)` onto entities
pub struct UniqueCodeService {
    entity_repo: Arc<dyn EntityRepository>,
}

impl UniqueCodeService {
    pub fn new(entity_repo: Arc<dyn EntityRepository>) -> Self {
        Self { entity_repo }
    }

    /// Version for a revision starting at `start_date` in `dataset_id`
    pub async fn compute_next_version(&self, dataset_id: i64, start_date: &DateTime<Utc>) -> DomainResult<f64> {
        let start = format_timestamp(start_date);
        let next = self.entity_repo.next_approved_after(dataset_id, &start).await?;
        let previous = self.entity_repo.previous_approved_before(dataset_id, &start).await?;
        let version = interpolate_version(previous.as_ref(), next.as_ref());
        log::debug!(
            "dataset {} start {}: previous {:?}, next {:?} -> version {}",
            dataset_id,
            start,
            previous.as_ref().map(|p| p.id),
            next.as_ref().map(|n| n.id),
            version
        );
        Ok(version)
    }

    /// Assign a unique code if the entity has none. Ancestors lacking a code
    /// are coded first. Returns the new code, or `None` when nothing changed.
    pub async fn generate_unique_code(&self, entity: &GeographicalEntity) -> DomainResult<Option<String>> {
        if entity.unique_code.is_some() {
            return Ok(None);
        }

        // Walk up to the nearest coded ancestor (or the root)
        let mut chain = vec![entity.clone()];
        loop {
            let current = &chain[chain.len() - 1];
            if current.unique_code.is_some() {
                break;
            }
            let Some(parent_id) = current.parent_id else { break };
            if chain.len() > MAX_ADMIN_DEPTH {
                return Err(DomainError::Internal(format!(
                    "entity {} exceeds the maximum admin depth of {}",
                    entity.id, MAX_ADMIN_DEPTH
                )));
            }
            let parent = self.entity_repo.find_by_id(parent_id).await?;
            chain.push(parent);
        }

        let mut parent_code: Option<String> = None;
        let mut assigned = None;
        for current in chain.iter().rev() {
            let code = match (&current.unique_code, &parent_code) {
                (Some(existing), _) => existing.clone(),
                (None, None) => {
                    let code = root_unique_code(current).ok_or_else(|| {
                        DomainError::Internal(format!("entity {} has neither internal code nor label", current.id))
                    })?;
                    self.entity_repo.set_unique_code(current.id, &code).await?;
                    code
                }
                (None, Some(parent)) => {
                    let sequence = self
                        .entity_repo
                        .max_child_sequence(current.dataset_id, parent, current.level)
                        .await?
                        .unwrap_or(0)
                        + 1;
                    let code = child_unique_code(parent, sequence);
                    self.entity_repo.set_unique_code(current.id, &code).await?;
                    code
                }
            };
            if current.id == entity.id {
                assigned = Some(code.clone());
            }
            parent_code = Some(code);
        }

        Ok(assigned)
    }

    /// Deferred pass over an upload's entities once it is valid: codes first,
    /// then the upload's version for rows lacking one. Walks the rows in
    /// keyset pages. Returns the number of rows touched.
    pub async fn stamp_upload(&self, upload_id: i64, version: f64) -> DomainResult<usize> {
        let mut cursor = ChunkCursor::default();
        let mut touched = 0;
        loop {
            let page = self.entity_repo.find_by_upload_chunk(upload_id, cursor).await?;
            let page_len = page.len();
            let last_id = page.last().map(|e| e.id);

            for entity in page {
                // Earlier rows in this pass may have coded this one as an ancestor
                let fresh = self.entity_repo.find_by_id(entity.id).await?;
                let mut changed = self.generate_unique_code(&fresh).await?.is_some();
                if fresh.unique_code_version.is_none() {
                    self.entity_repo.set_unique_code_version(fresh.id, version).await?;
                    changed = true;
                }
                if changed {
                    touched += 1;
                }
            }

            if !cursor.advance(last_id, page_len) {
                break;
            }
        }
        log::info!("upload {}: stamped {} entities with version {}", upload_id, touched, version);
        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::core::repository::FindById;
    use crate::domains::entity::repository::SqliteEntityRepository;
    use crate::testing::{approve_entity, insert_entity, seed_dataset, seed_upload};
    use crate::db_migration::test_pool;
    use chrono::TimeZone;

    fn neighbor(version: Option<f64>) -> ApprovedNeighbor {
        ApprovedNeighbor { id: 1, start_date: String::new(), unique_code_version: version }
    }

    #[test]
    fn test_interpolation_rules() {
        assert_eq!(interpolate_version(None, None), 1.0);
        assert_eq!(interpolate_version(Some(&neighbor(Some(3.0))), None), 4.0);
        assert_eq!(interpolate_version(None, Some(&neighbor(Some(1.0)))), 0.5);
        assert_eq!(interpolate_version(Some(&neighbor(Some(1.0))), Some(&neighbor(Some(2.0)))), 1.5);
        // Unversioned neighbours fall back to 1
        assert_eq!(interpolate_version(Some(&neighbor(None)), None), 1.0);
        assert_eq!(interpolate_version(Some(&neighbor(Some(2.0))), Some(&neighbor(None))), 1.0);
    }

    #[test]
    fn test_interpolation_stays_strictly_between_neighbours() {
        let versions = [0.001, 0.5, 1.0, 1.5, 2.0, 3.75, 10.0, 1024.0];
        for (i, &p) in versions.iter().enumerate() {
            for &n in &versions[i + 1..] {
                let v = interpolate_version(Some(&neighbor(Some(p))), Some(&neighbor(Some(n))));
                assert!(v > p && v < n, "{} not in ({}, {})", v, p, n);
            }
            let before = interpolate_version(None, Some(&neighbor(Some(p))));
            assert!(before > 0.0 && before < p);
            let after = interpolate_version(Some(&neighbor(Some(p))), None);
            assert!(after > p);
        }
    }

    #[test]
    fn test_code_formatting() {
        assert_eq!(child_unique_code("PAK", 1), "PAK_0001");
        assert_eq!(child_unique_code("PAK_0001", 12), "PAK_0001_0012");
    }

    #[tokio::test]
    async fn test_first_revision_in_empty_dataset_is_version_one() {
        let pool = test_pool().await;
        let dataset = seed_dataset(&pool).await;
        let service = UniqueCodeService::new(Arc::new(SqliteEntityRepository::new(pool)));
        let start = Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).unwrap();
        assert_eq!(service.compute_next_version(dataset.id, &start).await.unwrap(), 1.0);
    }

    #[tokio::test]
    async fn test_compute_next_version_between_approved_revisions() {
        let pool = test_pool().await;
        let dataset = seed_dataset(&pool).await;
        let repo = Arc::new(SqliteEntityRepository::new(pool.clone()));
        let jan = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let jun = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
        let first = insert_entity(&pool, dataset.id, 0, "PAK", None, jan).await;
        approve_entity(&pool, first, Some(1.0)).await;
        let second = insert_entity(&pool, dataset.id, 0, "PAK", None, jun).await;
        approve_entity(&pool, second, Some(2.0)).await;

        let service = UniqueCodeService::new(repo);
        let mar = Utc.with_ymd_and_hms(2023, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(service.compute_next_version(dataset.id, &mar).await.unwrap(), 1.5);
        let dec = Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap();
        assert_eq!(service.compute_next_version(dataset.id, &dec).await.unwrap(), 3.0);
        let earlier = Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(service.compute_next_version(dataset.id, &earlier).await.unwrap(), 0.5);
    }

    #[tokio::test]
    async fn test_generate_unique_code_is_idempotent() {
        let pool = test_pool().await;
        let dataset = seed_dataset(&pool).await;
        let repo = Arc::new(SqliteEntityRepository::new(pool.clone()));
        let start = Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).unwrap();
        let country = insert_entity(&pool, dataset.id, 0, "pak", None, start).await;
        let region = insert_entity(&pool, dataset.id, 1, "PAK01", Some(country), start).await;
        let sibling = insert_entity(&pool, dataset.id, 1, "PAK02", Some(country), start).await;

        let service = UniqueCodeService::new(repo.clone());

        // Coding a child first codes its root as well
        let region_entity = repo.find_by_id(region).await.unwrap();
        let code = service.generate_unique_code(&region_entity).await.unwrap();
        assert_eq!(code.as_deref(), Some("PAK_0001"));
        assert_eq!(repo.find_by_id(country).await.unwrap().unique_code.as_deref(), Some("PAK"));

        let sibling_entity = repo.find_by_id(sibling).await.unwrap();
        assert_eq!(service.generate_unique_code(&sibling_entity).await.unwrap().as_deref(), Some("PAK_0002"));

        let again = repo.find_by_id(region).await.unwrap();
        assert_eq!(service.generate_unique_code(&again).await.unwrap(), None);
        assert_eq!(repo.find_by_id(region).await.unwrap().unique_code.as_deref(), Some("PAK_0001"));
    }

    #[tokio::test]
    async fn test_stamp_upload_sets_versions_once() {
        let pool = test_pool().await;
        let dataset = seed_dataset(&pool).await;
        let repo = Arc::new(SqliteEntityRepository::new(pool.clone()));
        let start = Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).unwrap();
        let country = insert_entity(&pool, dataset.id, 0, "PAK", None, start).await;
        insert_entity(&pool, dataset.id, 1, "PAK01", Some(country), start).await;
        let (_, upload_id) = seed_upload(&pool, dataset.id).await;
        sqlx::query("UPDATE geographical_entities SET entity_upload_id = ?").bind(upload_id).execute(&pool).await.unwrap();

        let service = UniqueCodeService::new(repo.clone());
        assert_eq!(service.stamp_upload(upload_id, 2.5).await.unwrap(), 2);
        assert_eq!(service.stamp_upload(upload_id, 9.0).await.unwrap(), 0);
        let root = repo.find_by_id(country).await.unwrap();
        assert_eq!(root.unique_code_version, Some(2.5));
    }
}
