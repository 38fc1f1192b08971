use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::domains::entity::repository::EntityRepository;
use crate::domains::entity::types::GeographicalEntity;
use crate::domains::layer::hierarchy::MAX_ADMIN_DEPTH;
use crate::errors::DomainResult;

/// Entity whose parent reference matched nothing one level up
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnlinkedEntity {
    pub id: i64,
    pub level: i64,
    pub label: String,
    pub parent_code: Option<String>,
}

/// Wires parent and ancestor ids between the entities of one upload.
///
/// Parents are looked up by `internal_code` among the upload's entities one
/// level up. Rematched level-1 children already carry their new parent in
/// `parent_code`, so they follow it here. An upload without a level-0 entity
/// links its level-1 entities to the approved, latest country of that code.
pub struct HierarchyLinker {
    entity_repo: Arc<dyn EntityRepository>,
}

impl HierarchyLinker {
    pub fn new(entity_repo: Arc<dyn EntityRepository>) -> Self {
        Self { entity_repo }
    }

    pub async fn link_hierarchy(&self, upload_id: i64) -> DomainResult<Vec<UnlinkedEntity>> {
        let mut unlinked = Vec::new();
        let mut parents = self.entity_repo.find_by_upload_at_level(upload_id, 0).await?;
        for root in &parents {
            if root.parent_id.is_some() || root.ancestor_id.is_some() {
                self.entity_repo.set_parent(root.id, None, None).await?;
            }
        }

        for level in 1..=MAX_ADMIN_DEPTH as i64 {
            let children = self.entity_repo.find_by_upload_at_level(upload_id, level).await?;
            if children.is_empty() {
                break;
            }

            if level == 1 && parents.is_empty() {
                parents = self.approved_roots_for(&children).await?;
            }

            self.link_level(upload_id, level, &parents, &children, &mut unlinked).await?;

            // Re-read so that ancestor ids set above are visible to the next level
            parents = self.entity_repo.find_by_upload_at_level(upload_id, level).await?;
        }

        Ok(unlinked)
    }

    /// Sessions starting at level 1 attach to the dataset's approved countries
    async fn approved_roots_for(&self, children: &[GeographicalEntity]) -> DomainResult<Vec<GeographicalEntity>> {
        let mut codes: Vec<(i64, &str)> = children
            .iter()
            .filter_map(|c| c.parent_code.as_deref().map(|code| (c.dataset_id, code)))
            .collect();
        codes.sort_unstable();
        codes.dedup();

        let mut roots = Vec::with_capacity(codes.len());
        for (dataset_id, code) in codes {
            if let Some(root) = self.entity_repo.find_latest_approved_root(dataset_id, code).await? {
                roots.push(root);
            }
        }
        Ok(roots)
    }

    async fn link_level(
        &self,
        upload_id: i64,
        level: i64,
        parents: &[GeographicalEntity],
        children: &[GeographicalEntity],
        unlinked: &mut Vec<UnlinkedEntity>,
    ) -> DomainResult<()> {
        // First entity wins when codes repeat
        let mut by_code: HashMap<&str, &GeographicalEntity> = HashMap::new();
        for parent in parents {
            if let Some(code) = parent.internal_code.as_deref() {
                by_code.entry(code).or_insert(parent);
            }
        }

        for child in children {
            let parent = child.parent_code.as_deref().and_then(|code| by_code.get(code));
            match parent {
                Some(parent) => {
                    let ancestor_id = if parent.level == 0 { Some(parent.id) } else { parent.ancestor_id };
                    self.entity_repo.set_parent(child.id, Some(parent.id), ancestor_id).await?;
                }
                None => {
                    log::debug!(
                        "upload {}: level {} entity {} has no parent {:?}",
                        upload_id, level, child.id, child.parent_code
                    );
                    self.entity_repo.set_parent(child.id, None, None).await?;
                    unlinked.push(UnlinkedEntity {
                        id: child.id,
                        level,
                        label: child.label.clone().unwrap_or_default(),
                        parent_code: child.parent_code.clone(),
                    });
                }
            }
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
    use crate::testing::{approve_entity, insert_entity, seed_dataset, seed_upload};
    use chrono::Utc;

    async fn set_upload_and_parent_code(pool: &sqlx::SqlitePool, id: i64, upload_id: i64, parent_code: Option<&str>) {
        sqlx::query("UPDATE geographical_entities SET entity_upload_id = ?, parent_code = ? WHERE id = ?")
            .bind(upload_id)
            .bind(parent_code)
            .bind(id)
            .execute(pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_children_sit_one_level_below_their_parent() {
        let pool = test_pool().await;
        let dataset = seed_dataset(&pool).await;
        let (_, upload_id) = seed_upload(&pool, dataset.id).await;
        let now = Utc::now();

        let pak = insert_entity(&pool, dataset.id, 0, "PAK", None, now).await;
        let punjab = insert_entity(&pool, dataset.id, 1, "PAK01", None, now).await;
        let lahore = insert_entity(&pool, dataset.id, 2, "PAK01A", None, now).await;
        let orphan = insert_entity(&pool, dataset.id, 2, "PAK09A", None, now).await;
        set_upload_and_parent_code(&pool, pak, upload_id, None).await;
        set_upload_and_parent_code(&pool, punjab, upload_id, Some("PAK")).await;
        set_upload_and_parent_code(&pool, lahore, upload_id, Some("PAK01")).await;
        set_upload_and_parent_code(&pool, orphan, upload_id, Some("PAK09")).await;

        let repo = Arc::new(SqliteEntityRepository::new(pool.clone()));
        let unlinked = HierarchyLinker::new(repo.clone()).link_hierarchy(upload_id).await.unwrap();
        assert_eq!(unlinked.len(), 1);
        assert_eq!(unlinked[0].id, orphan);

        let lahore = repo.find_by_id(lahore).await.unwrap();
        assert_eq!(lahore.parent_id, Some(punjab));
        assert_eq!(lahore.ancestor_id, Some(pak));

        for id in [punjab, lahore.id] {
            let child = repo.find_by_id(id).await.unwrap();
            let parent = repo.find_by_id(child.parent_id.unwrap()).await.unwrap();
            assert_eq!(child.level, parent.level + 1);
        }
    }

    #[tokio::test]
    async fn test_level1_upload_links_to_approved_country() {
        let pool = test_pool().await;
        let dataset = seed_dataset(&pool).await;
        let (_, upload_id) = seed_upload(&pool, dataset.id).await;
        let now = Utc::now();

        let pak = insert_entity(&pool, dataset.id, 0, "PAK", None, now).await;
        approve_entity(&pool, pak, Some(1.0)).await;
        let punjab = insert_entity(&pool, dataset.id, 1, "PAK01", None, now).await;
        let stray = insert_entity(&pool, dataset.id, 1, "IND01", None, now).await;
        set_upload_and_parent_code(&pool, punjab, upload_id, Some("PAK")).await;
        set_upload_and_parent_code(&pool, stray, upload_id, Some("IND")).await;

        let repo = Arc::new(SqliteEntityRepository::new(pool.clone()));
        let unlinked = HierarchyLinker::new(repo.clone()).link_hierarchy(upload_id).await.unwrap();
        assert_eq!(unlinked.len(), 1);
        assert_eq!(unlinked[0].parent_code.as_deref(), Some("IND"));

        let punjab = repo.find_by_id(punjab).await.unwrap();
        assert_eq!(punjab.parent_id, Some(pak));
        assert_eq!(punjab.ancestor_id, Some(pak));
    }
}
