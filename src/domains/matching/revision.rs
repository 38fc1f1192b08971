use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::domains::entity::repository::EntityRepository;
use crate::domains::entity::types::{GeographicalEntity, MatchCandidate};
use crate::domains::layer::hierarchy::MAX_ADMIN_DEPTH;
use crate::domains::upload::types::EntityUploadStatus;
use crate::errors::DomainResult;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MatchStats {
    pub matched: usize,
    pub new: usize,
}

/// Carries concept identity from the previous approved revision over to a
/// newly validated upload, level by level from the root.
pub struct RevisionMatcher {
    entity_repo: Arc<dyn EntityRepository>,
}

impl RevisionMatcher {
    pub fn new(entity_repo: Arc<dyn EntityRepository>) -> Self {
        Self { entity_repo }
    }

    pub async fn match_revision(&self, upload: &EntityUploadStatus, dataset_id: i64) -> DomainResult<MatchStats> {
        let mut stats = MatchStats::default();
        // new entity id -> concept uuid it ended up with
        let mut concepts: HashMap<i64, Uuid> = HashMap::new();

        let roots = self.entity_repo.find_by_upload_at_level(upload.id, 0).await?;
        match (upload.original_geographical_entity_id, upload.revised_entity_id.is_some()) {
            (Some(original_id), _) => {
                let original = self.entity_repo.find_by_id(original_id).await?;
                for root in &roots {
                    self.entity_repo
                        .inherit_concept(root.id, original.uuid, original.unique_code.as_deref())
                        .await?;
                    concepts.insert(root.id, original.uuid);
                    stats.matched += 1;
                }
            }
            // A country submitted as new starts a lineage of its own
            (None, true) => {
                for root in &roots {
                    concepts.insert(root.id, root.uuid);
                    stats.new += 1;
                }
            }
            (None, false) => {
                let candidates = self.entity_repo.find_latest_approved_at_level(dataset_id, 0).await?;
                self.match_level(&roots, &candidates, &mut concepts, &mut stats).await?;
            }
        }

        for level in 1..=MAX_ADMIN_DEPTH as i64 {
            let entities = self.entity_repo.find_by_upload_at_level(upload.id, level).await?;
            if entities.is_empty() {
                break;
            }
            let candidates = self.entity_repo.find_latest_approved_at_level(dataset_id, level).await?;
            self.match_level(&entities, &candidates, &mut concepts, &mut stats).await?;
        }

        log::info!(
            "upload {}: {} entities continue an existing concept, {} are new",
            upload.id, stats.matched, stats.new
        );
        Ok(stats)
    }

    /// Match by internal code under the same parent concept, then by the new
    /// centroid falling inside an old geometry. Each old concept is taken once.
    async fn match_level(
        &self,
        entities: &[GeographicalEntity],
        candidates: &[MatchCandidate],
        concepts: &mut HashMap<i64, Uuid>,
        stats: &mut MatchStats,
    ) -> DomainResult<()> {
        let mut claimed: HashSet<i64> = HashSet::new();

        for entity in entities {
            let parent_concept = entity.parent_id.and_then(|id| concepts.get(&id).copied());
            let siblings: Vec<&MatchCandidate> = candidates
                .iter()
                .filter(|c| !claimed.contains(&c.id))
                .filter(|c| entity.level == 0 || (parent_concept.is_some() && c.parent_uuid == parent_concept))
                .collect();

            let by_code = entity.internal_code.as_deref().and_then(|code| {
                siblings.iter().find(|c| c.internal_code.as_deref() == Some(code)).copied()
            });
            let matched = match by_code {
                Some(candidate) => Some(candidate),
                None => entity.parsed_geometry().and_then(|g| g.centroid()).and_then(|centroid| {
                    siblings
                        .iter()
                        .find(|c| c.geometry.as_ref().map_or(false, |g| g.contains_point(centroid)))
                        .copied()
                }),
            };

            match matched {
                Some(candidate) => {
                    claimed.insert(candidate.id);
                    self.entity_repo
                        .inherit_concept(entity.id, candidate.uuid, candidate.unique_code.as_deref())
                        .await?;
                    concepts.insert(entity.id, candidate.uuid);
                    stats.matched += 1;
                }
                None => {
                    concepts.insert(entity.id, entity.uuid);
                    stats.new += 1;
                }
            }
        }
        Ok(())
    }
}
