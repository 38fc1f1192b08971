use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::domains::entity::geometry::Geometry;
use crate::domains::entity::repository::EntityRepository;
use crate::domains::layer::reader::FeatureReader;
use crate::domains::layer::repository::LayerFileRepository;
use crate::domains::layer::types::LayerFile;
use crate::domains::upload::repository::UploadRepository;
use crate::domains::upload::types::{NewEntityUpload, NewEntityUploadChildLv1};
use crate::errors::DomainResult;

/// Outcome of auto parent matching for a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParentMatchReport {
    pub uploads: usize,
    pub children: usize,
    pub rematched: usize,
    pub unmatched: usize,
}

/// Level-0 unit a level-1 feature can belong to
struct ParentCandidate {
    code: String,
    name: Option<String>,
    geometry: Option<Geometry>,
    original_id: Option<i64>,
}

/// Splits a session's layers into one upload per country and assigns every
/// level-1 feature to the country that spatially contains it.
pub struct ParentMatcher {
    upload_repo: Arc<dyn UploadRepository>,
    entity_repo: Arc<dyn EntityRepository>,
    layer_repo: Arc<dyn LayerFileRepository>,
    reader: Arc<dyn FeatureReader>,
}

impl ParentMatcher {
    pub fn new(
        upload_repo: Arc<dyn UploadRepository>,
        entity_repo: Arc<dyn EntityRepository>,
        layer_repo: Arc<dyn LayerFileRepository>,
        reader: Arc<dyn FeatureReader>,
    ) -> Self {
        Self { upload_repo, entity_repo, layer_repo, reader }
    }

    /// Countries come from the session's level-0 layer, or from the dataset's
    /// approved roots when the session starts at level 1.
    async fn parent_candidates(&self, dataset_id: i64, layer0: Option<&LayerFile>) -> DomainResult<Vec<ParentCandidate>> {
        let mut candidates = Vec::new();
        match layer0 {
            Some(layer) => {
                let Some(id_field) = layer.default_id_field() else {
                    log::warn!("level-0 layer {} has no default id field", layer.id);
                    return Ok(candidates);
                };
                for feature in self.reader.read(&layer.source())? {
                    let Some(code) = feature.value_of(id_field) else { continue };
                    let original = self.entity_repo.find_latest_approved_root(dataset_id, &code).await?;
                    candidates.push(ParentCandidate {
                        name: layer.default_name_field().and_then(|f| feature.value_of(f)),
                        geometry: feature.geometry.as_ref().and_then(|g| Geometry::from_geojson(g).ok()),
                        original_id: original.map(|e| e.id),
                        code,
                    });
                }
            }
            None => {
                for root in self.entity_repo.find_latest_approved_at_level(dataset_id, 0).await? {
                    let Some(code) = root.internal_code else { continue };
                    let entity = self.entity_repo.find_by_id(root.id).await?;
                    candidates.push(ParentCandidate {
                        code,
                        name: entity.label,
                        geometry: root.geometry,
                        original_id: Some(root.id),
                    });
                }
            }
        }
        Ok(candidates)
    }

    pub async fn preprocess(&self, session_id: i64) -> DomainResult<ParentMatchReport> {
        let session = self.upload_repo.find_session(session_id).await?;
        let layer0 = self.layer_repo.find_by_session_and_level(session_id, 0).await?;
        let layer1 = self.layer_repo.find_by_session_and_level(session_id, 1).await?;
        let candidates = self.parent_candidates(session.dataset_id, layer0.as_ref()).await?;

        // country code -> children (code, name, rematched)
        let mut assigned: BTreeMap<String, Vec<(String, Option<String>, bool)>> = BTreeMap::new();
        if layer0.is_some() {
            for candidate in &candidates {
                assigned.entry(candidate.code.clone()).or_default();
            }
        }

        let mut report = ParentMatchReport::default();
        if let Some(layer) = layer1.as_ref() {
            let id_field = layer.default_id_field();
            for feature in self.reader.read(&layer.source())? {
                let Some(code) = id_field.and_then(|f| feature.value_of(f)) else { continue };
                let declared = layer.parent_id_field.as_deref().and_then(|f| feature.value_of(f));
                let centroid = feature
                    .geometry
                    .as_ref()
                    .and_then(|g| Geometry::from_geojson(g).ok())
                    .and_then(|g| g.centroid());

                let containing = centroid.and_then(|point| {
                    candidates
                        .iter()
                        .find(|c| c.geometry.as_ref().map_or(false, |g| g.contains_point(point)))
                });
                let parent = containing.or_else(|| {
                    declared.as_deref().and_then(|d| candidates.iter().find(|c| c.code == d))
                });
                let Some(parent) = parent else {
                    log::debug!("session {}: level-1 feature {} matches no country", session_id, code);
                    report.unmatched += 1;
                    continue;
                };

                let rematched = declared.as_deref() != Some(parent.code.as_str());
                if rematched {
                    report.rematched += 1;
                }
                let name = layer.default_name_field().and_then(|f| feature.value_of(f));
                assigned.entry(parent.code.clone()).or_default().push((code, name, rematched));
            }
        }

        for (country_code, children) in assigned {
            let Some(candidate) = candidates.iter().find(|c| c.code == country_code) else { continue };
            let upload = match self.upload_repo.find_upload_by_revised_entity(session_id, &country_code).await? {
                Some(upload) => upload,
                None => {
                    self.upload_repo
                        .create_upload(&NewEntityUpload {
                            session_id,
                            original_geographical_entity_id: candidate.original_id,
                            revised_entity_id: Some(country_code.clone()),
                            revised_entity_name: candidate.name.clone(),
                            max_level: None,
                        })
                        .await?
                }
            };
            report.uploads += 1;

            self.upload_repo.clear_children_lv1(upload.id).await?;
            for (entity_id, entity_name, is_parent_rematched) in children {
                self.upload_repo
                    .add_child_lv1(&NewEntityUploadChildLv1 {
                        entity_upload_id: upload.id,
                        entity_id,
                        entity_name,
                        parent_entity_id: Some(country_code.clone()),
                        is_parent_rematched,
                    })
                    .await?;
                report.children += 1;
            }
        }

        self.upload_repo.mark_parent_matching_ready(session_id).await?;
        log::info!(
            "session {}: parent matching done, {} uploads, {} children ({} rematched, {} unmatched)",
            session_id, report.uploads, report.children, report.rematched, report.unmatched
        );
        Ok(report)
    }
}
