use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::domains::core::repository::FindById;
use crate::domains::dataset::repository::DatasetRepository;
use crate::domains::dataset::types::Dataset;
use crate::domains::entity::geometry::Geometry;
use crate::domains::entity::repository::EntityRepository;
use crate::domains::entity::types::NewGeographicalEntity;
use crate::domains::entity::unique_code::UniqueCodeService;
use crate::domains::layer::reader::{Feature, FeatureReader};
use crate::domains::layer::repository::LayerFileRepository;
use crate::domains::layer::types::LayerFile;
use crate::domains::matching::linker::HierarchyLinker;
use crate::domains::matching::revision::RevisionMatcher;
use crate::domains::qc::error_type::ErrorType;
use crate::domains::qc::report::{write_error_report, FeatureErrorRow};
use crate::domains::qc::summary::{parse_summaries, ErrorTally, LevelSummary};
use crate::domains::upload::repository::UploadRepository;
use crate::domains::upload::types::{EntityUploadChildLv1, EntityUploadStatus, LayerUploadSession, UploadStatus};
use crate::errors::DomainResult;

/// Width of the generated internal code when a layer maps no default id
pub const INTERNAL_CODE_DIGITS: usize = 8;

const PRIVACY_UNREADABLE: &[ErrorType] = &[ErrorType::PrivacyLevelError, ErrorType::InvalidPrivacyLevel];
const PRIVACY_ABOVE_MAX: &[ErrorType] = &[ErrorType::InvalidPrivacyLevel];

#[derive(Debug, Clone)]
pub struct ValidationOptions {
    pub error_report_dir: PathBuf,
    pub simplify_tolerance: f64,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            error_report_dir: PathBuf::from("error_reports"),
            simplify_tolerance: 0.0001,
        }
    }
}

/// Quality checks over an upload's layer features
#[async_trait]
pub trait QcService: Send + Sync {
    /// Validate every feature of the upload's country and persist the accepted
    /// ones as pending entities. Returns true when the upload ends VALID.
    async fn run_validation(&self, upload_id: i64) -> DomainResult<bool>;

    /// Match the upload against the previous revision, then stamp unique codes
    /// and the upload's version. Returns the version.
    async fn assign_versions(&self, upload_id: i64) -> DomainResult<f64>;

    async fn is_importable(&self, upload_id: i64, is_superuser: bool) -> DomainResult<(bool, bool)>;
}

/// Whether a validation result may still go to review, and whether it only
/// carries warnings. Superusers may also import results whose errors are all
/// bypassable.
pub fn is_validation_result_importable(upload: &EntityUploadStatus, is_superuser: bool) -> DomainResult<(bool, bool)> {
    if upload.status == UploadStatus::Valid {
        return Ok((true, false));
    }
    let Some(summaries) = upload.summaries.as_ref() else {
        return Ok((false, false));
    };

    let tally = ErrorTally::from_summaries(&parse_summaries(summaries)?);
    let mut importable = false;
    let mut warning = false;
    if tally.allowable > 0 && tally.blocking == 0 {
        importable = true;
        warning = true;
    }
    if is_superuser && tally.superadmin_bypass > 0 && tally.superadmin_blocking == 0 {
        importable = true;
    }
    Ok((importable, warning))
}

/// Privacy level of one feature: fixed per layer, read from a field, or the
/// dataset maximum. Levels under the dataset minimum are raised to it.
pub fn resolve_privacy_level(layer: &LayerFile, feature: &Feature, dataset: &Dataset) -> Result<i64, &'static [ErrorType]> {
    let level = match (layer.privacy_level, layer.privacy_level_field.as_deref()) {
        (Some(fixed), _) => fixed,
        (None, Some(field)) => feature
            .value_of(field)
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or(PRIVACY_UNREADABLE)?,
        (None, None) => dataset.max_privacy_level,
    };
    if level > dataset.max_privacy_level {
        return Err(PRIVACY_ABOVE_MAX);
    }
    Ok(dataset.clamp_privacy_level(level))
}

fn admin_level_name(names: Option<&Value>, level: i64) -> Option<String> {
    let name = match names? {
        Value::Object(map) => map.get(&level.to_string()),
        Value::Array(items) => usize::try_from(level).ok().and_then(|i| items.get(i)),
        _ => None,
    }?;
    name.as_str().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

enum Admission {
    /// Feature belongs to another country of the same layer
    Outside,
    Inside { parent_code: Option<String> },
}

/// Decides which features of shared layer files belong to one country
struct LineageScope {
    root_code: Option<String>,
    /// Level-1 code -> level-0 code it was matched to
    rematched: HashMap<String, Option<String>>,
    admitted: HashMap<i64, HashSet<String>>,
}

impl LineageScope {
    fn new(root_code: Option<String>, children: &[EntityUploadChildLv1]) -> Self {
        Self {
            root_code,
            rematched: children
                .iter()
                .map(|c| (c.entity_id.clone(), c.parent_entity_id.clone()))
                .collect(),
            admitted: HashMap::new(),
        }
    }

    fn admit(&mut self, level: i64, code: Option<&str>, declared_parent: Option<String>) -> Admission {
        let admission = if level == 1 && !self.rematched.is_empty() {
            match code.and_then(|c| self.rematched.get(c)) {
                Some(parent) => Admission::Inside { parent_code: parent.clone().or(declared_parent) },
                None => Admission::Outside,
            }
        } else if self.root_code.is_none() {
            Admission::Inside { parent_code: declared_parent }
        } else if level == 0 {
            if code.is_some() && code == self.root_code.as_deref() {
                Admission::Inside { parent_code: None }
            } else {
                Admission::Outside
            }
        } else {
            let known = declared_parent
                .as_deref()
                .map_or(false, |p| self.admitted.get(&(level - 1)).map_or(false, |codes| codes.contains(p)));
            if known {
                Admission::Inside { parent_code: declared_parent }
            } else {
                Admission::Outside
            }
        };

        if let (Admission::Inside { .. }, Some(code)) = (&admission, code) {
            self.admitted.entry(level).or_default().insert(code.to_string());
        }
        admission
    }
}

/// Everything a validation run accumulates
struct ValidationRun<'a> {
    upload: &'a EntityUploadStatus,
    session: &'a LayerUploadSession,
    dataset: &'a Dataset,
    revision: i64,
    scope: LineageScope,
    summaries: BTreeMap<i64, LevelSummary>,
    rows: Vec<FeatureErrorRow>,
    seen_codes: HashMap<i64, HashSet<String>>,
    created: usize,
}

impl ValidationRun<'_> {
    fn flag(&mut self, row: &mut FeatureErrorRow, error_type: ErrorType) {
        row.flag(error_type);
        self.summaries
            .entry(row.level)
            .or_insert_with(|| LevelSummary::new(row.level))
            .record(error_type);
    }
}

pub struct QcServiceImpl {
    upload_repo: Arc<dyn UploadRepository>,
    entity_repo: Arc<dyn EntityRepository>,
    dataset_repo: Arc<dyn DatasetRepository>,
    layer_repo: Arc<dyn LayerFileRepository>,
    reader: Arc<dyn FeatureReader>,
    options: ValidationOptions,
}

impl QcServiceImpl {
    pub fn new(
        upload_repo: Arc<dyn UploadRepository>,
        entity_repo: Arc<dyn EntityRepository>,
        dataset_repo: Arc<dyn DatasetRepository>,
        layer_repo: Arc<dyn LayerFileRepository>,
        reader: Arc<dyn FeatureReader>,
        options: ValidationOptions,
    ) -> Self {
        Self { upload_repo, entity_repo, dataset_repo, layer_repo, reader, options }
    }

    async fn validate_feature(
        &self,
        run: &mut ValidationRun<'_>,
        layer: &LayerFile,
        index: usize,
        feature: &Feature,
    ) -> DomainResult<()> {
        let level = layer.level;
        let code = match layer.default_id_field() {
            Some(field) => feature.value_of(field),
            None => Some(format!("{:0width$}", index + 1, width = INTERNAL_CODE_DIGITS)),
        };
        let declared_parent = layer.parent_id_field.as_deref().and_then(|f| feature.value_of(f));
        let parent_code = match run.scope.admit(level, code.as_deref(), declared_parent) {
            Admission::Outside => return Ok(()),
            Admission::Inside { parent_code } => parent_code,
        };

        let label = layer
            .default_name_field()
            .and_then(|f| feature.value_of(f))
            .or_else(|| code.clone())
            .unwrap_or_else(|| format!("Feature {}", index + 1));
        let mut row = FeatureErrorRow::new(level, label.clone());
        let mut accepted = true;

        match code.as_deref() {
            None => {
                run.flag(&mut row, ErrorType::DefaultCodeMissing);
                accepted = false;
            }
            Some(code) => {
                if !run.seen_codes.entry(level).or_default().insert(code.to_string()) {
                    run.flag(&mut row, ErrorType::DuplicateCode);
                    accepted = false;
                }
            }
        }

        let boundary_type = match layer.boundary_type.as_deref() {
            None => layer.entity_type.clone(),
            Some(field) => {
                let resolved = match feature.value_of(field) {
                    Some(value) => self.dataset_repo.find_boundary_type(run.dataset.id, &value).await?,
                    None => None,
                };
                if resolved.is_none() {
                    run.flag(&mut row, ErrorType::BoundaryTypeError);
                    accepted = false;
                }
                resolved.map(|b| b.type_label)
            }
        };

        let privacy_level = match resolve_privacy_level(layer, feature, run.dataset) {
            Ok(level) => level,
            Err(error_types) => {
                for error_type in error_types {
                    run.flag(&mut row, *error_type);
                }
                run.dataset.max_privacy_level
            }
        };

        let geometry = match feature.geometry.as_ref().map(Geometry::from_geojson) {
            Some(Ok(geometry)) => {
                if geometry.self_intersects() {
                    run.flag(&mut row, ErrorType::SelfIntersects);
                }
                if geometry.has_duplicate_nodes() {
                    run.flag(&mut row, ErrorType::DuplicateNodes);
                }
                Some(geometry)
            }
            Some(Err(err)) => {
                log::debug!("upload {}: level {} feature {} geometry rejected: {}", run.upload.id, level, index, err);
                run.flag(&mut row, ErrorType::InvalidGeometry);
                None
            }
            None => {
                run.flag(&mut row, ErrorType::InvalidGeometry);
                None
            }
        };

        if row.has_errors() {
            run.rows.push(row);
        }
        let (Some(geometry), Some(code), Some(raw_geometry), true) =
            (geometry, code, feature.geometry.clone(), accepted)
        else {
            return Ok(());
        };

        let (start_date, end_date) = run.session.entity_dates();
        let entity = self
            .entity_repo
            .upsert_pending(&NewGeographicalEntity {
                uuid: Uuid::new_v4(),
                revision_number: run.revision,
                level,
                dataset_id: run.dataset.id,
                layer_file_id: Some(layer.id),
                entity_upload_id: Some(run.upload.id),
                start_date,
                end_date,
                boundary_type,
                label,
                internal_code: code,
                geometry: raw_geometry,
                privacy_level,
                parent_code,
                admin_level_name: admin_level_name(run.upload.admin_level_names.as_ref(), level),
            })
            .await?;

        let simplified = geometry.simplify(self.options.simplify_tolerance);
        self.entity_repo.set_simplified_geometry(entity.id, &simplified.to_geojson()).await?;

        for mapping in &layer.id_fields {
            let Some(value) = feature.value_of(&mapping.field) else { continue };
            let id_type = self
                .dataset_repo
                .get_or_create_id_type(mapping.id_type.as_deref().unwrap_or(&mapping.field))
                .await?;
            self.entity_repo.add_entity_id(entity.id, id_type.id, &value, mapping.default).await?;
        }
        for (idx, mapping) in layer.name_fields.iter().enumerate() {
            let Some(name) = feature.value_of(&mapping.field) else { continue };
            let language_id = match mapping.language.as_deref() {
                Some(code) => self.dataset_repo.find_language(code).await?.map(|l| l.id),
                None => None,
            };
            self.entity_repo
                .add_entity_name(entity.id, &name, language_id, mapping.default, idx as i64)
                .await?;
        }

        run.created += 1;
        Ok(())
    }
}

#[async_trait]
impl QcService for QcServiceImpl {
    async fn run_validation(&self, upload_id: i64) -> DomainResult<bool> {
        let upload = self.upload_repo.find_by_id(upload_id).await?;
        let session = self.upload_repo.find_session(upload.session_id).await?;
        let dataset = self.dataset_repo.find_by_id(session.dataset_id).await?;

        let stale = self.entity_repo.delete_pending_by_upload(upload.id).await?;
        if stale > 0 {
            log::info!("upload {}: removed {} entities left by a previous run", upload.id, stale);
        }

        let revision = self.entity_repo.max_approved_revision(dataset.id).await?.unwrap_or(0) + 1;
        self.upload_repo.set_revision_number(upload.id, revision).await?;

        let layers: Vec<LayerFile> = self
            .layer_repo
            .find_by_session(session.id)
            .await?
            .into_iter()
            .filter(|l| upload.max_level.map_or(true, |max| l.level <= max))
            .collect();
        let children = self.upload_repo.find_children_lv1(upload.id).await?;

        let mut run = ValidationRun {
            upload: &upload,
            session: &session,
            dataset: &dataset,
            revision,
            scope: LineageScope::new(upload.revised_entity_id.clone(), &children),
            summaries: BTreeMap::new(),
            rows: Vec::new(),
            seen_codes: HashMap::new(),
            created: 0,
        };

        for layer in &layers {
            self.upload_repo
                .set_progress(upload.id, &format!("Validating level {}", layer.level))
                .await?;
            run.summaries.entry(layer.level).or_insert_with(|| LevelSummary::new(layer.level));

            let features = self.reader.read(&layer.source())?;
            log::info!("upload {}: validating {} features of level {}", upload.id, features.len(), layer.level);
            for (index, feature) in features.iter().enumerate() {
                self.validate_feature(&mut run, layer, index, feature).await?;
            }
        }

        let unlinked = HierarchyLinker::new(self.entity_repo.clone()).link_hierarchy(upload.id).await?;
        for entity in unlinked {
            let mut row = FeatureErrorRow::new(entity.level, entity.label);
            run.flag(&mut row, ErrorType::ParentNotFound);
            run.rows.push(row);
        }

        let summaries = serde_json::to_value(run.summaries.values().collect::<Vec<_>>())?;
        log::info!(
            "upload {}: revision {}, {} entities created, {} features with errors",
            upload.id, revision, run.created, run.rows.len()
        );

        if !run.rows.is_empty() {
            let report = match write_error_report(&self.options.error_report_dir, upload.id, &run.rows) {
                Ok(path) => Some(path.to_string_lossy().to_string()),
                Err(err) => {
                    log::error!("upload {}: error report not written: {}", upload.id, err);
                    None
                }
            };
            self.upload_repo
                .update_validation_result(upload.id, UploadStatus::Error, &summaries, report.as_deref())
                .await?;
            return Ok(false);
        }

        self.upload_repo
            .update_validation_result(upload.id, UploadStatus::Valid, &summaries, None)
            .await?;
        self.assign_versions(upload.id).await?;
        Ok(true)
    }

    async fn assign_versions(&self, upload_id: i64) -> DomainResult<f64> {
        let upload = self.upload_repo.find_by_id(upload_id).await?;
        let session = self.upload_repo.find_session(upload.session_id).await?;

        RevisionMatcher::new(self.entity_repo.clone())
            .match_revision(&upload, session.dataset_id)
            .await?;

        let codes = UniqueCodeService::new(self.entity_repo.clone());
        let (start_date, _) = session.entity_dates();
        // Recomputed on every run; revisions approved since the last run move the neighbours
        let version = codes.compute_next_version(session.dataset_id, &start_date).await?;
        self.upload_repo.set_unique_code_version(upload.id, version).await?;
        codes.stamp_upload(upload.id, version).await?;
        Ok(version)
    }

    async fn is_importable(&self, upload_id: i64, is_superuser: bool) -> DomainResult<(bool, bool)> {
        let upload = self.upload_repo.find_by_id(upload_id).await?;
        is_validation_result_importable(&upload, is_superuser)
    }
}
