use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::domains::layer::reader::FeatureReader;
use crate::domains::layer::types::LayerFile;
use crate::errors::DomainResult;

/// Admin depth never exceeds this; deeper chains mean malformed parent links.
pub const MAX_ADMIN_DEPTH: usize = 16;

/// Default id and parent reference of one feature
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureCodes {
    pub code: Option<String>,
    pub parent_code: Option<String>,
}

/// Per-session index of layer features, read once so that parent/child
/// lookups never go back to the files.
#[derive(Debug, Default, Serialize)]
pub struct LayerHierarchyCache {
    layers: HashMap<i64, Vec<FeatureCodes>>,
    levels: BTreeMap<i64, Vec<i64>>,
}

impl LayerHierarchyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(layer_files: &[LayerFile], reader: &dyn FeatureReader) -> DomainResult<Self> {
        let mut cache = Self::new();
        for layer in layer_files {
            let Some(id_field) = layer.default_id_field() else {
                log::warn!("layer file {} (level {}) has no default id field, skipped", layer.id, layer.level);
                continue;
            };
            let features = reader.read(&layer.source())?;
            let codes = features
                .iter()
                .map(|feature| FeatureCodes {
                    code: feature.value_of(id_field),
                    parent_code: layer.parent_id_field.as_deref().and_then(|f| feature.value_of(f)),
                })
                .collect();
            cache.insert_layer(layer.id, layer.level, codes);
        }
        log::debug!(
            "hierarchy cache built: {} layers over levels {:?}",
            cache.layers.len(),
            cache.levels.keys().collect::<Vec<_>>()
        );
        Ok(cache)
    }

    pub fn insert_layer(&mut self, layer_file_id: i64, level: i64, codes: Vec<FeatureCodes>) {
        self.layers.insert(layer_file_id, codes);
        let ids = self.levels.entry(level).or_default();
        if !ids.contains(&layer_file_id) {
            ids.push(layer_file_id);
        }
    }

    pub fn layer(&self, layer_file_id: i64) -> Option<&[FeatureCodes]> {
        self.layers.get(&layer_file_id).map(Vec::as_slice)
    }

    pub fn levels(&self) -> impl Iterator<Item = i64> + '_ {
        self.levels.keys().copied()
    }

    /// Features of every layer file at `level`, in insertion order
    pub fn features_at_level(&self, level: i64) -> impl Iterator<Item = &FeatureCodes> + '_ {
        self.levels
            .get(&level)
            .into_iter()
            .flatten()
            .filter_map(|id| self.layer(*id))
            .flatten()
    }

    /// Codes at `level` whose parent reference equals `parent_code`.
    /// Duplicates are kept.
    pub fn children_of(&self, level: i64, parent_code: &str) -> Vec<&str> {
        self.features_at_level(level)
            .filter(|f| f.parent_code.as_deref() == Some(parent_code))
            .filter_map(|f| f.code.as_deref())
            .collect()
    }

    /// Whether `start_code` at `start_level` has some descendant reaching
    /// `target_level`.
    pub fn has_descendant_at_level(&self, start_level: i64, start_code: &str, target_level: i64) -> bool {
        let mut stack: Vec<(i64, &str, usize)> = vec![(start_level, start_code, 0)];
        while let Some((level, code, depth)) = stack.pop() {
            if level >= target_level {
                return true;
            }
            if depth >= MAX_ADMIN_DEPTH {
                log::warn!("hierarchy search from {} stopped at depth {}", start_code, depth);
                continue;
            }
            for child in self.children_of(level + 1, code) {
                stack.push((level + 1, child, depth + 1));
            }
        }
        false
    }
}

/// A country upload can only claim `level` if the country actually has
/// features that deep.
pub fn validate_level_country(cache: &LayerHierarchyCache, country_code: &str, level: i64) -> bool {
    cache.has_descendant_at_level(0, country_code, level)
}

/// Same check for a set of level-1 entities.
pub fn validate_level_admin_1(cache: &LayerHierarchyCache, codes: &[&str], level: i64) -> bool {
    if level == 1 {
        return !codes.is_empty();
    }
    codes.iter().any(|code| cache.has_descendant_at_level(1, code, level))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::layer::reader::{Feature, InMemoryFeatureReader};
    use crate::domains::layer::types::{IdFieldMapping, LayerType};
    use serde_json::json;

    fn codes(pairs: &[(&str, Option<&str>)]) -> Vec<FeatureCodes> {
        pairs
            .iter()
            .map(|(code, parent)| FeatureCodes { code: Some(code.to_string()), parent_code: parent.map(str::to_string) })
            .collect()
    }

    fn pakistan() -> LayerHierarchyCache {
        let mut cache = LayerHierarchyCache::new();
        cache.insert_layer(1, 0, codes(&[("PAK", None)]));
        cache.insert_layer(2, 1, codes(&[("PAK01", Some("PAK")), ("PAK02", Some("PAK"))]));
        cache.insert_layer(3, 2, codes(&[("PAK01A", Some("PAK01"))]));
        cache
    }

    #[test]
    fn test_descendant_search_finds_level_two_but_not_three() {
        let cache = pakistan();
        assert!(cache.has_descendant_at_level(0, "PAK", 2));
        assert!(!cache.has_descendant_at_level(0, "PAK", 3));
        assert!(cache.has_descendant_at_level(0, "PAK", 0));
        assert!(!cache.has_descendant_at_level(1, "PAK02", 2));
    }

    #[test]
    fn test_missing_level_and_duplicates() {
        let mut cache = LayerHierarchyCache::new();
        cache.insert_layer(1, 0, codes(&[("AFG", None)]));
        assert!(cache.children_of(1, "AFG").is_empty());
        assert!(!cache.has_descendant_at_level(0, "AFG", 1));

        cache.insert_layer(2, 1, codes(&[("AFG01", Some("AFG")), ("AFG01", Some("AFG"))]));
        assert_eq!(cache.children_of(1, "AFG"), vec!["AFG01", "AFG01"]);
        assert!(validate_level_country(&cache, "AFG", 1));
    }

    #[test]
    fn test_validate_level_admin_1() {
        let cache = pakistan();
        assert!(validate_level_admin_1(&cache, &["PAK02"], 1));
        assert!(!validate_level_admin_1(&cache, &[], 1));
        assert!(validate_level_admin_1(&cache, &["PAK02", "PAK01"], 2));
        assert!(!validate_level_admin_1(&cache, &["PAK02"], 2));
    }

    #[test]
    fn test_self_referencing_codes_terminate() {
        let mut cache = LayerHierarchyCache::new();
        cache.insert_layer(1, 0, codes(&[("X", None)]));
        for level in 1..=20 {
            cache.insert_layer(level + 1, level, codes(&[("X", Some("X"))]));
        }
        assert!(cache.has_descendant_at_level(0, "X", 5));
        assert!(!cache.has_descendant_at_level(0, "X", 40));
    }

    #[test]
    fn test_build_reads_default_and_parent_fields() {
        let feature = |code: &str, parent: &str| Feature {
            geometry: None,
            properties: json!({"code": code, "parent": parent}).as_object().cloned().unwrap(),
        };
        let mut reader = InMemoryFeatureReader::default();
        reader.layers.insert("level_0.geojson".into(), vec![feature("PAK", "")]);
        reader.layers.insert("level_1.geojson".into(), vec![feature("PAK01", "PAK")]);

        let layer = |id: i64, level: i64, path: &str, parent: Option<&str>| LayerFile {
            id,
            session_id: 1,
            level,
            path: path.to_string(),
            layer_type: LayerType::Geojson,
            entity_type: None,
            id_fields: vec![IdFieldMapping { field: "code".into(), id_type: None, default: true }],
            name_fields: vec![],
            parent_id_field: parent.map(str::to_string),
            boundary_type: None,
            privacy_level: None,
            privacy_level_field: None,
        };
        let layers = vec![
            layer(10, 0, "level_0.geojson", None),
            layer(11, 1, "level_1.geojson", Some("parent")),
        ];

        let cache = LayerHierarchyCache::build(&layers, &reader).unwrap();
        assert_eq!(cache.children_of(1, "PAK"), vec!["PAK01"]);
        assert_eq!(cache.layer(10).unwrap()[0].parent_code, None);
        assert_eq!(cache.levels().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_children_span_every_file_of_a_level() {
        let mut cache = pakistan();
        cache.insert_layer(4, 1, codes(&[("PAK03", Some("PAK"))]));
        assert_eq!(cache.children_of(1, "PAK"), vec!["PAK01", "PAK02", "PAK03"]);
        assert_eq!(cache.features_at_level(1).count(), 3);
    }
}
