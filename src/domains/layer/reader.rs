use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::domains::layer::types::LayerType;
use crate::errors::{DomainError, DomainResult};
use crate::validation::validate_file_extension;

const ZIP_PREFIX: &str = "zip://";

/// Where a layer's features live. Shapefiles always come zipped and are
/// addressed as `zip://<archive>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerSource {
    File(PathBuf),
    Zip(PathBuf),
}

impl LayerSource {
    pub fn parse(path: &str, layer_type: LayerType) -> Self {
        if let Some(archive) = path.strip_prefix(ZIP_PREFIX) {
            return LayerSource::Zip(PathBuf::from(archive));
        }
        match layer_type {
            LayerType::Shapefile => LayerSource::Zip(PathBuf::from(path)),
            LayerType::Geojson if validate_file_extension(path, &["zip"]) => LayerSource::Zip(PathBuf::from(path)),
            LayerType::Geojson => LayerSource::File(PathBuf::from(path)),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            LayerSource::File(path) | LayerSource::Zip(path) => path,
        }
    }
}

impl fmt::Display for LayerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerSource::File(path) => write!(f, "{}", path.display()),
            LayerSource::Zip(path) => write!(f, "{}{}", ZIP_PREFIX, path.display()),
        }
    }
}

/// A feature as read from a layer: raw GeoJSON geometry plus properties
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Feature {
    pub geometry: Option<Value>,
    pub properties: Map<String, Value>,
}

impl Feature {
    /// Property value as text. Null, missing and blank values yield `None`;
    /// numbers and booleans are stringified.
    pub fn value_of(&self, field: &str) -> Option<String> {
        match self.properties.get(field)? {
            Value::Null => None,
            Value::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
            }
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            other => Some(other.to_string()),
        }
    }

    pub fn value_or(&self, field: &str, default: &str) -> String {
        self.value_of(field).unwrap_or_else(|| default.to_string())
    }

    pub fn has_valid_value(&self, field: &str) -> bool {
        self.value_of(field).is_some()
    }
}

/// Reads every feature of a layer
pub trait FeatureReader: Send + Sync {
    fn read(&self, source: &LayerSource) -> DomainResult<Vec<Feature>>;
}

/// Decodes zipped Shapefiles; supplied by the host application
pub trait ShapefileDecoder: Send + Sync {
    fn decode(&self, archive: &Path) -> DomainResult<Vec<Feature>>;
}

/// Reads GeoJSON files, optionally inside a zip archive. Archives holding a
/// Shapefile are handed to the configured decoder.
#[derive(Clone, Default)]
pub struct GeoJsonFeatureReader {
    shapefile_decoder: Option<Arc<dyn ShapefileDecoder>>,
}

impl GeoJsonFeatureReader {
    pub fn new() -> Self {
        Self { shapefile_decoder: None }
    }

    pub fn with_shapefile_decoder(decoder: Arc<dyn ShapefileDecoder>) -> Self {
        Self { shapefile_decoder: Some(decoder) }
    }

    fn read_archive(&self, archive_path: &Path) -> DomainResult<Vec<Feature>> {
        let file = File::open(archive_path)?;
        let mut archive = zip::ZipArchive::new(file)
            .map_err(|e| DomainError::File(format!("{}: {}", archive_path.display(), e)))?;

        let names: Vec<String> = archive.file_names().map(str::to_string).collect();
        if let Some(member) = names.iter().find(|n| validate_file_extension(n, &["geojson", "json"])) {
            let mut entry = archive
                .by_name(member)
                .map_err(|e| DomainError::File(format!("{}: {}", member, e)))?;
            let mut text = String::new();
            entry.read_to_string(&mut text)?;
            return parse_feature_collection(&text);
        }

        if names.iter().any(|n| validate_file_extension(n, &["shp"])) {
            return match &self.shapefile_decoder {
                Some(decoder) => decoder.decode(archive_path),
                None => Err(DomainError::External(format!(
                    "no shapefile decoder configured for {}",
                    archive_path.display()
                ))),
            };
        }

        Err(DomainError::File(format!("{} contains no readable layer", archive_path.display())))
    }
}

impl FeatureReader for GeoJsonFeatureReader {
    fn read(&self, source: &LayerSource) -> DomainResult<Vec<Feature>> {
        log::debug!("reading features from {}", source);
        match source {
            LayerSource::File(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| DomainError::File(format!("{}: {}", path.display(), e)))?;
                parse_feature_collection(&text)
            }
            LayerSource::Zip(path) => self.read_archive(path),
        }
    }
}

fn feature_from_value(value: &Value) -> Feature {
    let geometry = value.get("geometry").filter(|g| !g.is_null()).cloned();
    let properties = value
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    Feature { geometry, properties }
}

/// Parse a FeatureCollection (or a lone Feature). Individual features are
/// taken as-is; geometry problems surface later during validation.
pub fn parse_feature_collection(text: &str) -> DomainResult<Vec<Feature>> {
    let value: Value = serde_json::from_str(text)?;
    match value.get("type").and_then(Value::as_str) {
        Some("FeatureCollection") => {
            let features = value
                .get("features")
                .and_then(Value::as_array)
                .ok_or_else(|| DomainError::File("FeatureCollection has no features array".to_string()))?;
            Ok(features.iter().map(feature_from_value).collect())
        }
        Some("Feature") => Ok(vec![feature_from_value(&value)]),
        other => Err(DomainError::File(format!("unsupported GeoJSON root type {:?}", other))),
    }
}

/// Reader over features held in memory, keyed by layer path
#[cfg(test)]
#[derive(Default)]
pub struct InMemoryFeatureReader {
    pub layers: std::collections::HashMap<String, Vec<Feature>>,
}

#[cfg(test)]
impl FeatureReader for InMemoryFeatureReader {
    fn read(&self, source: &LayerSource) -> DomainResult<Vec<Feature>> {
        let key = source.path().to_string_lossy().to_string();
        self.layers
            .get(&key)
            .cloned()
            .ok_or_else(|| DomainError::File(format!("no layer at {}", key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    const COLLECTION: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {"type": "Feature", "properties": {"code_0": "PAK", "name_0": "Pakistan", "pop": 12},
             "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,1],[0,0]]]}},
            {"type": "Feature", "properties": null, "geometry": null}
        ]
    }"#;

    #[test]
    fn test_layer_source_parsing() {
        assert_eq!(
            LayerSource::parse("zip:///tmp/adm0.zip", LayerType::Shapefile),
            LayerSource::Zip(PathBuf::from("/tmp/adm0.zip"))
        );
        assert_eq!(
            LayerSource::parse("/tmp/adm0.zip", LayerType::Shapefile).to_string(),
            "zip:///tmp/adm0.zip"
        );
        assert_eq!(
            LayerSource::parse("/tmp/level_0.geojson", LayerType::Geojson),
            LayerSource::File(PathBuf::from("/tmp/level_0.geojson"))
        );
    }

    #[test]
    fn test_feature_values() {
        let features = parse_feature_collection(COLLECTION).unwrap();
        assert_eq!(features.len(), 2);
        assert_eq!(features[0].value_of("code_0").as_deref(), Some("PAK"));
        assert_eq!(features[0].value_of("pop").as_deref(), Some("12"));
        assert!(!features[0].has_valid_value("missing"));
        assert!(features[1].geometry.is_none());
        assert_eq!(features[1].value_or("name_0", "Unknown"), "Unknown");

        let blank = Feature { geometry: None, properties: json!({"code": "  "}).as_object().cloned().unwrap() };
        assert!(!blank.has_valid_value("code"));
    }

    #[test]
    fn test_read_plain_and_zipped_geojson() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("level_0.geojson");
        std::fs::write(&plain, COLLECTION).unwrap();

        let archive_path = dir.path().join("level_0.zip");
        {
            let file = File::create(&archive_path).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            writer.start_file("level_0.geojson", zip::write::FileOptions::default()).unwrap();
            writer.write_all(COLLECTION.as_bytes()).unwrap();
            writer.finish().unwrap();
        }

        let reader = GeoJsonFeatureReader::new();
        assert_eq!(reader.read(&LayerSource::File(plain)).unwrap().len(), 2);
        assert_eq!(reader.read(&LayerSource::Zip(archive_path)).unwrap().len(), 2);
    }

    #[test]
    fn test_shapefile_without_decoder_is_external_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("adm0.zip");
        {
            let file = File::create(&archive_path).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            writer.start_file("adm0.shp", zip::write::FileOptions::default()).unwrap();
            writer.write_all(b"not really a shapefile").unwrap();
            writer.finish().unwrap();
        }

        let reader = GeoJsonFeatureReader::new();
        assert!(matches!(
            reader.read(&LayerSource::Zip(archive_path.clone())),
            Err(DomainError::External(_))
        ));

        struct OneFeature;
        impl ShapefileDecoder for OneFeature {
            fn decode(&self, _archive: &Path) -> DomainResult<Vec<Feature>> {
                Ok(vec![Feature::default()])
            }
        }
        let reader = GeoJsonFeatureReader::with_shapefile_decoder(Arc::new(OneFeature));
        assert_eq!(reader.read(&LayerSource::Zip(archive_path)).unwrap().len(), 1);
    }
}
