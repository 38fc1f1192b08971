use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

use crate::domains::layer::reader::LayerSource;
use crate::errors::{DomainError, DomainResult, ValidationError};
use crate::validation::{validate_file_extension, Validate, ValidationBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LayerType {
    Geojson,
    Shapefile,
}

impl LayerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerType::Geojson => "GEOJSON",
            LayerType::Shapefile => "SHAPEFILE",
        }
    }
}

impl fmt::Display for LayerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LayerType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GEOJSON" => Ok(LayerType::Geojson),
            "SHAPEFILE" => Ok(LayerType::Shapefile),
            other => Err(DomainError::Validation(ValidationError::invalid_value(
                "layer_type",
                &format!("unknown layer type {}", other),
            ))),
        }
    }
}

/// Which feature property carries an identifier, and of which type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdFieldMapping {
    pub field: String,
    #[serde(default)]
    pub id_type: Option<String>,
    #[serde(default)]
    pub default: bool,
}

/// Which feature property carries a name, and in which language
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameFieldMapping {
    pub field: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub default: bool,
}

/// One uploaded file holding one admin level of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerFile {
    pub id: i64,
    pub session_id: i64,
    pub level: i64,
    pub path: String,
    pub layer_type: LayerType,
    pub entity_type: Option<String>,
    pub id_fields: Vec<IdFieldMapping>,
    pub name_fields: Vec<NameFieldMapping>,
    pub parent_id_field: Option<String>,
    /// Property holding the boundary type value
    pub boundary_type: Option<String>,
    /// Fixed privacy level for every feature of the layer
    pub privacy_level: Option<i64>,
    pub privacy_level_field: Option<String>,
}

impl LayerFile {
    pub fn default_id_field(&self) -> Option<&str> {
        self.id_fields.iter().find(|f| f.default).map(|f| f.field.as_str())
    }

    pub fn default_name_field(&self) -> Option<&str> {
        self.name_fields.iter().find(|f| f.default).map(|f| f.field.as_str())
    }

    pub fn source(&self) -> LayerSource {
        LayerSource::parse(&self.path, self.layer_type)
    }

    /// File name without directories, as shown to reviewers
    pub fn file_name(&self) -> &str {
        let path = self.path.strip_prefix("zip://").unwrap_or(&self.path);
        path.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLayerFile {
    pub session_id: i64,
    pub level: i64,
    pub path: String,
    pub layer_type: LayerType,
    pub entity_type: Option<String>,
    pub id_fields: Vec<IdFieldMapping>,
    pub name_fields: Vec<NameFieldMapping>,
    pub parent_id_field: Option<String>,
    pub boundary_type: Option<String>,
    pub privacy_level: Option<i64>,
    pub privacy_level_field: Option<String>,
}

impl Validate for NewLayerFile {
    fn validate(&self) -> DomainResult<()> {
        ValidationBuilder::new("level", Some(self.level))
            .min(0)
            .validate()?;
        ValidationBuilder::new("path", Some(self.path.clone()))
            .required()
            .not_blank()
            .validate()?;

        let allowed: &[&str] = match self.layer_type {
            LayerType::Geojson => &["geojson", "json", "zip"],
            LayerType::Shapefile => &["zip"],
        };
        if !validate_file_extension(self.path.trim_start_matches("zip://"), allowed) {
            return Err(DomainError::Validation(ValidationError::format(
                "path",
                &format!("{} layers must use one of: {}", self.layer_type, allowed.join(", ")),
            )));
        }

        if self.id_fields.iter().filter(|f| f.default).count() > 1 {
            return Err(DomainError::Validation(ValidationError::invalid_value(
                "id_fields",
                "at most one id field can be the default",
            )));
        }
        if self.level > 0 && self.parent_id_field.as_deref().map_or(true, |f| f.trim().is_empty()) {
            return Err(DomainError::Validation(ValidationError::required("parent_id_field")));
        }
        if let Some(level) = self.privacy_level {
            ValidationBuilder::new("privacy_level", Some(level)).range(1, 4).validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct LayerFileRow {
    pub id: i64,
    pub session_id: i64,
    pub level: i64,
    pub path: String,
    pub layer_type: String,
    pub entity_type: Option<String>,
    pub id_fields: String,
    pub name_fields: String,
    pub parent_id_field: Option<String>,
    pub boundary_type: Option<String>,
    pub privacy_level: Option<i64>,
    pub privacy_level_field: Option<String>,
}

impl LayerFileRow {
    pub fn into_entity(self) -> DomainResult<LayerFile> {
        Ok(LayerFile {
            id: self.id,
            session_id: self.session_id,
            level: self.level,
            path: self.path,
            layer_type: LayerType::from_str(&self.layer_type)?,
            entity_type: self.entity_type,
            id_fields: serde_json::from_str(&self.id_fields)?,
            name_fields: serde_json::from_str(&self.name_fields)?,
            parent_id_field: self.parent_id_field.filter(|f| !f.is_empty()),
            boundary_type: self.boundary_type.filter(|f| !f.is_empty()),
            privacy_level: self.privacy_level,
            privacy_level_field: self.privacy_level_field.filter(|f| !f.is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_layer(level: i64, path: &str, parent: Option<&str>) -> NewLayerFile {
        NewLayerFile {
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
        }
    }

    #[test]
    fn test_layer_file_validation() {
        assert!(new_layer(0, "level_0.geojson", None).validate().is_ok());
        assert!(new_layer(1, "level_1.geojson", None).validate().is_err());
        assert!(new_layer(1, "level_1.geojson", Some("code_0")).validate().is_ok());
        assert!(new_layer(0, "level_0.csv", None).validate().is_err());

        let mut shapefile = new_layer(0, "adm0.geojson", None);
        shapefile.layer_type = LayerType::Shapefile;
        assert!(shapefile.validate().is_err());
        shapefile.path = "adm0.zip".into();
        assert!(shapefile.validate().is_ok());
    }

    #[test]
    fn test_field_mapping_json() {
        let fields: Vec<IdFieldMapping> =
            serde_json::from_str(r#"[{"field": "code_0", "default": true}, {"field": "iso", "id_type": "ISO"}]"#).unwrap();
        assert_eq!(fields.len(), 2);
        assert!(fields[0].default);
        assert_eq!(fields[1].id_type.as_deref(), Some("ISO"));
        assert!(!fields[1].default);
    }

    #[test]
    fn test_file_name_strips_prefix_and_directories() {
        let mut layer = LayerFile {
            id: 1,
            session_id: 1,
            level: 0,
            path: "zip:///data/uploads/adm0.zip".into(),
            layer_type: LayerType::Shapefile,
            entity_type: None,
            id_fields: vec![],
            name_fields: vec![],
            parent_id_field: None,
            boundary_type: None,
            privacy_level: None,
            privacy_level_field: None,
        };
        assert_eq!(layer.file_name(), "adm0.zip");
        layer.path = "level_0.geojson".into();
        assert_eq!(layer.file_name(), "level_0.geojson");
    }
}
