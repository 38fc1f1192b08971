pub mod types;
pub mod reader;
pub mod hierarchy;
pub mod repository;

pub use types::{IdFieldMapping, LayerFile, LayerType, NameFieldMapping, NewLayerFile};
pub use reader::{Feature, FeatureReader, GeoJsonFeatureReader, LayerSource, ShapefileDecoder};
pub use hierarchy::{validate_level_admin_1, validate_level_country, LayerHierarchyCache, MAX_ADMIN_DEPTH};
pub use repository::{LayerFileRepository, SqliteLayerFileRepository};
