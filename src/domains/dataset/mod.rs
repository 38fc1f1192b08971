pub mod types;
pub mod repository;

pub use types::{BoundaryType, Dataset, IdType, Language, NewDataset};
pub use repository::{DatasetRepository, SqliteDatasetRepository};
