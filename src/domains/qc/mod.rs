pub mod error_type;
pub mod summary;
pub mod report;
pub mod service;

pub use error_type::{error_types_overview, ErrorType, ErrorTypesOverview};
pub use summary::{parse_summaries, ErrorTally, LevelSummary};
pub use report::{write_error_report, FeatureErrorRow};
pub use service::{is_validation_result_importable, QcService, QcServiceImpl, ValidationOptions};
