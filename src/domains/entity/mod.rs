pub mod geometry;
pub mod types;
pub mod repository;
pub mod unique_code;

pub use geometry::{BoundingBox, Geometry};
pub use types::{ApprovedNeighbor, EntityId, EntityName, GeographicalEntity, MatchCandidate, NewGeographicalEntity};
pub use repository::{EntityRepository, SqliteEntityRepository};
pub use unique_code::{interpolate_version, UniqueCodeService};
