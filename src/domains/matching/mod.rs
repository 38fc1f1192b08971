pub mod candidates;
pub mod linker;
pub mod revision;
pub mod parent;
pub mod service;

pub use candidates::{retrieve_layer0_default_codes, CandidateKey, CountryCandidate, CountryUploadRequest};
pub use linker::{HierarchyLinker, UnlinkedEntity};
pub use revision::{MatchStats, RevisionMatcher};
pub use parent::{ParentMatchReport, ParentMatcher};
pub use service::{MatchingService, MatchingServiceImpl};
