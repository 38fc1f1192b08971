pub mod core;
pub mod dataset;
pub mod entity;
pub mod jobs;
pub mod layer;
pub mod matching;
pub mod qc;
pub mod upload;
