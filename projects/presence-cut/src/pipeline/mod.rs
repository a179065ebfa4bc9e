// Presence-cut pipeline stages

pub mod detection;
pub mod orchestrator;
pub mod sampler;
pub mod segments;
pub mod splicer;
pub mod types;
