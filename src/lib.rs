//! cohort-master - application master for fixed-size distributed jobs
//!
//! cohort-master negotiates a fixed cohort of containers with a cluster resource
//! manager, publishes a ranked peer list so the workers can find each other,
//! launches one worker per container and decides the job's final outcome.
//!
//! # Architecture
//!
//! - **Cohort model**: atomic counters and the per-container record map
//! - **Cluster seam**: resource/node manager traits with a local backend and a mock
//! - **Shared storage**: where the peer list and launch script live
//! - **Master**: allocation, peer list, launch, completion and termination controllers
//! - **Output**: text and JSON outcome reports

pub mod cluster;
pub mod cohort;
pub mod config;
pub mod error;
pub mod master;
pub mod output;
pub mod storage;

// Re-export commonly used types
pub use cohort::{Cohort, FinalStatus, JobOutcome};
pub use config::Config;
pub use error::MasterError;
pub use master::AppMaster;

/// Result type used throughout cohort-master
pub type Result<T> = anyhow::Result<T>;
