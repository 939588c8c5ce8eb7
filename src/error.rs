//! Error types for cohort-master
//!
//! Most fallible paths return `anyhow::Result` with context attached. The
//! variants here are the failures callers need to tell apart.

use thiserror::Error;

/// Domain errors raised by the application master
#[derive(Error, Debug)]
pub enum MasterError {
    /// The cluster has fewer running nodes than the cohort needs
    #[error("Cluster has {available} running nodes but the cohort needs {required}")]
    InsufficientNodes { required: usize, available: usize },

    /// Enough nodes exist, but too few can fit one container each
    #[error(
        "Only {eligible} nodes can host a container of {memory_mb} MB / {vcores} vcores, cohort needs {required}"
    )]
    InsufficientResources {
        required: usize,
        eligible: usize,
        memory_mb: u64,
        vcores: u32,
    },

    /// A resource manager call that requires registration was made too early
    #[error("Application master is not registered with the resource manager")]
    NotRegistered,

    /// The client has been stopped and accepts no further calls
    #[error("{0} client has been stopped")]
    ClientStopped(&'static str),

    /// A launch artifact could not be read from shared storage
    #[error("Failed to stage '{name}' from {path}: {reason}")]
    Staging {
        name: String,
        path: String,
        reason: String,
    },

    /// The peer list could not be built or persisted
    #[error("Failed to build peer list: {0}")]
    PeerList(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = MasterError::InsufficientNodes { required: 4, available: 2 };
        assert_eq!(err.to_string(), "Cluster has 2 running nodes but the cohort needs 4");

        let err = MasterError::ClientStopped("Node manager");
        assert_eq!(err.to_string(), "Node manager client has been stopped");
    }
}
