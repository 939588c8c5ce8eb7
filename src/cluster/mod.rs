//! Cluster manager seam
//!
//! The master talks to two collaborators: a resource manager that grants
//! containers, and a node manager that starts them. Both are traits so the
//! controllers never depend on how the managers are reached.
//!
//! # Modules
//!
//! - `protocol`: containers, requests, statuses and the two event enums
//! - `local`: in-process managers that run workers as local processes
//! - `mock`: recording managers for tests
//!
//! Calls that only enqueue work (`add_container_request`, `query_status`)
//! are synchronous and must not block; their results arrive as events.

pub mod local;
pub mod mock;
pub mod protocol;

use anyhow::Result;
use async_trait::async_trait;

// Re-export key types
pub use local::LocalCluster;
pub use protocol::{
    Container,
    ContainerId,
    ContainerRequest,
    ContainerStatus,
    LaunchContext,
    NmEvent,
    NodeReport,
    Registration,
    Resource,
    RmEvent,
};

/// Resource manager client
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Nodes currently able to run containers
    async fn running_nodes(&self) -> Result<Vec<NodeReport>>;

    /// Register the master; heartbeating starts after this
    async fn register(&self, host: &str, rpc_port: i32, tracking_url: &str) -> Result<Registration>;

    /// Ask for one more container; the grant arrives as [`RmEvent::Allocated`]
    fn add_container_request(&self, request: ContainerRequest);

    /// Hand a granted container back
    fn release_container(&self, id: &ContainerId);

    /// Progress value sent with the next heartbeat
    fn report_progress(&self, progress: f32);

    /// Report the final status of the application
    async fn unregister(&self, status: crate::cohort::FinalStatus, message: Option<&str>) -> Result<()>;

    async fn stop(&self);
}

/// Node manager client
#[async_trait]
pub trait NodeManager: Send + Sync {
    /// Submit a start request; the result arrives as [`NmEvent::Started`] or
    /// [`NmEvent::StartError`]. An `Err` means the request was never submitted.
    async fn start_container(&self, container: &Container, context: LaunchContext) -> Result<()>;

    /// Ask for a container's status; the reply arrives as an event
    fn query_status(&self, id: &ContainerId, node: &protocol::NodeId);

    /// Stop the client and every container it started
    async fn stop(&self);
}
