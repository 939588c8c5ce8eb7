//! Cluster protocol types
//!
//! Data exchanged between the application master and the cluster managers:
//! the containers they grant, the requests the master sends, and the events
//! both managers deliver back.
//!
//! # Event Flow
//!
//! ```text
//! Master                Resource manager        Node manager
//!   |--- register ------------>|                      |
//!   |--- container request --->|                      |
//!   |<-- Allocated(batch) -----|                      |
//!   |--- start(container, launch context) ----------->|
//!   |<------------------------------------ Started ---|
//!   |<-- Completed(statuses) --|                      |
//!   |--- unregister(status) -->|                      |
//! ```
//!
//! Both managers deliver their events over their own channel; the master
//! consumes each channel on its own task.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Placeholder the node manager replaces with the container's log directory
pub const LOG_DIR_EXPANSION: &str = "<LOG_DIR>";

/// Exit status of a container that finished normally
pub const EXIT_SUCCESS: i32 = 0;

/// Exit status of a container the framework aborted
pub const EXIT_ABORTED: i32 = -100;

/// Exit status of a container preempted by the scheduler
pub const EXIT_PREEMPTED: i32 = -102;

/// Exit status of a container killed on the master's request
pub const EXIT_KILLED_BY_APPMASTER: i32 = -105;

/// Container identifier assigned by the resource manager
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Node manager address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub host: String,
    pub port: u16,
}

impl NodeId {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Memory and CPU of a container or node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub memory_mb: u64,
    pub vcores: u32,
}

impl Resource {
    pub fn new(memory_mb: u64, vcores: u32) -> Self {
        Self { memory_mb, vcores }
    }

    /// Whether `request` fits inside this capability
    pub fn covers(&self, request: &Resource) -> bool {
        self.memory_mb >= request.memory_mb && self.vcores >= request.vcores
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<memory:{}, vCores:{}>", self.memory_mb, self.vcores)
    }
}

/// A granted container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    pub node: NodeId,
    pub node_http_address: String,
    pub resource: Resource,
}

/// A running node as reported by the resource manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    pub node: NodeId,
    pub http_address: String,
    pub capability: Resource,
}

/// A request for one container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRequest {
    pub resource: Resource,
    pub priority: i32,
    /// Hosts the container must be placed on
    pub nodes: Option<Vec<String>>,
    /// Whether the scheduler may place it elsewhere
    pub relax_locality: bool,
}

impl ContainerRequest {
    /// Request pinned to `host`, or unconstrained when `host` is `None`
    pub fn new(resource: Resource, priority: i32, host: Option<String>) -> Self {
        let relax_locality = host.is_none();
        Self {
            resource,
            priority,
            nodes: host.map(|h| vec![h]),
            relax_locality,
        }
    }
}

/// How a container ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitKind {
    /// The worker process exited on its own
    Exited,
    /// The framework aborted the container
    Aborted,
    /// The scheduler preempted the container
    Preempted,
    /// Killed because the master asked for it
    KilledByMaster,
}

/// Final status of a completed container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub id: ContainerId,
    pub exit_code: i32,
    pub kind: ExitKind,
    pub diagnostics: String,
}

impl ContainerStatus {
    /// Status of a worker process that exited with `exit_code`
    pub fn exited(id: ContainerId, exit_code: i32) -> Self {
        Self {
            id,
            exit_code,
            kind: ExitKind::Exited,
            diagnostics: String::new(),
        }
    }

    /// Status of a container the framework aborted
    pub fn aborted(id: ContainerId, exit_code: i32, diagnostics: impl Into<String>) -> Self {
        Self {
            id,
            exit_code,
            kind: ExitKind::Aborted,
            diagnostics: diagnostics.into(),
        }
    }

    /// Killed or preempted by the cluster rather than by the job itself
    pub fn is_framework_aborted(&self) -> bool {
        matches!(self.kind, ExitKind::Aborted | ExitKind::Preempted)
    }
}

/// Container state as seen by a node manager status query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportedState {
    New,
    Running,
    Complete,
}

/// Reply to a status query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerReport {
    pub id: ContainerId,
    pub state: ReportedState,
    pub diagnostics: String,
}

/// A file the node manager copies into the container workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalResource {
    /// Location in shared storage
    pub source: PathBuf,
    pub size: u64,
    /// Modification time in milliseconds since the epoch
    pub timestamp_ms: i64,
}

/// Everything the node manager needs to start a worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchContext {
    /// Staged files, keyed by their name in the workspace
    pub local_resources: BTreeMap<String, LocalResource>,
    pub env: BTreeMap<String, String>,
    pub commands: Vec<String>,
}

/// Reply to registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub max_capability: Resource,
    /// Containers still running from earlier attempts of this application
    pub prior_containers: Vec<Container>,
}

/// Events delivered by the resource manager
#[derive(Debug, Clone, PartialEq)]
pub enum RmEvent {
    Allocated(Vec<Container>),
    Completed(Vec<ContainerStatus>),
    Error(String),
    ShutdownRequest,
    NodesUpdated(Vec<NodeReport>),
}

/// Events delivered by the node manager
#[derive(Debug, Clone, PartialEq)]
pub enum NmEvent {
    Started(ContainerId),
    StartError { id: ContainerId, cause: String },
    StatusReceived { id: ContainerId, report: ContainerReport },
    Stopped(ContainerId),
    StopError { id: ContainerId, cause: String },
    GetStatusError { id: ContainerId, cause: String },
}
