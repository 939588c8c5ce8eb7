//! Local cluster backend
//!
//! An in-process resource manager and node manager that run every container
//! as a child process on this machine. Useful for single-host runs and for
//! end-to-end tests of the master without a real cluster.
//!
//! # Architecture
//!
//! ```text
//! LocalResourceManager --+
//!                        +--> LocalInner (nodes, granted, running, finished)
//! LocalNodeManager ------+
//! ```
//!
//! - Requests are granted immediately, on the hinted host or round-robin
//! - A started container gets a workspace at `<work_dir>/<app-id>/<container-id>/`
//!   with its local resources copied in and a `logs/` directory that replaces
//!   `<LOG_DIR>` in the command
//! - Commands run under `sh -c`; the exit status is reported on the resource
//!   manager channel, as a real cluster would
//! - Stopping the node manager kills every running container

use super::protocol::*;
use super::{NodeManager, ResourceManager};
use crate::cohort::FinalStatus;
use crate::config::ClusterConfig;
use crate::error::MasterError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::process::Command;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Port reported for every local node manager
pub const LOCAL_NM_PORT: u16 = 45454;

/// Resource manager and node manager pair sharing one local cluster
pub struct LocalCluster {
    pub resource_manager: Arc<LocalResourceManager>,
    pub node_manager: Arc<LocalNodeManager>,
    pub rm_events: UnboundedReceiver<RmEvent>,
    pub nm_events: UnboundedReceiver<NmEvent>,
}

impl LocalCluster {
    /// Build a cluster with the nodes from `config` for application `app_id`
    pub fn new(app_id: &str, config: &ClusterConfig) -> Self {
        let nodes: Vec<NodeReport> = config
            .nodes
            .iter()
            .map(|n| NodeReport {
                node: NodeId::new(n.host.clone(), LOCAL_NM_PORT),
                http_address: format!("{}:8042", n.host),
                capability: Resource::new(n.memory_mb, n.vcores),
            })
            .collect();
        let max_capability = Resource::new(
            nodes.iter().map(|n| n.capability.memory_mb).max().unwrap_or(0),
            nodes.iter().map(|n| n.capability.vcores).max().unwrap_or(0),
        );

        let (rm_tx, rm_rx) = unbounded_channel();
        let (nm_tx, nm_rx) = unbounded_channel();

        let inner = Arc::new(LocalInner {
            app_id: app_id.to_string(),
            work_dir: config.work_dir.clone(),
            nodes,
            max_capability,
            registered: AtomicBool::new(false),
            rm_stopped: AtomicBool::new(false),
            nm_stopped: AtomicBool::new(false),
            next_container: AtomicU64::new(1),
            next_node: AtomicUsize::new(0),
            progress: Mutex::new(0.0),
            granted: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashMap::new()),
            rm_events: rm_tx,
            nm_events: nm_tx,
        });

        Self {
            resource_manager: Arc::new(LocalResourceManager { inner: inner.clone() }),
            node_manager: Arc::new(LocalNodeManager { inner }),
            rm_events: rm_rx,
            nm_events: nm_rx,
        }
    }
}

struct RunningContainer {
    kill: oneshot::Sender<ExitKind>,
}

struct LocalInner {
    app_id: String,
    work_dir: PathBuf,
    nodes: Vec<NodeReport>,
    max_capability: Resource,
    registered: AtomicBool,
    rm_stopped: AtomicBool,
    nm_stopped: AtomicBool,
    next_container: AtomicU64,
    next_node: AtomicUsize,
    progress: Mutex<f32>,
    /// Granted, not yet started
    granted: Mutex<HashMap<ContainerId, Container>>,
    running: Mutex<HashMap<ContainerId, RunningContainer>>,
    /// Exit codes of finished containers
    finished: Mutex<HashMap<ContainerId, i32>>,
    rm_events: UnboundedSender<RmEvent>,
    nm_events: UnboundedSender<NmEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LocalInner {
    fn emit_rm(&self, event: RmEvent) {
        if self.rm_events.send(event).is_err() {
            debug!("Resource manager event dropped, receiver closed");
        }
    }

    fn emit_nm(&self, event: NmEvent) {
        if self.nm_events.send(event).is_err() {
            debug!("Node manager event dropped, receiver closed");
        }
    }

    fn pick_host(&self, request: &ContainerRequest) -> String {
        if let Some(host) = request.nodes.as_ref().and_then(|n| n.first()) {
            return host.clone();
        }
        if self.nodes.is_empty() {
            return "localhost".to_string();
        }
        let i = self.next_node.fetch_add(1, Ordering::SeqCst) % self.nodes.len();
        self.nodes[i].node.host.clone()
    }

    fn workspace(&self, id: &ContainerId) -> PathBuf {
        self.work_dir.join(&self.app_id).join(id.as_str())
    }

    fn finish(&self, status: ContainerStatus) {
        lock(&self.running).remove(&status.id);
        lock(&self.finished).insert(status.id.clone(), status.exit_code);
        self.emit_rm(RmEvent::Completed(vec![status]));
    }
}

/// Resource manager half of the local cluster
pub struct LocalResourceManager {
    inner: Arc<LocalInner>,
}

impl LocalResourceManager {
    /// Last progress value reported by the master
    pub fn progress(&self) -> f32 {
        *lock(&self.inner.progress)
    }
}

#[async_trait]
impl ResourceManager for LocalResourceManager {
    async fn running_nodes(&self) -> Result<Vec<NodeReport>> {
        if self.inner.rm_stopped.load(Ordering::SeqCst) {
            return Err(MasterError::ClientStopped("Resource manager").into());
        }
        Ok(self.inner.nodes.clone())
    }

    async fn register(&self, host: &str, rpc_port: i32, tracking_url: &str) -> Result<Registration> {
        if self.inner.rm_stopped.load(Ordering::SeqCst) {
            return Err(MasterError::ClientStopped("Resource manager").into());
        }
        info!(host, rpc_port, tracking_url, app_id = %self.inner.app_id, "Application master registered");
        self.inner.registered.store(true, Ordering::SeqCst);
        Ok(Registration {
            max_capability: self.inner.max_capability,
            prior_containers: Vec::new(),
        })
    }

    fn add_container_request(&self, request: ContainerRequest) {
        if self.inner.rm_stopped.load(Ordering::SeqCst) {
            warn!("Container request ignored, resource manager client stopped");
            return;
        }
        let host = self.inner.pick_host(&request);
        let seq = self.inner.next_container.fetch_add(1, Ordering::SeqCst);
        let container = Container {
            id: ContainerId::new(format!("container_{}_{:06}", self.inner.app_id, seq)),
            node: NodeId::new(host.clone(), LOCAL_NM_PORT),
            node_http_address: format!("{}:8042", host),
            resource: request.resource,
        };
        debug!(container = %container.id, host = %host, "Granting container");
        lock(&self.inner.granted).insert(container.id.clone(), container.clone());
        self.inner.emit_rm(RmEvent::Allocated(vec![container]));
    }

    fn release_container(&self, id: &ContainerId) {
        if lock(&self.inner.granted).remove(id).is_some() {
            self.inner.finish(ContainerStatus::aborted(
                id.clone(),
                EXIT_ABORTED,
                "Container released by the application master",
            ));
            return;
        }
        if let Some(running) = lock(&self.inner.running).remove(id) {
            let _ = running.kill.send(ExitKind::Aborted);
        }
    }

    fn report_progress(&self, progress: f32) {
        *lock(&self.inner.progress) = progress;
    }

    async fn unregister(&self, status: FinalStatus, message: Option<&str>) -> Result<()> {
        if !self.inner.registered.load(Ordering::SeqCst) {
            return Err(MasterError::NotRegistered.into());
        }
        info!(status = %status, message = message.unwrap_or(""), "Application master unregistered");
        self.inner.registered.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.inner.rm_stopped.store(true, Ordering::SeqCst);
    }
}

/// Node manager half of the local cluster
pub struct LocalNodeManager {
    inner: Arc<LocalInner>,
}

#[async_trait]
impl NodeManager for LocalNodeManager {
    async fn start_container(&self, container: &Container, context: LaunchContext) -> Result<()> {
        if self.inner.nm_stopped.load(Ordering::SeqCst) {
            return Err(MasterError::ClientStopped("Node manager").into());
        }
        if lock(&self.inner.granted).remove(&container.id).is_none() {
            anyhow::bail!("Container {} was not granted by this cluster", container.id);
        }

        let inner = self.inner.clone();
        let container = container.clone();
        tokio::spawn(async move { run_container(inner, container, context).await });
        Ok(())
    }

    fn query_status(&self, id: &ContainerId, _node: &NodeId) {
        let state = if lock(&self.inner.running).contains_key(id) {
            Some((ReportedState::Running, String::new()))
        } else if let Some(code) = lock(&self.inner.finished).get(id) {
            Some((ReportedState::Complete, format!("Exit code {}", code)))
        } else if lock(&self.inner.granted).contains_key(id) {
            Some((ReportedState::New, String::new()))
        } else {
            None
        };

        match state {
            Some((state, diagnostics)) => self.inner.emit_nm(NmEvent::StatusReceived {
                id: id.clone(),
                report: ContainerReport {
                    id: id.clone(),
                    state,
                    diagnostics,
                },
            }),
            None => self.inner.emit_nm(NmEvent::GetStatusError {
                id: id.clone(),
                cause: format!("Unknown container {}", id),
            }),
        }
    }

    async fn stop(&self) {
        self.inner.nm_stopped.store(true, Ordering::SeqCst);
        let running: Vec<(ContainerId, RunningContainer)> = lock(&self.inner.running).drain().collect();
        for (id, container) in running {
            if container.kill.send(ExitKind::KilledByMaster).is_err() {
                self.inner.emit_nm(NmEvent::StopError {
                    id,
                    cause: "Container already exited".to_string(),
                });
                continue;
            }
            self.inner.emit_nm(NmEvent::Stopped(id));
        }
    }
}

/// Copy every local resource into the workspace
async fn localize(workspace: &Path, context: &LaunchContext) -> Result<()> {
    tokio::fs::create_dir_all(workspace.join("logs"))
        .await
        .with_context(|| format!("Failed to create workspace {}", workspace.display()))?;
    for (name, resource) in &context.local_resources {
        let target = workspace.join(name);
        tokio::fs::copy(&resource.source, &target)
            .await
            .with_context(|| format!("Failed to localize {} from {}", name, resource.source.display()))?;
    }
    Ok(())
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

fn killed_status(id: ContainerId, kind: ExitKind) -> ContainerStatus {
    match kind {
        ExitKind::KilledByMaster => ContainerStatus {
            id,
            exit_code: EXIT_KILLED_BY_APPMASTER,
            kind,
            diagnostics: "Container killed by the application master".to_string(),
        },
        _ => ContainerStatus::aborted(id, EXIT_ABORTED, "Container released by the application master"),
    }
}

async fn run_container(inner: Arc<LocalInner>, container: Container, context: LaunchContext) {
    let id = container.id.clone();
    let workspace = inner.workspace(&id);

    if let Err(e) = localize(&workspace, &context).await {
        inner.emit_nm(NmEvent::StartError {
            id,
            cause: format!("{:#}", e),
        });
        return;
    }

    let log_dir = workspace.join("logs");
    let command = context
        .commands
        .join(" ")
        .replace(LOG_DIR_EXPANSION, &log_dir.to_string_lossy());
    debug!(container = %id, command = %command, "Starting container");

    let spawned = Command::new("sh")
        .arg("-c")
        .arg(&command)
        .envs(&context.env)
        .current_dir(&workspace)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            inner.emit_nm(NmEvent::StartError {
                id,
                cause: format!("Failed to spawn worker: {}", e),
            });
            return;
        }
    };

    let (kill_tx, mut kill_rx) = oneshot::channel();
    lock(&inner.running).insert(id.clone(), RunningContainer { kill: kill_tx });
    inner.emit_nm(NmEvent::Started(id.clone()));

    // Stop raced with the start
    if inner.nm_stopped.load(Ordering::SeqCst) {
        if let Some(running) = lock(&inner.running).remove(&id) {
            let _ = running.kill.send(ExitKind::KilledByMaster);
            inner.emit_nm(NmEvent::Stopped(id.clone()));
        }
    }

    let status = tokio::select! {
        result = child.wait() => match result {
            Ok(status) => ContainerStatus::exited(id.clone(), exit_code(status)),
            Err(e) => ContainerStatus::aborted(id.clone(), EXIT_ABORTED, format!("Lost track of worker: {}", e)),
        },
        Ok(kind) = &mut kill_rx => {
            if let Err(e) = child.kill().await {
                warn!(container = %id, error = %e, "Failed to kill worker");
            }
            killed_status(id.clone(), kind)
        }
    };

    debug!(container = %id, exit_code = status.exit_code, "Container finished");
    inner.finish(status);
}
