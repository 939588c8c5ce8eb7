//! Application master
//!
//! Drives one job from registration to unregistration. All shared state lives
//! in a [`MasterContext`] that every controller holds through an `Arc`; there
//! are no globals.
//!
//! # Architecture
//!
//! ```text
//!            RmEvent channel                 NmEvent channel
//!                  |                               |
//!             rm event task                   nm event task
//!           /       |        \                     |
//!   Allocation  Completion  (error, shutdown)  Completion
//!       |
//!   launch wave task --> PeerListBuilder --> one task per container start
//!
//!   TerminationDecider: wait for done, join launches, stop, unregister
//! ```
//!
//! - `allocation`: requests, host hints, allocation intake, retries
//! - `peers`: ranked hostfile built and written to shared storage
//! - `launch`: launch waves, rank 0 stagger, per-container start tasks
//! - `completion`: exit statuses and node manager callbacks
//! - `termination`: bounded shutdown and the final outcome

pub mod allocation;
pub mod completion;
pub mod launch;
pub mod peers;
pub mod termination;

use crate::cluster::protocol::{NmEvent, Resource, RmEvent};
use crate::cluster::{NodeManager, ResourceManager};
use crate::cohort::record::{ContainerRecord, ContainerRegistry};
use crate::cohort::{Cohort, CohortSnapshot, JobOutcome};
use crate::config::Config;
use crate::storage::SharedStorage;
use crate::Result;
use allocation::AllocationController;
use completion::CompletionController;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use termination::TerminationDecider;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// State shared by every controller
pub struct MasterContext {
    pub config: Config,
    pub app_id: String,
    pub cohort: Cohort,
    pub containers: ContainerRegistry,
    pub rm: Arc<dyn ResourceManager>,
    pub nm: Arc<dyn NodeManager>,
    pub storage: Arc<dyn SharedStorage>,
    /// Candidate hosts, consumed one per request
    hosts: Mutex<VecDeque<String>>,
    /// Per-container request, clamped at registration
    resource: RwLock<Resource>,
    /// Launch waves and per-container start tasks
    launches: Mutex<Vec<JoinHandle<()>>>,
    closing: AtomicBool,
    requests_halted: AtomicBool,
    first_wave_logged: AtomicBool,
    started_at: Instant,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MasterContext {
    pub fn new(
        mut config: Config,
        rm: Arc<dyn ResourceManager>,
        nm: Arc<dyn NodeManager>,
        storage: Arc<dyn SharedStorage>,
    ) -> Self {
        let app_id = config.resolve_app_id();
        let resource = Resource::new(config.container.memory_mb, config.container.vcores);
        Self {
            cohort: Cohort::new(config.job.num_containers),
            config,
            app_id,
            containers: ContainerRegistry::new(),
            rm,
            nm,
            storage,
            hosts: Mutex::new(VecDeque::new()),
            resource: RwLock::new(resource),
            launches: Mutex::new(Vec::new()),
            closing: AtomicBool::new(false),
            requests_halted: AtomicBool::new(false),
            first_wave_logged: AtomicBool::new(false),
            started_at: Instant::now(),
        }
    }

    /// Resource asked for in every container request
    pub fn resource(&self) -> Resource {
        *self.resource.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_resource(&self, resource: Resource) {
        *self.resource.write().unwrap_or_else(PoisonError::into_inner) = resource;
    }

    pub fn set_hosts(&self, hosts: impl IntoIterator<Item = String>) {
        *lock(&self.hosts) = hosts.into_iter().collect();
    }

    /// Next candidate host, if any remain
    pub fn take_host(&self) -> Option<String> {
        lock(&self.hosts).pop_front()
    }

    pub fn remaining_hosts(&self) -> usize {
        lock(&self.hosts).len()
    }

    /// Remember a launch task so termination can join it
    pub fn track_launch(&self, handle: JoinHandle<()>) {
        lock(&self.launches).push(handle);
    }

    pub(crate) fn take_launches(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *lock(&self.launches))
    }

    /// Termination has begun; late events are ignored
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub(crate) fn begin_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    /// Whether events may still change the counters
    pub fn accepting_events(&self) -> bool {
        !self.is_closing() && !self.cohort.is_done()
    }

    /// No further container requests are issued
    pub fn requests_halted(&self) -> bool {
        self.requests_halted.load(Ordering::SeqCst)
    }

    pub(crate) fn halt_requests(&self) {
        self.requests_halted.store(true, Ordering::SeqCst);
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// True exactly once, for the first launch wave
    pub(crate) fn first_wave(&self) -> bool {
        !self.first_wave_logged.swap(true, Ordering::SeqCst)
    }
}

/// Everything known about the job once it has terminated
#[derive(Debug, Clone)]
pub struct MasterReport {
    pub app_id: String,
    pub outcome: JobOutcome,
    pub counters: CohortSnapshot,
    /// Tracked containers at termination, in allocation order
    pub containers: Vec<ContainerRecord>,
    pub elapsed: Duration,
}

/// Route one resource manager event to its controller
pub fn dispatch_rm_event(ctx: &Arc<MasterContext>, event: RmEvent) {
    match event {
        RmEvent::Allocated(batch) => AllocationController::new(ctx.clone()).on_allocated(batch),
        RmEvent::Completed(statuses) => CompletionController::new(ctx.clone()).on_completed(statuses),
        RmEvent::Error(cause) => CompletionController::new(ctx.clone()).on_rm_error(&cause),
        RmEvent::ShutdownRequest => CompletionController::new(ctx.clone()).on_shutdown_request(),
        RmEvent::NodesUpdated(nodes) => {
            info!(nodes = nodes.len(), "Cluster nodes updated");
        }
    }
}

/// Route one node manager event to its controller
pub fn dispatch_nm_event(ctx: &Arc<MasterContext>, event: NmEvent) {
    let completion = CompletionController::new(ctx.clone());
    match event {
        NmEvent::Started(id) => completion.on_started(&id),
        NmEvent::StartError { id, cause } => completion.on_start_error(&id, &cause),
        NmEvent::StatusReceived { id, report } => {
            debug!(container = %id, state = ?report.state, diagnostics = %report.diagnostics, "Container status");
        }
        NmEvent::Stopped(id) => completion.on_stopped(&id),
        NmEvent::StopError { id, cause } => {
            warn!(container = %id, cause = %cause, "Failed to stop container");
            completion.on_stopped(&id);
        }
        NmEvent::GetStatusError { id, cause } => {
            warn!(container = %id, cause = %cause, "Failed to query container status");
        }
    }
}

/// The application master
///
/// # Example
///
/// ```no_run
/// use cohort_master::cluster::LocalCluster;
/// use cohort_master::storage::LocalStorage;
/// use cohort_master::{AppMaster, Config};
/// use std::sync::Arc;
///
/// # async fn run() -> anyhow::Result<()> {
/// let mut config = Config::default();
/// config.launch.script_path = "launch.py".into();
/// let app_id = config.resolve_app_id();
///
/// let cluster = LocalCluster::new(&app_id, &config.cluster);
/// let storage = Arc::new(LocalStorage::new(&config.storage.root));
/// let master = AppMaster::new(
///     config,
///     cluster.resource_manager,
///     cluster.rm_events,
///     cluster.node_manager,
///     cluster.nm_events,
///     storage,
/// );
/// let report = master.run().await?;
/// println!("{}", report.outcome.status);
/// # Ok(())
/// # }
/// ```
pub struct AppMaster {
    ctx: Arc<MasterContext>,
    rm_events: UnboundedReceiver<RmEvent>,
    nm_events: UnboundedReceiver<NmEvent>,
}

impl AppMaster {
    pub fn new(
        config: Config,
        rm: Arc<dyn ResourceManager>,
        rm_events: UnboundedReceiver<RmEvent>,
        nm: Arc<dyn NodeManager>,
        nm_events: UnboundedReceiver<NmEvent>,
        storage: Arc<dyn SharedStorage>,
    ) -> Self {
        Self {
            ctx: Arc::new(MasterContext::new(config, rm, nm, storage)),
            rm_events,
            nm_events,
        }
    }

    pub fn context(&self) -> Arc<MasterContext> {
        self.ctx.clone()
    }

    /// Run the job to completion
    ///
    /// Returns `Err` only when the job could not be started (not enough
    /// nodes, registration failure). Every failure after that is folded into
    /// the report's outcome.
    pub async fn run(self) -> Result<MasterReport> {
        let Self {
            ctx,
            mut rm_events,
            mut nm_events,
        } = self;
        let allocation = AllocationController::new(ctx.clone());

        allocation.select_hosts().await?;
        allocation.register().await?;

        let rm_task = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                while let Some(event) = rm_events.recv().await {
                    dispatch_rm_event(&ctx, event);
                }
                debug!("Resource manager event channel closed");
            })
        };
        let nm_task = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                while let Some(event) = nm_events.recv().await {
                    dispatch_nm_event(&ctx, event);
                }
                debug!("Node manager event channel closed");
            })
        };
        let heartbeat_task = spawn_heartbeat(ctx.clone());

        allocation.request_outstanding();

        let report = TerminationDecider::new(ctx.clone()).finish().await;

        heartbeat_task.abort();
        rm_task.abort();
        nm_task.abort();
        Ok(report)
    }
}

/// Push progress to the resource manager until aborted
fn spawn_heartbeat(ctx: Arc<MasterContext>) -> JoinHandle<()> {
    let period = ctx.config.runtime.heartbeat_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            ctx.rm.report_progress(ctx.cohort.progress());
        }
    })
}
