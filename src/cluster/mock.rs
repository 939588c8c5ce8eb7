//! Mock cluster managers for testing
//!
//! Recording implementations of [`ResourceManager`] and [`NodeManager`]. They
//! never touch the network or spawn processes; tests inspect what the master
//! asked for and inject the events a real cluster would deliver.
//!
//! # Features
//!
//! - Records every container request, release, progress report and start
//! - Optional automatic grants (hinted host first, then round-robin)
//! - Optional automatic `Started` events
//! - Start requests can be made to fail or to hang forever
//! - Unregister can be made to fail
//!
//! # Example
//!
//! ```
//! use cohort_master::cluster::mock::MockResourceManager;
//! use cohort_master::cluster::{ResourceManager, RmEvent};
//! use cohort_master::cluster::protocol::{ContainerRequest, Resource};
//!
//! let (rm, mut events) = MockResourceManager::with_hosts(&["h1", "h2"]);
//! rm.set_auto_allocate(true);
//! rm.add_container_request(ContainerRequest::new(Resource::new(1000, 2), 10, None));
//!
//! assert_eq!(rm.requests().len(), 1);
//! match events.try_recv().unwrap() {
//!     RmEvent::Allocated(batch) => assert_eq!(batch[0].node.host, "h1"),
//!     other => panic!("unexpected event {:?}", other),
//! }
//! ```

use super::protocol::*;
use super::{NodeManager, ResourceManager};
use crate::cohort::FinalStatus;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Mock resource manager
pub struct MockResourceManager {
    nodes: Mutex<Vec<NodeReport>>,
    registration: Mutex<Registration>,
    requests: Mutex<Vec<ContainerRequest>>,
    released: Mutex<Vec<ContainerId>>,
    progress: Mutex<Vec<f32>>,
    unregistered: Mutex<Option<(FinalStatus, Option<String>)>>,
    auto_allocate: AtomicBool,
    fail_unregister: AtomicBool,
    stopped: AtomicBool,
    next_container: AtomicU64,
    next_node: AtomicUsize,
    events: UnboundedSender<RmEvent>,
}

impl MockResourceManager {
    /// Mock with one 8 GB / 8 vcore node per host
    pub fn with_hosts(hosts: &[&str]) -> (Arc<Self>, UnboundedReceiver<RmEvent>) {
        let nodes = hosts
            .iter()
            .map(|host| NodeReport {
                node: NodeId::new(*host, 45454),
                http_address: format!("{}:8042", host),
                capability: Resource::new(8192, 8),
            })
            .collect();
        Self::with_nodes(nodes)
    }

    pub fn with_nodes(nodes: Vec<NodeReport>) -> (Arc<Self>, UnboundedReceiver<RmEvent>) {
        let (tx, rx) = unbounded_channel();
        let rm = Self {
            nodes: Mutex::new(nodes),
            registration: Mutex::new(Registration {
                max_capability: Resource::new(8192, 8),
                prior_containers: Vec::new(),
            }),
            requests: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
            progress: Mutex::new(Vec::new()),
            unregistered: Mutex::new(None),
            auto_allocate: AtomicBool::new(false),
            fail_unregister: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            next_container: AtomicU64::new(1),
            next_node: AtomicUsize::new(0),
            events: tx,
        };
        (Arc::new(rm), rx)
    }

    /// Grant every request immediately
    pub fn set_auto_allocate(&self, enabled: bool) {
        self.auto_allocate.store(enabled, Ordering::SeqCst);
    }

    pub fn set_fail_unregister(&self, fail: bool) {
        self.fail_unregister.store(fail, Ordering::SeqCst);
    }

    pub fn set_registration(&self, registration: Registration) {
        *self.registration.lock().unwrap() = registration;
    }

    /// Deliver an event as if the cluster sent it
    pub fn emit(&self, event: RmEvent) {
        let _ = self.events.send(event);
    }

    /// Build a container on `host` with a fresh id
    pub fn make_container(&self, host: &str) -> Container {
        let seq = self.next_container.fetch_add(1, Ordering::SeqCst);
        Container {
            id: ContainerId::new(format!("container_mock_{:06}", seq)),
            node: NodeId::new(host, 45454),
            node_http_address: format!("{}:8042", host),
            resource: Resource::new(1000, 2),
        }
    }

    pub fn requests(&self) -> Vec<ContainerRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn released(&self) -> Vec<ContainerId> {
        self.released.lock().unwrap().clone()
    }

    pub fn progress_reports(&self) -> Vec<f32> {
        self.progress.lock().unwrap().clone()
    }

    pub fn unregistered(&self) -> Option<(FinalStatus, Option<String>)> {
        self.unregistered.lock().unwrap().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn pick_host(&self, request: &ContainerRequest) -> String {
        if let Some(host) = request.nodes.as_ref().and_then(|n| n.first()) {
            return host.clone();
        }
        let nodes = self.nodes.lock().unwrap();
        if nodes.is_empty() {
            return "localhost".to_string();
        }
        let i = self.next_node.fetch_add(1, Ordering::SeqCst) % nodes.len();
        nodes[i].node.host.clone()
    }
}

#[async_trait]
impl ResourceManager for MockResourceManager {
    async fn running_nodes(&self) -> Result<Vec<NodeReport>> {
        Ok(self.nodes.lock().unwrap().clone())
    }

    async fn register(&self, _host: &str, _rpc_port: i32, _tracking_url: &str) -> Result<Registration> {
        Ok(self.registration.lock().unwrap().clone())
    }

    fn add_container_request(&self, request: ContainerRequest) {
        let host = self.pick_host(&request);
        self.requests.lock().unwrap().push(request.clone());
        if self.auto_allocate.load(Ordering::SeqCst) {
            let mut container = self.make_container(&host);
            container.resource = request.resource;
            self.emit(RmEvent::Allocated(vec![container]));
        }
    }

    fn release_container(&self, id: &ContainerId) {
        self.released.lock().unwrap().push(id.clone());
    }

    fn report_progress(&self, progress: f32) {
        self.progress.lock().unwrap().push(progress);
    }

    async fn unregister(&self, status: FinalStatus, message: Option<&str>) -> Result<()> {
        if self.fail_unregister.load(Ordering::SeqCst) {
            anyhow::bail!("mock unregister failure");
        }
        *self.unregistered.lock().unwrap() = Some((status, message.map(str::to_string)));
        Ok(())
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Record of a start request for testing verification
#[derive(Debug, Clone)]
pub struct StartRecord {
    pub id: ContainerId,
    pub host: String,
    pub context: LaunchContext,
    pub at: Instant,
}

/// Mock node manager
pub struct MockNodeManager {
    starts: Mutex<Vec<StartRecord>>,
    status_queries: Mutex<Vec<ContainerId>>,
    auto_start: AtomicBool,
    fail_submit: AtomicBool,
    hang: AtomicBool,
    stopped: AtomicBool,
    events: UnboundedSender<NmEvent>,
}

impl MockNodeManager {
    pub fn new() -> (Arc<Self>, UnboundedReceiver<NmEvent>) {
        let (tx, rx) = unbounded_channel();
        let nm = Self {
            starts: Mutex::new(Vec::new()),
            status_queries: Mutex::new(Vec::new()),
            auto_start: AtomicBool::new(false),
            fail_submit: AtomicBool::new(false),
            hang: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            events: tx,
        };
        (Arc::new(nm), rx)
    }

    /// Emit `Started` for every accepted start request
    pub fn set_auto_start(&self, enabled: bool) {
        self.auto_start.store(enabled, Ordering::SeqCst);
    }

    /// Reject start requests at submission
    pub fn set_fail_submit(&self, fail: bool) {
        self.fail_submit.store(fail, Ordering::SeqCst);
    }

    /// Make start requests never return
    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn emit(&self, event: NmEvent) {
        let _ = self.events.send(event);
    }

    pub fn starts(&self) -> Vec<StartRecord> {
        self.starts.lock().unwrap().clone()
    }

    pub fn start_count(&self) -> usize {
        self.starts.lock().unwrap().len()
    }

    pub fn status_queries(&self) -> Vec<ContainerId> {
        self.status_queries.lock().unwrap().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeManager for MockNodeManager {
    async fn start_container(&self, container: &Container, context: LaunchContext) -> Result<()> {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_submit.load(Ordering::SeqCst) {
            anyhow::bail!("mock start submission failure");
        }
        self.starts.lock().unwrap().push(StartRecord {
            id: container.id.clone(),
            host: container.node.host.clone(),
            context,
            at: Instant::now(),
        });
        if self.auto_start.load(Ordering::SeqCst) {
            self.emit(NmEvent::Started(container.id.clone()));
        }
        Ok(())
    }

    fn query_status(&self, id: &ContainerId, _node: &NodeId) {
        self.status_queries.lock().unwrap().push(id.clone());
        self.emit(NmEvent::StatusReceived {
            id: id.clone(),
            report: ContainerReport {
                id: id.clone(),
                state: ReportedState::Running,
                diagnostics: String::new(),
            },
        });
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_rm_round_robin_and_hints() {
        let (rm, mut events) = MockResourceManager::with_hosts(&["h1", "h2"]);
        rm.set_auto_allocate(true);
        let resource = Resource::new(1000, 2);

        rm.add_container_request(ContainerRequest::new(resource, 10, Some("h2".to_string())));
        rm.add_container_request(ContainerRequest::new(resource, 10, None));
        rm.add_container_request(ContainerRequest::new(resource, 10, None));

        let mut hosts = Vec::new();
        while let Ok(RmEvent::Allocated(batch)) = events.try_recv() {
            hosts.extend(batch.into_iter().map(|c| c.node.host));
        }
        assert_eq!(hosts, vec!["h2", "h1", "h2"]);
        assert_eq!(rm.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_mock_rm_unregister() {
        let (rm, _events) = MockResourceManager::with_hosts(&["h1"]);
        rm.unregister(FinalStatus::Failed, Some("boom")).await.unwrap();
        assert_eq!(rm.unregistered(), Some((FinalStatus::Failed, Some("boom".to_string()))));

        rm.set_fail_unregister(true);
        assert!(rm.unregister(FinalStatus::Succeeded, None).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_nm_records_starts() {
        let (nm, mut events) = MockNodeManager::new();
        nm.set_auto_start(true);
        let (rm, _rm_events) = MockResourceManager::with_hosts(&["h1"]);
        let container = rm.make_container("h1");

        nm.start_container(&container, LaunchContext::default()).await.unwrap();
        assert_eq!(nm.start_count(), 1);
        assert_eq!(events.try_recv().unwrap(), NmEvent::Started(container.id.clone()));

        nm.set_fail_submit(true);
        assert!(nm.start_container(&container, LaunchContext::default()).await.is_err());
        assert_eq!(nm.start_count(), 1);
    }
}
