//! Per-container records
//!
//! One [`ContainerRecord`] exists for every container the resource manager
//! granted and the master accepted. Records are inserted on allocation and
//! removed when the container is lost, fails to start, or is stopped.
//!
//! Ranks are handed out at launch time, not allocation time: a launch wave
//! claims every record that has no rank yet and gives it the lowest ranks not
//! held by a live record. On the first wave this is plain allocation order;
//! after a lost slot, the replacement inherits the vacated rank.

use crate::cluster::protocol::{Container, ContainerId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lifecycle state of one container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Granted by the resource manager, not yet launched
    Allocated,
    /// Start request submitted to the node manager
    Launching,
    /// Node manager confirmed the start
    Running,
    /// Worker exited cleanly
    Completed,
    /// Worker or launch failed
    Failed,
    /// Reclaimed by the framework
    Lost,
}

impl ContainerState {
    /// No further transitions are expected
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Lost)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Allocated => "allocated",
            Self::Launching => "launching",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Lost => "lost",
        };
        f.write_str(s)
    }
}

/// One granted execution slot
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub container: Container,
    /// Position in allocation order
    pub seq: u64,
    pub rank: Option<usize>,
    pub state: ContainerState,
}

impl ContainerRecord {
    pub fn id(&self) -> &ContainerId {
        &self.container.id
    }

    pub fn host(&self) -> &str {
        &self.container.node.host
    }
}

/// A ranked peer as it appears in the peer list, before address resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedHost {
    pub rank: usize,
    pub host: String,
}

#[derive(Debug, Default)]
struct RegistryInner {
    records: HashMap<ContainerId, ContainerRecord>,
    next_seq: u64,
}

/// Concurrent map of container records keyed by id
#[derive(Debug, Default)]
pub struct ContainerRegistry {
    inner: Mutex<RegistryInner>,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a newly allocated container.
    ///
    /// Returns `false` (and changes nothing) if the id is already tracked.
    pub fn insert_if_absent(&self, container: Container) -> bool {
        let mut inner = self.lock();
        if inner.records.contains_key(&container.id) {
            return false;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.records.insert(
            container.id.clone(),
            ContainerRecord {
                container,
                seq,
                rank: None,
                state: ContainerState::Allocated,
            },
        );
        true
    }

    pub fn contains(&self, id: &ContainerId) -> bool {
        self.lock().records.contains_key(id)
    }

    pub fn get(&self, id: &ContainerId) -> Option<ContainerRecord> {
        self.lock().records.get(id).cloned()
    }

    /// Move a live record to the terminal `state`.
    ///
    /// Returns the record as it was before the transition, or `None` if the
    /// id is untracked or the record is already terminal. Of two concurrent
    /// outcomes for one container, only one gets `Some`.
    pub fn finish(&self, id: &ContainerId, state: ContainerState) -> Option<ContainerRecord> {
        let mut inner = self.lock();
        let record = inner.records.get_mut(id)?;
        if record.state.is_terminal() {
            return None;
        }
        let previous = record.clone();
        record.state = state;
        Some(previous)
    }

    /// Move a record from `Allocated` to `Launching`.
    ///
    /// Returns `false` if the record is no longer tracked (lost, failed to
    /// start) or has already left `Allocated`.
    pub fn begin_launch(&self, id: &ContainerId) -> bool {
        let mut inner = self.lock();
        match inner.records.get_mut(id) {
            Some(record) if record.state == ContainerState::Allocated => {
                record.state = ContainerState::Launching;
                true
            }
            _ => false,
        }
    }

    /// Mark a live record `Running`; terminal records are left alone
    pub fn mark_running(&self, id: &ContainerId) -> bool {
        let mut inner = self.lock();
        match inner.records.get_mut(id) {
            Some(record) if !record.state.is_terminal() => {
                record.state = ContainerState::Running;
                true
            }
            _ => false,
        }
    }

    /// Whether the record is tracked and still waiting to be launched
    pub fn is_launchable(&self, id: &ContainerId) -> bool {
        self.lock()
            .records
            .get(id)
            .is_some_and(|r| r.state == ContainerState::Allocated)
    }

    pub fn remove(&self, id: &ContainerId) -> Option<ContainerRecord> {
        self.lock().records.remove(id)
    }

    /// Assign ranks to every record that has none and return those records,
    /// ordered by rank.
    ///
    /// Claimed records are excluded from later claims, so each record is
    /// launched at most once.
    pub fn claim_unlaunched(&self) -> Vec<ContainerRecord> {
        let mut inner = self.lock();

        let taken: BTreeSet<usize> = inner.records.values().filter_map(|r| r.rank).collect();
        let mut pending: Vec<(u64, ContainerId)> = inner
            .records
            .values()
            .filter(|r| r.rank.is_none() && r.state == ContainerState::Allocated)
            .map(|r| (r.seq, r.container.id.clone()))
            .collect();
        pending.sort();

        let mut free_ranks = (0..).filter(|rank| !taken.contains(rank));
        let mut claimed = Vec::with_capacity(pending.len());
        for (_, id) in pending {
            if let (Some(rank), Some(record)) = (free_ranks.next(), inner.records.get_mut(&id)) {
                record.rank = Some(rank);
                claimed.push(record.clone());
            }
        }
        claimed.sort_by_key(|r| r.rank);
        claimed
    }

    /// Every ranked record, ordered by rank
    pub fn ranked_hosts(&self) -> Vec<RankedHost> {
        let inner = self.lock();
        let mut peers: Vec<RankedHost> = inner
            .records
            .values()
            .filter_map(|r| {
                r.rank.map(|rank| RankedHost {
                    rank,
                    host: r.container.node.host.clone(),
                })
            })
            .collect();
        peers.sort_by_key(|p| p.rank);
        peers
    }

    /// All records in allocation order
    pub fn records(&self) -> Vec<ContainerRecord> {
        let inner = self.lock();
        let mut records: Vec<ContainerRecord> = inner.records.values().cloned().collect();
        records.sort_by_key(|r| r.seq);
        records
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::protocol::{NodeId, Resource};

    fn container(id: &str, host: &str) -> Container {
        Container {
            id: ContainerId::new(id),
            node: NodeId::new(host, 45454),
            node_http_address: format!("{}:8042", host),
            resource: Resource::new(1000, 2),
        }
    }

    #[test]
    fn test_duplicate_insert_is_ignored() {
        let registry = ContainerRegistry::new();
        assert!(registry.insert_if_absent(container("c1", "h1")));
        assert!(!registry.insert_if_absent(container("c1", "h2")));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&ContainerId::new("c1")).unwrap().host(), "h1");
    }

    #[test]
    fn test_claim_assigns_ranks_in_allocation_order() {
        let registry = ContainerRegistry::new();
        registry.insert_if_absent(container("c-b", "h1"));
        registry.insert_if_absent(container("c-a", "h2"));
        registry.insert_if_absent(container("c-c", "h3"));

        let claimed = registry.claim_unlaunched();
        let ids: Vec<&str> = claimed.iter().map(|r| r.id().as_str()).collect();
        assert_eq!(ids, vec!["c-b", "c-a", "c-c"]);
        assert_eq!(claimed.iter().map(|r| r.rank).collect::<Vec<_>>(), vec![Some(0), Some(1), Some(2)]);

        // Already claimed records are not handed out twice
        assert!(registry.claim_unlaunched().is_empty());
    }

    #[test]
    fn test_replacement_inherits_vacated_rank() {
        let registry = ContainerRegistry::new();
        for (id, host) in [("c1", "h1"), ("c2", "h2"), ("c3", "h3")] {
            registry.insert_if_absent(container(id, host));
        }
        registry.claim_unlaunched();

        registry.remove(&ContainerId::new("c2"));
        registry.insert_if_absent(container("c4", "h4"));

        let claimed = registry.claim_unlaunched();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id().as_str(), "c4");
        assert_eq!(claimed[0].rank, Some(1));

        let peers = registry.ranked_hosts();
        let hosts: Vec<&str> = peers.iter().map(|p| p.host.as_str()).collect();
        assert_eq!(hosts, vec!["h1", "h4", "h3"]);
    }

    #[test]
    fn test_launch_then_running() {
        let registry = ContainerRegistry::new();
        registry.insert_if_absent(container("c1", "h1"));
        let id = ContainerId::new("c1");

        assert!(registry.begin_launch(&id));
        assert!(registry.mark_running(&id));
        assert_eq!(registry.get(&id).unwrap().state, ContainerState::Running);
        assert!(!registry.mark_running(&ContainerId::new("nope")));
        assert!(ContainerState::Lost.is_terminal());
        assert!(!ContainerState::Running.is_terminal());
    }

    #[test]
    fn test_finish_only_once() {
        let registry = ContainerRegistry::new();
        registry.insert_if_absent(container("c1", "h1"));
        let id = ContainerId::new("c1");

        let previous = registry.finish(&id, ContainerState::Failed).unwrap();
        assert_eq!(previous.state, ContainerState::Allocated);
        assert!(registry.finish(&id, ContainerState::Completed).is_none());
        assert_eq!(registry.get(&id).unwrap().state, ContainerState::Failed);
        assert!(registry.finish(&ContainerId::new("nope"), ContainerState::Failed).is_none());

        // A late start confirmation does not revive a finished record
        assert!(!registry.mark_running(&id));
        assert_eq!(registry.get(&id).unwrap().state, ContainerState::Failed);
    }

    #[test]
    fn test_begin_launch_requires_allocated() {
        let registry = ContainerRegistry::new();
        registry.insert_if_absent(container("c1", "h1"));
        registry.insert_if_absent(container("c2", "h2"));
        let (c1, c2) = (ContainerId::new("c1"), ContainerId::new("c2"));

        assert!(registry.is_launchable(&c1));
        assert!(registry.begin_launch(&c1));
        assert!(!registry.begin_launch(&c1));
        assert!(!registry.is_launchable(&c1));

        registry.remove(&c2);
        assert!(!registry.is_launchable(&c2));
        assert!(!registry.begin_launch(&c2));
    }
}
