//! Cohort model
//!
//! The cohort is the fixed set of containers a job must obtain. This module
//! holds the aggregate counters shared by every controller, and the final
//! outcome derived from them.
//!
//! # Counters
//!
//! The counters are atomics, so single reads never block. They are written
//! from the resource-manager and node-manager event tasks and from launch
//! tasks. Every mutation takes the cohort's write lock, checks its guard and
//! updates the counters as one step, then wakes the termination waiter.
//! [`Cohort::snapshot`] takes the same lock, so a snapshot always satisfies
//! `failed <= completed <= allocated <= requested <= total`.

pub mod record;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::warn;

/// Aggregate state of the cohort
#[derive(Debug)]
pub struct Cohort {
    total_desired: usize,
    requested: AtomicUsize,
    allocated: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    done: AtomicBool,
    /// Serializes counter mutations and snapshots
    write: Mutex<()>,
    changed: Notify,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CohortSnapshot {
    pub total: usize,
    pub requested: usize,
    pub allocated: usize,
    pub completed: usize,
    pub failed: usize,
    pub done: bool,
}

impl Cohort {
    /// Create a cohort of `total_desired` containers with all counters at zero
    pub fn new(total_desired: usize) -> Self {
        Self {
            total_desired,
            requested: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            done: AtomicBool::new(false),
            write: Mutex::new(()),
            changed: Notify::new(),
        }
    }

    fn write(&self) -> MutexGuard<'_, ()> {
        self.write.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn total_desired(&self) -> usize {
        self.total_desired
    }

    pub fn requested(&self) -> usize {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Whether the job has been declared done
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Done flag set, or every container accounted for
    pub fn is_finished(&self) -> bool {
        self.is_done() || self.completed() == self.total_desired
    }

    pub fn snapshot(&self) -> CohortSnapshot {
        let _write = self.write();
        CohortSnapshot {
            total: self.total_desired,
            requested: self.requested(),
            allocated: self.allocated(),
            completed: self.completed(),
            failed: self.failed(),
            done: self.is_done(),
        }
    }

    /// Number of requests still needed to reach the full cohort
    pub fn outstanding(&self) -> usize {
        self.total_desired.saturating_sub(self.requested())
    }

    /// Record `n` newly issued container requests
    pub fn add_requested(&self, n: usize) {
        let _write = self.write();
        self.requested.fetch_add(n, Ordering::SeqCst);
        self.changed.notify_one();
    }

    /// Count one newly granted container.
    ///
    /// Refused once the job is done, or when every request is already
    /// matched by an allocation.
    pub fn try_add_allocated(&self) -> bool {
        let _write = self.write();
        if self.is_done() || self.allocated() >= self.requested() {
            return false;
        }
        self.allocated.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_one();
        true
    }

    /// A worker exited cleanly.
    ///
    /// The first clean exit is taken as completion of the whole cohort:
    /// `completed` is forced to `allocated` and the job is marked done.
    /// Outcomes of workers that are still running are never counted.
    /// Returns `false` if the job was already done.
    pub fn record_success(&self) -> bool {
        let _write = self.write();
        if self.is_done() {
            return false;
        }
        self.completed.store(self.allocated(), Ordering::SeqCst);
        self.done.store(true, Ordering::SeqCst);
        self.changed.notify_one();
        true
    }

    /// A worker failed, or its launch failed. Terminal for that slot.
    ///
    /// Returns `false` if the job was already done, or if every allocated
    /// slot is already accounted for.
    pub fn record_failure(&self) -> bool {
        let _write = self.write();
        if self.is_done() || self.completed() >= self.allocated() {
            return false;
        }
        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        self.failed.fetch_add(1, Ordering::SeqCst);
        if completed >= self.total_desired {
            self.done.store(true, Ordering::SeqCst);
        }
        self.changed.notify_one();
        true
    }

    /// The framework reclaimed a slot; it never really ran.
    ///
    /// Lowers `allocated` and `requested` by one. Returns `false` if the job
    /// was already done or no live slot is left to lose.
    pub fn record_lost(&self) -> bool {
        let _write = self.write();
        if self.is_done() {
            return false;
        }
        let (allocated, requested, completed) = (self.allocated(), self.requested(), self.completed());
        if allocated == 0 || requested == 0 || allocated <= completed {
            warn!(allocated, requested, completed, "Lost container with no live slot, counters unchanged");
            return false;
        }
        self.allocated.fetch_sub(1, Ordering::SeqCst);
        self.requested.fetch_sub(1, Ordering::SeqCst);
        self.changed.notify_one();
        true
    }

    /// Declare the job done (shutdown request, fatal manager error)
    pub fn mark_done(&self) {
        let _write = self.write();
        self.done.store(true, Ordering::SeqCst);
        self.changed.notify_one();
    }

    /// Fraction of the cohort completed, clamped to 1.0
    pub fn progress(&self) -> f32 {
        if self.total_desired == 0 {
            return 1.0;
        }
        (self.completed() as f32 / self.total_desired as f32).min(1.0)
    }

    /// Wait until [`is_finished`](Self::is_finished) holds
    ///
    /// Only one task waits on a cohort; every mutation stores a wake-up permit,
    /// so a change between the check and the await is never missed.
    pub async fn wait_finished(&self) {
        loop {
            if self.is_finished() {
                return;
            }
            self.changed.notified().await;
        }
    }

    /// Final outcome derived from the counters
    pub fn outcome(&self) -> JobOutcome {
        let snapshot = self.snapshot();
        if snapshot.failed == 0 && snapshot.completed == snapshot.total {
            JobOutcome {
                status: FinalStatus::Succeeded,
                diagnostics: None,
            }
        } else {
            JobOutcome {
                status: FinalStatus::Failed,
                diagnostics: Some(format!(
                    "Diagnostics., total={}, completed={}, allocated={}, failed={}",
                    snapshot.total, snapshot.completed, snapshot.allocated, snapshot.failed
                )),
            }
        }
    }
}

/// Final status reported to the resource manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalStatus {
    Succeeded,
    Failed,
}

impl fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Outcome of the whole job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub status: FinalStatus,
    pub diagnostics: Option<String>,
}

impl JobOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == FinalStatus::Succeeded
    }
}
