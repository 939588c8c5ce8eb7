//! Completion controller
//!
//! Turns exit statuses and manager callbacks into counter updates:
//!
//! | Event                       | Effect                                         |
//! |-----------------------------|------------------------------------------------|
//! | exit 0                      | Completed, cohort finished (success shortcut)  |
//! | exit != 0, framework abort  | Lost, slot re-requested                        |
//! | exit != 0 otherwise         | Failed, terminal for the slot                  |
//! | start error, staging error  | Failed, terminal for the slot                  |
//! | resource manager error      | job done, no more requests                     |
//! | shutdown request            | job done                                       |
//!
//! Once the job is done or termination has begun, further outcomes are logged
//! and dropped so the counters stay consistent.

use super::allocation::AllocationController;
use super::MasterContext;
use crate::cluster::protocol::{ContainerId, ContainerStatus, EXIT_SUCCESS};
use crate::cohort::record::ContainerState;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct CompletionController {
    ctx: Arc<MasterContext>,
}

impl CompletionController {
    pub fn new(ctx: Arc<MasterContext>) -> Self {
        Self { ctx }
    }

    pub fn on_completed(&self, statuses: Vec<ContainerStatus>) {
        let mut lost = 0;
        for status in statuses {
            if !self.ctx.accepting_events() {
                debug!(container = %status.id, exit_code = status.exit_code, "Job finished, completion ignored");
                continue;
            }
            let state = if status.exit_code == EXIT_SUCCESS {
                ContainerState::Completed
            } else if status.is_framework_aborted() {
                ContainerState::Lost
            } else {
                ContainerState::Failed
            };
            let Some(record) = self.ctx.containers.finish(&status.id, state) else {
                debug!(container = %status.id, "Completion for untracked or finished container ignored");
                continue;
            };

            match state {
                ContainerState::Completed => {
                    if self.ctx.cohort.record_success() {
                        info!(container = %status.id, rank = ?record.rank, "Container exited cleanly, cohort finished");
                    } else {
                        debug!(container = %status.id, "Job finished, clean exit not counted");
                    }
                }
                ContainerState::Lost => {
                    if !self.ctx.cohort.record_lost() {
                        debug!(container = %status.id, "Job finished, loss not counted");
                        continue;
                    }
                    self.ctx.containers.remove(&status.id);
                    lost += 1;
                    info!(
                        container = %status.id,
                        exit_code = status.exit_code,
                        diagnostics = %status.diagnostics,
                        "Container lost, requesting a replacement"
                    );
                }
                _ => {
                    if !self.ctx.cohort.record_failure() {
                        debug!(container = %status.id, "Job finished, failure not counted");
                        continue;
                    }
                    warn!(
                        container = %status.id,
                        rank = ?record.rank,
                        exit_code = status.exit_code,
                        diagnostics = %status.diagnostics,
                        "Container failed"
                    );
                }
            }
        }

        if lost > 0 {
            AllocationController::new(self.ctx.clone()).request_outstanding();
        }
    }

    pub fn on_started(&self, id: &ContainerId) {
        let Some(record) = self.ctx.containers.get(id) else {
            debug!(container = %id, "Start confirmation for untracked container");
            return;
        };
        self.ctx.containers.mark_running(id);
        info!(container = %id, host = %record.host(), "Container started");
        self.ctx.nm.query_status(id, &record.container.node);
    }

    /// The node manager could not start the container
    pub fn on_start_error(&self, id: &ContainerId, cause: &str) {
        if !self.ctx.accepting_events() {
            debug!(container = %id, cause, "Job finished, start error ignored");
            return;
        }
        if self.ctx.containers.finish(id, ContainerState::Failed).is_none() {
            debug!(container = %id, "Start error for untracked or finished container");
            return;
        }
        self.ctx.containers.remove(id);
        if self.ctx.cohort.record_failure() {
            warn!(container = %id, cause, "Failed to start container");
        } else {
            debug!(container = %id, cause, "Job finished, start error not counted");
        }
    }

    /// The container could not be launched (peer list or staging failure)
    pub fn on_launch_failure(&self, id: &ContainerId, cause: &str) {
        if !self.ctx.accepting_events() {
            debug!(container = %id, cause, "Job finished, launch failure ignored");
            return;
        }
        if self.ctx.containers.finish(id, ContainerState::Failed).is_none() {
            return;
        }
        if self.ctx.cohort.record_failure() {
            warn!(container = %id, cause, "Container launch failed");
        } else {
            debug!(container = %id, cause, "Job finished, launch failure not counted");
        }
    }

    pub fn on_stopped(&self, id: &ContainerId) {
        debug!(container = %id, "Container stopped");
        self.ctx.containers.remove(id);
    }

    pub fn on_rm_error(&self, cause: &str) {
        error!(cause, "Resource manager error, shutting down");
        self.ctx.halt_requests();
        self.ctx.cohort.mark_done();
    }

    pub fn on_shutdown_request(&self) {
        info!("Shutdown requested by the resource manager");
        self.ctx.cohort.mark_done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::protocol::{ContainerReport, NmEvent, ReportedState, RmEvent, EXIT_PREEMPTED};
    use crate::cluster::protocol::ExitKind;
    use crate::cohort::FinalStatus;
    use crate::master::testing::*;
    use crate::master::{dispatch_nm_event, dispatch_rm_event};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Barrier;

    /// Request and allocate the whole cohort on `hosts`, returning the ids
    async fn allocate_cohort(h: &mut Harness, hosts: &[&str]) -> Vec<ContainerId> {
        AllocationController::new(h.ctx.clone()).request_outstanding();
        let batch: Vec<_> = hosts.iter().map(|host| h.rm.make_container(host)).collect();
        let ids = batch.iter().map(|c| c.id.clone()).collect();
        h.rm.emit(RmEvent::Allocated(batch));
        h.pump_rm();
        h.settle_launches().await;
        ids
    }

    fn complete(h: &mut Harness, status: ContainerStatus) {
        h.rm.emit(RmEvent::Completed(vec![status]));
        h.pump_rm();
    }

    #[tokio::test]
    async fn test_success_shortcut_with_running_peers() {
        let hosts = ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5"];
        let mut h = harness(5, &hosts);
        let ids = allocate_cohort(&mut h, &hosts).await;
        assert_eq!(h.nm.start_count(), 5);

        complete(&mut h, ContainerStatus::exited(ids[0].clone(), 0));
        assert_eq!(h.ctx.cohort.completed(), 5);
        assert!(h.ctx.cohort.is_done());
        h.assert_invariants();

        // Peers finishing afterwards are not counted
        complete(&mut h, ContainerStatus::exited(ids[1].clone(), 1));
        assert_eq!(h.ctx.cohort.failed(), 0);
        assert_eq!(h.ctx.cohort.outcome().status, FinalStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_failure_accounting_with_lost_slot() {
        let hosts = ["10.0.0.1", "10.0.0.2", "10.0.0.3"];
        let mut h = harness(3, &hosts);
        let ids = allocate_cohort(&mut h, &hosts).await;
        let (a, b, c) = (ids[0].clone(), ids[1].clone(), ids[2].clone());
        assert_eq!(h.ctx.containers.get(&a).unwrap().rank, Some(0));

        // A is reclaimed by the framework: exactly one compensating request
        complete(&mut h, ContainerStatus::aborted(a.clone(), 137, "preempted"));
        assert_eq!(h.rm.requests().len(), 4);
        assert_eq!(h.ctx.cohort.requested(), 3);
        assert_eq!(h.ctx.cohort.allocated(), 2);
        assert!(!h.ctx.containers.contains(&a));
        h.assert_invariants();

        // Its replacement takes over rank 0
        let replacement = h.rm.make_container("10.0.0.4");
        h.rm.emit(RmEvent::Allocated(vec![replacement.clone()]));
        h.pump_rm();
        h.settle_launches().await;
        assert_eq!(h.ctx.containers.get(&replacement.id).unwrap().rank, Some(0));
        assert_eq!(h.nm.start_count(), 4);

        complete(&mut h, ContainerStatus::exited(b.clone(), 1));
        h.assert_invariants();
        complete(&mut h, ContainerStatus::exited(c, 0));
        h.assert_invariants();

        let outcome = h.ctx.cohort.outcome();
        assert_eq!(outcome.status, FinalStatus::Failed);
        assert_eq!(
            outcome.diagnostics.as_deref(),
            Some("Diagnostics., total=3, completed=3, allocated=3, failed=1")
        );
        assert_eq!(h.ctx.containers.get(&b).unwrap().state, ContainerState::Failed);
    }

    #[tokio::test]
    async fn test_preempted_counts_as_lost() {
        let hosts = ["10.0.0.1", "10.0.0.2"];
        let mut h = harness(2, &hosts);
        let ids = allocate_cohort(&mut h, &hosts).await;

        complete(
            &mut h,
            ContainerStatus {
                id: ids[1].clone(),
                exit_code: EXIT_PREEMPTED,
                kind: ExitKind::Preempted,
                diagnostics: String::new(),
            },
        );
        assert_eq!(h.ctx.cohort.failed(), 0);
        assert_eq!(h.ctx.cohort.completed(), 0);
        assert_eq!(h.rm.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_worker_failures_finish_job() {
        let hosts = ["10.0.0.1", "10.0.0.2"];
        let mut h = harness(2, &hosts);
        let ids = allocate_cohort(&mut h, &hosts).await;

        complete(&mut h, ContainerStatus::exited(ids[0].clone(), 1));
        assert!(!h.ctx.cohort.is_finished());
        // Repeated status for the same container is not counted twice
        complete(&mut h, ContainerStatus::exited(ids[0].clone(), 1));
        assert_eq!(h.ctx.cohort.failed(), 1);

        complete(&mut h, ContainerStatus::exited(ids[1].clone(), 2));
        assert!(h.ctx.cohort.is_finished());
        assert_eq!(h.ctx.cohort.failed(), 2);
        h.assert_invariants();
    }

    #[tokio::test]
    async fn test_start_error_and_started() {
        let hosts = ["10.0.0.1", "10.0.0.2"];
        let mut h = harness(2, &hosts);
        let ids = allocate_cohort(&mut h, &hosts).await;

        dispatch_nm_event(&h.ctx, NmEvent::Started(ids[0].clone()));
        assert_eq!(h.ctx.containers.get(&ids[0]).unwrap().state, ContainerState::Running);
        assert_eq!(h.nm.status_queries(), vec![ids[0].clone()]);
        match h.nm_events.try_recv().unwrap() {
            NmEvent::StatusReceived { report, .. } => assert_eq!(report.state, ReportedState::Running),
            other => panic!("unexpected event {:?}", other),
        }

        dispatch_nm_event(
            &h.ctx,
            NmEvent::StartError {
                id: ids[1].clone(),
                cause: "no such image".to_string(),
            },
        );
        assert!(!h.ctx.containers.contains(&ids[1]));
        assert_eq!(h.ctx.cohort.completed(), 1);
        assert_eq!(h.ctx.cohort.failed(), 1);

        // Housekeeping events leave the counters alone
        dispatch_nm_event(
            &h.ctx,
            NmEvent::StatusReceived {
                id: ids[0].clone(),
                report: ContainerReport {
                    id: ids[0].clone(),
                    state: ReportedState::Running,
                    diagnostics: String::new(),
                },
            },
        );
        dispatch_nm_event(
            &h.ctx,
            NmEvent::GetStatusError {
                id: ids[0].clone(),
                cause: "timeout".to_string(),
            },
        );
        assert_eq!(h.ctx.cohort.completed(), 1);
        h.assert_invariants();
    }

    #[tokio::test]
    async fn test_events_ignored_while_closing() {
        let hosts = ["10.0.0.1", "10.0.0.2"];
        let mut h = harness(2, &hosts);
        let ids = allocate_cohort(&mut h, &hosts).await;

        h.ctx.begin_closing();
        complete(&mut h, ContainerStatus::exited(ids[0].clone(), 1));
        complete(&mut h, ContainerStatus::aborted(ids[1].clone(), 137, "killed"));

        assert_eq!(h.ctx.cohort.completed(), 0);
        assert_eq!(h.ctx.cohort.allocated(), 2);
        assert_eq!(h.rm.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_untracked_completion_ignored() {
        let hosts = ["10.0.0.1"];
        let mut h = harness(1, &hosts);
        allocate_cohort(&mut h, &hosts).await;

        dispatch_rm_event(
            &h.ctx,
            RmEvent::Completed(vec![ContainerStatus::exited(ContainerId::new("container_other"), 1)]),
        );
        assert_eq!(h.ctx.cohort.completed(), 0);
        assert_eq!(h.ctx.cohort.failed(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_counters_consistent_across_callback_channels() {
        let hosts = ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"];
        for round in 0..200 {
            let mut h = harness(4, &hosts);
            let ids = allocate_cohort(&mut h, &hosts).await;
            let barrier = Arc::new(Barrier::new(3));
            let stop = Arc::new(AtomicBool::new(false));

            // Resource manager side: a lost slot, then an exit
            let rm_side = {
                let (ctx, ids, barrier) = (h.ctx.clone(), ids.clone(), barrier.clone());
                let exit_code = if round % 2 == 0 { EXIT_SUCCESS } else { 1 };
                tokio::spawn(async move {
                    barrier.wait().await;
                    dispatch_rm_event(
                        &ctx,
                        RmEvent::Completed(vec![ContainerStatus::aborted(ids[1].clone(), 137, "preempted")]),
                    );
                    dispatch_rm_event(&ctx, RmEvent::Completed(vec![ContainerStatus::exited(ids[0].clone(), exit_code)]));
                })
            };
            // Node manager and launch side: a start error and a staging failure
            let nm_side = {
                let (ctx, ids, barrier) = (h.ctx.clone(), ids.clone(), barrier.clone());
                tokio::spawn(async move {
                    barrier.wait().await;
                    dispatch_nm_event(
                        &ctx,
                        NmEvent::StartError {
                            id: ids[2].clone(),
                            cause: "no such image".to_string(),
                        },
                    );
                    CompletionController::new(ctx.clone()).on_launch_failure(&ids[3], "staging failed");
                })
            };
            let observer = {
                let (ctx, barrier, stop) = (h.ctx.clone(), barrier.clone(), stop.clone());
                tokio::spawn(async move {
                    barrier.wait().await;
                    let mut violations = Vec::new();
                    while !stop.load(Ordering::SeqCst) {
                        let s = ctx.cohort.snapshot();
                        let ordered = s.failed <= s.completed
                            && s.completed <= s.allocated
                            && s.allocated <= s.requested
                            && s.requested <= s.total;
                        if !ordered {
                            violations.push(s);
                        }
                        tokio::task::yield_now().await;
                    }
                    violations
                })
            };

            rm_side.await.unwrap();
            nm_side.await.unwrap();
            stop.store(true, Ordering::SeqCst);
            let violations = observer.await.unwrap();
            assert!(violations.is_empty(), "round {}: {:?}", round, violations);
            h.assert_invariants();
        }
    }
}
