//! Launch coordinator
//!
//! A launch wave claims every allocated container that has not been launched,
//! gives each a rank, writes the peer list, and then starts one task per
//! container. The rank 0 container is submitted first and the rest only after
//! the settle delay, so rank 0 can set up the state the others connect to.
//! The delay is a head start, not a barrier.
//!
//! A container lost or failed before its start task runs is skipped, so its
//! rank can be taken over by a replacement without two workers sharing it.
//!
//! Each start task stages the hostfile and launch script, builds the command
//! line and submits the start request. A slow or hung start request only
//! holds up its own task.

use super::completion::CompletionController;
use super::peers::{PeerListBuilder, HOSTFILE_NAME};
use super::MasterContext;
use crate::cluster::protocol::{LaunchContext, LocalResource, LOG_DIR_EXPANSION};
use crate::cohort::record::ContainerRecord;
use crate::error::MasterError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct LaunchCoordinator {
    ctx: Arc<MasterContext>,
}

impl LaunchCoordinator {
    pub fn new(ctx: Arc<MasterContext>) -> Self {
        Self { ctx }
    }

    /// Run a launch wave on its own task
    pub fn spawn_wave(&self) {
        let coordinator = Self::new(self.ctx.clone());
        let handle = tokio::spawn(async move { coordinator.run_wave().await });
        self.ctx.track_launch(handle);
    }

    /// Claim, rank and launch every unlaunched container
    pub async fn run_wave(&self) {
        let claimed = self.ctx.containers.claim_unlaunched();
        if claimed.is_empty() {
            return;
        }

        let hostfile = match PeerListBuilder::new(self.ctx.clone()).build().await {
            Ok(path) => path,
            Err(e) => {
                error!(error = %e, containers = claimed.len(), "Launch wave aborted");
                let completion = CompletionController::new(self.ctx.clone());
                for record in &claimed {
                    completion.on_launch_failure(record.id(), &e.to_string());
                }
                return;
            }
        };

        if self.ctx.first_wave() {
            info!("Started application in {} ms", self.ctx.elapsed().as_millis());
        }

        let mut records = claimed.into_iter().peekable();
        if let Some(first) = records.next_if(|r| r.rank == Some(0)) {
            self.spawn_launch(first, hostfile.clone());
            let delay = self.ctx.config.runtime.settle_delay();
            if records.peek().is_some() && !delay.is_zero() {
                debug!(delay_ms = delay.as_millis() as u64, "Waiting for rank 0 to settle");
                tokio::time::sleep(delay).await;
            }
        }
        for record in records {
            if self.ctx.is_closing() {
                debug!(container = %record.id(), "Shutting down, launch skipped");
                continue;
            }
            if !self.ctx.containers.is_launchable(record.id()) {
                debug!(container = %record.id(), "Container no longer allocated, launch skipped");
                continue;
            }
            self.spawn_launch(record, hostfile.clone());
        }
    }

    fn spawn_launch(&self, record: ContainerRecord, hostfile: PathBuf) {
        let coordinator = Self::new(self.ctx.clone());
        let handle = tokio::spawn(async move { coordinator.launch(record, &hostfile).await });
        self.ctx.track_launch(handle);
    }

    /// Shell command line for the worker of `rank`
    pub fn command(&self, rank: usize) -> String {
        let launch = &self.ctx.config.launch;
        let parts = [
            launch.shell_command.clone(),
            format!("./{}", launch.script_name),
            rank.to_string(),
            format!("./{}", HOSTFILE_NAME),
            launch.script_args.trim().to_string(),
            format!("1>{}/stdout", LOG_DIR_EXPANSION),
            format!("2>{}/stderr", LOG_DIR_EXPANSION),
        ];
        parts
            .iter()
            .filter(|p| !p.is_empty())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn stage(&self, name: &str, path: &Path) -> Result<LocalResource, MasterError> {
        self.ctx
            .storage
            .local_resource(path)
            .map_err(|e| MasterError::Staging {
                name: name.to_string(),
                path: path.display().to_string(),
                reason: format!("{:#}", e),
            })
    }

    /// Staged files, environment and command for one container
    pub fn launch_context(&self, rank: usize, hostfile: &Path) -> Result<LaunchContext, MasterError> {
        let launch = &self.ctx.config.launch;
        let mut context = LaunchContext {
            env: launch.env.clone(),
            commands: vec![self.command(rank)],
            ..Default::default()
        };
        context
            .local_resources
            .insert(HOSTFILE_NAME.to_string(), self.stage(HOSTFILE_NAME, hostfile)?);
        context
            .local_resources
            .insert(launch.script_name.clone(), self.stage(&launch.script_name, &launch.script_path)?);
        Ok(context)
    }

    async fn launch(&self, record: ContainerRecord, hostfile: &Path) {
        let id = record.id().clone();
        if self.ctx.is_closing() {
            debug!(container = %id, "Shutting down, launch skipped");
            return;
        }
        if !self.ctx.containers.begin_launch(&id) {
            debug!(container = %id, "Container no longer allocated, launch skipped");
            return;
        }
        let rank = record.rank.unwrap_or_default();
        let completion = CompletionController::new(self.ctx.clone());

        let context = match self.launch_context(rank, hostfile) {
            Ok(context) => context,
            Err(e) => {
                warn!(container = %id, rank, error = %e, "Staging failed");
                completion.on_launch_failure(&id, &e.to_string());
                return;
            }
        };

        info!(container = %id, rank, host = %record.host(), "Launching container");
        debug!(container = %id, command = %context.commands.join(" "), "Launch command");

        match self.ctx.nm.start_container(&record.container, context).await {
            Ok(()) => debug!(container = %id, "Start request submitted"),
            Err(e) => completion.on_start_error(&id, &format!("{:#}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::protocol::{ContainerId, ContainerStatus, RmEvent};
    use crate::cohort::record::ContainerState;
    use crate::master::allocation::AllocationController;
    use crate::master::testing::*;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn allocate(h: &Harness, hosts: &[&str]) {
        let allocation = AllocationController::new(h.ctx.clone());
        allocation.request_outstanding();
        let batch = hosts.iter().map(|host| h.rm.make_container(host)).collect();
        allocation.on_allocated(batch);
    }

    #[test]
    fn test_launch_command() {
        let h = harness_with(&["h1"], |config| config.launch.script_args = "--epochs 3".to_string());
        let coordinator = LaunchCoordinator::new(h.ctx.clone());
        assert_eq!(
            coordinator.command(2),
            "python ./launch.py 2 ./hostfile --epochs 3 1><LOG_DIR>/stdout 2><LOG_DIR>/stderr"
        );

        let h = harness(1, &["h1"]);
        assert_eq!(
            LaunchCoordinator::new(h.ctx.clone()).command(0),
            "python ./launch.py 0 ./hostfile 1><LOG_DIR>/stdout 2><LOG_DIR>/stderr"
        );
    }

    #[tokio::test]
    async fn test_rank_zero_starts_first() {
        let hosts = ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"];
        let h = harness_with(&hosts, |config| {
            config.job.num_containers = 4;
            config.runtime.settle_delay_ms = 150;
        });
        allocate(&h, &hosts);
        h.settle_launches().await;

        let mut starts = h.nm.starts();
        assert_eq!(starts.len(), 4);
        starts.sort_by_key(|s| s.at);

        let rank_of = |id: &ContainerId| h.ctx.containers.get(id).and_then(|r| r.rank);
        assert_eq!(rank_of(&starts[0].id), Some(0));
        for later in &starts[1..] {
            assert_ne!(rank_of(&later.id), Some(0));
            assert!(later.at.duration_since(starts[0].at) >= Duration::from_millis(100));
        }
    }

    #[tokio::test]
    async fn test_launch_context_stages_hostfile_and_script() {
        let h = harness_with(&["10.0.0.1"], |config| {
            config.launch.env.insert("NCCL_DEBUG".to_string(), "INFO".to_string());
        });
        allocate(&h, &["10.0.0.1"]);
        h.settle_launches().await;

        let starts = h.nm.starts();
        assert_eq!(starts.len(), 1);
        let context = &starts[0].context;
        assert_eq!(context.local_resources["hostfile"].source, h.dir.path().join("cohort/hostfile"));
        assert_eq!(context.local_resources["launch.py"].source, h.dir.path().join("launch.py"));
        assert_eq!(context.env.get("NCCL_DEBUG").map(String::as_str), Some("INFO"));
        assert!(context.commands[0].starts_with("python ./launch.py 0 ./hostfile"));

        let record = h.ctx.containers.get(&starts[0].id).unwrap();
        assert_eq!(record.state, ContainerState::Launching);
    }

    #[tokio::test]
    async fn test_staging_failure_counts_without_start() {
        let h = harness(2, &["10.0.0.1", "10.0.0.2"]);
        std::fs::remove_file(h.dir.path().join("launch.py")).unwrap();

        allocate(&h, &["10.0.0.1", "10.0.0.2"]);
        h.settle_launches().await;

        assert_eq!(h.nm.start_count(), 0);
        assert_eq!(h.ctx.cohort.completed(), 2);
        assert_eq!(h.ctx.cohort.failed(), 2);
        assert!(h.ctx.cohort.is_done());
        h.assert_invariants();
    }

    #[tokio::test]
    async fn test_start_submit_failure_is_terminal() {
        let h = harness(2, &["10.0.0.1", "10.0.0.2"]);
        h.nm.set_fail_submit(true);

        allocate(&h, &["10.0.0.1", "10.0.0.2"]);
        h.settle_launches().await;

        assert_eq!(h.ctx.cohort.failed(), 2);
        assert!(h.ctx.containers.is_empty());
        h.assert_invariants();
    }

    #[tokio::test]
    async fn test_container_lost_during_settle_delay_is_not_started() {
        let hosts = ["10.0.0.1", "10.0.0.2", "10.0.0.3"];
        let mut h = harness_with(&hosts, |config| {
            config.job.num_containers = 3;
            config.runtime.settle_delay_ms = 300;
        });
        allocate(&h, &hosts);

        // Rank 0 is submitted, the others wait out the settle delay
        tokio::time::sleep(Duration::from_millis(50)).await;
        let lost = h
            .ctx
            .containers
            .records()
            .into_iter()
            .find(|r| r.rank == Some(2))
            .expect("rank 2 claimed")
            .id()
            .clone();
        h.rm.emit(RmEvent::Completed(vec![ContainerStatus::aborted(lost.clone(), 137, "preempted")]));
        h.pump_rm();
        assert!(!h.ctx.containers.contains(&lost));

        h.settle_launches().await;
        let started: Vec<ContainerId> = h.nm.starts().into_iter().map(|s| s.id).collect();
        assert_eq!(started.len(), 2);
        assert!(!started.contains(&lost));

        // The replacement takes over rank 2 and is the only one holding it
        let replacement = h.rm.make_container("10.0.0.4");
        h.rm.emit(RmEvent::Allocated(vec![replacement.clone()]));
        h.pump_rm();
        h.settle_launches().await;
        assert_eq!(h.ctx.containers.get(&replacement.id).unwrap().rank, Some(2));
        assert_eq!(h.nm.start_count(), 3);
        let ranks: BTreeSet<usize> = h.ctx.containers.records().iter().filter_map(|r| r.rank).collect();
        assert_eq!(ranks, BTreeSet::from([0, 1, 2]));
        h.assert_invariants();
    }
}
