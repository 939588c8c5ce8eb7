//! Allocation controller
//!
//! Validates that the cluster can host the cohort, registers the master,
//! issues container requests (pinned to candidate hosts while any remain) and
//! takes in the containers the resource manager grants. The launch wave is
//! triggered from here once the cohort is fully allocated.

use super::launch::LaunchCoordinator;
use super::MasterContext;
use crate::cluster::protocol::{Container, ContainerRequest, Resource};
use crate::error::MasterError;
use crate::Result;
use anyhow::Context;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct AllocationController {
    ctx: Arc<MasterContext>,
}

impl AllocationController {
    pub fn new(ctx: Arc<MasterContext>) -> Self {
        Self { ctx }
    }

    /// Build the candidate host list from the cluster's running nodes.
    ///
    /// Fails when the cluster has fewer nodes than the cohort, or fewer nodes
    /// able to fit one container each.
    pub async fn select_hosts(&self) -> Result<()> {
        let required = self.ctx.cohort.total_desired();
        let resource = self.ctx.resource();
        let nodes = self
            .ctx
            .rm
            .running_nodes()
            .await
            .context("Failed to list running nodes")?;

        if nodes.len() < required {
            return Err(MasterError::InsufficientNodes {
                required,
                available: nodes.len(),
            }
            .into());
        }

        let eligible: Vec<String> = nodes
            .iter()
            .filter(|n| n.capability.covers(&resource))
            .map(|n| n.node.host.clone())
            .collect();
        if eligible.len() < required {
            return Err(MasterError::InsufficientResources {
                required,
                eligible: eligible.len(),
                memory_mb: resource.memory_mb,
                vcores: resource.vcores,
            }
            .into());
        }

        info!(nodes = nodes.len(), eligible = eligible.len(), "Cluster can host the cohort");
        self.ctx.set_hosts(eligible);
        Ok(())
    }

    /// Register with the resource manager and apply what it answers
    pub async fn register(&self) -> Result<()> {
        let host = match hostname::get() {
            Ok(name) => name.to_string_lossy().into_owned(),
            Err(e) => {
                warn!(error = %e, "Failed to read host name, registering as localhost");
                "localhost".to_string()
            }
        };
        let job = &self.ctx.config.job;
        let registration = self
            .ctx
            .rm
            .register(&host, job.rpc_port, &job.tracking_url)
            .await
            .context("Failed to register with the resource manager")?;

        let requested = self.ctx.resource();
        let max = registration.max_capability;
        let clamped = Resource::new(
            requested.memory_mb.min(max.memory_mb),
            requested.vcores.min(max.vcores),
        );
        if clamped != requested {
            info!(requested = %requested, max = %max, "Container request clamped to cluster maximum");
            self.ctx.set_resource(clamped);
        }

        if !registration.prior_containers.is_empty() {
            info!(
                count = registration.prior_containers.len(),
                "Releasing containers from previous attempts"
            );
            for container in &registration.prior_containers {
                self.ctx.rm.release_container(&container.id);
            }
        }
        Ok(())
    }

    /// Ask for one more container, pinned to the next candidate host if any
    pub fn request_container(&self) {
        let host = self.ctx.take_host();
        let request = ContainerRequest::new(self.ctx.resource(), self.ctx.config.job.priority, host);
        debug!(
            host = request.nodes.as_ref().and_then(|n| n.first()).map(String::as_str).unwrap_or("*"),
            resource = %request.resource,
            "Requesting container"
        );
        self.ctx.rm.add_container_request(request);
        self.ctx.cohort.add_requested(1);
    }

    /// Issue requests until `requested` is back at the cohort size
    pub fn request_outstanding(&self) {
        if self.ctx.requests_halted() || !self.ctx.accepting_events() {
            return;
        }
        let outstanding = self.ctx.cohort.outstanding();
        if outstanding > 0 {
            info!(count = outstanding, "Requesting containers");
        }
        for _ in 0..outstanding {
            self.request_container();
        }
    }

    /// Take in a batch of granted containers.
    ///
    /// Duplicates are ignored. Grants beyond the outstanding requests, or
    /// arriving after the job is done, are released. When the batch completes
    /// the cohort a launch wave is started for every unlaunched container.
    pub fn on_allocated(&self, batch: Vec<Container>) {
        let mut accepted = 0;
        for container in batch {
            if self.ctx.containers.contains(&container.id) {
                debug!(container = %container.id, "Duplicate allocation ignored");
                continue;
            }
            if !self.ctx.accepting_events() || !self.ctx.cohort.try_add_allocated() {
                info!(container = %container.id, host = %container.node.host, "Releasing unneeded container");
                self.ctx.rm.release_container(&container.id);
                continue;
            }

            info!(
                container = %container.id,
                host = %container.node.host,
                resource = %container.resource,
                "Container allocated"
            );
            self.ctx.containers.insert_if_absent(container);
            accepted += 1;
        }

        if accepted > 0 && self.ctx.cohort.allocated() == self.ctx.cohort.total_desired() {
            info!(total = self.ctx.cohort.total_desired(), "Cohort fully allocated");
            LaunchCoordinator::new(self.ctx.clone()).spawn_wave();
        }
    }
}
