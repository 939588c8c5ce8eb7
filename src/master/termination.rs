//! Termination decider
//!
//! Waits until the job is done, then shuts down in a fixed order: join the
//! launch tasks (bounded), stop the node manager client, compute the outcome,
//! unregister and stop the resource manager client. Launch tasks still
//! running at the deadline are detached, never killed. A failed unregister is
//! logged and the locally computed outcome stands.

use super::{MasterContext, MasterReport};
use std::sync::Arc;
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};

pub struct TerminationDecider {
    ctx: Arc<MasterContext>,
}

impl TerminationDecider {
    pub fn new(ctx: Arc<MasterContext>) -> Self {
        Self { ctx }
    }

    /// Join tracked launch tasks until they finish or the join bound passes.
    ///
    /// Returns the number of tasks abandoned.
    pub async fn join_launches(&self) -> usize {
        let deadline = Instant::now() + self.ctx.config.runtime.launch_join_timeout();
        let mut abandoned = 0;
        loop {
            let handles = self.ctx.take_launches();
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                match timeout_at(deadline, handle).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "Launch task panicked"),
                    Err(_) => abandoned += 1,
                }
            }
            if Instant::now() >= deadline {
                break;
            }
        }
        if abandoned > 0 {
            warn!(abandoned, "Launch tasks still running at shutdown were abandoned");
        }
        abandoned
    }

    /// Block until the job is done and shut everything down
    pub async fn finish(&self) -> MasterReport {
        self.ctx.cohort.wait_finished().await;
        self.ctx.begin_closing();
        info!(counters = ?self.ctx.cohort.snapshot(), "Job finished, shutting down");

        self.join_launches().await;
        let containers = self.ctx.containers.records();
        self.ctx.nm.stop().await;

        let outcome = self.ctx.cohort.outcome();
        match &outcome.diagnostics {
            Some(diagnostics) => warn!(status = %outcome.status, diagnostics = %diagnostics, "Job outcome"),
            None => info!(status = %outcome.status, "Job outcome"),
        }

        if let Err(e) = self
            .ctx
            .rm
            .unregister(outcome.status, outcome.diagnostics.as_deref())
            .await
        {
            let cause = format!("{:#}", e);
            error!(error = %cause, "Failed to unregister application master");
        }
        self.ctx.rm.stop().await;

        MasterReport {
            app_id: self.ctx.app_id.clone(),
            counters: self.ctx.cohort.snapshot(),
            outcome,
            containers,
            elapsed: self.ctx.elapsed(),
        }
    }
}
