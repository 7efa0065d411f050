//! Background status polling.
//!
//! Refreshes the orchestrator's view of the controller on a fixed cadence.
//! Polls go through [`MotionOrchestrator::refresh_status`], which takes the
//! same link lock as every command, so a poll can never read a line that
//! belongs to an in-flight command. Ticks are skipped while a motion request
//! is running or the link is down.

use crate::motion::orchestrator::MotionOrchestrator;
use crate::motion::state::MachineStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Handle to a running poll loop. Dropping it stops the loop.
#[derive(Debug)]
pub struct StatusPoller {
    handle: JoinHandle<()>,
}

impl StatusPoller {
    /// Start polling `orchestrator` every `interval`.
    pub fn spawn(orchestrator: Arc<MotionOrchestrator>, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(?interval, "Status poller started");

            loop {
                ticker.tick().await;
                if orchestrator.is_busy()
                    || orchestrator.get_status().status == MachineStatus::Disconnected
                {
                    continue;
                }
                match orchestrator.refresh_status().await {
                    Ok(snapshot) => debug!(%snapshot, "Status refreshed"),
                    Err(e) => debug!(error = %e, "Status poll failed"),
                }
            }
        });
        Self { handle }
    }

    /// True once the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
