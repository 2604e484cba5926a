//! Background reconciliation.
//!
//! The supervisor periodically asks the driver for every VM's actual state
//! and corrects the registry when the hypervisor changed it behind our back
//! (guest shutdown, crash, external virsh commands). VMs with an operation
//! in flight are skipped; they are picked up on the next tick.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::api::state::ApiState;

/// Periodic reconciler for VM state.
pub struct Supervisor {
    state: Arc<ApiState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Supervisor {
    /// Create a supervisor that stops when `shutdown_rx` flips to true.
    pub fn new(state: Arc<ApiState>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self { state, shutdown_rx }
    }

    /// Run until shutdown is signalled.
    pub async fn run(mut self) {
        let period = self.state.config.reconcile_interval;
        tracing::info!(interval = ?period, "supervisor started");

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("supervisor stopped");
    }

    /// Reconcile every VM once.
    async fn tick(&self) {
        let state = self.state.clone();
        match tokio::task::spawn_blocking(move || state.lifecycle.reconcile_all()).await {
            Ok(0) => tracing::trace!("reconcile found no drift"),
            Ok(changed) => tracing::info!(changed, "reconciled vm state with driver"),
            Err(e) => tracing::error!(error = %e, "reconcile task panicked"),
        }
    }
}
