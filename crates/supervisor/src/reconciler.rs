//! The lifecycle reconciler: a single long-running loop, stateless
//! across ticks, that drives each bot from its observed state toward
//! its desired state. Every tick snapshots the full bot list from the
//! state store, then runs a stop step and a start step on each one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use warden_domain::trace::TraceEvent;
use warden_domain::{BotId, BotState};
use warden_statestore::{StateStore, StopOutcome};

use crate::config_source::ConfigSource;
use crate::supervisor::WorkerSupervisor;

pub struct Reconciler {
    state_store: Arc<dyn StateStore>,
    config_source: Arc<dyn ConfigSource>,
    supervisor: Arc<WorkerSupervisor>,
    tick_count: AtomicU64,
    last_tick_at: Mutex<Option<DateTime<Utc>>>,
}

impl Reconciler {
    pub fn new(
        state_store: Arc<dyn StateStore>,
        config_source: Arc<dyn ConfigSource>,
        supervisor: Arc<WorkerSupervisor>,
    ) -> Self {
        Self {
            state_store,
            config_source,
            supervisor,
            tick_count: AtomicU64::new(0),
            last_tick_at: Mutex::new(None),
        }
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count.load(Ordering::Acquire)
    }

    pub fn last_tick_at(&self) -> Option<DateTime<Utc>> {
        *self.last_tick_at.lock()
    }

    /// One reconciliation pass. Stateless: every fact needed comes from
    /// the state store on this call, so a crash between ticks loses no
    /// information a restarted reconciler couldn't reconstruct.
    pub async fn tick(&self) {
        let ids = self.state_store.list_all_bots().await;

        for id in &ids {
            // Order matters: `should_restart` is handled by the stop
            // step, which demotes it to `starting` so the start step
            // below picks it up in the same tick.
            self.stop_step(id).await;
            self.start_step(id).await;
        }

        let tick = self.tick_count.fetch_add(1, Ordering::AcqRel) + 1;
        *self.last_tick_at.lock() = Some(Utc::now());
        TraceEvent::ReconcilerTick {
            tick,
            bot_count: ids.len(),
        }
        .emit();
    }

    async fn stop_step(&self, id: &BotId) {
        match self.state_store.try_stop(id).await {
            StopOutcome::None => {}
            StopOutcome::ToIdle => {
                self.supervisor.remove(id).await;
                self.state_store.set_state(id, BotState::Idle).await;
                self.state_store.release_stop_lock(id).await;
            }
            StopOutcome::ToRestart => {
                self.supervisor.remove(id).await;
                self.state_store.release_stop_lock(id).await;

                let init = self.config_source.load_init_config(id).await;
                let agent = self.config_source.load_agent_config(id).await;
                match (init, agent) {
                    (Some(init), Some(agent)) => {
                        self.state_store.mark_should_start(id, init, agent).await;
                    }
                    _ => {
                        tracing::warn!(bot_id = %id, "restart requested but config store has no row, dropping to idle");
                        self.state_store.set_state(id, BotState::Idle).await;
                    }
                }
            }
        }
    }

    async fn start_step(&self, id: &BotId) {
        if !self.state_store.try_start(id).await {
            return;
        }

        let init = self.state_store.load_init_config(id).await;
        let agent = self.state_store.load_agent_config(id).await;
        match (init, agent) {
            (Some(init), Some(agent)) => {
                if !self.supervisor.add(id.clone(), init, agent).await {
                    // `add` returning false means a runtime was already
                    // present; leave state as `starting` rather than
                    // claim a transition that didn't happen.
                    tracing::warn!(bot_id = %id, "start step found an existing runtime already present");
                    self.state_store.release_start_lock(id).await;
                }
                // Otherwise the supervisor now owns this bot's startup:
                // it writes `running` once the worker's chat connection
                // reports ready, `idle` if it never does, and releases
                // the start lock either way.
            }
            _ => {
                tracing::warn!(bot_id = %id, "start step found missing config, dropping to idle");
                self.state_store.set_state(id, BotState::Idle).await;
                self.state_store.release_start_lock(id).await;
            }
        }
    }
}
