//! Process-wide registry of live bot workers: a guarded single-writer
//! map that owns a spawned worker task per entry, plus the readiness
//! watcher that promotes a starting bot to running (or rolls it back
//! to idle) once the worker's chat connection resolves one way or the
//! other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use warden_agentrunner::{AgentEngine, AgentRunner, UsageSink};
use warden_chatclient::ChatClient;
use warden_domain::config::{AgentRunnerConfig, RouterConfig};
use warden_domain::trace::TraceEvent;
use warden_domain::{AgentConfig, BotId, BotState, InitConfig};
use warden_router::{ChannelRouter, RouterSnapshot};
use warden_statestore::StateStore;

use crate::reconciler::Reconciler;
use crate::worker::{BotWorker, ReadyOutcome};

/// Builds the chat-service connection for a bot from its `InitConfig`.
/// The concrete chat client implementation is an external collaborator;
/// only this seam is owned here.
pub type ChatClientFactory = Box<dyn Fn(&InitConfig) -> Arc<dyn ChatClient> + Send + Sync>;

struct RuntimeHandle {
    worker: Arc<BotWorker>,
    task: JoinHandle<()>,
}

pub struct WorkerSupervisor {
    runtimes: RwLock<HashMap<BotId, RuntimeHandle>>,
    chat_client_factory: ChatClientFactory,
    engine: Arc<dyn AgentEngine>,
    state_store: Arc<dyn StateStore>,
    usage_sink: Arc<dyn UsageSink>,
    router_config: RouterConfig,
    agent_runner_config: AgentRunnerConfig,
    reconciler_task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerSupervisor {
    pub fn new(
        chat_client_factory: ChatClientFactory,
        engine: Arc<dyn AgentEngine>,
        state_store: Arc<dyn StateStore>,
        usage_sink: Arc<dyn UsageSink>,
        router_config: RouterConfig,
        agent_runner_config: AgentRunnerConfig,
    ) -> Self {
        Self {
            runtimes: RwLock::new(HashMap::new()),
            chat_client_factory,
            engine,
            state_store,
            usage_sink,
            router_config,
            agent_runner_config,
            reconciler_task: Mutex::new(None),
        }
    }

    /// Insert and spawn a worker for `bot_id`, and spawn the readiness
    /// watcher that will promote it to running (or roll it back to
    /// idle) once the chat connection resolves. Already present ⇒ log
    /// and no-op, leaving whatever runtime is there untouched.
    ///
    /// Returns whether a worker was spawned. Callers must not set
    /// `BotState::Running` themselves on a `true` return — that happens
    /// only once the worker reports ready, via the watcher spawned here.
    pub async fn add(self: &Arc<Self>, bot_id: BotId, init: InitConfig, agent: AgentConfig) -> bool {
        if self.runtimes.read().contains_key(&bot_id) {
            tracing::info!(bot_id = %bot_id, "worker already present, skipping add");
            return false;
        }

        let chat_client = (self.chat_client_factory)(&init);
        let router = Arc::new(ChannelRouter::new(bot_id.as_str(), self.router_config.clone()));
        let agent_runner = Arc::new(AgentRunner::new(
            self.engine.clone(),
            self.state_store.clone(),
            self.usage_sink.clone(),
            self.agent_runner_config.clone(),
        ));
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let worker = Arc::new(BotWorker::new(
            bot_id.clone(),
            init,
            agent,
            chat_client,
            self.engine.clone(),
            agent_runner,
            router,
            cancel,
            ready_tx,
        ));

        let run_handle = worker.clone();
        let sup = self.clone();
        let cleanup_id = bot_id.clone();
        let task = tokio::spawn(async move {
            run_handle.run().await;
            // Worker task ended on its own (connection loss, etc.) rather
            // than via `remove` — reflect that in both the map and the
            // state store so the bot isn't left reporting `running` with
            // no live worker behind it.
            if sup.runtimes.write().remove(&cleanup_id).is_some() {
                TraceEvent::WorkerRemoved {
                    bot_id: cleanup_id.as_str(),
                    reason: "worker task ended unexpectedly",
                }
                .emit();
                sup.state_store.set_state(&cleanup_id, BotState::Idle).await;
            }
        });

        self.runtimes.write().insert(bot_id.clone(), RuntimeHandle { worker, task });
        TraceEvent::WorkerSpawned { bot_id: bot_id.as_str() }.emit();

        let sup = self.clone();
        let ready_id = bot_id.clone();
        tokio::spawn(async move {
            sup.await_readiness(ready_id, ready_rx).await;
        });

        true
    }

    /// Wait for the worker's readiness outcome and write the terminal
    /// state: `Running` once ready, `Idle` (after detaching the worker)
    /// if it never became ready. Releases the start lock last, so the
    /// lock stays held for exactly as long as the bot is mid-start.
    async fn await_readiness(self: Arc<Self>, bot_id: BotId, ready_rx: oneshot::Receiver<ReadyOutcome>) {
        let outcome = ready_rx
            .await
            .unwrap_or_else(|_| ReadyOutcome::Failed("worker exited before reporting readiness".to_string()));

        match outcome {
            ReadyOutcome::Ready => {
                self.state_store.set_state(&bot_id, BotState::Running).await;
            }
            ReadyOutcome::Failed(reason) => {
                tracing::warn!(bot_id = %bot_id, reason = %reason, "worker failed to become ready, rolling back to idle");
                self.stop_and_detach(&bot_id, "failed to become ready").await;
                self.state_store.set_state(&bot_id, BotState::Idle).await;
            }
        }
        self.state_store.release_start_lock(&bot_id).await;
    }

    /// Cooperative stop and detach. No-op if the worker already removed
    /// itself (e.g. it exited on its own before this ran).
    async fn stop_and_detach(&self, bot_id: &BotId, reason: &'static str) -> bool {
        let handle = self.runtimes.write().remove(bot_id);
        match handle {
            Some(handle) => {
                handle.worker.stop().await;
                if tokio::time::timeout(Duration::from_secs(5), handle.task).await.is_err() {
                    tracing::warn!(bot_id = %bot_id, "worker task did not stop within the drain window");
                }
                TraceEvent::WorkerRemoved { bot_id: bot_id.as_str(), reason }.emit();
                true
            }
            None => false,
        }
    }

    /// Cooperative stop and detach, called by the reconciler's stop step.
    pub async fn remove(&self, bot_id: &BotId) -> bool {
        self.stop_and_detach(bot_id, "removed by reconciler").await
    }

    pub fn get(&self, bot_id: &BotId) -> Option<Arc<BotWorker>> {
        self.runtimes.read().get(bot_id).map(|h| h.worker.clone())
    }

    pub fn list_all(&self) -> Vec<BotId> {
        self.runtimes.read().keys().cloned().collect()
    }

    /// Read-only router snapshots for every live worker, consumed by the
    /// monitoring endpoint.
    pub fn snapshot(&self) -> Vec<RouterSnapshot> {
        self.runtimes.read().values().map(|h| h.worker.router().snapshot()).collect()
    }

    /// Start the Reconciler's tick loop.
    pub fn start(self: &Arc<Self>, reconciler: Arc<Reconciler>, tick_interval: Duration) {
        let mut slot = self.reconciler_task.lock();
        if slot.is_some() {
            return;
        }
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            loop {
                interval.tick().await;
                reconciler.tick().await;
            }
        });
        *slot = Some(task);
    }

    /// Stop the Reconciler's tick loop. Live workers are left running;
    /// callers wanting a full shutdown should `remove` each bot first.
    pub fn stop(&self) {
        if let Some(task) = self.reconciler_task.lock().take() {
            task.abort();
        }
    }
}
