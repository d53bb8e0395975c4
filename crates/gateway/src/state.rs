//! Wires the core crates into one [`AppState`] for the `warden` binary:
//! a `Clone` struct of `Arc<...>` services, built once in `main` and
//! threaded through every axum handler via `State<AppState>`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use warden_agentrunner::{AgentEngine, LoggingUsageSink, MockAgentEngine, UsageSink};
use warden_chatclient::{ChatClient, MockChatClient};
use warden_domain::config::Config;
use warden_domain::InitConfig;
use warden_statestore::{MemoryStateStore, StateStore};
use warden_supervisor::{ChatClientFactory, ConfigSource, MockConfigSource, Reconciler, WorkerSupervisor};

/// Shared application state passed to every monitoring-endpoint handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub state_store: Arc<dyn StateStore>,
    pub supervisor: Arc<WorkerSupervisor>,
    pub reconciler: Arc<Reconciler>,
    pub config_source: Arc<MockConfigSource>,
    pub started_at: DateTime<Utc>,
}

/// Build the supervisor stack: a `StateStore`, a `ConfigSource` (the
/// consumed shape of the external relational config store — an
/// in-process mock stands in here), an `AgentEngine` and `ChatClient`
/// factory (external collaborators too, so the in-process mocks from
/// `warden-agentrunner`/`warden-chatclient` stand in), and the
/// `WorkerSupervisor` + `Reconciler` that tie them together.
///
/// Wiring a production `ChatClient`/`AgentEngine` here is an
/// integration point for the process that embeds this core, not
/// something the core builds for itself.
pub fn build(config: Arc<Config>) -> AppState {
    let state_store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new(Duration::from_secs(
        config.state_store.lock_ttl_secs,
    )));
    let config_source = Arc::new(MockConfigSource::new());
    let config_source_trait: Arc<dyn ConfigSource> = config_source.clone();

    let engine: Arc<dyn AgentEngine> = Arc::new(MockAgentEngine::new());
    let usage_sink: Arc<dyn UsageSink> = Arc::new(LoggingUsageSink);

    let chat_client_factory: ChatClientFactory =
        Box::new(|_init: &InitConfig| Arc::new(MockChatClient::new()) as Arc<dyn ChatClient>);

    let supervisor = Arc::new(WorkerSupervisor::new(
        chat_client_factory,
        engine,
        state_store.clone(),
        usage_sink,
        config.router.clone(),
        config.agent_runner.clone(),
    ));

    let reconciler = Arc::new(Reconciler::new(
        state_store.clone(),
        config_source_trait,
        supervisor.clone(),
    ));

    AppState {
        config,
        state_store,
        supervisor,
        reconciler,
        config_source,
        started_at: Utc::now(),
    }
}
