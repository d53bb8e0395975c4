//! Consumed shape of the external persistent configuration store: a
//! relational store holding bot/agent rows, owned by the control plane.
//! The reconciler's restart step always reloads from here, never from
//! local cache, so a restart picks up whatever config was last written.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use warden_domain::{AgentConfig, BotId, InitConfig};

#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load_init_config(&self, id: &BotId) -> Option<InitConfig>;

    async fn load_agent_config(&self, id: &BotId) -> Option<AgentConfig>;
}

/// In-memory config source for tests and local dev.
pub struct MockConfigSource {
    rows: Mutex<HashMap<BotId, (InitConfig, AgentConfig)>>,
}

impl MockConfigSource {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
        }
    }

    pub fn seed(&self, id: BotId, init: InitConfig, agent: AgentConfig) {
        self.rows.lock().insert(id, (init, agent));
    }

    pub fn remove(&self, id: &BotId) {
        self.rows.lock().remove(id);
    }
}

impl Default for MockConfigSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigSource for MockConfigSource {
    async fn load_init_config(&self, id: &BotId) -> Option<InitConfig> {
        self.rows.lock().get(id).map(|(init, _)| init.clone())
    }

    async fn load_agent_config(&self, id: &BotId) -> Option<AgentConfig> {
        self.rows.lock().get(id).map(|(_, agent)| agent.clone())
    }
}
