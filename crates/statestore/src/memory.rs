use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use warden_domain::{AgentConfig, BotId, BotState, ConversationKey, InitConfig};

use crate::{BotSnapshot, LockEntry, LockKind, StateStore, StopOutcome};

struct Inner {
    states: HashMap<BotId, BotState>,
    init_configs: HashMap<BotId, InitConfig>,
    agent_configs: HashMap<BotId, AgentConfig>,
    locks: HashMap<(BotId, LockKind), LockEntry>,
    usage_window: HashMap<(String, String), Vec<(Instant, u64)>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            states: HashMap::new(),
            init_configs: HashMap::new(),
            agent_configs: HashMap::new(),
            locks: HashMap::new(),
            usage_window: HashMap::new(),
        }
    }

    fn known_ids(&self) -> Vec<BotId> {
        let mut ids: Vec<BotId> = self
            .states
            .keys()
            .chain(self.init_configs.keys())
            .chain(self.agent_configs.keys())
            .cloned()
            .collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids.dedup();
        ids
    }

    fn try_acquire(&mut self, id: &BotId, kind: LockKind, ttl: Duration, now: Instant) -> bool {
        let key = (id.clone(), kind);
        if let Some(entry) = self.locks.get(&key) {
            if entry.expires_at > now {
                return false;
            }
        }
        self.locks.insert(key, LockEntry { expires_at: now + ttl });
        true
    }

    fn release(&mut self, id: &BotId, kind: LockKind) {
        self.locks.remove(&(id.clone(), kind));
    }
}

/// Single-process `StateStore` implementation. Suitable as the
/// authoritative registry for one supervisor process, and for tests —
/// a networked implementation is a drop-in replacement behind the same
/// trait.
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
    lock_ttl: Duration,
}

impl MemoryStateStore {
    pub fn new(lock_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
            lock_ttl,
        }
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get_state(&self, id: &BotId) -> BotState {
        self.inner
            .lock()
            .states
            .get(id)
            .copied()
            .unwrap_or_default()
    }

    async fn set_state(&self, id: &BotId, state: BotState) {
        self.inner.lock().states.insert(id.clone(), state);
    }

    async fn mark_should_start(&self, id: &BotId, init: InitConfig, agent: AgentConfig) {
        let mut inner = self.inner.lock();
        inner.init_configs.insert(id.clone(), init);
        inner.agent_configs.insert(id.clone(), agent);
        inner.states.insert(id.clone(), BotState::ShouldStart);
    }

    async fn mark_should_stop(&self, id: &BotId) {
        self.inner
            .lock()
            .states
            .insert(id.clone(), BotState::ShouldStop);
    }

    async fn mark_should_restart(&self, id: &BotId) {
        self.inner
            .lock()
            .states
            .insert(id.clone(), BotState::ShouldRestart);
    }

    async fn clear_config(&self, id: &BotId) {
        let mut inner = self.inner.lock();
        inner.init_configs.remove(id);
        inner.agent_configs.remove(id);
    }

    async fn load_init_config(&self, id: &BotId) -> Option<InitConfig> {
        self.inner.lock().init_configs.get(id).cloned()
    }

    async fn load_agent_config(&self, id: &BotId) -> Option<AgentConfig> {
        self.inner.lock().agent_configs.get(id).cloned()
    }

    async fn try_start(&self, id: &BotId) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if !inner.try_acquire(id, LockKind::Starting, self.lock_ttl, now) {
            return false;
        }
        let should = inner.states.get(id).copied().unwrap_or_default() == BotState::ShouldStart;
        if should {
            inner.states.insert(id.clone(), BotState::Starting);
            true
        } else {
            inner.release(id, LockKind::Starting);
            false
        }
    }

    async fn release_start_lock(&self, id: &BotId) {
        self.inner.lock().release(id, LockKind::Starting);
    }

    async fn try_stop(&self, id: &BotId) -> StopOutcome {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if !inner.try_acquire(id, LockKind::Stopping, self.lock_ttl, now) {
            return StopOutcome::None;
        }
        let current = inner.states.get(id).copied().unwrap_or_default();
        match current {
            BotState::ShouldStop => {
                inner.states.insert(id.clone(), BotState::Stopping);
                StopOutcome::ToIdle
            }
            BotState::ShouldRestart => {
                inner.states.insert(id.clone(), BotState::Starting);
                // The restart's teardown is momentary from the state
                // machine's point of view — nothing is "in flight" under
                // this lock once we've jumped straight to `starting`, so
                // release it immediately rather than holding it until a
                // later, unrelated release call.
                inner.release(id, LockKind::Stopping);
                StopOutcome::ToRestart
            }
            _ => {
                inner.release(id, LockKind::Stopping);
                StopOutcome::None
            }
        }
    }

    async fn release_stop_lock(&self, id: &BotId) {
        self.inner.lock().release(id, LockKind::Stopping);
    }

    async fn list_all_bots(&self) -> Vec<BotId> {
        self.inner.lock().known_ids()
    }

    async fn reset_all(&self) {
        let mut inner = self.inner.lock();
        let ids = inner.known_ids();
        for id in ids {
            inner.states.insert(id, BotState::Idle);
        }
        inner.init_configs.clear();
        inner.agent_configs.clear();
        inner.locks.clear();
        tracing::info!("state store reset: all bots idle, all config and locks cleared");
    }

    async fn snapshot(&self) -> Vec<BotSnapshot> {
        let inner = self.inner.lock();
        inner
            .known_ids()
            .into_iter()
            .map(|id| BotSnapshot {
                state: inner.states.get(&id).copied().unwrap_or_default(),
                has_init_config: inner.init_configs.contains_key(&id),
                has_agent_config: inner.agent_configs.contains_key(&id),
                bot_id: id.as_str().to_string(),
            })
            .collect()
    }

    async fn record_usage_window(&self, key: &ConversationKey, model: &str, tokens: u64) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner
            .usage_window
            .entry((key.as_key_string(), model.to_string()))
            .or_default()
            .push((now, tokens));
    }

    async fn usage_in_window(
        &self,
        key: &ConversationKey,
        model: &str,
        interval_seconds: u64,
    ) -> u64 {
        let now = Instant::now();
        let window = Duration::from_secs(interval_seconds);
        let mut inner = self.inner.lock();
        let entry = inner
            .usage_window
            .entry((key.as_key_string(), model.to_string()))
            .or_default();
        entry.retain(|(at, _)| now.duration_since(*at) <= window);
        entry.iter().map(|(_, tokens)| tokens).sum()
    }
}
