//! The authoritative bot-state registry: atomic state transitions,
//! distributed-lock-guarded `starting`/`stopping` steps, and the
//! per-session rate-limit ledger consulted by the agent runner.
//!
//! `StateStore` is the consumed shape of the networked key-value store
//! the core assumes — only [`MemoryStateStore`] is shipped here, a
//! single-process stand-in behind the same trait a networked
//! implementation would fill.

mod memory;

use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;

use warden_domain::{AgentConfig, BotId, BotState, ConversationKey, InitConfig};

pub use memory::MemoryStateStore;

/// Result of `tryStop`: which follow-up action the Reconciler should take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No stop/restart was pending; no action taken.
    None,
    /// `should_stop` was pending: state is now `stopping`, drive to `idle`
    /// once the worker is removed.
    ToIdle,
    /// `should_restart` was pending: state is now `starting` directly,
    /// demoting the restart so the next start step (after `markShouldStart`
    /// reloads fresh config) can pick it up.
    ToRestart,
}

/// Which of the two per-bot distributed locks an operation is using.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    Starting,
    Stopping,
}

/// A read-only snapshot row for the monitoring endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BotSnapshot {
    pub bot_id: String,
    pub state: BotState,
    pub has_init_config: bool,
    pub has_agent_config: bool,
}

/// The shared key-value registry backing bot lifecycle state.
///
/// All cross-process coordination for bot lifecycle transitions goes
/// through this trait; the worker supervisor's in-memory map of live
/// workers is never shared across processes — only this store is.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Absent ⇒ `idle`. Fail-closed: an unknown bot is never treated as
    /// running.
    async fn get_state(&self, id: &BotId) -> BotState;

    /// Validates nothing beyond "is this a recognized `BotState`" — the
    /// type system already guarantees that, so this never no-ops in
    /// practice, but the signature mirrors the spec's `setState`.
    async fn set_state(&self, id: &BotId, state: BotState);

    /// Atomically writes both config blobs then `state = should_start`.
    async fn mark_should_start(&self, id: &BotId, init: InitConfig, agent: AgentConfig);

    async fn mark_should_stop(&self, id: &BotId);

    async fn mark_should_restart(&self, id: &BotId);

    /// Deletes both config blobs for `id`. Does not touch state.
    async fn clear_config(&self, id: &BotId);

    async fn load_init_config(&self, id: &BotId) -> Option<InitConfig>;

    async fn load_agent_config(&self, id: &BotId) -> Option<AgentConfig>;

    /// Acquire the `starting` lock; if state is `should_start`, transition
    /// to `starting` and return `true`. Otherwise release the lock (if
    /// acquired) and return `false`. A `false` result with no held lock
    /// (lock contention) and a `false` result with the state check failing
    /// are indistinguishable to the caller by design (§7 `LockContention`
    /// "returns false without error").
    async fn try_start(&self, id: &BotId) -> bool;

    /// Release the `starting` lock once the worker supervisor has
    /// observed the worker ready (or failed) and written the terminal
    /// state. Keeps the lock's hold duration matched to the actual
    /// transition instead of always waiting out the TTL.
    async fn release_start_lock(&self, id: &BotId);

    async fn try_stop(&self, id: &BotId) -> StopOutcome;

    /// Release the `stopping` lock once the Worker Supervisor has
    /// observed worker removal and written `idle`.
    async fn release_stop_lock(&self, id: &BotId);

    /// Scan by prefix and deduplicate ids (in-memory: every id that has
    /// ever had state, init config, or agent config written for it).
    async fn list_all_bots(&self) -> Vec<BotId>;

    /// Set every known bot to `idle` and delete all config and lock keys.
    /// Invoked once at process start, so a fresh process never inherits
    /// stale `running`/`starting` rows left behind by a previous one.
    async fn reset_all(&self);

    /// Read-only accessor for the monitoring endpoint.
    async fn snapshot(&self) -> Vec<BotSnapshot>;

    /// Record `tokens` spent just now for `(key, model)` — the rate-limit
    /// ledger the agent runner adaptor consults. Owned by the state
    /// store rather than the runner itself, so the window is shared
    /// across worker restarts.
    async fn record_usage_window(&self, key: &ConversationKey, model: &str, tokens: u64);

    /// Sum of tokens recorded for `(key, model)` within the last
    /// `interval_seconds`, pruning older entries as a side effect.
    async fn usage_in_window(&self, key: &ConversationKey, model: &str, interval_seconds: u64) -> u64;
}

/// Internal bookkeeping shared by `MemoryStateStore`'s lock map: an
/// advisory TTL'd lock rather than a blocking mutex — callers that lose
/// the race get `false`/`None` immediately instead of waiting.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LockEntry {
    pub(crate) expires_at: Instant,
}
