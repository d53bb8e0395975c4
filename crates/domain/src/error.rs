//! Shared error type used across all warden crates.
//!
//! Variants map directly onto the error kinds in the core's error-handling
//! design: config problems are fatal to the affected bot, state-store and
//! lock errors are transient and retried by the reconciler, chat/engine
//! errors terminate or fall back at the boundary where they occur.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("config: {0}")]
    Config(String),

    #[error("state store: {0}")]
    StateStore(String),

    #[error("lock contention on {0}")]
    LockContention(String),

    #[error("chat service: {0}")]
    ChatService(String),

    #[error("router saturated: {0}")]
    RouterSaturated(String),

    #[error("channel backlogged: {0}")]
    ChannelBacklogged(String),

    #[error("agent run failed: {0}")]
    AgentRun(String),

    #[error("engine timeout after {0:?}")]
    EngineTimeout(std::time::Duration),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
