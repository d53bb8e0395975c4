//! Structured trace events emitted at the seams between subsystems.
//!
//! Each variant carries just enough context to reconstruct what
//! happened from logs alone, without needing the rest of the process
//! state. `.emit()` logs the event as a single structured `tracing`
//! record; nothing here is fallible.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent<'a> {
    BotStateChanged {
        bot_id: &'a str,
        from: &'a str,
        to: &'a str,
    },
    ReconcilerTick {
        tick: u64,
        bot_count: usize,
    },
    WorkerSpawned {
        bot_id: &'a str,
    },
    WorkerRemoved {
        bot_id: &'a str,
        reason: &'a str,
    },
    MessageAdmitted {
        bot_id: &'a str,
        conversation_key: &'a str,
    },
    MessageRejected {
        bot_id: &'a str,
        reason: &'a str,
    },
    ChannelQueueCreated {
        bot_id: &'a str,
        conversation_key: &'a str,
    },
    ChannelQueueEvicted {
        bot_id: &'a str,
        conversation_key: &'a str,
    },
    RouterSaturated {
        bot_id: &'a str,
        conversation_key: &'a str,
    },
    ChannelBacklogged {
        bot_id: &'a str,
        conversation_key: &'a str,
        pending: usize,
    },
    AgentRunStarted {
        conversation_key: &'a str,
        model_name: &'a str,
    },
    AgentRunFailed {
        conversation_key: &'a str,
        error: &'a str,
    },
    RateLimited {
        conversation_key: &'a str,
        model_name: &'a str,
    },
    UsageRecorded {
        model_name: &'a str,
        input_tokens: u64,
        output_tokens: u64,
        approximate: bool,
    },
}

impl<'a> TraceEvent<'a> {
    pub fn emit(&self) {
        match serde_json::to_string(self) {
            Ok(json) => tracing::info!(target: "warden::trace", event = %json),
            Err(e) => tracing::warn!(target: "warden::trace", error = %e, "failed to serialize trace event"),
        }
    }
}
