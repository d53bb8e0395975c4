use serde::{Deserialize, Serialize};

/// Write-only usage record emitted after each completed agent run.
/// Aggregation by `(agent_id, model_name, year, month)` happens
/// downstream in the usage sink; the core never reads these back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub agent_id: String,
    pub agent_name: String,
    pub model_name: String,
    pub year: i32,
    pub month: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// True when token counts came from the word-count fallback
    /// estimator rather than a model-specific tokenizer.
    pub approximate: bool,
}
