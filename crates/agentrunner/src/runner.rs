//! Drives one agent turn: streams engine output, enforces per-model
//! rate limits, chunks output for delivery, and records token usage.
//!
//! A spawned task owns the sending half of a channel and streams
//! chunks back to the caller. Rate-limit accounting is counters held
//! behind the [`warden_statestore::StateStore`] rather than in-process
//! state, so limits are shared across every worker touching the same
//! conversation key.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use futures_util::StreamExt;
use tokio::sync::mpsc;

use warden_domain::config::{AgentRunnerConfig, ModelPolicy, RateLimitPolicy};
use warden_domain::error::{Error, Result};
use warden_domain::trace::TraceEvent;
use warden_domain::{ConversationKey, SessionId, UsageRecord};
use warden_statestore::StateStore;

use crate::engine::{AgentEngine, EngineEvent};
use crate::stream_adapter::ReceiverStream;

pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Reserved sentinel the adaptor's own internal bookkeeping may splice
/// into accumulated text; stripped before anything is chunked for
/// delivery.
const RESERVED_MARKER: char = '\u{E000}';

/// Consumed shape of the external usage sink. Aggregation by
/// `(agent_id, model_name, year, month)` is the sink's job, not the
/// adaptor's.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record_usage(&self, record: UsageRecord) -> Result<()>;
}

/// Default sink used by the `run` CLI command when no richer sink is
/// wired up: logs the record as a structured trace event and drops it.
pub struct LoggingUsageSink;

#[async_trait]
impl UsageSink for LoggingUsageSink {
    async fn record_usage(&self, record: UsageRecord) -> Result<()> {
        TraceEvent::UsageRecorded {
            model_name: &record.model_name,
            input_tokens: record.input_tokens,
            output_tokens: record.output_tokens,
            approximate: record.approximate,
        }
        .emit();
        Ok(())
    }
}

/// In-process sink that retains every record, for assertions in tests.
pub struct MockUsageSink {
    records: parking_lot::Mutex<Vec<UsageRecord>>,
}

impl MockUsageSink {
    pub fn new() -> Self {
        Self {
            records: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().clone()
    }
}

impl Default for MockUsageSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UsageSink for MockUsageSink {
    async fn record_usage(&self, record: UsageRecord) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }
}

/// Everything one `AgentRunner::run` call needs, plus
/// `agent_id`/`agent_name` carried for the `UsageRecord` key.
pub struct RunArgs {
    pub app_name: String,
    pub agent_id: String,
    pub agent_name: String,
    pub session_id: SessionId,
    pub conversation_key: ConversationKey,
    /// Query text, already including the user-context preamble
    /// prepended by the bot worker; the input token estimate is
    /// computed from exactly this string.
    pub query_text: String,
    pub model_name: String,
    pub function_display_map: HashMap<String, String>,
    pub only_final: bool,
    pub fallback_error_message: String,
}

pub struct AgentRunner {
    engine: Arc<dyn AgentEngine>,
    state_store: Arc<dyn StateStore>,
    usage_sink: Arc<dyn UsageSink>,
    config: AgentRunnerConfig,
}

impl AgentRunner {
    pub fn new(
        engine: Arc<dyn AgentEngine>,
        state_store: Arc<dyn StateStore>,
        usage_sink: Arc<dyn UsageSink>,
        config: AgentRunnerConfig,
    ) -> Self {
        Self {
            engine,
            state_store,
            usage_sink,
            config,
        }
    }

    /// Run one agent turn and stream text chunks back to the caller.
    /// Never returns an `Err` stream item — engine and adaptor
    /// failures are translated into a single `fallback_error_message`
    /// chunk instead.
    pub fn run(&self, args: RunArgs) -> BoxStream<'static, String> {
        let (tx, rx) = mpsc::channel::<String>(32);
        let engine = self.engine.clone();
        let state_store = self.state_store.clone();
        let usage_sink = self.usage_sink.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            if let Err(e) = run_inner(engine, state_store, usage_sink, config, args, tx).await {
                tracing::warn!(error = %e, "agent run failed without reaching a fallback send");
            }
        });

        Box::pin(ReceiverStream(rx))
    }
}

async fn run_inner(
    engine: Arc<dyn AgentEngine>,
    state_store: Arc<dyn StateStore>,
    usage_sink: Arc<dyn UsageSink>,
    config: AgentRunnerConfig,
    args: RunArgs,
    tx: mpsc::Sender<String>,
) -> Result<()> {
    let key_str = args.conversation_key.as_key_string();

    let (canonical_model, policy) = match resolve_model(&config, &args.model_name) {
        Ok(v) => v,
        Err(e) => {
            send_chunks(&tx, &args.fallback_error_message, config.chunk_size_chars).await;
            return Err(e);
        }
    };

    let (input_tokens, _) = estimate_tokens(&args.query_text);
    let used = state_store
        .usage_in_window(&args.conversation_key, &canonical_model, policy.interval_seconds)
        .await;

    if used.saturating_add(input_tokens) > policy.max_tokens {
        TraceEvent::RateLimited {
            conversation_key: &key_str,
            model_name: &canonical_model,
        }
        .emit();
        match policy.on_exceed {
            RateLimitPolicy::Reject => {
                send_chunks(&tx, &args.fallback_error_message, config.chunk_size_chars).await;
                return Err(Error::RateLimited(format!(
                    "{key_str}/{canonical_model}: {used} + {input_tokens} > {}",
                    policy.max_tokens
                )));
            }
            RateLimitPolicy::Defer => {
                // Bounded defer: give the window a moment to age out rather
                // than rejecting outright. Not a full re-check loop — one
                // short wait keeps this deterministic for callers and tests.
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }

    TraceEvent::AgentRunStarted {
        conversation_key: &key_str,
        model_name: &canonical_model,
    }
    .emit();

    let engine_call = tokio::time::timeout(
        Duration::from_secs(config.engine_timeout_secs),
        engine.run(&args.app_name, &args.session_id, &key_str, &args.query_text),
    )
    .await;

    let mut stream = match engine_call {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            TraceEvent::AgentRunFailed {
                conversation_key: &key_str,
                error: &e.to_string(),
            }
            .emit();
            send_chunks(&tx, &args.fallback_error_message, config.chunk_size_chars).await;
            return Err(e);
        }
        Err(_) => {
            let e = Error::EngineTimeout(Duration::from_secs(config.engine_timeout_secs));
            TraceEvent::AgentRunFailed {
                conversation_key: &key_str,
                error: &e.to_string(),
            }
            .emit();
            send_chunks(&tx, &args.fallback_error_message, config.chunk_size_chars).await;
            return Err(e);
        }
    };

    let mut accumulator = String::new();
    let mut emitted = String::new();

    while let Some(event) = stream.next().await {
        match event {
            EngineEvent::Partial { text } => {
                accumulator.push_str(&text);
                if !args.only_final {
                    send_chunks(&tx, &text, config.chunk_size_chars).await;
                    emitted.push_str(&text);
                }
            }
            EngineEvent::FunctionCall { name } => {
                if !args.only_final {
                    let shown = match args.function_display_map.get(&name) {
                        Some(label) => format!("[{label}]"),
                        None => "[working...]".to_string(),
                    };
                    send_chunks(&tx, &shown, config.chunk_size_chars).await;
                    emitted.push_str(&shown);
                }
            }
            EngineEvent::FunctionResponse { .. } => {
                // Not surfaced to the conversation: only call names are
                // mapped to a display label, not their results.
            }
            EngineEvent::Escalation { message } => {
                let shown = format!("\u{26A0} {message}");
                send_chunks(&tx, &shown, config.chunk_size_chars).await;
                emitted.push_str(&shown);
                record_usage(
                    &usage_sink,
                    &state_store,
                    &args,
                    &canonical_model,
                    input_tokens,
                    &emitted,
                )
                .await;
                return Ok(());
            }
            EngineEvent::Final { text } => {
                let mut combined = accumulator.clone();
                combined.push_str(&text);
                let trimmed = combined.trim();
                let final_text = if trimmed.is_empty() {
                    "[no valid response]".to_string()
                } else {
                    trimmed.to_string()
                };
                send_chunks(&tx, &final_text, config.chunk_size_chars).await;
                emitted.push_str(&final_text);
                record_usage(
                    &usage_sink,
                    &state_store,
                    &args,
                    &canonical_model,
                    input_tokens,
                    &emitted,
                )
                .await;
                return Ok(());
            }
        }
    }

    Ok(())
}

async fn record_usage(
    usage_sink: &Arc<dyn UsageSink>,
    state_store: &Arc<dyn StateStore>,
    args: &RunArgs,
    canonical_model: &str,
    input_tokens: u64,
    emitted: &str,
) {
    let (output_tokens, _) = estimate_tokens(emitted);
    let now = Utc::now();
    let record = UsageRecord {
        agent_id: args.agent_id.clone(),
        agent_name: args.agent_name.clone(),
        model_name: canonical_model.to_string(),
        year: now.year(),
        month: now.month(),
        input_tokens,
        output_tokens,
        approximate: true,
    };

    if let Err(e) = usage_sink.record_usage(record).await {
        tracing::warn!(error = %e, "failed to write usage record");
    }
    state_store
        .record_usage_window(&args.conversation_key, canonical_model, input_tokens + output_tokens)
        .await;
}

fn resolve_model(config: &AgentRunnerConfig, model_name: &str) -> Result<(String, ModelPolicy)> {
    if let Some(policy) = config.models.get(model_name) {
        return Ok((model_name.to_string(), policy.clone()));
    }
    if let Some(target) = config.model_aliases.get(model_name) {
        if let Some(policy) = config.models.get(target) {
            return Ok((target.clone(), policy.clone()));
        }
    }
    Err(Error::Config(format!(
        "unknown model \"{model_name}\" after alias resolution"
    )))
}

/// Word-count × 1.3 fallback tokenizer. Always flagged approximate —
/// no model-specific tokenizer is wired in.
fn estimate_tokens(text: &str) -> (u64, bool) {
    let words = text.split_whitespace().count();
    let tokens = (words as f64 * 1.3).ceil() as u64;
    (tokens, true)
}

fn strip_reserved_markers(text: &str) -> String {
    if text.contains(RESERVED_MARKER) {
        text.chars().filter(|&c| c != RESERVED_MARKER).collect()
    } else {
        text.to_string()
    }
}

fn chunk_text(text: &str, chunk_size_chars: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(chunk_size_chars.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

async fn send_chunks(tx: &mpsc::Sender<String>, text: &str, chunk_size_chars: usize) {
    let stripped = strip_reserved_markers(text);
    for chunk in chunk_text(&stripped, chunk_size_chars) {
        if tx.send(chunk).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockAgentEngine;
    use warden_domain::config::{AgentRunnerConfig, ModelPolicy};
    use warden_statestore::MemoryStateStore;

    fn config_with_model(max_tokens: u64, interval_seconds: u64, on_exceed: RateLimitPolicy) -> AgentRunnerConfig {
        let mut cfg = AgentRunnerConfig {
            models: HashMap::new(),
            ..Default::default()
        };
        cfg.models.insert(
            "gpt-4o".to_string(),
            ModelPolicy {
                max_tokens,
                interval_seconds,
                on_exceed,
            },
        );
        cfg.default_model_name = "gpt-4o".to_string();
        cfg
    }

    fn args(engine_model: &str) -> RunArgs {
        RunArgs {
            app_name: "warden".into(),
            agent_id: "bot_1".into(),
            agent_name: "test-agent".into(),
            session_id: SessionId::new("sess_1"),
            conversation_key: ConversationKey::dm("u1"),
            query_text: "hello there".into(),
            model_name: engine_model.into(),
            function_display_map: HashMap::new(),
            only_final: false,
            fallback_error_message: "something went wrong".into(),
        }
    }

    #[tokio::test]
    async fn final_event_emits_trimmed_text_and_records_usage() {
        let engine = Arc::new(MockAgentEngine::new());
        engine.push_script(vec![EngineEvent::Final {
            text: "  hello world  ".into(),
        }]);
        let store = Arc::new(MemoryStateStore::default());
        let sink = Arc::new(MockUsageSink::new());
        let runner = AgentRunner::new(
            engine,
            store,
            sink.clone(),
            config_with_model(100_000, 60, RateLimitPolicy::Reject),
        );

        let mut stream = runner.run(args("gpt-4o"));
        let chunk = stream.next().await.unwrap();
        assert_eq!(chunk, "hello world");
        assert!(stream.next().await.is_none());
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn final_with_no_content_emits_no_valid_response_marker() {
        let engine = Arc::new(MockAgentEngine::new());
        engine.push_script(vec![EngineEvent::Final { text: "   ".into() }]);
        let runner = AgentRunner::new(
            engine,
            Arc::new(MemoryStateStore::default()),
            Arc::new(MockUsageSink::new()),
            config_with_model(100_000, 60, RateLimitPolicy::Reject),
        );

        let mut stream = runner.run(args("gpt-4o"));
        assert_eq!(stream.next().await.unwrap(), "[no valid response]");
    }

    #[tokio::test]
    async fn function_call_uses_display_map_label() {
        let engine = Arc::new(MockAgentEngine::new());
        engine.push_script(vec![
            EngineEvent::FunctionCall {
                name: "lookup_weather".into(),
            },
            EngineEvent::Final {
                text: "done".into(),
            },
        ]);
        let runner = AgentRunner::new(
            engine,
            Arc::new(MemoryStateStore::default()),
            Arc::new(MockUsageSink::new()),
            config_with_model(100_000, 60, RateLimitPolicy::Reject),
        );
        let mut a = args("gpt-4o");
        a.function_display_map
            .insert("lookup_weather".into(), "Checking the weather".into());

        let mut stream = runner.run(a);
        assert_eq!(stream.next().await.unwrap(), "[Checking the weather]");
        assert_eq!(stream.next().await.unwrap(), "done");
    }

    #[tokio::test]
    async fn unmapped_function_call_uses_neutral_placeholder() {
        let engine = Arc::new(MockAgentEngine::new());
        engine.push_script(vec![
            EngineEvent::FunctionCall {
                name: "mystery_tool".into(),
            },
            EngineEvent::Final {
                text: "done".into(),
            },
        ]);
        let runner = AgentRunner::new(
            engine,
            Arc::new(MemoryStateStore::default()),
            Arc::new(MockUsageSink::new()),
            config_with_model(100_000, 60, RateLimitPolicy::Reject),
        );

        let mut stream = runner.run(args("gpt-4o"));
        assert_eq!(stream.next().await.unwrap(), "[working...]");
    }

    #[tokio::test]
    async fn escalation_terminates_stream_with_warning_prefix() {
        let engine = Arc::new(MockAgentEngine::new());
        engine.push_script(vec![EngineEvent::Escalation {
            message: "needs a human".into(),
        }]);
        let sink = Arc::new(MockUsageSink::new());
        let runner = AgentRunner::new(
            engine,
            Arc::new(MemoryStateStore::default()),
            sink.clone(),
            config_with_model(100_000, 60, RateLimitPolicy::Reject),
        );

        let mut stream = runner.run(args("gpt-4o"));
        let chunk = stream.next().await.unwrap();
        assert!(chunk.starts_with('\u{26A0}'));
        assert!(stream.next().await.is_none());
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn engine_failure_yields_single_fallback_chunk_and_no_usage() {
        let engine = Arc::new(MockAgentEngine::new());
        engine.fail_next_run("provider unreachable");
        let sink = Arc::new(MockUsageSink::new());
        let runner = AgentRunner::new(
            engine,
            Arc::new(MemoryStateStore::default()),
            sink.clone(),
            config_with_model(100_000, 60, RateLimitPolicy::Reject),
        );

        let mut stream = runner.run(args("gpt-4o"));
        assert_eq!(stream.next().await.unwrap(), "something went wrong");
        assert!(stream.next().await.is_none());
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn unknown_model_without_alias_yields_fallback_and_no_usage() {
        let engine = Arc::new(MockAgentEngine::new());
        engine.push_script(vec![EngineEvent::Final { text: "hi".into() }]);
        let sink = Arc::new(MockUsageSink::new());
        let runner = AgentRunner::new(
            engine,
            Arc::new(MemoryStateStore::default()),
            sink.clone(),
            config_with_model(100_000, 60, RateLimitPolicy::Reject),
        );

        let mut stream = runner.run(args("gpt-3.5-legacy"));
        assert_eq!(stream.next().await.unwrap(), "something went wrong");
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn model_alias_resolves_to_canonical_policy() {
        let engine = Arc::new(MockAgentEngine::new());
        engine.push_script(vec![EngineEvent::Final { text: "hi".into() }]);
        let mut cfg = config_with_model(100_000, 60, RateLimitPolicy::Reject);
        cfg.model_aliases.insert("legacy-name".into(), "gpt-4o".into());
        let sink = Arc::new(MockUsageSink::new());
        let runner = AgentRunner::new(
            engine,
            Arc::new(MemoryStateStore::default()),
            sink.clone(),
            cfg,
        );

        let mut stream = runner.run(args("legacy-name"));
        assert_eq!(stream.next().await.unwrap(), "hi");
        assert_eq!(sink.records()[0].model_name, "gpt-4o");
    }

    #[tokio::test]
    async fn rate_limit_reject_skips_engine_call_and_usage() {
        let engine = Arc::new(MockAgentEngine::new());
        engine.push_script(vec![EngineEvent::Final { text: "should not run".into() }]);
        let store = Arc::new(MemoryStateStore::default());
        let key = ConversationKey::dm("u1");
        store.record_usage_window(&key, "gpt-4o", 99_999).await;
        let sink = Arc::new(MockUsageSink::new());
        let runner = AgentRunner::new(
            engine,
            store,
            sink.clone(),
            config_with_model(100_000, 60, RateLimitPolicy::Reject),
        );

        let mut stream = runner.run(args("gpt-4o"));
        assert_eq!(stream.next().await.unwrap(), "something went wrong");
        assert!(stream.next().await.is_none());
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn output_chunked_into_2000_character_pieces() {
        let engine = Arc::new(MockAgentEngine::new());
        let long_text: String = "x".repeat(5100);
        engine.push_script(vec![EngineEvent::Final { text: long_text.clone() }]);
        let runner = AgentRunner::new(
            engine,
            Arc::new(MemoryStateStore::default()),
            Arc::new(MockUsageSink::new()),
            config_with_model(1_000_000, 60, RateLimitPolicy::Reject),
        );

        let mut a = args("gpt-4o");
        a.only_final = true;
        let mut stream = runner.run(a);
        let c1 = stream.next().await.unwrap();
        let c2 = stream.next().await.unwrap();
        let c3 = stream.next().await.unwrap();
        assert_eq!(c1.len(), 2000);
        assert_eq!(c2.len(), 2000);
        assert_eq!(c3.len(), 1100);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn only_final_suppresses_partial_emission() {
        let engine = Arc::new(MockAgentEngine::new());
        engine.push_script(vec![
            EngineEvent::Partial { text: "thinking...".into() },
            EngineEvent::Final { text: " done".into() },
        ]);
        let runner = AgentRunner::new(
            engine,
            Arc::new(MemoryStateStore::default()),
            Arc::new(MockUsageSink::new()),
            config_with_model(100_000, 60, RateLimitPolicy::Reject),
        );

        let mut a = args("gpt-4o");
        a.only_final = true;
        let mut stream = runner.run(a);
        assert_eq!(stream.next().await.unwrap(), "thinking... done");
        assert!(stream.next().await.is_none());
    }
}
