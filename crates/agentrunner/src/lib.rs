//! The agent runner adaptor and the agent-engine trait boundary it
//! wraps: drives one conversational turn against an `AgentEngine`,
//! classifies and chunks its output, and records usage.

mod stream_adapter;

pub mod engine;
pub mod runner;

pub use engine::{AgentEngine, EngineEvent, MockAgentEngine};
pub use runner::{AgentRunner, LoggingUsageSink, MockUsageSink, RunArgs, UsageSink};
