//! Wires the lifecycle state machine to the channel router and the
//! agent runner: the lifecycle reconciler, the worker supervisor, and
//! the bot worker.

pub mod config_source;
pub mod reconciler;
pub mod supervisor;
pub mod worker;


pub use config_source::{ConfigSource, MockConfigSource};
pub use reconciler::Reconciler;
pub use supervisor::{ChatClientFactory, WorkerSupervisor};
pub use worker::BotWorker;
