pub mod config;
pub mod error;
pub mod ids;
pub mod model;
pub mod state;
pub mod trace;
pub mod usage;

pub use error::{Error, Result};
pub use ids::{BotId, ConversationKey, SessionId};
pub use model::{AgentConfig, InitConfig};
pub use state::BotState;
pub use usage::UsageRecord;
