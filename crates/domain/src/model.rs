use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::ids::BotId;

/// Per-bot immutable-per-run parameters. Credentials are opaque to the
/// core — it never inspects `credential_token` beyond passing it to the
/// chat client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitConfig {
    pub bot_id: BotId,
    pub credential_token: String,
    pub command_prefix: String,
    pub direct_message_allowlist: BTreeSet<String>,
    pub server_allowlist: BTreeSet<String>,
}

impl InitConfig {
    pub fn allows_dm_from(&self, user_id: &str) -> bool {
        self.direct_message_allowlist.contains(user_id)
    }

    pub fn allows_server(&self, server_id: &str) -> bool {
        self.server_allowlist.contains(server_id)
    }
}

/// Per-bot agent parameters. `tool_names` order is significant: it is
/// the order advertised to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub app_name: String,
    pub description: String,
    pub role_instructions: String,
    pub tool_instructions: String,
    pub model_name: String,
    pub tool_names: Vec<String>,
    pub user_function_display_map: HashMap<String, String>,
    pub fallback_error_message: String,
}

impl AgentConfig {
    /// Human-readable label for a function-call event, or `None` if the
    /// function name has no mapping — callers fall back to a neutral
    /// placeholder in that case.
    pub fn display_label_for(&self, function_name: &str) -> Option<&str> {
        self.user_function_display_map
            .get(function_name)
            .map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_init() -> InitConfig {
        InitConfig {
            bot_id: BotId::new("bot_1"),
            credential_token: "tok".into(),
            command_prefix: "!".into(),
            direct_message_allowlist: BTreeSet::from(["u1".to_string()]),
            server_allowlist: BTreeSet::from(["s1".to_string()]),
        }
    }

    #[test]
    fn allowlist_checks_are_exact_match() {
        let init = sample_init();
        assert!(init.allows_dm_from("u1"));
        assert!(!init.allows_dm_from("u2"));
        assert!(init.allows_server("s1"));
        assert!(!init.allows_server("s2"));
    }

    #[test]
    fn display_label_falls_back_to_none_for_unmapped_function() {
        let agent = AgentConfig {
            app_name: "a".into(),
            description: "d".into(),
            role_instructions: "r".into(),
            tool_instructions: "t".into(),
            model_name: "gpt-4o".into(),
            tool_names: vec!["search".into()],
            user_function_display_map: HashMap::from([(
                "search".to_string(),
                "Searching the web".to_string(),
            )]),
            fallback_error_message: "Sorry, something went wrong.".into(),
        };
        assert_eq!(agent.display_label_for("search"), Some("Searching the web"));
        assert_eq!(agent.display_label_for("unknown_fn"), None);
    }
}
