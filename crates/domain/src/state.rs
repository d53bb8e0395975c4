use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a bot. Exactly one value is recorded per bot id in
/// the state store; absence is treated as `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotState {
    Idle,
    ShouldStart,
    Starting,
    Running,
    ShouldStop,
    Stopping,
    ShouldRestart,
}

impl Default for BotState {
    fn default() -> Self {
        Self::Idle
    }
}

impl BotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ShouldStart => "should_start",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::ShouldStop => "should_stop",
            Self::Stopping => "stopping",
            Self::ShouldRestart => "should_restart",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "idle" => Self::Idle,
            "should_start" => Self::ShouldStart,
            "starting" => Self::Starting,
            "running" => Self::Running,
            "should_stop" => Self::ShouldStop,
            "stopping" => Self::Stopping,
            "should_restart" => Self::ShouldRestart,
            _ => return None,
        })
    }
}

impl fmt::Display for BotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_variant_through_string_form() {
        let all = [
            BotState::Idle,
            BotState::ShouldStart,
            BotState::Starting,
            BotState::Running,
            BotState::ShouldStop,
            BotState::Stopping,
            BotState::ShouldRestart,
        ];
        for s in all {
            assert_eq!(BotState::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn unrecognized_string_parses_to_none() {
        assert_eq!(BotState::parse("bogus"), None);
    }

    #[test]
    fn default_is_idle() {
        assert_eq!(BotState::default(), BotState::Idle);
    }
}
