//! Consumed shape of the external agent (LLM) engine. The engine
//! itself — session storage, model dispatch, tool execution — lives
//! outside this crate; only the trait boundary the agent runner
//! adaptor dispatches against is implemented here.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use warden_domain::error::{Error, Result};
use warden_domain::SessionId;

use crate::stream_adapter::ReceiverStream;

pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// One event from a running agent turn.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Partial { text: String },
    FunctionCall { name: String },
    FunctionResponse { name: String },
    Final { text: String },
    Escalation { message: String },
}

/// The capabilities the Agent Runner Adaptor needs from the agent engine.
#[async_trait]
pub trait AgentEngine: Send + Sync {
    async fn create_session(&self, app_name: &str, user_key: &str) -> Result<SessionId>;

    async fn list_sessions(&self, app_name: &str, user_key: &str) -> Result<Vec<SessionId>>;

    async fn delete_session(&self, app_name: &str, session_id: &SessionId) -> Result<()>;

    /// Run one turn and stream its events.
    async fn run(
        &self,
        app_name: &str,
        session_id: &SessionId,
        user_key: &str,
        user_message: &str,
    ) -> Result<BoxStream<'static, EngineEvent>>;
}

/// In-process `AgentEngine` for tests and local dev. Scripted runs are
/// queued with [`MockAgentEngine::push_script`] and consumed FIFO, one
/// script per `run()` call; with no script queued, `run()` emits a
/// single `Final` echoing the input.
pub struct MockAgentEngine {
    sessions: Mutex<HashMap<(String, String), Vec<SessionId>>>,
    scripts: Mutex<VecDeque<Vec<EngineEvent>>>,
    fail_next: Mutex<Option<String>>,
}

impl MockAgentEngine {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            scripts: Mutex::new(VecDeque::new()),
            fail_next: Mutex::new(None),
        }
    }

    /// Queue the events the next `run()` call should emit.
    pub fn push_script(&self, events: Vec<EngineEvent>) {
        self.scripts.lock().push_back(events);
    }

    /// Make the next `run()` call fail with `message` instead of
    /// consuming a queued script.
    pub fn fail_next_run(&self, message: impl Into<String>) {
        *self.fail_next.lock() = Some(message.into());
    }
}

impl Default for MockAgentEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentEngine for MockAgentEngine {
    async fn create_session(&self, app_name: &str, user_key: &str) -> Result<SessionId> {
        let session = SessionId::new(format!("sess_{}", uuid::Uuid::new_v4()));
        self.sessions
            .lock()
            .entry((app_name.to_string(), user_key.to_string()))
            .or_default()
            .push(session.clone());
        Ok(session)
    }

    async fn list_sessions(&self, app_name: &str, user_key: &str) -> Result<Vec<SessionId>> {
        Ok(self
            .sessions
            .lock()
            .get(&(app_name.to_string(), user_key.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_session(&self, app_name: &str, session_id: &SessionId) -> Result<()> {
        let mut sessions = self.sessions.lock();
        for (key, ids) in sessions.iter_mut() {
            if key.0 == app_name {
                ids.retain(|id| id != session_id);
            }
        }
        Ok(())
    }

    async fn run(
        &self,
        _app_name: &str,
        _session_id: &SessionId,
        _user_key: &str,
        user_message: &str,
    ) -> Result<BoxStream<'static, EngineEvent>> {
        if let Some(message) = self.fail_next.lock().take() {
            return Err(Error::AgentRun(message));
        }

        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| vec![EngineEvent::Final { text: format!("echo: {user_message}") }]);

        let (tx, rx) = mpsc::channel::<EngineEvent>(script.len().max(1));
        for event in script {
            let _ = tx.send(event).await;
        }
        Ok(Box::pin(ReceiverStream(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn sessions_are_tracked_per_app_and_user() {
        let engine = MockAgentEngine::new();
        let s1 = engine.create_session("app", "dm:1").await.unwrap();
        let s2 = engine.create_session("app", "dm:1").await.unwrap();
        assert_ne!(s1, s2);
        let listed = engine.list_sessions("app", "dm:1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(engine.list_sessions("app", "dm:2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_session_removes_only_matching_id() {
        let engine = MockAgentEngine::new();
        let s1 = engine.create_session("app", "dm:1").await.unwrap();
        let s2 = engine.create_session("app", "dm:1").await.unwrap();
        engine.delete_session("app", &s1).await.unwrap();
        let listed = engine.list_sessions("app", "dm:1").await.unwrap();
        assert_eq!(listed, vec![s2]);
    }

    #[tokio::test]
    async fn run_without_script_echoes_input() {
        let engine = MockAgentEngine::new();
        let session = engine.create_session("app", "dm:1").await.unwrap();
        let mut stream = engine.run("app", &session, "dm:1", "hi").await.unwrap();
        let event = stream.next().await.unwrap();
        assert!(matches!(event, EngineEvent::Final { text } if text == "echo: hi"));
    }

    #[tokio::test]
    async fn fail_next_run_returns_error_once() {
        let engine = MockAgentEngine::new();
        let session = engine.create_session("app", "dm:1").await.unwrap();
        engine.fail_next_run("boom");
        let err = engine.run("app", &session, "dm:1", "hi").await.unwrap_err();
        assert!(matches!(err, Error::AgentRun(msg) if msg == "boom"));
        // Second call is not affected by the earlier failure.
        assert!(engine.run("app", &session, "dm:1", "hi").await.is_ok());
    }
}
