use std::collections::HashSet;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_core::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use warden_domain::error::{Error, Result};

use crate::{BoxStream, ChatChannel, ChatClient, ChatEvent};

/// An in-process `ChatClient` for tests and local dev: `connect` hands
/// back a stream fed by [`MockChatClient::push_event`], `send` is
/// recorded rather than delivered anywhere.
pub struct MockChatClient {
    sent: Mutex<Vec<(ChatChannel, String)>>,
    admins: Mutex<HashSet<(String, String)>>,
    tx: mpsc::UnboundedSender<ChatEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<ChatEvent>>>,
}

impl MockChatClient {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sent: Mutex::new(Vec::new()),
            admins: Mutex::new(HashSet::new()),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Push an event onto the stream handed back by `connect`. Dropped
    /// silently if the stream hasn't been connected (or was dropped).
    pub fn push_event(&self, event: ChatEvent) {
        let _ = self.tx.send(event);
    }

    pub fn sent_messages(&self) -> Vec<(ChatChannel, String)> {
        self.sent.lock().clone()
    }

    pub fn grant_admin(&self, channel_id: impl Into<String>, user_id: impl Into<String>) {
        self.admins.lock().insert((channel_id.into(), user_id.into()));
    }
}

impl Default for MockChatClient {
    fn default() -> Self {
        Self::new()
    }
}

struct EventStream(mpsc::UnboundedReceiver<ChatEvent>);

impl Stream for EventStream {
    type Item = ChatEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ChatEvent>> {
        self.0.poll_recv(cx)
    }
}

#[async_trait]
impl ChatClient for MockChatClient {
    async fn connect(&self, _credential_token: &str) -> Result<BoxStream<'static, ChatEvent>> {
        let rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| Error::ChatService("already connected".into()))?;
        Ok(Box::pin(EventStream(rx)))
    }

    async fn send(&self, channel: &ChatChannel, body: &str) -> Result<()> {
        if body.len() > 2000 {
            return Err(Error::ChatService(format!(
                "body exceeds 2000 bytes ({})",
                body.len()
            )));
        }
        self.sent.lock().push((channel.clone(), body.to_string()));
        Ok(())
    }

    async fn is_admin(&self, channel_id: &str, user_id: &str) -> Result<bool> {
        Ok(self
            .admins
            .lock()
            .contains(&(channel_id.to_string(), user_id.to_string())))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
