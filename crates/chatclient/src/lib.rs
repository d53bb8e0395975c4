//! Consumed shape of the external chat service. The gateway, the auth
//! model, and the wire protocol belong to the chat service itself —
//! this crate only defines the trait boundary the bot worker dispatches
//! against, without vendoring any particular provider's SDK.

mod mock;

use async_trait::async_trait;
use std::pin::Pin;

use warden_domain::error::Result;

pub use mock::MockChatClient;

/// A boxed event stream, mirroring `sa_domain::stream::BoxStream`.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Where a message originated: a direct message from a user, or a
/// server text channel. Maps onto a `ConversationKey` one-to-one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatChannel {
    Dm { user_id: String },
    Server { channel_id: String, server_id: String },
}

/// One inbound message as delivered by the chat service, before any
/// admission filtering.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub author_id: String,
    pub author_is_bot: bool,
    pub author_username: String,
    pub author_display_name: String,
    pub channel: ChatChannel,
    pub content: String,
    /// Whether the receiving bot's own id appears as a mention in `content`.
    pub mentions_bot: bool,
}

/// Lifecycle and inbound events delivered by a connected chat client.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// Connection established and ready to receive/send.
    Ready,
    Message(InboundMessage),
    Close { reason: String },
}

/// The capabilities a Bot Worker needs from its chat-service connection.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Open the connection using `credential_token` and begin producing
    /// `ChatEvent`s. Requests only the minimum capabilities needed:
    /// direct messages, server messages with content, and member info.
    async fn connect(&self, credential_token: &str) -> Result<BoxStream<'static, ChatEvent>>;

    /// Send `body` to `channel`. `body` must not exceed 2,000 bytes;
    /// callers are expected to chunk before calling this.
    async fn send(&self, channel: &ChatChannel, body: &str) -> Result<()>;

    /// Whether `user_id` holds an administrative role on the server
    /// that owns `channel_id` — the permission check behind
    /// `clear_sessions` with an explicit target.
    async fn is_admin(&self, channel_id: &str, user_id: &str) -> Result<bool>;

    /// Close the connection cleanly.
    async fn close(&self) -> Result<()>;
}
