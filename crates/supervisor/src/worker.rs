//! One running bot: the chat-service connection, the admission
//! pipeline, the session cache, and the Channel Router it owns. A
//! single long-running task owns the ingress side and hands work off
//! to the router rather than running handlers inline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use warden_agentrunner::{AgentEngine, AgentRunner, RunArgs};
use warden_chatclient::{ChatChannel, ChatClient, ChatEvent, InboundMessage};
use warden_domain::trace::TraceEvent;
use warden_domain::{AgentConfig, BotId, ConversationKey, InitConfig, SessionId};
use warden_router::ChannelRouter;

const HELP_TEXT: &str = "commands: help, clear_sessions [channel_<id>|dm_<id>]";

/// What happened on the way to (or instead of) becoming ready, reported
/// exactly once back to whoever is waiting to promote the bot to
/// running.
pub enum ReadyOutcome {
    Ready,
    Failed(String),
}

/// One validated, admitted inbound message waiting on the router.
struct InboundJob {
    conversation_key: ConversationKey,
    chat_channel: ChatChannel,
    user_id: String,
    username: String,
    display_name: String,
    channel_descriptor: String,
    query_text: String,
}

pub struct BotWorker {
    bot_id: BotId,
    init: InitConfig,
    agent: AgentConfig,
    chat_client: Arc<dyn ChatClient>,
    engine: Arc<dyn AgentEngine>,
    agent_runner: Arc<AgentRunner>,
    router: Arc<ChannelRouter<InboundJob>>,
    session_cache: Mutex<HashMap<ConversationKey, SessionId>>,
    cancel: CancellationToken,
    ready_tx: Mutex<Option<oneshot::Sender<ReadyOutcome>>>,
}

impl BotWorker {
    pub fn new(
        bot_id: BotId,
        init: InitConfig,
        agent: AgentConfig,
        chat_client: Arc<dyn ChatClient>,
        engine: Arc<dyn AgentEngine>,
        agent_runner: Arc<AgentRunner>,
        router: Arc<ChannelRouter<InboundJob>>,
        cancel: CancellationToken,
        ready_tx: oneshot::Sender<ReadyOutcome>,
    ) -> Self {
        Self {
            bot_id,
            init,
            agent,
            chat_client,
            engine,
            agent_runner,
            router,
            session_cache: Mutex::new(HashMap::new()),
            cancel,
            ready_tx: Mutex::new(Some(ready_tx)),
        }
    }

    /// Send the outcome to whoever is waiting on readiness. A no-op past
    /// the first call — only the first outcome (the transition out of
    /// "not yet ready") matters.
    fn report_ready(&self, outcome: ReadyOutcome) {
        if let Some(tx) = self.ready_tx.lock().take() {
            let _ = tx.send(outcome);
        }
    }

    pub fn bot_id(&self) -> &BotId {
        &self.bot_id
    }

    pub fn router(&self) -> &Arc<ChannelRouter<InboundJob>> {
        &self.router
    }

    /// Ingress loop: connect, then dispatch every inbound message until
    /// the connection ends or a stop is requested. Never executes a
    /// message handler inline — everything accepted goes through the
    /// router. Reports exactly one readiness outcome: `Ready` on the
    /// first `ChatEvent::Ready`, `Failed` if the connection never gets
    /// that far.
    pub async fn run(self: Arc<Self>) {
        let mut stream = match self.chat_client.connect(&self.init.credential_token).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(bot_id = %self.bot_id, error = %e, "failed to connect chat client");
                self.report_ready(ReadyOutcome::Failed(format!("connect failed: {e}")));
                return;
            }
        };

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.report_ready(ReadyOutcome::Failed("stopped before becoming ready".to_string()));
                    break;
                }
                event = stream.next() => event,
            };
            match event {
                Some(ChatEvent::Ready) => {
                    tracing::debug!(bot_id = %self.bot_id, "chat connection ready");
                    self.report_ready(ReadyOutcome::Ready);
                }
                Some(ChatEvent::Message(msg)) => self.on_message(msg).await,
                Some(ChatEvent::Close { reason }) => {
                    tracing::info!(bot_id = %self.bot_id, reason, "chat connection closed by remote");
                    self.report_ready(ReadyOutcome::Failed(format!("connection closed before becoming ready: {reason}")));
                    break;
                }
                None => {
                    self.report_ready(ReadyOutcome::Failed(
                        "connection stream ended before becoming ready".to_string(),
                    ));
                    break;
                }
            }
        }
    }

    /// Cooperative stop: cancel the ingress loop, drain the router, and
    /// close the chat connection.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.router.shutdown(Duration::from_secs(5)).await;
        if let Err(e) = self.chat_client.close().await {
            tracing::warn!(bot_id = %self.bot_id, error = %e, "error closing chat client");
        }
    }

    async fn on_message(self: &Arc<Self>, msg: InboundMessage) {
        if msg.author_is_bot {
            return;
        }

        let conversation_key = match &msg.channel {
            ChatChannel::Dm { user_id } => {
                if !self.init.allows_dm_from(user_id) {
                    TraceEvent::MessageRejected {
                        bot_id: self.bot_id.as_str(),
                        reason: "dm sender not in allowlist",
                    }
                    .emit();
                    return;
                }
                ConversationKey::dm(user_id.clone())
            }
            ChatChannel::Server { channel_id, server_id } => {
                if !msg.mentions_bot || !self.init.allows_server(server_id) {
                    TraceEvent::MessageRejected {
                        bot_id: self.bot_id.as_str(),
                        reason: "server message not mentioned or server not allowlisted",
                    }
                    .emit();
                    return;
                }
                ConversationKey::channel(channel_id.clone())
            }
        };

        let Some(stripped) = self.strip_self_mention(&msg.content) else {
            TraceEvent::MessageRejected {
                bot_id: self.bot_id.as_str(),
                reason: "empty after stripping self-mention",
            }
            .emit();
            return;
        };

        if let Some(command) = stripped.strip_prefix(&self.init.command_prefix) {
            self.handle_command(command.trim(), &msg).await;
            return;
        }

        TraceEvent::MessageAdmitted {
            bot_id: self.bot_id.as_str(),
            conversation_key: &conversation_key.as_key_string(),
        }
        .emit();

        let job = InboundJob {
            conversation_key: conversation_key.clone(),
            chat_channel: msg.channel.clone(),
            user_id: msg.author_id.clone(),
            username: msg.author_username.clone(),
            display_name: msg.author_display_name.clone(),
            channel_descriptor: describe_channel(&msg.channel),
            query_text: stripped,
        };

        let worker = self.clone();
        if let Err(e) = self
            .router
            .enqueue(conversation_key, job, move |job| {
                let worker = worker.clone();
                async move { worker.handle_job(job).await }
            })
            .await
        {
            tracing::warn!(bot_id = %self.bot_id, error = %e, "dropping message, router rejected enqueue");
        }
    }

    fn strip_self_mention(&self, content: &str) -> Option<String> {
        let mention = format!("<@{}>", self.bot_id.as_str());
        let trimmed = content.trim_start();
        let rest = trimmed.strip_prefix(mention.as_str()).unwrap_or(trimmed).trim_start();
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        }
    }

    async fn handle_command(self: &Arc<Self>, command: &str, msg: &InboundMessage) {
        let mut parts = command.split_whitespace();
        match parts.next() {
            Some("help") => {
                let _ = self.chat_client.send(&msg.channel, HELP_TEXT).await;
            }
            Some("clear_sessions") => {
                self.handle_clear_sessions(parts.next(), msg).await;
            }
            _ => {
                let _ = self
                    .chat_client
                    .send(&msg.channel, "unrecognized command, try \"help\"")
                    .await;
            }
        }
    }

    /// No target clears the caller's own conversation key; an explicit
    /// target requires the caller to hold an admin role on the channel
    /// the command was issued in. Running it twice in a row is a no-op
    /// the second time — there are no sessions left to clear.
    async fn handle_clear_sessions(self: &Arc<Self>, target: Option<&str>, msg: &InboundMessage) {
        let key = match target {
            None => match &msg.channel {
                ChatChannel::Dm { user_id } => ConversationKey::dm(user_id.clone()),
                ChatChannel::Server { channel_id, .. } => ConversationKey::channel(channel_id.clone()),
            },
            Some(raw) => {
                let resolved = if let Some(id) = raw.strip_prefix("channel_") {
                    Some(ConversationKey::channel(id))
                } else if let Some(id) = raw.strip_prefix("dm_") {
                    Some(ConversationKey::dm(id))
                } else {
                    None
                };
                let Some(key) = resolved else {
                    let _ = self
                        .chat_client
                        .send(&msg.channel, "invalid target, expected channel_<id> or dm_<id>")
                        .await;
                    return;
                };
                let admin_channel_id = match &msg.channel {
                    ChatChannel::Server { channel_id, .. } => channel_id.clone(),
                    ChatChannel::Dm { .. } => {
                        let _ = self
                            .chat_client
                            .send(&msg.channel, "admin role cannot be checked from a direct message")
                            .await;
                        return;
                    }
                };
                match self.chat_client.is_admin(&admin_channel_id, &msg.author_id).await {
                    Ok(true) => {}
                    _ => {
                        let _ = self
                            .chat_client
                            .send(&msg.channel, "not authorized to clear another conversation's sessions")
                            .await;
                        return;
                    }
                }
                key
            }
        };

        let sessions = self
            .engine
            .list_sessions(&self.agent.app_name, &key.as_key_string())
            .await
            .unwrap_or_default();
        let count = sessions.len();
        for session in &sessions {
            let _ = self.engine.delete_session(&self.agent.app_name, session).await;
        }
        self.session_cache.lock().remove(&key);

        let ack = if count == 0 {
            "no sessions".to_string()
        } else {
            format!("cleared {count} session(s)")
        };
        let _ = self.chat_client.send(&msg.channel, &ack).await;
    }

    async fn ensure_session(&self, key: &ConversationKey) -> SessionId {
        if let Some(id) = self.session_cache.lock().get(key).cloned() {
            return id;
        }
        match self.engine.create_session(&self.agent.app_name, &key.as_key_string()).await {
            Ok(id) => {
                self.session_cache.lock().insert(key.clone(), id.clone());
                id
            }
            Err(e) => {
                tracing::warn!(bot_id = %self.bot_id, error = %e, "session creation failed, using ephemeral id");
                SessionId::ephemeral(key)
            }
        }
    }

    async fn handle_job(self: Arc<Self>, job: InboundJob) {
        let session_id = self.ensure_session(&job.conversation_key).await;
        let preamble = format!(
            "[user:{} username:{} display:{} channel:{}] ",
            job.user_id, job.username, job.display_name, job.channel_descriptor
        );
        let query_text = format!("{preamble}{}", job.query_text);

        let run_args = RunArgs {
            app_name: self.agent.app_name.clone(),
            agent_id: self.bot_id.as_str().to_string(),
            agent_name: self.agent.app_name.clone(),
            session_id,
            conversation_key: job.conversation_key.clone(),
            query_text,
            model_name: self.agent.model_name.clone(),
            function_display_map: self.agent.user_function_display_map.clone(),
            only_final: false,
            fallback_error_message: self.agent.fallback_error_message.clone(),
        };

        let mut stream = self.agent_runner.run(run_args);
        while let Some(chunk) = stream.next().await {
            if let Err(e) = self.chat_client.send(&job.chat_channel, &chunk).await {
                tracing::warn!(bot_id = %self.bot_id, error = %e, "failed to deliver chunk, dropping rest of this run");
                break;
            }
        }
    }
}

fn describe_channel(channel: &ChatChannel) -> String {
    match channel {
        ChatChannel::Dm { user_id } => format!("dm:{user_id}"),
        ChatChannel::Server { channel_id, server_id } => format!("server:{server_id}/channel:{channel_id}"),
    }
}
