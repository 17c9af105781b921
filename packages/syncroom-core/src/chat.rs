//! Chat/system-event pipeline (component G).
//!
//! Chat messages are rate-limited per user over a sliding window; system
//! notices (join/leave/play/pause/seek) are advisory broadcasts with no rate
//! limit, distinct from the chat message stream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::bus::EventBus;
use crate::clock::now_ms;
use crate::error::{SyncError, SyncResult};
use crate::models::Role;
use crate::state_store::StateStore;

/// Default sliding-window chat cap (§6 `chat_rate_limit_window_ms`,
/// `chat_rate_limit_max`).
pub const DEFAULT_CHAT_RATE_LIMIT_MAX: u64 = 30;
pub const DEFAULT_CHAT_RATE_LIMIT_WINDOW: Duration = Duration::from_millis(60_000);

/// Minimum/maximum length of a chat message body (§6).
pub const CHAT_MESSAGE_MIN_LEN: usize = 1;
pub const CHAT_MESSAGE_MAX_LEN: usize = 1000;

/// Persists a chat message through the external CRUD collaborator and
/// records a non-blocking analytics/audit event (§4.G, §7 Audit hook).
#[async_trait]
pub trait ChatSink: Send + Sync {
    async fn persist(&self, room_id: &str, sender_handle: &str, content: &str) -> SyncResult<()>;

    /// Fire-and-forget; a failure here is logged but never fails the
    /// user-facing chat send (§7 Audit hook).
    async fn record_analytics(&self, room_id: &str, sender_handle: &str);
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    kind: &'static str,
    sender_handle: &'a str,
    content: &'a str,
    sent_at_ms: u64,
}

/// System notice kinds broadcast without a content field (§4.G, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEventKind {
    Join,
    Leave,
    Play,
    Pause,
    Seek,
}

impl SystemEventKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Play => "play",
            Self::Pause => "pause",
            Self::Seek => "seek",
        }
    }
}

/// Minimal `ChatSink` that logs instead of persisting. Suitable for a
/// single-instance deployment with no chat-history requirement; production
/// deployments that need durable chat history should back `ChatSink` with a
/// real store.
#[derive(Default)]
pub struct LoggingChatSink;

#[async_trait]
impl ChatSink for LoggingChatSink {
    async fn persist(&self, room_id: &str, sender_handle: &str, content: &str) -> SyncResult<()> {
        log::info!("[Chat] {}/{}: {}", room_id, sender_handle, content);
        Ok(())
    }

    async fn record_analytics(&self, _room_id: &str, _sender_handle: &str) {}
}

pub struct ChatPipeline {
    store: Arc<dyn StateStore>,
    bus: Arc<dyn EventBus>,
    sink: Arc<dyn ChatSink>,
}

impl ChatPipeline {
    pub fn new(store: Arc<dyn StateStore>, bus: Arc<dyn EventBus>, sink: Arc<dyn ChatSink>) -> Self {
        Self { store, bus, sink }
    }

    /// `chat_message` (§4.G): requires a non-guest caller, enforces the
    /// sliding-window cap, persists, broadcasts, and fires the analytics
    /// hook without blocking on its result.
    pub async fn send(
        &self,
        room_id: &str,
        sender_role: Role,
        sender_handle: &str,
        content: &str,
    ) -> SyncResult<()> {
        if sender_role == Role::Guest {
            return Err(SyncError::GuestCannotChat);
        }
        if content.len() < CHAT_MESSAGE_MIN_LEN || content.len() > CHAT_MESSAGE_MAX_LEN {
            return Err(SyncError::Validation(format!(
                "content must be {}-{} chars",
                CHAT_MESSAGE_MIN_LEN, CHAT_MESSAGE_MAX_LEN
            )));
        }

        let within_quota = self
            .store
            .check_chat_rate_limit(
                room_id,
                sender_handle,
                DEFAULT_CHAT_RATE_LIMIT_MAX,
                DEFAULT_CHAT_RATE_LIMIT_WINDOW,
            )
            .await?;
        if !within_quota {
            return Err(SyncError::RateLimitExceeded);
        }

        self.sink.persist(room_id, sender_handle, content).await?;

        let message = ChatMessage {
            kind: "chat_message",
            sender_handle,
            content,
            sent_at_ms: now_ms(),
        };
        let payload = serde_json::to_string(&message)?;
        self.bus.publish(room_id, payload).await;

        // Non-blocking: a failed analytics write must never fail the send.
        self.sink.record_analytics(room_id, sender_handle).await;

        Ok(())
    }

    /// Emits an advisory `{kind, ...}` system notice with no content field
    /// and no rate limit (§4.G).
    pub async fn emit_system_event(&self, room_id: &str, kind: SystemEventKind) {
        let payload = serde_json::json!({ "kind": kind.as_str() }).to_string();
        self.bus.publish(room_id, payload).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalEventBus;
    use crate::state_store::MemoryStateStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopSink {
        analytics_calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatSink for NoopSink {
        async fn persist(&self, _room_id: &str, _sender_handle: &str, _content: &str) -> SyncResult<()> {
            Ok(())
        }
        async fn record_analytics(&self, _room_id: &str, _sender_handle: &str) {
            self.analytics_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pipeline() -> (ChatPipeline, Arc<NoopSink>) {
        let bus = Arc::new(LocalEventBus::new());
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new(bus.clone()));
        let sink = Arc::new(NoopSink {
            analytics_calls: AtomicUsize::new(0),
        });
        (ChatPipeline::new(store, bus, sink.clone()), sink)
    }

    #[tokio::test]
    async fn guest_cannot_chat() {
        let (pipeline, _sink) = pipeline();
        let err = pipeline
            .send("R1", Role::Guest, "g1", "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::GuestCannotChat));
    }

    #[tokio::test]
    async fn empty_content_is_rejected() {
        let (pipeline, _sink) = pipeline();
        let err = pipeline
            .send("R1", Role::Participant, "p1", "")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn successful_send_fires_analytics_hook() {
        let (pipeline, sink) = pipeline();
        pipeline.send("R1", Role::Participant, "p1", "hi").await.unwrap();
        assert_eq!(sink.analytics_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exceeding_rate_limit_does_not_broadcast() {
        let (pipeline, _sink) = pipeline();
        for _ in 0..DEFAULT_CHAT_RATE_LIMIT_MAX {
            pipeline.send("R1", Role::Participant, "p1", "hi").await.unwrap();
        }
        let err = pipeline
            .send("R1", Role::Participant, "p1", "one too many")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RateLimitExceeded));
    }
}
