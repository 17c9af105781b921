//! Application bootstrap and dependency wiring (component L).
//!
//! This module contains the composition root - the single place where all
//! services are instantiated and wired together. This pattern provides:
//!
//! - **Clarity**: All dependency relationships are visible in one place
//! - **Testability**: Easy to swap implementations for testing
//! - **Maintainability**: Service creation logic is isolated from usage

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::{AppState, Authenticator, PassthroughAuthenticator, WsConnectionManager};
use crate::bus::{EventBus, LocalEventBus, RedisEventBus};
use crate::chat::{ChatPipeline, ChatSink, LoggingChatSink};
use crate::error::{SyncError, SyncResult};
use crate::playback::PlaybackEngine;
use crate::session::{
    InMemoryParticipantRegistry, InMemoryRoomDirectory, ParticipantRegistry, RoomDirectory,
    SessionEngine,
};
use crate::state_store::{MemoryStateStore, RedisStateStore, StateStore};
use crate::voice::VoiceRelay;

/// External collaborators the embedding application may supply. Each
/// defaults to the minimal in-process reference implementation described in
/// §10.4 when omitted, which is not horizontally-scalable.
#[derive(Default)]
pub struct Collaborators {
    pub rooms: Option<Arc<dyn RoomDirectory>>,
    pub participants: Option<Arc<dyn ParticipantRegistry>>,
    pub chat_sink: Option<Arc<dyn ChatSink>>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
}

/// Container for all bootstrapped services. Consumed to build `AppState` and
/// to drive graceful shutdown.
#[derive(Clone)]
pub struct BootstrappedServices {
    // Debug is implemented manually below (fields hold `Arc<dyn Trait>`s
    // that don't implement Debug).
    pub store: Arc<dyn StateStore>,
    pub bus: Arc<dyn EventBus>,
    pub playback: Arc<PlaybackEngine>,
    pub session: Arc<SessionEngine>,
    pub voice: Arc<VoiceRelay>,
    pub chat: Arc<ChatPipeline>,
    pub authenticator: Arc<dyn Authenticator>,
    pub ws_manager: Arc<WsConnectionManager>,
    pub cancel_token: CancellationToken,
}

impl std::fmt::Debug for BootstrappedServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrappedServices").finish_non_exhaustive()
    }
}

impl BootstrappedServices {
    /// Builds the shared Gateway application state (step 7 of §10.4).
    pub fn app_state(&self, ping_timeout_ms: u64, ping_interval_ms: u64) -> AppState {
        AppState {
            store: self.store.clone(),
            bus: self.bus.clone(),
            playback: self.playback.clone(),
            session: self.session.clone(),
            voice: self.voice.clone(),
            chat: self.chat.clone(),
            authenticator: self.authenticator.clone(),
            ws_manager: self.ws_manager.clone(),
            shutdown: self.cancel_token.clone(),
            ping_timeout_ms,
            ping_interval_ms,
        }
    }

    /// Initiates graceful shutdown: cancels the root token (stopping the
    /// Redis pub/sub relay task and every in-flight connection's select
    /// loop).
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] Beginning graceful shutdown...");
        self.cancel_token.cancel();
        log::info!("[Bootstrap] Shutdown complete");
    }
}

/// Bootstraps all application services with their dependencies (§10.4).
///
/// Wiring order:
/// 1. State-store client (Redis connection/pool, or an in-process fake).
/// 2. Event bus (local broadcast registry, optionally bridged to Redis
///    pub/sub for horizontal scaling).
/// 3. Clock service - stateless, no wiring needed beyond the free functions
///    in [`crate::clock`].
/// 4. Playback engine (depends on 1, 2, 3).
/// 5. Session engine (depends on 1, 2, a `RoomDirectory`/`ParticipantRegistry`
///    pair).
/// 6. Voice relay and chat pipeline (depend on 1, 2, 5).
/// 7. The shared Gateway application state aggregating all of the above -
///    built lazily via [`BootstrappedServices::app_state`], since it also
///    needs transport-level settings (`ping_timeout_ms`, `ping_interval_ms`)
///    that are not part of service wiring.
///
/// # Errors
/// Returns an error if a Redis URL is configured but the client or initial
/// connection cannot be established.
pub async fn bootstrap_services(
    redis_url: Option<&str>,
    key_prefix: &str,
    collaborators: Collaborators,
) -> SyncResult<BootstrappedServices> {
    let cancel_token = CancellationToken::new();

    // 1 + 2: state store and event bus share a backend choice. A configured
    // Redis URL gets both a pooled store and a cross-instance bus relay; its
    // absence degrades to single-instance, in-process fakes.
    let local_bus = Arc::new(LocalEventBus::new());
    let (store, bus): (Arc<dyn StateStore>, Arc<dyn EventBus>) = match redis_url {
        Some(url) => {
            let client = redis::Client::open(url)
                .map_err(|err| SyncError::Internal(format!("invalid redis url: {}", err)))?;
            let redis_bus = Arc::new(RedisEventBus::new(local_bus.clone(), client));
            redis_bus.spawn_relay(cancel_token.clone());
            let store = Arc::new(
                RedisStateStore::connect(url, key_prefix.to_string(), local_bus.clone()).await?,
            );
            (store, redis_bus as Arc<dyn EventBus>)
        }
        None => {
            log::warn!(
                "[Bootstrap] No redis_url configured, running single-instance with in-memory state"
            );
            let store = Arc::new(MemoryStateStore::new(local_bus.clone()));
            (store, local_bus.clone() as Arc<dyn EventBus>)
        }
    };

    // 3: clock service is stateless (crate::clock free functions).

    // 4: playback engine.
    let playback = Arc::new(PlaybackEngine::new(store.clone(), bus.clone()));

    // 5: session engine, with collaborator defaults per §10.4.
    let rooms = collaborators
        .rooms
        .unwrap_or_else(|| Arc::new(InMemoryRoomDirectory::new()));
    let participants = collaborators
        .participants
        .unwrap_or_else(|| Arc::new(InMemoryParticipantRegistry::new()));
    let session = Arc::new(SessionEngine::new(
        rooms,
        participants,
        store.clone(),
        bus.clone(),
    ));

    // 6: voice relay and chat pipeline.
    let voice = Arc::new(VoiceRelay::new(store.clone(), bus.clone()));
    let chat_sink = collaborators
        .chat_sink
        .unwrap_or_else(|| Arc::new(LoggingChatSink));
    let chat = Arc::new(ChatPipeline::new(store.clone(), bus.clone(), chat_sink));

    let authenticator = collaborators
        .authenticator
        .unwrap_or_else(|| Arc::new(PassthroughAuthenticator));

    Ok(BootstrappedServices {
        store,
        bus,
        playback,
        session,
        voice,
        chat,
        authenticator,
        ws_manager: Arc::new(WsConnectionManager::new()),
        cancel_token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bootstrap_without_redis_url_uses_in_memory_backend() {
        let services = bootstrap_services(None, "syncroom:", Collaborators::default())
            .await
            .unwrap();
        let state = services.app_state(10_000, 25_000);
        assert!(!state.shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn bootstrap_rejects_malformed_redis_url() {
        let err = bootstrap_services(Some("not-a-url"), "syncroom:", Collaborators::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Internal(_)));
    }

    #[tokio::test]
    async fn shutdown_cancels_the_root_token() {
        let services = bootstrap_services(None, "syncroom:", Collaborators::default())
            .await
            .unwrap();
        let token = services.cancel_token.clone();
        services.shutdown().await;
        assert!(token.is_cancelled());
    }
}
