//! Syncroom Core - shared library for the synchronized watch-room server.
//!
//! This crate provides the room-coordination engine used by the standalone
//! gateway binary: authoritative playback state, participant/session
//! lifecycle, voice-signaling relay, and chat, all addressable over a single
//! WebSocket endpoint per room.
//!
//! # Architecture
//!
//! The crate is organized into the components described in the design
//! document, each its own module:
//!
//! - [`clock`]: monotonic server clock and clock-skew clamping (component A)
//! - [`state_store`]: typed interface over the Redis-compatible backend (component B)
//! - [`bus`]: pub/sub event bus, keyed by room (component C)
//! - [`models`]: wire/storage types shared across engines (component D)
//! - [`playback`]: authoritative playback-state machine (component D)
//! - [`session`]: socket lifecycle - join/leave/capacity/role (component E)
//! - [`voice`]: WebRTC-style signaling relay (component F)
//! - [`chat`]: rate-limited chat and system-event broadcasts (component G)
//! - [`api`]: the WebSocket gateway, router, and shared app state (component I)
//! - [`bootstrap`]: composition root wiring all of the above (component L)
//! - [`error`]: centralized error types and wire error envelope
//!
//! # Abstraction traits
//!
//! External collaborators are seamed behind traits so the engines are
//! testable without a live Redis instance or a real database:
//!
//! - [`state_store::StateStore`]: the key/value backend
//! - [`bus::EventBus`]: cross-instance pub/sub
//! - [`session::RoomDirectory`] / [`session::ParticipantRegistry`]: room and
//!   participant CRUD
//! - [`chat::ChatSink`]: chat persistence and analytics
//! - [`api::Authenticator`]: bearer-credential resolution
//!
//! Each trait ships a minimal in-process reference implementation suitable
//! for a single-instance deployment; [`bootstrap::bootstrap_services`] wires
//! the production Redis-backed versions by default.

#![warn(clippy::all)]

pub mod api;
pub mod bootstrap;
pub mod bus;
pub mod chat;
pub mod clock;
pub mod error;
pub mod models;
pub mod playback;
pub mod session;
pub mod state_store;
pub mod voice;

pub use api::{start_server, AppState, Authenticator, AuthContext, PassthroughAuthenticator, ServerError, WsConnectionManager};
pub use bootstrap::{bootstrap_services, BootstrappedServices, Collaborators};
pub use bus::{BusMessage, EventBus, LocalEventBus, RedisEventBus};
pub use chat::{ChatPipeline, ChatSink, LoggingChatSink, SystemEventKind};
pub use clock::{clamp_to_window, now_ms, Monotonic};
pub use error::{ErrorEnvelope, SyncError, SyncResult};
pub use models::{
    Participant, PlaybackControlPolicy, PlaybackSnapshot, Role, Room, SourceType, SyncCommand,
    SyncCommandType, VoicePeer,
};
pub use playback::PlaybackEngine;
pub use session::{
    InMemoryParticipantRegistry, InMemoryRoomDirectory, JoinOutcome, ParticipantRegistry,
    RoomDirectory, SessionEngine,
};
pub use state_store::{KeyBuilder, MemoryStateStore, RedisStateStore, StateStore};
pub use voice::{Signal, VoiceRelay};
