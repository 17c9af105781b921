//! State store (component B): a typed interface over a Redis-compatible
//! key/value backend with sorted-set, set, string, and counter primitives and
//! key-level TTL.
//!
//! Keys are bit-exact per §4.B; see [`keys::KeyBuilder`]. The engines depend
//! on the [`StateStore`] trait rather than on Redis directly, so unit tests
//! run against [`MemoryStateStore`] without a live Redis instance.

mod keys;
mod memory;
mod redis_store;

pub use keys::KeyBuilder;
pub use memory::MemoryStateStore;
pub use redis_store::RedisStateStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::SyncResult;
use crate::models::{Participant, PlaybackSnapshot, VoicePeer};

/// Default TTL for room-scoped keys (§4.B, §6 `room_state_ttl_sec`).
pub const ROOM_STATE_TTL: Duration = Duration::from_secs(86_400);

/// Typed interface over the key/value backend (component B).
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Deserializes the stored snapshot. Fails with `InvalidState` if the
    /// stored payload does not validate.
    async fn get_snapshot(&self, room_id: &str) -> SyncResult<Option<PlaybackSnapshot>>;

    /// Validates `snapshot`, writes it unconditionally, refreshes its TTL,
    /// and publishes it on the room's events channel.
    async fn set_snapshot(&self, room_id: &str, snapshot: &PlaybackSnapshot) -> SyncResult<()>;

    /// Accepts the write iff `snapshot.sequence_number` is strictly greater
    /// than the currently stored sequence number, or no snapshot exists yet.
    /// Returns `false` without side effects otherwise.
    async fn update_snapshot(&self, room_id: &str, snapshot: &PlaybackSnapshot) -> SyncResult<bool>;

    /// Atomically increments the per-room sequence counter, setting its TTL
    /// on first use, and returns the new value.
    async fn increment_sequence(&self, room_id: &str) -> SyncResult<u64>;

    /// Adds a participant to the room's participant set. A duplicate add
    /// (same participant_handle) is a no-op.
    async fn add_participant(&self, room_id: &str, participant: &Participant) -> SyncResult<()>;

    async fn remove_participant(&self, room_id: &str, participant_handle: &str) -> SyncResult<()>;

    async fn list_participants(&self, room_id: &str) -> SyncResult<Vec<Participant>>;

    async fn add_online_socket(&self, room_id: &str, socket_id: &str) -> SyncResult<()>;

    async fn remove_online_socket(&self, room_id: &str, socket_id: &str) -> SyncResult<()>;

    async fn online_count(&self, room_id: &str) -> SyncResult<usize>;

    async fn add_voice_peer(&self, room_id: &str, peer: &VoicePeer) -> SyncResult<()>;

    async fn remove_voice_peer(&self, room_id: &str, participant_handle: &str) -> SyncResult<()>;

    async fn list_voice_peers(&self, room_id: &str) -> SyncResult<Vec<VoicePeer>>;

    async fn set_voice_speaking(
        &self,
        room_id: &str,
        participant_handle: &str,
        is_speaking: bool,
    ) -> SyncResult<()>;

    /// Checks and records one playback-command attempt for `participant_handle`
    /// against a fixed-window counter keyed via [`KeyBuilder::ratelimit`]
    /// (§4.E "Rate-limit on playback commands"). Returns whether the caller
    /// is still within quota (`true`) or over it (`false`).
    async fn check_command_rate_limit(
        &self,
        room_id: &str,
        participant_handle: &str,
        max: u64,
        window: Duration,
    ) -> SyncResult<bool>;

    /// Checks and records one chat-message attempt for `participant_handle`
    /// against a true sliding window keyed via [`KeyBuilder::chat_ratelimit`]
    /// (§4.G: chat rate limiting goes "via a sorted-set in the state store",
    /// distinct from the fixed-window counter used for playback commands).
    async fn check_chat_rate_limit(
        &self,
        room_id: &str,
        participant_handle: &str,
        max: u64,
        window: Duration,
    ) -> SyncResult<bool>;

    /// Deletes every key for `room_id` and unsubscribes local listeners.
    /// Idempotent: a second call is a no-op.
    async fn clear_room(&self, room_id: &str) -> SyncResult<()>;
}

#[cfg(test)]
mod trait_object_safety {
    use super::*;

    fn _assert_object_safe(_store: &dyn StateStore) {}
}
