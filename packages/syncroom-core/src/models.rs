//! Data model shared by every engine (component table §3).
//!
//! Names here are contract-level; the state store persists serialized forms
//! of most of these, the room/participant directory traits persist the rest.

use serde::{Deserialize, Serialize};

/// Playback-control policy for a room, decided by the external room CRUD
/// collaborator and consumed read-mostly by the session engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackControlPolicy {
    OwnerOnly,
    All,
    Selected,
}

/// A room as seen by the core. Owned by the external room CRUD collaborator;
/// the core consumes it read-mostly (§1, §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub room_id: String,
    pub code: String,
    pub name: String,
    pub capacity: u8,
    pub password_hash: Option<String>,
    pub playback_control: PlaybackControlPolicy,
    pub owner_id: Option<String>,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
}

/// Membership role within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Participant,
    Guest,
}

/// A membership record in a room (§3 Participant).
///
/// Invariant: `(room_id, participant_handle)` is unique; a user id appears at
/// most once per room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub room_id: String,
    pub participant_handle: String,
    pub user_id: Option<String>,
    pub display_name: String,
    pub role: Role,
    pub can_control: bool,
    pub joined_at_ms: u64,
}

/// Source type for the media currently assigned to a room's playback
/// snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Upload,
    Youtube,
    External,
}

/// The per-room authoritative playback state (§3 PlaybackSnapshot).
///
/// Exactly one snapshot exists per room; absence means "no media selected
/// yet". Mutated exclusively by the playback engine (component D).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackSnapshot {
    pub source_type: SourceType,
    pub source_id: String,
    pub is_playing: bool,
    pub playback_rate: f64,
    pub anchor_server_time_ms: u64,
    pub anchor_media_time_ms: u64,
    pub sequence_number: u64,
}

impl PlaybackSnapshot {
    /// The single most important equation in the system (§3 Derivation rule):
    /// current media position at wall-clock time `t_ms`.
    pub fn media_time_at(&self, t_ms: u64) -> u64 {
        if !self.is_playing {
            return self.anchor_media_time_ms;
        }
        let elapsed = t_ms.saturating_sub(self.anchor_server_time_ms) as f64;
        self.anchor_media_time_ms + (elapsed * self.playback_rate) as u64
    }

    /// Validation rules from §4.B: any violation means the stored payload (or
    /// a caller-constructed update) must be rejected with `InvalidState`.
    pub fn is_valid(&self) -> bool {
        self.playback_rate.is_finite()
            && self.playback_rate > 0.0
            && self.anchor_media_time_ms < u64::MAX
            && self.anchor_server_time_ms < u64::MAX
    }
}

/// A participant that has opted into the voice subchannel (§3 VoicePeer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoicePeer {
    pub participant_handle: String,
    pub is_speaking: bool,
    pub joined_at_ms: u64,
}

/// The kind of playback command broadcast to a room, carried alongside the
/// sequence number assigned when it was produced (§4.D, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncCommandType {
    Play,
    Pause,
    Seek,
    SetRate,
}

/// A derived event broadcast alongside a snapshot mutation, carrying only the
/// delta useful for direct client action (§4.D: "Command broadcasting is
/// distinct from snapshot setting").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncCommand {
    #[serde(rename = "type")]
    pub kind: SyncCommandType,
    pub at_server_time: u64,
    pub sequence_number: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_media_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(is_playing: bool, rate: f64, anchor_server: u64, anchor_media: u64) -> PlaybackSnapshot {
        PlaybackSnapshot {
            source_type: SourceType::Youtube,
            source_id: "abc".into(),
            is_playing,
            playback_rate: rate,
            anchor_server_time_ms: anchor_server,
            anchor_media_time_ms: anchor_media,
            sequence_number: 1,
        }
    }

    #[test]
    fn derivation_matches_anchor_at_anchor_time() {
        let s = snapshot(true, 1.0, 2000, 0);
        assert_eq!(s.media_time_at(2000), 0);
    }

    #[test]
    fn derivation_advances_linearly_while_playing() {
        let s = snapshot(true, 1.0, 2000, 0);
        assert_eq!(s.media_time_at(5000), 3000);
    }

    #[test]
    fn derivation_applies_rate_multiplier() {
        let s = snapshot(true, 1.5, 3000, 7000);
        assert_eq!(s.media_time_at(5000), 10000);
    }

    #[test]
    fn derivation_freezes_when_paused() {
        let s = snapshot(false, 1.0, 5000, 3000);
        assert_eq!(s.media_time_at(999_999), 3000);
    }

    #[test]
    fn invalid_rate_fails_validation() {
        let mut s = snapshot(true, 1.0, 0, 0);
        s.playback_rate = 0.0;
        assert!(!s.is_valid());
        s.playback_rate = f64::NAN;
        assert!(!s.is_valid());
    }
}
