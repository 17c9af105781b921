//! Centralized error types for the room coordination engine.
//!
//! This module defines the wire-facing error taxonomy: a single enum with one
//! variant per error code, a `code()` accessor returning the exact wire string,
//! and `From` conversions from lower-level errors so call sites can use `?`
//! throughout the engines and the gateway.

use serde::Serialize;
use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
pub trait ErrorCode {
    /// Returns the machine-readable code sent to clients on the wire.
    fn code(&self) -> &'static str;
}

/// Broad category used only for logging/metrics grouping. Never sent on the
/// wire - the wire only ever sees `{code, message}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Auth,
    NotFound,
    Policy,
    Validation,
    Throttling,
    Consistency,
    Transient,
    Critical,
}

/// Application-wide error type for the room coordination engine.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "code", content = "message")]
pub enum SyncError {
    /// Bearer credential missing or rejected at handshake.
    #[error("invalid authentication token")]
    InvalidToken,

    /// Operation requires privileges the caller does not have.
    #[error("unauthorized")]
    Unauthorized,

    /// Room code does not resolve to a live, unexpired room.
    #[error("room not found")]
    RoomNotFound,

    /// Room is already at capacity.
    #[error("room is full")]
    RoomFull,

    /// Caller is already a member of the room they tried to join.
    #[error("already in room")]
    AlreadyInRoom,

    /// Caller attempted a room-scoped operation while not in a room.
    #[error("not in room")]
    NotInRoom,

    /// Caller attempted voice:join while already a voice peer.
    #[error("already in voice")]
    AlreadyInVoice,

    /// Caller attempted a voice operation without having joined voice.
    #[error("not in voice")]
    NotInVoice,

    /// Guests are not permitted to send chat messages.
    #[error("guests cannot chat")]
    GuestCannotChat,

    /// Caller lacks the role/policy required for the attempted action.
    #[error("forbidden")]
    Forbidden,

    /// Malformed or out-of-range input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Room join supplied with a wrong or missing password.
    #[error("invalid password")]
    InvalidPassword,

    /// Voice signaling payload was malformed.
    #[error("invalid signal payload")]
    InvalidSignal,

    /// Sender exceeded a rate-limit quota.
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// CAS on the playback snapshot failed after the retry budget was spent.
    #[error("conflicting update, retries exceeded")]
    ConflictExceeded,

    /// State store or event bus failure; caller should retry.
    #[error("internal error: {0}")]
    Internal(String),

    /// No playback snapshot exists yet for a room whose caller sent a
    /// mutating playback command.
    #[error("no playback state")]
    NoPlaybackState,

    /// Stored payload failed validation on read or write.
    #[error("invalid stored state: {0}")]
    InvalidState(String),
}

impl ErrorCode for SyncError {
    fn code(&self) -> &'static str {
        match self {
            Self::InvalidToken => "INVALID_TOKEN",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::RoomNotFound => "ROOM_NOT_FOUND",
            Self::RoomFull => "ROOM_FULL",
            Self::AlreadyInRoom => "ALREADY_IN_ROOM",
            Self::NotInRoom => "NOT_IN_ROOM",
            Self::AlreadyInVoice => "ALREADY_IN_VOICE",
            Self::NotInVoice => "NOT_IN_VOICE",
            Self::GuestCannotChat => "GUEST_CANNOT_CHAT",
            Self::Forbidden => "FORBIDDEN",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InvalidPassword => "INVALID_PASSWORD",
            Self::InvalidSignal => "INVALID_SIGNAL",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::ConflictExceeded => "CONFLICT_EXCEEDED",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::NoPlaybackState => "INTERNAL_ERROR",
            Self::InvalidState(_) => "INTERNAL_ERROR",
        }
    }
}

impl SyncError {
    /// Broad category, used for logging/metrics only.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidToken | Self::Unauthorized => ErrorCategory::Auth,
            Self::RoomNotFound => ErrorCategory::NotFound,
            Self::RoomFull
            | Self::AlreadyInRoom
            | Self::NotInRoom
            | Self::AlreadyInVoice
            | Self::NotInVoice
            | Self::GuestCannotChat
            | Self::Forbidden => ErrorCategory::Policy,
            Self::Validation(_) | Self::InvalidPassword | Self::InvalidSignal => {
                ErrorCategory::Validation
            }
            Self::RateLimitExceeded => ErrorCategory::Throttling,
            Self::ConflictExceeded => ErrorCategory::Consistency,
            Self::Internal(_) | Self::NoPlaybackState | Self::InvalidState(_) => {
                ErrorCategory::Transient
            }
        }
    }

    /// True if the offending connection should be closed rather than just
    /// replied to (per the §7 propagation policy, only auth-handshake and
    /// critical failures close the connection).
    pub fn closes_connection(&self) -> bool {
        matches!(self, Self::InvalidToken | Self::Unauthorized)
    }
}

/// Convenient Result alias for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Wire envelope for error replies: `{code, message}`.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub code: &'static str,
    pub message: String,
}

impl From<&SyncError> for ErrorEnvelope {
    fn from(err: &SyncError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<redis::RedisError> for SyncError {
    fn from(err: redis::RedisError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidState(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_full_returns_policy_code() {
        let err = SyncError::RoomFull;
        assert_eq!(err.code(), "ROOM_FULL");
        assert_eq!(err.category(), ErrorCategory::Policy);
        assert!(!err.closes_connection());
    }

    #[test]
    fn invalid_token_closes_connection() {
        let err = SyncError::InvalidToken;
        assert_eq!(err.code(), "INVALID_TOKEN");
        assert!(err.closes_connection());
    }

    #[test]
    fn validation_error_carries_detail_in_message() {
        let err = SyncError::Validation("target_media_time must be >= 0".into());
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(err.to_string().contains("target_media_time"));
    }

    #[test]
    fn no_playback_state_maps_to_internal_error_wire_code() {
        let err = SyncError::NoPlaybackState;
        assert_eq!(err.code(), "INTERNAL_ERROR");
    }

    #[test]
    fn envelope_preserves_code_and_message() {
        let err = SyncError::RateLimitExceeded;
        let envelope = ErrorEnvelope::from(&err);
        assert_eq!(envelope.code, "RATE_LIMIT_EXCEEDED");
        assert_eq!(envelope.message, err.to_string());
    }
}
