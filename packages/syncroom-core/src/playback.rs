//! Playback engine (component D): holds per-room authority over the
//! `PlaybackSnapshot`, accepts commands, assigns sequence numbers, publishes.
//!
//! Every mutating operation follows the same shape (§4.D): validate, load
//! current snapshot, increment sequence, construct the new snapshot, CAS it
//! in with bounded retry, then emit the derived `SyncCommand`. Retries mirror
//! the graceful-degradation style used throughout the teacher's sync-group
//! manager - log and retry rather than aborting outright, up to a bound.

use std::sync::Arc;
use std::time::Duration;

use crate::bus::EventBus;
use crate::clock::{clamp_to_window, now_ms};
use crate::error::{SyncError, SyncResult};
use crate::models::{PlaybackSnapshot, SourceType, SyncCommand, SyncCommandType};
use crate::state_store::StateStore;

/// Maximum number of CAS retries before an operation gives up with
/// `ConflictExceeded` (§4.D step 5, §5 "at most 3 attempts").
const MAX_CAS_RETRIES: u32 = 3;

/// Window around `now_ms()` that a client-supplied `at_server_time` is
/// truncated into, bounding clock misalignment (§4.D edge policy).
const CLOCK_SKEW_WINDOW_MS: u64 = 5_000;

/// Minimum and maximum accepted `playback_rate` (§3, §6).
pub const RATE_MIN: f64 = 0.1;
pub const RATE_MAX: f64 = 4.0;

pub struct PlaybackEngine {
    store: Arc<dyn StateStore>,
    bus: Arc<dyn EventBus>,
}

impl PlaybackEngine {
    pub fn new(store: Arc<dyn StateStore>, bus: Arc<dyn EventBus>) -> Self {
        Self { store, bus }
    }

    fn resolve_at_server_time(at_server_time: Option<u64>) -> u64 {
        match at_server_time {
            Some(t) => clamp_to_window(t, CLOCK_SKEW_WINDOW_MS),
            None => now_ms(),
        }
    }

    /// Sets the first snapshot for a room (external source-selection path,
    /// §4.D "Source selection" / §9 Open Question 1 resolution). Not exposed
    /// on the wire protocol - called by whatever external collaborator
    /// assigns a room its media source.
    pub async fn select_source(
        &self,
        room_id: &str,
        source_type: SourceType,
        source_id: String,
    ) -> SyncResult<PlaybackSnapshot> {
        let snapshot = PlaybackSnapshot {
            source_type,
            source_id,
            is_playing: false,
            playback_rate: 1.0,
            anchor_server_time_ms: now_ms(),
            anchor_media_time_ms: 0,
            sequence_number: 0,
        };
        self.store.set_snapshot(room_id, &snapshot).await?;
        Ok(snapshot)
    }

    pub async fn play(&self, room_id: &str, at_server_time: Option<u64>) -> SyncResult<SyncCommand> {
        let at = Self::resolve_at_server_time(at_server_time);
        self.mutate(room_id, |current| {
            let mut next = current.clone();
            next.is_playing = true;
            next.anchor_server_time_ms = at;
            (next, SyncCommandType::Play, None, None)
        })
        .await
    }

    pub async fn pause(&self, room_id: &str, at_server_time: Option<u64>) -> SyncResult<SyncCommand> {
        let at = Self::resolve_at_server_time(at_server_time);
        self.mutate(room_id, |current| {
            let media_time = current.media_time_at(at);
            let mut next = current.clone();
            next.anchor_media_time_ms = media_time;
            next.is_playing = false;
            next.anchor_server_time_ms = at;
            (next, SyncCommandType::Pause, None, None)
        })
        .await
    }

    pub async fn seek(
        &self,
        room_id: &str,
        target_media_ms: u64,
        at_server_time: Option<u64>,
    ) -> SyncResult<SyncCommand> {
        let at = Self::resolve_at_server_time(at_server_time);
        self.mutate(room_id, move |current| {
            let mut next = current.clone();
            next.anchor_media_time_ms = target_media_ms;
            next.anchor_server_time_ms = at;
            (next, SyncCommandType::Seek, Some(target_media_ms), None)
        })
        .await
    }

    pub async fn set_rate(
        &self,
        room_id: &str,
        rate: f64,
        at_server_time: Option<u64>,
    ) -> SyncResult<SyncCommand> {
        if !(RATE_MIN..=RATE_MAX).contains(&rate) {
            return Err(SyncError::Validation(format!(
                "rate must be in [{}, {}]",
                RATE_MIN, RATE_MAX
            )));
        }
        let at = Self::resolve_at_server_time(at_server_time);
        self.mutate(room_id, move |current| {
            let media_time = current.media_time_at(at);
            let mut next = current.clone();
            next.anchor_media_time_ms = media_time;
            next.playback_rate = rate;
            next.anchor_server_time_ms = at;
            (next, SyncCommandType::SetRate, None, Some(rate))
        })
        .await
    }

    /// Returns the current snapshot to the caller only; does not mutate or
    /// broadcast (§4.D `resync`).
    pub async fn resync(&self, room_id: &str) -> SyncResult<PlaybackSnapshot> {
        self.store
            .get_snapshot(room_id)
            .await?
            .ok_or(SyncError::NoPlaybackState)
    }

    /// Shared retry loop for play/pause/seek/set_rate: loads the current
    /// snapshot, applies `build_next`, and CASes it in, retrying with the
    /// freshly observed snapshot on a lost race.
    async fn mutate(
        &self,
        room_id: &str,
        build_next: impl Fn(&PlaybackSnapshot) -> (PlaybackSnapshot, SyncCommandType, Option<u64>, Option<f64>),
    ) -> SyncResult<SyncCommand> {
        for _attempt in 0..=MAX_CAS_RETRIES {
            let current = self
                .store
                .get_snapshot(room_id)
                .await?
                .ok_or(SyncError::NoPlaybackState)?;

            let next_sequence = self.store.increment_sequence(room_id).await?;
            let (mut next, kind, target_media_time, rate) = build_next(&current);
            next.sequence_number = next_sequence;

            if self.store.update_snapshot(room_id, &next).await? {
                let command = SyncCommand {
                    kind,
                    at_server_time: next.anchor_server_time_ms,
                    sequence_number: next.sequence_number,
                    target_media_time,
                    rate,
                };
                let payload = serde_json::to_string(&command)?;
                self.bus.publish(room_id, payload).await;
                return Ok(command);
            }

            log::warn!(
                "[Playback] update_snapshot lost the race for room {} at sequence {}, retrying",
                room_id,
                next_sequence
            );
        }
        Err(SyncError::ConflictExceeded)
    }
}

/// Timeout applied to every state-store call from the playback engine
/// (§5 Cancellation & timeouts, recommended 2s).
pub const STATE_STORE_CALL_TIMEOUT: Duration = Duration::from_secs(2);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalEventBus;
    use crate::state_store::MemoryStateStore;

    fn engine() -> (PlaybackEngine, Arc<dyn StateStore>) {
        let bus = Arc::new(LocalEventBus::new());
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new(bus.clone()));
        (PlaybackEngine::new(store.clone(), bus), store)
    }

    #[tokio::test]
    async fn play_without_snapshot_fails_with_no_playback_state() {
        let (engine, _store) = engine();
        let err = engine.play("R1", Some(2000)).await.unwrap_err();
        assert!(matches!(err, SyncError::NoPlaybackState));
    }

    #[tokio::test]
    async fn scenario_basic_play_through() {
        let (engine, store) = engine();
        engine
            .select_source("R1", SourceType::Youtube, "abc".into())
            .await
            .unwrap();

        let cmd = engine.play("R1", Some(2000)).await.unwrap();
        assert_eq!(cmd.kind, SyncCommandType::Play);
        assert_eq!(cmd.sequence_number, 1);

        let snapshot = store.get_snapshot("R1").await.unwrap().unwrap();
        assert!(snapshot.is_playing);
        assert_eq!(snapshot.anchor_server_time_ms, 2000);
        assert_eq!(snapshot.media_time_at(5000), 3000);
    }

    #[tokio::test]
    async fn scenario_pause_preserves_position() {
        let (engine, store) = engine();
        engine
            .select_source("R1", SourceType::Youtube, "abc".into())
            .await
            .unwrap();
        engine.play("R1", Some(2000)).await.unwrap();

        engine.pause("R1", Some(5000)).await.unwrap();
        let snapshot = store.get_snapshot("R1").await.unwrap().unwrap();
        assert!(!snapshot.is_playing);
        assert_eq!(snapshot.anchor_media_time_ms, 3000);

        let resynced = engine.resync("R1").await.unwrap();
        assert_eq!(resynced.anchor_media_time_ms, 3000);
    }

    #[tokio::test]
    async fn scenario_rate_change_recomputes_position() {
        let (engine, store) = engine();
        engine
            .select_source("R1", SourceType::Youtube, "abc".into())
            .await
            .unwrap();
        engine.play("R1", Some(1000)).await.unwrap();

        engine.set_rate("R1", 1.5, Some(3000)).await.unwrap();
        let snapshot = store.get_snapshot("R1").await.unwrap().unwrap();
        assert_eq!(snapshot.anchor_media_time_ms, 2000);
        assert_eq!(snapshot.playback_rate, 1.5);
        assert_eq!(snapshot.media_time_at(5000), 5000);
    }

    #[tokio::test]
    async fn seek_zero_is_accepted() {
        let (engine, _store) = engine();
        engine
            .select_source("R1", SourceType::Youtube, "abc".into())
            .await
            .unwrap();
        let cmd = engine.seek("R1", 0, Some(1000)).await.unwrap();
        assert_eq!(cmd.target_media_time, Some(0));
    }

    #[tokio::test]
    async fn rate_boundaries_accepted_outside_rejected() {
        let (engine, _store) = engine();
        engine
            .select_source("R1", SourceType::Youtube, "abc".into())
            .await
            .unwrap();
        assert!(engine.set_rate("R1", RATE_MIN, None).await.is_ok());
        assert!(engine.set_rate("R1", RATE_MAX, None).await.is_ok());
        assert!(matches!(
            engine.set_rate("R1", 0.05, None).await.unwrap_err(),
            SyncError::Validation(_)
        ));
        assert!(matches!(
            engine.set_rate("R1", 4.1, None).await.unwrap_err(),
            SyncError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn sequence_number_strictly_increases_across_commands() {
        let (engine, _store) = engine();
        engine
            .select_source("R1", SourceType::Youtube, "abc".into())
            .await
            .unwrap();
        let a = engine.play("R1", Some(1000)).await.unwrap();
        let b = engine.pause("R1", Some(2000)).await.unwrap();
        let c = engine.seek("R1", 500, Some(3000)).await.unwrap();
        assert!(a.sequence_number < b.sequence_number);
        assert!(b.sequence_number < c.sequence_number);
    }
}
