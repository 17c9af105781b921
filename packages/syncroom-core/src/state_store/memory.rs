//! In-memory [`StateStore`] fake used by engine unit tests so engine logic
//! runs without a live Redis instance (§10.5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::StateStore;
use crate::bus::EventBus;
use crate::clock::now_ms;
use crate::error::SyncResult;
use crate::models::{Participant, PlaybackSnapshot, VoicePeer};

#[derive(Default)]
struct RoomState {
    snapshot: Option<PlaybackSnapshot>,
    sequence: u64,
    participants: HashMap<String, Participant>,
    online: std::collections::HashSet<String>,
    voice: HashMap<String, VoicePeer>,
    command_rate_limits: HashMap<String, u64>,
    chat_rate_limits: HashMap<String, Vec<u64>>,
}

/// Single-process, non-persistent [`StateStore`] backed by a mutex-guarded
/// map. Mirrors the production `RedisStateStore`'s semantics (CAS on
/// `update_snapshot`, no-op duplicate adds) without any external dependency.
pub struct MemoryStateStore {
    rooms: Mutex<HashMap<String, RoomState>>,
    bus: Arc<dyn EventBus>,
}

impl MemoryStateStore {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            bus,
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get_snapshot(&self, room_id: &str) -> SyncResult<Option<PlaybackSnapshot>> {
        Ok(self
            .rooms
            .lock()
            .get(room_id)
            .and_then(|r| r.snapshot.clone()))
    }

    async fn set_snapshot(&self, room_id: &str, snapshot: &PlaybackSnapshot) -> SyncResult<()> {
        self.rooms
            .lock()
            .entry(room_id.to_string())
            .or_default()
            .snapshot = Some(snapshot.clone());
        let payload = serde_json::to_string(snapshot)?;
        self.bus.publish(room_id, payload).await;
        Ok(())
    }

    async fn update_snapshot(&self, room_id: &str, snapshot: &PlaybackSnapshot) -> SyncResult<bool> {
        let accepted = {
            let mut rooms = self.rooms.lock();
            let room = rooms.entry(room_id.to_string()).or_default();
            let accepted = match &room.snapshot {
                None => true,
                Some(current) => snapshot.sequence_number > current.sequence_number,
            };
            if accepted {
                room.snapshot = Some(snapshot.clone());
            }
            accepted
        };
        if accepted {
            let payload = serde_json::to_string(snapshot)?;
            self.bus.publish(room_id, payload).await;
        }
        Ok(accepted)
    }

    async fn increment_sequence(&self, room_id: &str) -> SyncResult<u64> {
        let mut rooms = self.rooms.lock();
        let room = rooms.entry(room_id.to_string()).or_default();
        room.sequence += 1;
        Ok(room.sequence)
    }

    async fn add_participant(&self, room_id: &str, participant: &Participant) -> SyncResult<()> {
        self.rooms
            .lock()
            .entry(room_id.to_string())
            .or_default()
            .participants
            .entry(participant.participant_handle.clone())
            .or_insert_with(|| participant.clone());
        Ok(())
    }

    async fn remove_participant(&self, room_id: &str, participant_handle: &str) -> SyncResult<()> {
        if let Some(room) = self.rooms.lock().get_mut(room_id) {
            room.participants.remove(participant_handle);
        }
        Ok(())
    }

    async fn list_participants(&self, room_id: &str) -> SyncResult<Vec<Participant>> {
        Ok(self
            .rooms
            .lock()
            .get(room_id)
            .map(|r| r.participants.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_online_socket(&self, room_id: &str, socket_id: &str) -> SyncResult<()> {
        self.rooms
            .lock()
            .entry(room_id.to_string())
            .or_default()
            .online
            .insert(socket_id.to_string());
        Ok(())
    }

    async fn remove_online_socket(&self, room_id: &str, socket_id: &str) -> SyncResult<()> {
        if let Some(room) = self.rooms.lock().get_mut(room_id) {
            room.online.remove(socket_id);
        }
        Ok(())
    }

    async fn online_count(&self, room_id: &str) -> SyncResult<usize> {
        Ok(self
            .rooms
            .lock()
            .get(room_id)
            .map(|r| r.online.len())
            .unwrap_or(0))
    }

    async fn add_voice_peer(&self, room_id: &str, peer: &VoicePeer) -> SyncResult<()> {
        self.rooms
            .lock()
            .entry(room_id.to_string())
            .or_default()
            .voice
            .insert(peer.participant_handle.clone(), peer.clone());
        Ok(())
    }

    async fn remove_voice_peer(&self, room_id: &str, participant_handle: &str) -> SyncResult<()> {
        if let Some(room) = self.rooms.lock().get_mut(room_id) {
            room.voice.remove(participant_handle);
        }
        Ok(())
    }

    async fn list_voice_peers(&self, room_id: &str) -> SyncResult<Vec<VoicePeer>> {
        Ok(self
            .rooms
            .lock()
            .get(room_id)
            .map(|r| r.voice.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_voice_speaking(
        &self,
        room_id: &str,
        participant_handle: &str,
        is_speaking: bool,
    ) -> SyncResult<()> {
        if let Some(room) = self.rooms.lock().get_mut(room_id) {
            if let Some(peer) = room.voice.get_mut(participant_handle) {
                peer.is_speaking = is_speaking;
            }
        }
        Ok(())
    }

    async fn check_command_rate_limit(
        &self,
        room_id: &str,
        participant_handle: &str,
        max: u64,
        _window: Duration,
    ) -> SyncResult<bool> {
        // Fixed-window counter that never resets; this fake does not model
        // TTL expiry. Tests that need window-rollover behavior should drive
        // the Redis-backed store.
        let mut rooms = self.rooms.lock();
        let room = rooms.entry(room_id.to_string()).or_default();
        let count = room
            .command_rate_limits
            .entry(participant_handle.to_string())
            .or_insert(0);
        *count += 1;
        Ok(*count <= max)
    }

    async fn check_chat_rate_limit(
        &self,
        room_id: &str,
        participant_handle: &str,
        max: u64,
        window: Duration,
    ) -> SyncResult<bool> {
        let now = now_ms();
        let cutoff = now.saturating_sub(window.as_millis() as u64);
        let mut rooms = self.rooms.lock();
        let room = rooms.entry(room_id.to_string()).or_default();
        let entries = room
            .chat_rate_limits
            .entry(participant_handle.to_string())
            .or_default();
        entries.retain(|&t| t > cutoff);
        if entries.len() as u64 >= max {
            return Ok(false);
        }
        entries.push(now);
        Ok(true)
    }

    async fn clear_room(&self, room_id: &str) -> SyncResult<()> {
        self.rooms.lock().remove(room_id);
        self.bus.forget_room(room_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalEventBus;
    use crate::models::{SourceType};

    fn store() -> MemoryStateStore {
        MemoryStateStore::new(Arc::new(LocalEventBus::new()))
    }

    fn snapshot(seq: u64) -> PlaybackSnapshot {
        PlaybackSnapshot {
            source_type: SourceType::Youtube,
            source_id: "abc".into(),
            is_playing: false,
            playback_rate: 1.0,
            anchor_server_time_ms: 0,
            anchor_media_time_ms: 0,
            sequence_number: seq,
        }
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = store();
        let s = snapshot(0);
        store.set_snapshot("R1", &s).await.unwrap();
        let got = store.get_snapshot("R1").await.unwrap();
        assert_eq!(got, Some(s));
    }

    #[tokio::test]
    async fn update_snapshot_rejects_non_increasing_sequence() {
        let store = store();
        store.set_snapshot("R1", &snapshot(5)).await.unwrap();
        let accepted = store.update_snapshot("R1", &snapshot(5)).await.unwrap();
        assert!(!accepted);
        let accepted = store.update_snapshot("R1", &snapshot(6)).await.unwrap();
        assert!(accepted);
    }

    #[tokio::test]
    async fn increment_sequence_k_times_equals_initial_plus_k() {
        let store = store();
        for _ in 0..5 {
            store.increment_sequence("R1").await.unwrap();
        }
        let n = store.increment_sequence("R1").await.unwrap();
        assert_eq!(n, 6);
    }

    #[tokio::test]
    async fn duplicate_add_participant_is_a_no_op() {
        let store = store();
        let p = Participant {
            room_id: "R1".into(),
            participant_handle: "abcdefghij".into(),
            user_id: None,
            display_name: "Alice".into(),
            role: crate::models::Role::Owner,
            can_control: true,
            joined_at_ms: 0,
        };
        store.add_participant("R1", &p).await.unwrap();
        store.add_participant("R1", &p).await.unwrap();
        let list = store.list_participants("R1").await.unwrap();
        assert_eq!(list.len(), 1);
    }

    #[tokio::test]
    async fn clear_room_twice_is_idempotent() {
        let store = store();
        store.set_snapshot("R1", &snapshot(0)).await.unwrap();
        store.clear_room("R1").await.unwrap();
        store.clear_room("R1").await.unwrap();
        assert_eq!(store.get_snapshot("R1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn online_count_tracks_add_and_remove() {
        let store = store();
        store.add_online_socket("R1", "s1").await.unwrap();
        store.add_online_socket("R1", "s2").await.unwrap();
        assert_eq!(store.online_count("R1").await.unwrap(), 2);
        store.remove_online_socket("R1", "s1").await.unwrap();
        assert_eq!(store.online_count("R1").await.unwrap(), 1);
    }
}
