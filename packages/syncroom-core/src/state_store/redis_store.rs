//! Production [`StateStore`] backed by Redis (§4.B, §10.3).
//!
//! The playback snapshot is stored as a hash with two fields (`seq`, `data`)
//! rather than a single JSON blob so that `update_snapshot`'s compare-and-set
//! can compare sequence numbers inside a Lua script without decoding the
//! full payload there.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{KeyBuilder, StateStore, ROOM_STATE_TTL};
use crate::bus::EventBus;
use crate::clock::now_ms;
use crate::error::{SyncError, SyncResult};
use crate::models::{Participant, PlaybackSnapshot, VoicePeer};

/// Lua script implementing the CAS in `update_snapshot`. Returns 1 if the
/// write was accepted, 0 if a sequence number already present is `>=` the
/// candidate's.
const UPDATE_SNAPSHOT_SCRIPT: &str = r#"
local cur_seq = redis.call('HGET', KEYS[1], 'seq')
if cur_seq and tonumber(cur_seq) >= tonumber(ARGV[1]) then
  return 0
end
redis.call('HSET', KEYS[1], 'seq', ARGV[1], 'data', ARGV[2])
redis.call('EXPIRE', KEYS[1], ARGV[3])
return 1
"#;

pub struct RedisStateStore {
    conn: ConnectionManager,
    keys: KeyBuilder,
    bus: Arc<dyn EventBus>,
    ttl: Duration,
}

impl RedisStateStore {
    pub async fn connect(
        redis_url: &str,
        prefix: impl Into<String>,
        bus: Arc<dyn EventBus>,
    ) -> SyncResult<Self> {
        let client = redis::Client::open(redis_url).map_err(SyncError::from)?;
        let conn = ConnectionManager::new(client).await.map_err(SyncError::from)?;
        Ok(Self {
            conn,
            keys: KeyBuilder::new(prefix),
            bus,
            ttl: ROOM_STATE_TTL,
        })
    }

    fn validate(snapshot: &PlaybackSnapshot) -> SyncResult<()> {
        if !snapshot.is_valid() {
            return Err(SyncError::InvalidState(
                "playback snapshot failed validation".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn get_snapshot(&self, room_id: &str) -> SyncResult<Option<PlaybackSnapshot>> {
        let mut conn = self.conn.clone();
        let data: Option<String> = conn.hget(self.keys.playback(room_id), "data").await?;
        match data {
            None => Ok(None),
            Some(raw) => {
                let snapshot: PlaybackSnapshot = serde_json::from_str(&raw)?;
                if !snapshot.is_valid() {
                    return Err(SyncError::InvalidState(
                        "stored playback snapshot failed validation on read".into(),
                    ));
                }
                Ok(Some(snapshot))
            }
        }
    }

    async fn set_snapshot(&self, room_id: &str, snapshot: &PlaybackSnapshot) -> SyncResult<()> {
        Self::validate(snapshot)?;
        let data = serde_json::to_string(snapshot)?;
        let mut conn = self.conn.clone();
        let key = self.keys.playback(room_id);
        let _: () = redis::pipe()
            .hset(&key, "seq", snapshot.sequence_number)
            .hset(&key, "data", &data)
            .expire(&key, self.ttl.as_secs() as i64)
            .query_async(&mut conn)
            .await?;
        self.bus.publish(room_id, data).await;
        Ok(())
    }

    async fn update_snapshot(&self, room_id: &str, snapshot: &PlaybackSnapshot) -> SyncResult<bool> {
        Self::validate(snapshot)?;
        let data = serde_json::to_string(snapshot)?;
        let mut conn = self.conn.clone();
        let accepted: i32 = redis::Script::new(UPDATE_SNAPSHOT_SCRIPT)
            .key(self.keys.playback(room_id))
            .arg(snapshot.sequence_number)
            .arg(&data)
            .arg(self.ttl.as_secs() as i64)
            .invoke_async(&mut conn)
            .await?;
        let accepted = accepted == 1;
        if accepted {
            self.bus.publish(room_id, data).await;
        }
        Ok(accepted)
    }

    async fn increment_sequence(&self, room_id: &str) -> SyncResult<u64> {
        let mut conn = self.conn.clone();
        let key = self.keys.sequence(room_id);
        let n: u64 = conn.incr(&key, 1u64).await?;
        if n == 1 {
            let _: () = conn.expire(&key, self.ttl.as_secs() as i64).await?;
        }
        Ok(n)
    }

    async fn add_participant(&self, room_id: &str, participant: &Participant) -> SyncResult<()> {
        let data = serde_json::to_string(participant)?;
        let mut conn = self.conn.clone();
        let key = self.keys.participants(room_id);
        // HSETNX gives us the "duplicate add is a no-op" semantics for free.
        let _: bool = conn
            .hset_nx(&key, &participant.participant_handle, &data)
            .await?;
        let _: () = conn.expire(&key, self.ttl.as_secs() as i64).await?;
        Ok(())
    }

    async fn remove_participant(&self, room_id: &str, participant_handle: &str) -> SyncResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hdel(self.keys.participants(room_id), participant_handle)
            .await?;
        Ok(())
    }

    async fn list_participants(&self, room_id: &str) -> SyncResult<Vec<Participant>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.hvals(self.keys.participants(room_id)).await?;
        raw.iter()
            .map(|s| serde_json::from_str(s).map_err(SyncError::from))
            .collect()
    }

    async fn add_online_socket(&self, room_id: &str, socket_id: &str) -> SyncResult<()> {
        let mut conn = self.conn.clone();
        let key = self.keys.online(room_id);
        let _: () = conn.sadd(&key, socket_id).await?;
        let _: () = conn.expire(&key, self.ttl.as_secs() as i64).await?;
        Ok(())
    }

    async fn remove_online_socket(&self, room_id: &str, socket_id: &str) -> SyncResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.srem(self.keys.online(room_id), socket_id).await?;
        Ok(())
    }

    async fn online_count(&self, room_id: &str) -> SyncResult<usize> {
        let mut conn = self.conn.clone();
        let n: usize = conn.scard(self.keys.online(room_id)).await?;
        Ok(n)
    }

    async fn add_voice_peer(&self, room_id: &str, peer: &VoicePeer) -> SyncResult<()> {
        let data = serde_json::to_string(peer)?;
        let mut conn = self.conn.clone();
        let key = self.keys.voice_participants(room_id);
        let _: () = conn.hset(&key, &peer.participant_handle, &data).await?;
        let _: () = conn.expire(&key, self.ttl.as_secs() as i64).await?;
        Ok(())
    }

    async fn remove_voice_peer(&self, room_id: &str, participant_handle: &str) -> SyncResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hdel(self.keys.voice_participants(room_id), participant_handle)
            .await?;
        Ok(())
    }

    async fn list_voice_peers(&self, room_id: &str) -> SyncResult<Vec<VoicePeer>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.hvals(self.keys.voice_participants(room_id)).await?;
        raw.iter()
            .map(|s| serde_json::from_str(s).map_err(SyncError::from))
            .collect()
    }

    async fn set_voice_speaking(
        &self,
        room_id: &str,
        participant_handle: &str,
        is_speaking: bool,
    ) -> SyncResult<()> {
        let key = self.keys.voice_participants(room_id);
        let mut conn = self.conn.clone();
        let current: Option<String> = conn.hget(&key, participant_handle).await?;
        let Some(raw) = current else { return Ok(()) };
        let mut peer: VoicePeer = serde_json::from_str(&raw)?;
        peer.is_speaking = is_speaking;
        let data = serde_json::to_string(&peer)?;
        let _: () = conn.hset(&key, participant_handle, &data).await?;
        Ok(())
    }

    async fn check_command_rate_limit(
        &self,
        room_id: &str,
        participant_handle: &str,
        max: u64,
        window: Duration,
    ) -> SyncResult<bool> {
        let key = self.keys.ratelimit(room_id, participant_handle);
        let mut conn = self.conn.clone();
        let n: u64 = conn.incr(&key, 1u64).await?;
        if n == 1 {
            let _: () = conn.expire(&key, window.as_secs().max(1) as i64).await?;
        }
        Ok(n <= max)
    }

    async fn check_chat_rate_limit(
        &self,
        room_id: &str,
        participant_handle: &str,
        max: u64,
        window: Duration,
    ) -> SyncResult<bool> {
        let key = self.keys.chat_ratelimit(room_id, participant_handle);
        let mut conn = self.conn.clone();
        let now = now_ms() as i64;
        let cutoff = now - window.as_millis() as i64;
        let _: () = conn.zrembyscore(&key, 0, cutoff).await?;
        let count: u64 = conn.zcard(&key).await?;
        if count >= max {
            return Ok(false);
        }
        let member = uuid::Uuid::new_v4().to_string();
        let _: () = conn.zadd(&key, member, now).await?;
        let _: () = conn.expire(&key, window.as_secs().max(1) as i64).await?;
        Ok(true)
    }

    async fn clear_room(&self, room_id: &str) -> SyncResult<()> {
        let mut conn = self.conn.clone();
        let keys = [
            self.keys.playback(room_id),
            self.keys.participants(room_id),
            self.keys.online(room_id),
            self.keys.sequence(room_id),
            self.keys.voice_participants(room_id),
            self.keys.shadow_muted(room_id),
        ];
        // Idempotent: DEL on an already-missing key is a documented no-op.
        let _: () = conn.del(&keys[..]).await?;
        self.bus.forget_room(room_id);
        Ok(())
    }
}
