//! Session engine (component E): socket lifecycle - authenticate, join room,
//! enforce capacity/role, leave, disconnect, clean up.
//!
//! Room lookup and Participant persistence are external collaborators (§1);
//! the engine depends on them through the [`RoomDirectory`] and
//! [`ParticipantRegistry`] traits so it is testable without a real database,
//! mirroring the teacher's trait-seamed dependency-injection style.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::bus::EventBus;
use crate::clock::now_ms;
use crate::error::{SyncError, SyncResult};
use crate::models::{Participant, PlaybackControlPolicy, Role, Room};
use crate::state_store::StateStore;

/// URL-safe alphabet for participant handles (§4.E step 5).
const HANDLE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz23456789";
const HANDLE_LEN: usize = 10;

/// Default sliding cap on playback commands per (room, participant) per
/// second (§4.E, §6 `rate_limit_per_sec`).
pub const DEFAULT_COMMAND_RATE_LIMIT_PER_SEC: u64 = 10;

/// Room lookup by code, an external collaborator (§1, §4.E step 1).
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn find_by_code(&self, code: &str) -> SyncResult<Option<Room>>;
}

/// Participant persistence, an external collaborator (§4.E step 7).
#[async_trait]
pub trait ParticipantRegistry: Send + Sync {
    async fn persist(&self, participant: &Participant) -> SyncResult<()>;
    async fn delete(&self, room_id: &str, participant_handle: &str) -> SyncResult<()>;
}

/// Minimal in-process `RoomDirectory`, suitable for a single-instance
/// deployment or integration tests. Not horizontally-scalable: a second
/// instance would not see rooms registered here. Production deployments
/// with more than one instance should back `RoomDirectory` with a shared
/// database instead.
pub struct InMemoryRoomDirectory {
    rooms: parking_lot::Mutex<std::collections::HashMap<String, Room>>,
}

impl InMemoryRoomDirectory {
    pub fn new() -> Self {
        Self {
            rooms: parking_lot::Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Registers a room so it can be found by its join code. Room creation
    /// itself is out of scope for the core (§1); callers wire this in
    /// wherever rooms come into existence.
    pub fn insert(&self, room: Room) {
        self.rooms.lock().insert(room.code.clone(), room);
    }
}

impl Default for InMemoryRoomDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RoomDirectory for InMemoryRoomDirectory {
    async fn find_by_code(&self, code: &str) -> SyncResult<Option<Room>> {
        Ok(self.rooms.lock().get(code).cloned())
    }
}

/// Minimal in-process `ParticipantRegistry` mirroring
/// [`InMemoryRoomDirectory`]'s scaling caveat: participant records do not
/// survive a restart and are not shared across instances.
#[derive(Default)]
pub struct InMemoryParticipantRegistry {
    participants: parking_lot::Mutex<std::collections::HashMap<(String, String), Participant>>,
}

impl InMemoryParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ParticipantRegistry for InMemoryParticipantRegistry {
    async fn persist(&self, participant: &Participant) -> SyncResult<()> {
        self.participants.lock().insert(
            (participant.room_id.clone(), participant.participant_handle.clone()),
            participant.clone(),
        );
        Ok(())
    }

    async fn delete(&self, room_id: &str, participant_handle: &str) -> SyncResult<()> {
        self.participants
            .lock()
            .remove(&(room_id.to_string(), participant_handle.to_string()));
        Ok(())
    }
}

/// Generates a 10-character opaque participant-handle from a URL-safe
/// alphabet using a cryptographic RNG (§4.E step 5).
pub fn generate_participant_handle() -> String {
    let mut rng = rand::thread_rng();
    (0..HANDLE_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..HANDLE_ALPHABET.len());
            HANDLE_ALPHABET[idx] as char
        })
        .collect()
}

/// Result of a successful join, handed back to the gateway to reply with
/// `room:state` and to register the connection in the room's delivery group
/// (§4.E step 8, §6).
#[derive(Debug)]
pub struct JoinOutcome {
    pub room: Room,
    pub participant: Participant,
    pub participants: Vec<Participant>,
}

pub struct SessionEngine {
    rooms: Arc<dyn RoomDirectory>,
    participants: Arc<dyn ParticipantRegistry>,
    store: Arc<dyn StateStore>,
    bus: Arc<dyn EventBus>,
}

impl SessionEngine {
    pub fn new(
        rooms: Arc<dyn RoomDirectory>,
        participants: Arc<dyn ParticipantRegistry>,
        store: Arc<dyn StateStore>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            rooms,
            participants,
            store,
            bus,
        }
    }

    /// Join algorithm (§4.E, "the subtle one").
    pub async fn join(
        &self,
        room_code: &str,
        socket_id: &str,
        password: Option<&str>,
        caller_user_id: Option<&str>,
        guest_name: Option<&str>,
    ) -> SyncResult<JoinOutcome> {
        // Step 1: look up room, reject missing or expired.
        let room = self
            .rooms
            .find_by_code(room_code)
            .await?
            .ok_or(SyncError::RoomNotFound)?;
        if now_ms() > room.expires_at_ms {
            return Err(SyncError::RoomNotFound);
        }

        // Step 2: password check.
        if let Some(hash) = &room.password_hash {
            let supplied = password.ok_or(SyncError::InvalidPassword)?;
            if !verify_password(hash, supplied) {
                return Err(SyncError::InvalidPassword);
            }
        }

        // Step 3: capacity check, then authoritative re-count after insert.
        // The set-membership add is itself commutative (§5 Shared-resource
        // policy); the re-count after add is what actually prevents
        // overshoot under concurrent joins.
        let pre_count = self.store.online_count(&room.room_id).await?;
        if pre_count >= room.capacity as usize {
            return Err(SyncError::RoomFull);
        }

        // Step 4: decide role.
        let role = match (caller_user_id, &room.owner_id) {
            (Some(uid), Some(owner_id)) if uid == owner_id => Role::Owner,
            (Some(_), _) => Role::Participant,
            (None, _) => {
                let name = guest_name.filter(|n| !n.trim().is_empty());
                if name.is_none() {
                    return Err(SyncError::Validation(
                        "guest_name is required for unauthenticated joins".into(),
                    ));
                }
                Role::Guest
            }
        };

        // Step 5: opaque handle.
        let participant_handle = generate_participant_handle();

        // Step 6: can_control.
        let can_control = role == Role::Owner || room.playback_control == PlaybackControlPolicy::All;

        let display_name = match role {
            Role::Guest => guest_name.unwrap_or("Guest").to_string(),
            _ => caller_user_id.unwrap_or("participant").to_string(),
        };

        let participant = Participant {
            room_id: room.room_id.clone(),
            participant_handle: participant_handle.clone(),
            user_id: caller_user_id.map(str::to_string),
            display_name,
            role,
            can_control,
            joined_at_ms: now_ms(),
        };

        // Step 7: persist and register.
        self.participants.persist(&participant).await?;
        self.store.add_participant(&room.room_id, &participant).await?;
        self.store.add_online_socket(&room.room_id, socket_id).await?;

        // Authoritative re-count: if capacity was overshot by a concurrent
        // join that landed between our check and our insert, back out.
        let post_count = self.store.online_count(&room.room_id).await?;
        if post_count > room.capacity as usize {
            self.leave(&room.room_id, socket_id, &participant_handle).await?;
            return Err(SyncError::RoomFull);
        }

        let participants = self.store.list_participants(&room.room_id).await?;

        let notice = system_notice(SystemNoticeKind::Joined, &participant_handle);
        self.bus.publish(&room.room_id, notice).await;

        Ok(JoinOutcome {
            room,
            participant,
            participants,
        })
    }

    /// Leave/disconnect path. Idempotent: a second call for an already-gone
    /// participant is a no-op (§4.E).
    pub async fn leave(&self, room_id: &str, socket_id: &str, participant_handle: &str) -> SyncResult<()> {
        self.store.remove_online_socket(room_id, socket_id).await?;
        self.store.remove_participant(room_id, participant_handle).await?;
        self.participants.delete(room_id, participant_handle).await?;

        // Cascade to voice cleanup: best-effort, mirrors the graceful
        // degradation the teacher's sync-group manager applies to partial
        // teardown failures - a failed voice removal must not block the
        // room-level leave from completing.
        if let Err(err) = self.store.remove_voice_peer(room_id, participant_handle).await {
            log::warn!(
                "[Session] Voice cleanup failed during leave for {}/{}: {}",
                room_id,
                participant_handle,
                err
            );
        }

        let notice = system_notice(SystemNoticeKind::Left, participant_handle);
        self.bus.publish(room_id, notice).await;
        Ok(())
    }

    /// Checks and records one playback-command attempt against the sliding
    /// cap (§4.E "Rate-limit on playback commands").
    pub async fn check_command_rate_limit(
        &self,
        room_id: &str,
        participant_handle: &str,
    ) -> SyncResult<()> {
        let within_quota = self
            .store
            .check_command_rate_limit(
                room_id,
                participant_handle,
                DEFAULT_COMMAND_RATE_LIMIT_PER_SEC,
                Duration::from_secs(1),
            )
            .await?;
        if within_quota {
            Ok(())
        } else {
            Err(SyncError::RateLimitExceeded)
        }
    }

    /// Permission check for playback commands (§4.E table).
    pub fn can_control_playback(policy: PlaybackControlPolicy, participant: &Participant) -> bool {
        match policy {
            PlaybackControlPolicy::OwnerOnly => participant.role == Role::Owner,
            PlaybackControlPolicy::All => {
                participant.role == Role::Owner || participant.role == Role::Participant
            }
            PlaybackControlPolicy::Selected => {
                participant.role == Role::Owner || participant.can_control
            }
        }
    }
}

fn verify_password(hash: &str, supplied: &str) -> bool {
    // Password hashing itself is an external collaborator (§1 Non-goals);
    // the core only compares a caller-supplied plaintext against the
    // already-hashed value the external auth service produced.
    hash == supplied
}

enum SystemNoticeKind {
    Joined,
    Left,
}

fn system_notice(kind: SystemNoticeKind, participant_handle: &str) -> String {
    let kind_str = match kind {
        SystemNoticeKind::Joined => "participant_joined",
        SystemNoticeKind::Left => "participant_left",
    };
    serde_json::json!({
        "kind": kind_str,
        "participant_handle": participant_handle,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalEventBus;
    use crate::state_store::MemoryStateStore;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct FakeRooms(Mutex<HashMap<String, Room>>);

    #[async_trait]
    impl RoomDirectory for FakeRooms {
        async fn find_by_code(&self, code: &str) -> SyncResult<Option<Room>> {
            Ok(self.0.lock().get(code).cloned())
        }
    }

    struct FakeParticipants;

    #[async_trait]
    impl ParticipantRegistry for FakeParticipants {
        async fn persist(&self, _participant: &Participant) -> SyncResult<()> {
            Ok(())
        }
        async fn delete(&self, _room_id: &str, _participant_handle: &str) -> SyncResult<()> {
            Ok(())
        }
    }

    fn room(capacity: u8) -> Room {
        Room {
            room_id: "room-1".into(),
            code: "ABCD1234".into(),
            name: "Movie night".into(),
            capacity,
            password_hash: None,
            playback_control: PlaybackControlPolicy::OwnerOnly,
            owner_id: Some("owner-1".into()),
            created_at_ms: 0,
            expires_at_ms: u64::MAX,
        }
    }

    fn engine(r: Room) -> SessionEngine {
        let mut map = HashMap::new();
        map.insert(r.code.clone(), r);
        let bus = Arc::new(LocalEventBus::new());
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new(bus.clone()));
        SessionEngine::new(
            Arc::new(FakeRooms(Mutex::new(map))),
            Arc::new(FakeParticipants),
            store,
            bus,
        )
    }

    #[tokio::test]
    async fn owner_join_assigns_owner_role() {
        let engine = engine(room(5));
        let outcome = engine
            .join("ABCD1234", "sock-1", None, Some("owner-1"), None)
            .await
            .unwrap();
        assert_eq!(outcome.participant.role, Role::Owner);
        assert!(outcome.participant.can_control);
    }

    #[tokio::test]
    async fn unknown_code_returns_room_not_found() {
        let engine = engine(room(5));
        let err = engine.join("NOPE0000", "sock-1", None, None, Some("Guest")).await.unwrap_err();
        assert!(matches!(err, SyncError::RoomNotFound));
    }

    #[tokio::test]
    async fn guest_without_name_is_rejected() {
        let engine = engine(room(5));
        let err = engine.join("ABCD1234", "sock-1", None, None, None).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn capacity_cap_rejects_the_nth_plus_one_join() {
        let engine = engine(room(2));
        engine.join("ABCD1234", "sock-1", None, Some("owner-1"), None).await.unwrap();
        engine.join("ABCD1234", "sock-2", None, Some("p-2"), None).await.unwrap();
        let err = engine.join("ABCD1234", "sock-3", None, Some("p-3"), None).await.unwrap_err();
        assert!(matches!(err, SyncError::RoomFull));
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let mut r = room(5);
        r.password_hash = Some("secret".into());
        let engine = engine(r);
        let err = engine
            .join("ABCD1234", "sock-1", Some("wrong"), Some("owner-1"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidPassword));
    }

    #[tokio::test]
    async fn leave_is_idempotent() {
        let engine = engine(room(5));
        let outcome = engine
            .join("ABCD1234", "sock-1", None, Some("owner-1"), None)
            .await
            .unwrap();
        let handle = outcome.participant.participant_handle.clone();
        engine.leave("room-1", "sock-1", &handle).await.unwrap();
        engine.leave("room-1", "sock-1", &handle).await.unwrap();
    }

    #[test]
    fn permission_table_matches_spec() {
        let owner = Participant {
            room_id: "r".into(),
            participant_handle: "h".into(),
            user_id: Some("u".into()),
            display_name: "n".into(),
            role: Role::Owner,
            can_control: true,
            joined_at_ms: 0,
        };
        let mut guest = owner.clone();
        guest.role = Role::Guest;
        guest.can_control = false;

        assert!(SessionEngine::can_control_playback(PlaybackControlPolicy::OwnerOnly, &owner));
        assert!(!SessionEngine::can_control_playback(PlaybackControlPolicy::OwnerOnly, &guest));
        assert!(!SessionEngine::can_control_playback(PlaybackControlPolicy::All, &guest));
        assert!(!SessionEngine::can_control_playback(PlaybackControlPolicy::Selected, &guest));
    }

    #[test]
    fn generated_handles_are_ten_chars_from_the_url_safe_alphabet() {
        for _ in 0..20 {
            let handle = generate_participant_handle();
            assert_eq!(handle.len(), HANDLE_LEN);
            assert!(handle.bytes().all(|b| HANDLE_ALPHABET.contains(&b)));
        }
    }

    #[tokio::test]
    async fn in_memory_room_directory_finds_by_code() {
        let dir = InMemoryRoomDirectory::new();
        assert!(dir.find_by_code("ABCD1234").await.unwrap().is_none());
        dir.insert(room(5));
        assert!(dir.find_by_code("ABCD1234").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn in_memory_participant_registry_persists_and_deletes() {
        let registry = InMemoryParticipantRegistry::new();
        let participant = Participant {
            room_id: "R1".into(),
            participant_handle: "h1".into(),
            user_id: None,
            display_name: "n".into(),
            role: Role::Guest,
            can_control: false,
            joined_at_ms: 0,
        };
        registry.persist(&participant).await.unwrap();
        registry.delete("R1", "h1").await.unwrap();
        // Deleting an unknown key is a no-op, not an error.
        registry.delete("R1", "h1").await.unwrap();
    }
}
