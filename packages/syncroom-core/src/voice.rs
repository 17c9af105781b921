//! Voice signaling relay (component F).
//!
//! The server never sees media, only signaling envelopes. Generalizes the
//! teacher's x-rincon relay shape (one peer's command re-pointed at another
//! speaker) to an opaque WebRTC-style offer/answer/ICE relay between two
//! sockets of the same room.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bus::EventBus;
use crate::clock::now_ms;
use crate::error::{SyncError, SyncResult};
use crate::models::VoicePeer;
use crate::state_store::StateStore;

/// The kind of signaling payload relayed between two peers (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Signal {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: String },
}

pub struct VoiceRelay {
    store: Arc<dyn StateStore>,
    bus: Arc<dyn EventBus>,
}

impl VoiceRelay {
    pub fn new(store: Arc<dyn StateStore>, bus: Arc<dyn EventBus>) -> Self {
        Self { store, bus }
    }

    /// `voice_join` (§4.F). Returns the roster of other peers to the caller;
    /// the broadcast of `VoicePeerJoined` is the caller's responsibility via
    /// the returned event payload, so the gateway can address it correctly.
    pub async fn join(&self, room_id: &str, participant_handle: &str) -> SyncResult<Vec<VoicePeer>> {
        let existing = self.store.list_voice_peers(room_id).await?;
        if existing.iter().any(|p| p.participant_handle == participant_handle) {
            return Err(SyncError::AlreadyInVoice);
        }

        let peer = VoicePeer {
            participant_handle: participant_handle.to_string(),
            is_speaking: false,
            joined_at_ms: now_ms(),
        };
        self.store.add_voice_peer(room_id, &peer).await?;

        let notice = serde_json::json!({
            "kind": "voice_peer_joined",
            "participant_handle": participant_handle,
        })
        .to_string();
        self.bus.publish(room_id, notice).await;

        Ok(existing)
    }

    /// `voice_leave` (§4.F).
    pub async fn leave(&self, room_id: &str, participant_handle: &str) -> SyncResult<()> {
        let existing = self.store.list_voice_peers(room_id).await?;
        if !existing.iter().any(|p| p.participant_handle == participant_handle) {
            return Err(SyncError::NotInVoice);
        }
        self.store.remove_voice_peer(room_id, participant_handle).await?;

        let notice = serde_json::json!({
            "kind": "voice_peer_left",
            "participant_handle": participant_handle,
        })
        .to_string();
        self.bus.publish(room_id, notice).await;
        Ok(())
    }

    /// Cleanup on disconnect: broadcasts `VoicePeerLeft` before removing
    /// from the set, then removes. A no-op if the peer was never in voice
    /// (disconnect cascades must be idempotent - §4.E).
    pub async fn cleanup_on_disconnect(&self, room_id: &str, participant_handle: &str) -> SyncResult<()> {
        match self.leave(room_id, participant_handle).await {
            Ok(()) | Err(SyncError::NotInVoice) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// `voice_signal` (§4.F). The caller is responsible for deciding
    /// local-vs-bus delivery; this just validates membership and returns the
    /// serialized envelope to deliver, addressed to `target_handle`.
    pub async fn signal(
        &self,
        room_id: &str,
        caller_handle: &str,
        target_handle: &str,
        signal: Signal,
    ) -> SyncResult<String> {
        let peers = self.store.list_voice_peers(room_id).await?;
        if !peers.iter().any(|p| p.participant_handle == caller_handle) {
            return Err(SyncError::NotInVoice);
        }
        if !peers.iter().any(|p| p.participant_handle == target_handle) {
            return Err(SyncError::NotInVoice);
        }

        let envelope = serde_json::json!({
            "kind": "voice_signal",
            "from_id": caller_handle,
            "target_id": target_handle,
            "signal": signal,
        });
        Ok(envelope.to_string())
    }

    /// `voice_speaking` (§4.F). Failures here are non-critical: the caller
    /// logs and continues rather than surfacing an error to the client.
    pub async fn set_speaking(&self, room_id: &str, participant_handle: &str, is_speaking: bool) {
        if let Err(err) = self
            .store
            .set_voice_speaking(room_id, participant_handle, is_speaking)
            .await
        {
            log::warn!(
                "[Voice] Failed to update speaking flag for {}/{}: {}",
                room_id,
                participant_handle,
                err
            );
            return;
        }
        let notice = serde_json::json!({
            "kind": "voice_speaking",
            "participant_handle": participant_handle,
            "is_speaking": is_speaking,
        })
        .to_string();
        self.bus.publish(room_id, notice).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalEventBus;
    use crate::state_store::MemoryStateStore;

    fn relay() -> VoiceRelay {
        let bus = Arc::new(LocalEventBus::new());
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new(bus.clone()));
        VoiceRelay::new(store, bus)
    }

    #[tokio::test]
    async fn scenario_voice_signaling_relay() {
        let relay = relay();
        let others_for_o = relay.join("R1", "O_handle__").await.unwrap();
        assert!(others_for_o.is_empty());

        let others_for_p = relay.join("R1", "P_handle__").await.unwrap();
        assert_eq!(others_for_p.len(), 1);
        assert_eq!(others_for_p[0].participant_handle, "O_handle__");

        let envelope = relay
            .signal(
                "R1",
                "O_handle__",
                "P_handle__",
                Signal::Offer { sdp: "v=0...".into() },
            )
            .await
            .unwrap();
        assert!(envelope.contains("\"from_id\":\"O_handle__\""));
        assert!(envelope.contains("\"target_id\":\"P_handle__\""));
    }

    #[tokio::test]
    async fn joining_voice_twice_fails() {
        let relay = relay();
        relay.join("R1", "A").await.unwrap();
        let err = relay.join("R1", "A").await.unwrap_err();
        assert!(matches!(err, SyncError::AlreadyInVoice));
    }

    #[tokio::test]
    async fn signal_to_non_voice_target_fails() {
        let relay = relay();
        relay.join("R1", "A").await.unwrap();
        let err = relay
            .signal("R1", "A", "B", Signal::IceCandidate { candidate: "x".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotInVoice));
    }

    #[tokio::test]
    async fn disconnect_cleanup_is_idempotent() {
        let relay = relay();
        relay.join("R1", "A").await.unwrap();
        relay.cleanup_on_disconnect("R1", "A").await.unwrap();
        relay.cleanup_on_disconnect("R1", "A").await.unwrap();
    }
}
