//! Event bus (component C): pub/sub across server instances keyed by room.
//!
//! Within a single process, fan-out is a local broadcast channel per room so
//! a publish reaches every locally-connected gateway task without a Redis
//! round trip. A background task relays inbound Redis pub/sub messages for
//! every subscribed room into the same local channel, so a publish on one
//! instance reaches every instance's locally-connected sockets.
//!
//! Delivery is at-least-once; subscribers must tolerate redeliveries and rely
//! on `sequence_number`, never on delivery order. A bus failure degrades to
//! single-instance operation - errors here are logged, never propagated as a
//! hard failure (§4.C).

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

/// An opaque payload published on a room's channel: either a full snapshot
/// refresh or a voice-signaling envelope addressed to a specific instance.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub room_id: String,
    /// Pre-serialized JSON payload - the bus does not interpret it.
    pub payload: String,
}

/// Capacity of each per-room local broadcast channel. Sized generously for a
/// 5-participant room; a slow receiver only ever drops its own backlog.
const LOCAL_CHANNEL_CAPACITY: usize = 256;

/// Pub/sub across server instances, keyed by room (component C).
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes `payload` to every local subscriber of `room_id` and, if a
    /// cross-instance backend is attached, to every other instance.
    async fn publish(&self, room_id: &str, payload: String);

    /// Subscribes to a room's local fan-out. Returns a receiver that observes
    /// every message published to this room from this point on, whether it
    /// originated locally or arrived from another instance.
    fn subscribe(&self, room_id: &str) -> broadcast::Receiver<BusMessage>;

    /// Drops the local channel for a room once no more gateways reference it.
    /// Best-effort; a room with no subscribers simply never has a channel
    /// allocated in the first place.
    fn forget_room(&self, room_id: &str);
}

/// In-process local fan-out registry: one broadcast channel per room,
/// allocated lazily on first publish or subscribe.
///
/// Grounded on the teacher's `BroadcastEventBridge`, generalized from a
/// single global channel to one channel per room so that rooms with no
/// listeners carry no broadcast overhead.
pub struct LocalEventBus {
    channels: DashMap<String, broadcast::Sender<BusMessage>>,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    fn sender_for(&self, room_id: &str) -> broadcast::Sender<BusMessage> {
        self.channels
            .entry(room_id.to_string())
            .or_insert_with(|| broadcast::channel(LOCAL_CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    async fn publish(&self, room_id: &str, payload: String) {
        let sender = self.sender_for(room_id);
        // No receivers is not an error - the room may have no locally
        // connected clients right now.
        let _ = sender.send(BusMessage {
            room_id: room_id.to_string(),
            payload,
        });
    }

    fn subscribe(&self, room_id: &str) -> broadcast::Receiver<BusMessage> {
        self.sender_for(room_id).subscribe()
    }

    fn forget_room(&self, room_id: &str) {
        self.channels.remove(room_id);
    }
}

/// Wraps a [`LocalEventBus`] with a Redis pub/sub bridge for cross-instance
/// delivery. A publish always feeds the local channel directly (fast path)
/// and is also forwarded to Redis (horizontal-scaling path); a background
/// subscriber task relays inbound Redis messages for rooms this instance
/// cares about back into the local channel.
///
/// Losing the Redis connection degrades to single-instance operation: `log`
/// records the failure and publishing continues to serve local subscribers.
pub struct RedisEventBus {
    local: Arc<LocalEventBus>,
    client: redis::Client,
}

impl RedisEventBus {
    pub fn new(local: Arc<LocalEventBus>, client: redis::Client) -> Self {
        Self { local, client }
    }

    /// Spawns the background task that relays every `room:*:events` message
    /// from Redis into the local bus. Intended to be called once at
    /// bootstrap; the task runs until the provided `shutdown` token fires.
    pub fn spawn_relay(self: &Arc<Self>, shutdown: tokio_util::sync::CancellationToken) {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if shutdown.is_cancelled() {
                    return;
                }
                match bus.run_relay_once(&shutdown).await {
                    Ok(()) => return,
                    Err(err) => {
                        log::warn!(
                            "[Bus] Redis pub/sub relay disconnected, degrading to single-instance mode: {}",
                            err
                        );
                        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                    }
                }
            }
        });
    }

    async fn run_relay_once(
        &self,
        shutdown: &tokio_util::sync::CancellationToken,
    ) -> redis::RedisResult<()> {
        let conn = self.client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.psubscribe("room:*:events").await?;
        let mut stream = pubsub.on_message();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                msg = futures::StreamExt::next(&mut stream) => {
                    let Some(msg) = msg else { return Ok(()) };
                    let channel: String = msg.get_channel_name().to_string();
                    let Some(room_id) = extract_room_id(&channel) else { continue };
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(err) => {
                            log::warn!("[Bus] Failed to decode Redis pub/sub payload: {}", err);
                            continue;
                        }
                    };
                    let _ = self.local.publish(&room_id, payload).await;
                }
            }
        }
    }
}

fn extract_room_id(channel: &str) -> Option<String> {
    channel
        .strip_prefix("room:")
        .and_then(|rest| rest.strip_suffix(":events"))
        .map(str::to_string)
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, room_id: &str, payload: String) {
        self.local.publish(room_id, payload.clone()).await;

        let client = self.client.clone();
        let channel = format!("room:{}:events", room_id);
        tokio::spawn(async move {
            let result: redis::RedisResult<()> = async {
                let mut conn = client.get_async_connection().await?;
                redis::cmd("PUBLISH")
                    .arg(&channel)
                    .arg(&payload)
                    .query_async(&mut conn)
                    .await
            }
            .await;
            if let Err(err) = result {
                log::warn!("[Bus] Cross-instance publish failed, local delivery still succeeded: {}", err);
            }
        });
    }

    fn subscribe(&self, room_id: &str) -> broadcast::Receiver<BusMessage> {
        self.local.subscribe(room_id)
    }

    fn forget_room(&self, room_id: &str) {
        self.local.forget_room(room_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_bus_delivers_to_subscriber() {
        let bus = LocalEventBus::new();
        let mut rx = bus.subscribe("R1");
        bus.publish("R1", "hello".into()).await;
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.room_id, "R1");
        assert_eq!(msg.payload, "hello");
    }

    #[tokio::test]
    async fn local_bus_isolates_rooms() {
        let bus = LocalEventBus::new();
        let mut rx_a = bus.subscribe("A");
        let rx_b = bus.subscribe("B");
        bus.publish("A", "for-a".into()).await;
        let msg = rx_a.recv().await.unwrap();
        assert_eq!(msg.payload, "for-a");
        drop(rx_b);
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = LocalEventBus::new();
        bus.publish("empty-room", "nobody-home".into()).await;
    }

    #[test]
    fn extract_room_id_parses_channel_name() {
        assert_eq!(extract_room_id("room:ABCD1234:events"), Some("ABCD1234".to_string()));
        assert_eq!(extract_room_id("not-a-room-channel"), None);
    }
}
