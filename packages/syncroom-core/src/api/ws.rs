//! WebSocket gateway handler (component I): the `/sync` connection loop.
//!
//! Grounded on the teacher's `api/ws.rs` connection shape: a 4-branch
//! `tokio::select!` racing cancellation, inbound frames, room broadcast
//! fan-out, and a heartbeat tick, with RAII guards for cleanup on drop.
//! Generalized from a single global broadcast channel to a per-room
//! subscription obtained from the event bus once the connection joins a
//! room, and from audio-streaming message types to the sync protocol's
//! event set (§6).

use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::api::AppState;
use crate::chat::SystemEventKind;
use crate::error::{ErrorEnvelope, SyncError, SyncResult};
use crate::models::{Participant, PlaybackControlPolicy, Role};
use crate::session::SessionEngine;
use crate::voice::Signal;

/// Query parameters accepted on the `/sync` upgrade request. A bearer token
/// may also arrive via the `Authorization` header; the query param is a
/// fallback for clients that cannot set headers on a WebSocket handshake.
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
enum WsIncoming {
    #[serde(rename = "room:join")]
    RoomJoin {
        room_code: String,
        password: Option<String>,
        guest_name: Option<String>,
    },
    #[serde(rename = "room:leave")]
    RoomLeave {},
    #[serde(rename = "chat:message")]
    ChatMessage { content: String },
    #[serde(rename = "time:ping")]
    TimePing { client_time: u64 },
    #[serde(rename = "sync:play")]
    SyncPlay { at_server_time: Option<u64> },
    #[serde(rename = "sync:pause")]
    SyncPause { at_server_time: Option<u64> },
    #[serde(rename = "sync:seek")]
    SyncSeek {
        target_media_time: i64,
        at_server_time: Option<u64>,
    },
    #[serde(rename = "sync:rate")]
    SyncRate { rate: f64, at_server_time: Option<u64> },
    #[serde(rename = "sync:resync")]
    SyncResync {},
    #[serde(rename = "voice:join")]
    VoiceJoin {},
    #[serde(rename = "voice:leave")]
    VoiceLeave {},
    #[serde(rename = "voice:signal")]
    VoiceSignal { target_id: String, signal: Signal },
    #[serde(rename = "voice:speaking")]
    VoiceSpeaking { is_speaking: bool },
    #[serde(rename = "ready:initiate")]
    ReadyInitiate {},
    #[serde(rename = "ready:respond")]
    ReadyRespond { is_ready: bool },
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", content = "data")]
enum WsOutgoing {
    #[serde(rename = "room:state")]
    RoomState {
        room: crate::models::Room,
        participants: Vec<crate::models::Participant>,
        playback: Option<crate::models::PlaybackSnapshot>,
    },
    #[serde(rename = "room:error")]
    RoomError(ErrorEnvelope),
    #[serde(rename = "chat:error")]
    ChatError(ErrorEnvelope),
    #[serde(rename = "voice:error")]
    VoiceError(ErrorEnvelope),
    #[serde(rename = "sync:error")]
    SyncError(ErrorEnvelope),
    #[serde(rename = "error")]
    Error(ErrorEnvelope),
    #[serde(rename = "time:pong")]
    TimePong { client_time: u64, server_time: u64 },
    #[serde(rename = "sync:state")]
    SyncState { state: crate::models::PlaybackSnapshot },
    #[serde(rename = "voice:peers")]
    VoicePeers { peers: Vec<crate::models::VoicePeer> },
}

impl WsOutgoing {
    fn to_message(&self) -> Option<Message> {
        serde_json::to_string(self).ok().map(|s| Message::Text(s.into()))
    }

    fn from_error(err: &SyncError) -> Self {
        Self::Error(ErrorEnvelope::from(err))
    }
}

/// Per-connection mutable state held by the handler task (not shared across
/// connections - the room-scoped `online`/participant sets live in the
/// state store, this is purely local bookkeeping per §4.I "Connection
/// registry").
#[derive(Default)]
struct ConnState {
    room_id: Option<String>,
    participant: Option<Participant>,
    playback_control: Option<PlaybackControlPolicy>,
    in_voice: bool,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state, params.token))
}

async fn handle_ws(socket: WebSocket, state: AppState, token: Option<String>) {
    let (mut sender, mut receiver) = socket.split();

    let auth = match state.authenticator.authenticate(token.as_deref()).await {
        Ok(ctx) => ctx,
        Err(err) => {
            if let Some(msg) = WsOutgoing::from_error(&err).to_message() {
                let _ = sender.send(msg).await;
            }
            return;
        }
    };

    let conn_guard = state.ws_manager.register();
    let cancel_token = conn_guard.cancel_token().clone();
    let socket_id = conn_guard.id().to_string();

    log::info!(
        "[Gateway] Connection {} established (session={}, guest={})",
        socket_id,
        auth.session_id,
        auth.is_guest
    );

    let conn = Mutex::new(ConnState::default());
    // Replaced with a room subscription once `room:join` succeeds.
    let mut room_rx: Option<broadcast::Receiver<crate::bus::BusMessage>> = None;

    let mut heartbeat = tokio::time::interval(Duration::from_millis(state.ping_interval_ms));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_activity = Instant::now();
    let ping_timeout = Duration::from_millis(state.ping_timeout_ms);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                log::info!("[Gateway] Connection {} force-closed", socket_id);
                break;
            }
            msg = receiver.next() => {
                last_activity = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<WsIncoming>(&text) {
                            Ok(incoming) => {
                                handle_event(
                                    &state,
                                    &conn,
                                    &socket_id,
                                    &auth,
                                    incoming,
                                    &mut sender,
                                    &mut room_rx,
                                )
                                .await;
                            }
                            Err(err) => {
                                let envelope = ErrorEnvelope {
                                    code: "VALIDATION_ERROR",
                                    message: format!("unrecognized event: {}", err),
                                };
                                if let Some(msg) = WsOutgoing::Error(envelope).to_message() {
                                    let _ = sender.send(msg).await;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
            recv_result = async {
                match room_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => futures::future::pending().await,
                }
            } => {
                if let Ok(bus_msg) = recv_result {
                    if let Some(outgoing) = filter_bus_message(&conn, &bus_msg.payload) {
                        if sender.send(Message::Text(outgoing.into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            _ = heartbeat.tick() => {
                if last_activity.elapsed() > ping_timeout {
                    log::warn!("[Gateway] Connection {} heartbeat timeout", socket_id);
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    cleanup_on_disconnect(&state, &conn, &socket_id).await;
}

/// Dispatches one decoded event to the relevant engine and writes the reply
/// (or error) back to the socket. On `room:join` success, subscribes the
/// connection to the room's bus channel so broadcasts start flowing.
async fn handle_event(
    state: &AppState,
    conn: &Mutex<ConnState>,
    socket_id: &str,
    auth: &super::AuthContext,
    event: WsIncoming,
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    room_rx: &mut Option<broadcast::Receiver<crate::bus::BusMessage>>,
) {
    match event {
        WsIncoming::RoomJoin {
            room_code,
            password,
            guest_name,
        } => {
            if room_code.len() != 8 {
                reply_error(
                    sender,
                    WsOutgoing::RoomError(ErrorEnvelope::from(&SyncError::Validation(
                        "room_code must be 8 characters".into(),
                    ))),
                )
                .await;
                return;
            }
            if let Some(name) = &guest_name {
                if name.is_empty() || name.len() > 50 {
                    reply_error(
                        sender,
                        WsOutgoing::RoomError(ErrorEnvelope::from(&SyncError::Validation(
                            "guest_name must be 1-50 characters".into(),
                        ))),
                    )
                    .await;
                    return;
                }
            }
            let result = state
                .session
                .join(
                    &room_code,
                    socket_id,
                    password.as_deref(),
                    auth.user_id.as_deref(),
                    guest_name.as_deref(),
                )
                .await;
            match result {
                Ok(outcome) => {
                    let playback = state.playback.resync(&outcome.room.room_id).await.ok();
                    {
                        let mut c = conn.lock();
                        c.room_id = Some(outcome.room.room_id.clone());
                        c.playback_control = Some(outcome.room.playback_control);
                        c.participant = Some(outcome.participant.clone());
                    }
                    *room_rx = Some(state.bus.subscribe(&outcome.room.room_id));
                    state
                        .chat
                        .emit_system_event(&outcome.room.room_id, SystemEventKind::Join)
                        .await;

                    let reply = WsOutgoing::RoomState {
                        room: outcome.room,
                        participants: outcome.participants,
                        playback,
                    };
                    if let Some(msg) = reply.to_message() {
                        let _ = sender.send(msg).await;
                    }
                }
                Err(err) => reply_error(sender, WsOutgoing::RoomError(ErrorEnvelope::from(&err))).await,
            }
        }

        WsIncoming::RoomLeave {} => {
            let Some((room_id, handle)) = room_and_handle(conn) else {
                reply_error(sender, WsOutgoing::RoomError(not_in_room())).await;
                return;
            };
            if let Err(err) = state.session.leave(&room_id, socket_id, &handle).await {
                reply_error(sender, WsOutgoing::RoomError(ErrorEnvelope::from(&err))).await;
                return;
            }
            state.chat.emit_system_event(&room_id, SystemEventKind::Leave).await;
            *room_rx = None;
            let mut c = conn.lock();
            *c = ConnState::default();
        }

        WsIncoming::ChatMessage { content } => {
            let Some((room_id, handle)) = room_and_handle(conn) else {
                reply_error(sender, WsOutgoing::ChatError(not_in_room())).await;
                return;
            };
            let role = conn.lock().participant.as_ref().map(|p| p.role).unwrap_or(Role::Guest);
            if let Err(err) = state.chat.send(&room_id, role, &handle, &content).await {
                reply_error(sender, WsOutgoing::ChatError(ErrorEnvelope::from(&err))).await;
            }
        }

        WsIncoming::TimePing { client_time } => {
            let reply = WsOutgoing::TimePong {
                client_time,
                server_time: crate::clock::now_ms(),
            };
            if let Some(msg) = reply.to_message() {
                let _ = sender.send(msg).await;
            }
        }

        WsIncoming::SyncPlay { at_server_time } => {
            dispatch_playback(state, conn, sender, |room_id| async move {
                state.playback.play(&room_id, at_server_time).await
            })
            .await;
        }
        WsIncoming::SyncPause { at_server_time } => {
            dispatch_playback(state, conn, sender, |room_id| async move {
                state.playback.pause(&room_id, at_server_time).await
            })
            .await;
        }
        WsIncoming::SyncSeek {
            target_media_time,
            at_server_time,
        } => {
            if target_media_time < 0 {
                reply_error(
                    sender,
                    WsOutgoing::SyncError(ErrorEnvelope::from(&SyncError::Validation(
                        "target_media_time must be >= 0".into(),
                    ))),
                )
                .await;
                return;
            }
            let target = target_media_time as u64;
            dispatch_playback(state, conn, sender, |room_id| async move {
                state.playback.seek(&room_id, target, at_server_time).await
            })
            .await;
        }
        WsIncoming::SyncRate { rate, at_server_time } => {
            dispatch_playback(state, conn, sender, |room_id| async move {
                state.playback.set_rate(&room_id, rate, at_server_time).await
            })
            .await;
        }
        WsIncoming::SyncResync {} => {
            let Some((room_id, _)) = room_and_handle(conn) else {
                reply_error(sender, WsOutgoing::SyncError(not_in_room())).await;
                return;
            };
            match state.playback.resync(&room_id).await {
                Ok(snapshot) => {
                    if let Some(msg) = (WsOutgoing::SyncState { state: snapshot }).to_message() {
                        let _ = sender.send(msg).await;
                    }
                }
                Err(err) => reply_error(sender, WsOutgoing::SyncError(ErrorEnvelope::from(&err))).await,
            }
        }

        WsIncoming::VoiceJoin {} => {
            let Some((room_id, handle)) = room_and_handle(conn) else {
                reply_error(sender, WsOutgoing::VoiceError(not_in_room())).await;
                return;
            };
            match state.voice.join(&room_id, &handle).await {
                Ok(peers) => {
                    conn.lock().in_voice = true;
                    if let Some(msg) = (WsOutgoing::VoicePeers { peers }).to_message() {
                        let _ = sender.send(msg).await;
                    }
                }
                Err(err) => reply_error(sender, WsOutgoing::VoiceError(ErrorEnvelope::from(&err))).await,
            }
        }
        WsIncoming::VoiceLeave {} => {
            let Some((room_id, handle)) = room_and_handle(conn) else {
                reply_error(sender, WsOutgoing::VoiceError(not_in_room())).await;
                return;
            };
            match state.voice.leave(&room_id, &handle).await {
                Ok(()) => conn.lock().in_voice = false,
                Err(err) => reply_error(sender, WsOutgoing::VoiceError(ErrorEnvelope::from(&err))).await,
            }
        }
        WsIncoming::VoiceSignal { target_id, signal } => {
            let Some((room_id, handle)) = room_and_handle(conn) else {
                reply_error(sender, WsOutgoing::VoiceError(not_in_room())).await;
                return;
            };
            match state.voice.signal(&room_id, &handle, &target_id, signal).await {
                Ok(envelope) => state.bus.publish(&room_id, envelope).await,
                Err(err) => reply_error(sender, WsOutgoing::VoiceError(ErrorEnvelope::from(&err))).await,
            }
        }
        WsIncoming::VoiceSpeaking { is_speaking } => {
            let Some((room_id, handle)) = room_and_handle(conn) else {
                return;
            };
            state.voice.set_speaking(&room_id, &handle, is_speaking).await;
        }

        WsIncoming::ReadyInitiate {} => {
            let Some((room_id, handle)) = room_and_handle(conn) else {
                return;
            };
            let payload = serde_json::json!({ "kind": "ready_check", "requested_by": handle }).to_string();
            state.bus.publish(&room_id, payload).await;
        }
        WsIncoming::ReadyRespond { is_ready } => {
            let Some((room_id, handle)) = room_and_handle(conn) else {
                return;
            };
            let payload = serde_json::json!({
                "kind": "ready_status",
                "participant_handle": handle,
                "is_ready": is_ready,
            })
            .to_string();
            state.bus.publish(&room_id, payload).await;
        }
    }
}

/// Inspects a bus payload before it reaches this connection's client. Every
/// broadcast is opaque JSON; the one exception is a `voice_signal` envelope,
/// which carries a `target_id` and must be seen only by that participant
/// (§4.F, §8 scenario 6 "no other socket sees the payload").
fn filter_bus_message(conn: &Mutex<ConnState>, payload: &str) -> Option<String> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
        return Some(payload.to_string());
    };
    if value.get("kind").and_then(|k| k.as_str()) != Some("voice_signal") {
        return Some(payload.to_string());
    }

    let target_id = value.get("target_id").and_then(|v| v.as_str())?;
    let own_handle = conn.lock().participant.as_ref().map(|p| p.participant_handle.clone())?;
    if target_id != own_handle {
        return None;
    }

    let reshaped = serde_json::json!({
        "event": "voice:signal",
        "data": {
            "from_id": value.get("from_id"),
            "signal": value.get("signal"),
        }
    });
    Some(reshaped.to_string())
}

fn room_and_handle(conn: &Mutex<ConnState>) -> Option<(String, String)> {
    let c = conn.lock();
    match (&c.room_id, &c.participant) {
        (Some(r), Some(p)) => Some((r.clone(), p.participant_handle.clone())),
        _ => None,
    }
}

fn not_in_room() -> ErrorEnvelope {
    ErrorEnvelope::from(&SyncError::NotInRoom)
}

/// Shared shape for the four playback commands: requires IN_ROOM, enforces
/// the per-participant command rate limit and the playback-control
/// permission table before delegating to the playback engine (§4.E, §4.I).
async fn dispatch_playback<F, Fut>(
    state: &AppState,
    conn: &Mutex<ConnState>,
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    command: F,
) where
    F: FnOnce(String) -> Fut,
    Fut: std::future::Future<Output = SyncResult<crate::models::SyncCommand>>,
{
    let Some((room_id, handle)) = room_and_handle(conn) else {
        reply_error(sender, WsOutgoing::SyncError(not_in_room())).await;
        return;
    };

    let allowed = {
        let c = conn.lock();
        match (&c.participant, c.playback_control) {
            (Some(participant), Some(policy)) => {
                SessionEngine::can_control_playback(policy, participant)
            }
            _ => false,
        }
    };
    if !allowed {
        reply_error(sender, WsOutgoing::SyncError(ErrorEnvelope::from(&SyncError::Forbidden))).await;
        return;
    }

    if let Err(err) = state.session.check_command_rate_limit(&room_id, &handle).await {
        reply_error(sender, WsOutgoing::SyncError(ErrorEnvelope::from(&err))).await;
        return;
    }

    if let Err(err) = command(room_id).await {
        reply_error(sender, WsOutgoing::SyncError(ErrorEnvelope::from(&err))).await;
    }
    // Success path: the playback engine already broadcast `sync:command`
    // on the room's bus channel, which this connection (and every other
    // room member) receives through its bus subscription.
}

async fn reply_error(sender: &mut futures::stream::SplitSink<WebSocket, Message>, outgoing: WsOutgoing) {
    if let Some(msg) = outgoing.to_message() {
        let _ = sender.send(msg).await;
    }
}

/// Disconnect cleanup (§4.E, §4.F): leave the room and voice channel if the
/// connection was in either. Idempotent - a connection that never joined a
/// room is a no-op here.
async fn cleanup_on_disconnect(state: &AppState, conn: &Mutex<ConnState>, socket_id: &str) {
    let (room_id, handle, in_voice) = {
        let c = conn.lock();
        (
            c.room_id.clone(),
            c.participant.as_ref().map(|p| p.participant_handle.clone()),
            c.in_voice,
        )
    };
    let (Some(room_id), Some(handle)) = (room_id, handle) else {
        return;
    };

    if in_voice {
        if let Err(err) = state.voice.cleanup_on_disconnect(&room_id, &handle).await {
            log::warn!("[Gateway] Voice cleanup failed for {}/{}: {}", room_id, handle, err);
        }
    }
    if let Err(err) = state.session.leave(&room_id, socket_id, &handle).await {
        log::warn!("[Gateway] Leave-on-disconnect failed for {}/{}: {}", room_id, handle, err);
        return;
    }
    state.chat.emit_system_event(&room_id, SystemEventKind::Leave).await;
}

