//! Per-connection protocol loop.
//!
//! A socket moves through `Connected` (registered, no role) and `Joined`
//! (holds a role slot). Leaving the loop for any reason, including a handler
//! error or panic, runs the same cleanup: close frame, registry removal,
//! departure notices, writer drain.

use std::{borrow::Cow, panic::AssertUnwindSafe, time::Duration};

use anyhow::{Context, Result};
use axum::{
    extract::ws::{close_code, CloseFrame, Message, WebSocket},
    http::HeaderMap,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    FutureExt, SinkExt, StreamExt,
};
use metrics::counter;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::principal::{PrincipalError, PrincipalResolver};
use crate::protocol::{
    parse_client_frame, take_photo_relay, ClientMessage, RevokeReason, ServerMessage,
};
use crate::rooms::{
    parse_device_id, Connection, ConnectionKey, JoinReason, LeaseDecision, ParamError, Role,
    RoomHub, RoomKey,
};

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const CONNECT_HINT: &str = "connect with ?room=acc:<id>&device_id=<id>";

/// Query string of the connection entry point.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Params(#[from] ParamError),
    #[error(transparent)]
    Principal(#[from] PrincipalError),
}

impl HandshakeError {
    pub fn reason(&self) -> &'static str {
        match self {
            HandshakeError::Params(_) => "invalid_params",
            HandshakeError::Principal(err) => err.reason(),
        }
    }
}

/// Everything the loop needs to know about the upgrade request.
#[derive(Debug)]
pub struct Handshake {
    pub params: ConnectParams,
    pub origin: Option<String>,
    pub host: Option<String>,
    pub admission: Result<(RoomKey, String), HandshakeError>,
}

impl Handshake {
    pub fn from_request(
        params: ConnectParams,
        headers: &HeaderMap,
        resolver: &dyn PrincipalResolver,
    ) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        let admission = admit(&params, headers, resolver);
        Self {
            origin: header("origin"),
            host: header("host"),
            params,
            admission,
        }
    }

    fn hello(&self) -> ServerMessage {
        ServerMessage::Hello {
            room: trimmed(&self.params.room),
            device_id: trimmed(&self.params.device_id),
            origin: self.origin.clone(),
            host: self.host.clone(),
        }
    }
}

fn trimmed(value: &Option<String>) -> String {
    value.as_deref().unwrap_or_default().trim().to_string()
}

/// Validates the connection parameters and checks the room against the
/// request's principal.
pub fn admit(
    params: &ConnectParams,
    headers: &HeaderMap,
    resolver: &dyn PrincipalResolver,
) -> Result<(RoomKey, String), HandshakeError> {
    let room = RoomKey::parse(params.room.as_deref().unwrap_or_default())?;
    let device_id = parse_device_id(params.device_id.as_deref().unwrap_or_default())?;
    resolver.authorize(headers, &room)?;
    Ok((room, device_id))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connected,
    Joined(Role),
}

/// How the receive loop ended, including a caught panic.
type LoopOutcome = std::thread::Result<Result<Exit>>;

/// Why the receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    PeerGone,
    /// Superseded or evicted; the close frame is already queued.
    Cancelled,
    Policy(&'static str),
}

pub async fn serve_connection(socket: WebSocket, hub: RoomHub, handshake: Handshake) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    if let Err(err) = send_direct(&mut ws_tx, &handshake.hello()).await {
        debug!(error = %err, "peer left before hello");
        return;
    }

    let (room, device_id) = match handshake.admission {
        Ok(admitted) => admitted,
        Err(err) => {
            counter!("shutter_room_handshakes_rejected_total", 1, "reason" => err.reason());
            warn!(
                room = ?handshake.params.room,
                device_id = ?handshake.params.device_id,
                reason = err.reason(),
                error = %err,
                "connection refused"
            );
            let notice = ServerMessage::Error {
                reason: err.reason().to_string(),
                room: handshake.params.room.clone(),
                device_id: handshake.params.device_id.clone(),
                hint: Some(match &err {
                    HandshakeError::Params(inner) => format!("{inner}; {CONNECT_HINT}"),
                    HandshakeError::Principal(inner) => inner.to_string(),
                }),
            };
            let _ = send_direct(&mut ws_tx, &notice).await;
            let _ = ws_tx.send(close_frame(close_code::POLICY, err.reason())).await;
            return;
        }
    };

    let (tx, rx) = mpsc::channel(hub.config().connection_buffer);
    let closer = CancellationToken::new();
    let connection = Connection::new(device_id.clone(), tx.clone(), closer.clone());
    let registration = hub.add(&room, connection);
    let key = registration.key.clone();
    counter!("shutter_room_connections_opened_total", 1);
    if let Some(departure) = registration.superseded {
        hub.announce_departures(&room, &[departure]);
    }

    let mut writer = tokio::spawn(write_frames(ws_tx, rx, key.clone()));

    let mut session = Session::new(hub.clone(), key.clone(), tx.clone());
    let outcome = AssertUnwindSafe(session.run(&mut ws_rx, &closer))
        .catch_unwind()
        .await;

    finish_session(&hub, &key, &tx, outcome);

    drop(session);
    drop(tx);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        debug!(room = %room, device_id = %device_id, "writer did not drain in time");
        writer.abort();
    }
    info!(
        room = %room,
        device_id = %device_id,
        connection_id = %key.connection_id,
        "connection closed"
    );
}

/// Queues the close frame the loop outcome calls for, then removes the
/// connection and tells the room what it took with it.
fn finish_session(
    hub: &RoomHub,
    key: &ConnectionKey,
    tx: &mpsc::Sender<Message>,
    outcome: LoopOutcome,
) {
    let close = match outcome {
        Ok(Ok(Exit::PeerGone)) => Some((close_code::NORMAL, "bye")),
        Ok(Ok(Exit::Cancelled)) => None,
        Ok(Ok(Exit::Policy(reason))) => Some((close_code::POLICY, reason)),
        Ok(Err(err)) => {
            counter!("shutter_room_handler_faults_total", 1, "kind" => "error");
            warn!(room = %key.room, device_id = %key.device_id, error = ?err, "handler failed");
            Some((close_code::ERROR, "internal error"))
        }
        Err(_) => {
            counter!("shutter_room_handler_faults_total", 1, "kind" => "panic");
            warn!(room = %key.room, device_id = %key.device_id, "handler panicked");
            Some((close_code::ERROR, "internal error"))
        }
    };
    if let Some((code, reason)) = close {
        let _ = tx.try_send(close_frame(code, reason));
    }

    if let Some(departure) = hub.remove(key, RevokeReason::Disconnected) {
        hub.announce_departures(&key.room, &[departure]);
    }
    counter!("shutter_room_connections_closed_total", 1);
}

async fn write_frames(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    key: ConnectionKey,
) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if ws_tx.send(message).await.is_err() || closing {
            break;
        }
    }
    debug!(room = %key.room, device_id = %key.device_id, "writer task finished");
}

async fn send_direct(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<()> {
    let text = serde_json::to_string(message).context("failed to encode frame")?;
    ws_tx
        .send(Message::Text(text))
        .await
        .context("failed to send frame")
}

fn close_frame(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    }))
}

/// Protocol state of one registered connection.
struct Session {
    hub: RoomHub,
    key: ConnectionKey,
    tx: mpsc::Sender<Message>,
    phase: Phase,
}

impl Session {
    fn new(hub: RoomHub, key: ConnectionKey, tx: mpsc::Sender<Message>) -> Self {
        Self {
            hub,
            key,
            tx,
            phase: Phase::Connected,
        }
    }

    async fn run(
        &mut self,
        ws_rx: &mut SplitStream<WebSocket>,
        closer: &CancellationToken,
    ) -> Result<Exit> {
        loop {
            let frame = tokio::select! {
                biased;
                _ = closer.cancelled() => return Ok(Exit::Cancelled),
                frame = ws_rx.next() => frame,
            };
            let text = match frame {
                None => return Ok(Exit::PeerGone),
                Some(Err(err)) => {
                    debug!(device_id = %self.key.device_id, error = %err, "receive failed");
                    return Ok(Exit::PeerGone);
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(
                        room = %self.key.room,
                        device_id = %self.key.device_id,
                        reason = ?frame.map(|f| f.reason.to_string()),
                        "client closed websocket"
                    );
                    return Ok(Exit::PeerGone);
                }
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        counter!("shutter_room_frames_dropped_total", 1, "cause" => "binary");
                        continue;
                    }
                },
                Some(Ok(_)) => continue,
            };
            if let Some(exit) = self.handle_text(&text)? {
                return Ok(exit);
            }
        }
    }

    fn handle_text(&mut self, text: &str) -> Result<Option<Exit>> {
        let Some((message, raw)) = parse_client_frame(text) else {
            counter!("shutter_room_frames_dropped_total", 1, "cause" => "malformed");
            debug!(device_id = %self.key.device_id, "dropping malformed frame");
            return Ok(None);
        };

        match (message, self.phase) {
            (ClientMessage::Ping, _) => {
                self.hub.touch(&self.key);
                self.reply(&ServerMessage::Pong)?;
                Ok(None)
            }
            (ClientMessage::Join { role }, _) => self.join(&role),
            (ClientMessage::Unknown, _) => {
                debug!(device_id = %self.key.device_id, "ignoring unknown message type");
                Ok(None)
            }
            (message, Phase::Connected) => {
                counter!("shutter_room_frames_dropped_total", 1, "cause" => "not_joined");
                debug!(device_id = %self.key.device_id, ?message, "dropping message before join");
                Ok(None)
            }
            (ClientMessage::TakePhoto, Phase::Joined(role)) => Ok(self.take_photo(role, raw)),
            (
                ClientMessage::PhotoUploaded {
                    picture_id,
                    image_url,
                    pictured_at,
                },
                Phase::Joined(_),
            ) => Ok(self.photo_uploaded(picture_id, image_url, pictured_at)),
            (ClientMessage::RecorderAcquire { ttl_ms }, Phase::Joined(_)) => {
                self.acquire_lease(ttl_ms)
            }
            (ClientMessage::RecorderHeartbeat { ttl_ms }, Phase::Joined(_)) => {
                let ttl = self.hub.config().lease_ttl_for(ttl_ms);
                if !self.hub.heartbeat_lease(&self.key, ttl) {
                    debug!(device_id = %self.key.device_id, "heartbeat from non-holder ignored");
                }
                Ok(None)
            }
            (ClientMessage::RecorderRelease, Phase::Joined(_)) => {
                self.hub.release_lease(&self.key);
                self.hub.broadcast_roster(&self.key.room);
                Ok(None)
            }
        }
    }

    fn join(&mut self, role_name: &str) -> Result<Option<Exit>> {
        let Some(outcome) = self.hub.join_role(&self.key, role_name) else {
            return Ok(Some(Exit::Cancelled));
        };

        if let (true, Some(role)) = (outcome.granted, outcome.role) {
            self.phase = Phase::Joined(role);
            self.reply(&ServerMessage::JoinOk {
                role,
                limits: outcome.limits,
            })?;
            if outcome.lease_revoked {
                counter!(
                    "shutter_room_leases_revoked_total",
                    1,
                    "reason" => RevokeReason::RoleChanged.as_str()
                );
                self.hub.broadcast(
                    &self.key.room,
                    &ServerMessage::RecorderRevoked {
                        device_id: self.key.device_id.clone(),
                        reason: RevokeReason::RoleChanged,
                    },
                    None,
                );
            }
            self.hub.broadcast_roster(&self.key.room);
            return Ok(None);
        }

        self.reply(&ServerMessage::JoinDenied {
            reason: outcome.reason,
            limits: outcome.limits,
        })?;
        if outcome.reason == JoinReason::InvalidRole {
            return Ok(Some(Exit::Policy("invalid_role")));
        }
        Ok(None)
    }

    /// Relays the shutter command for the controller. The role is confirmed
    /// against this connection, not just the device id.
    fn take_photo(&self, role: Role, raw: Value) -> Option<Exit> {
        let room = &self.key.room;
        let device_id = &self.key.device_id;
        let current = match role {
            Role::Controller => self.hub.current_role(&self.key),
            Role::Participant => Some(role),
        };
        match current {
            // The controller slot only goes away with the connection.
            None => return Some(Exit::Cancelled),
            Some(Role::Controller) => {}
            Some(Role::Participant) => {
                counter!("shutter_room_frames_dropped_total", 1, "cause" => "not_controller");
                debug!(
                    room = %room,
                    device_id = %device_id,
                    "take_photo from non-controller dropped"
                );
                return None;
            }
        }
        let relay = take_photo_relay(raw, device_id);
        let delivered = self.hub.broadcast(room, &relay, Some(device_id));
        counter!("shutter_room_photos_triggered_total", 1);
        debug!(room = %room, device_id = %device_id, delivered, "take_photo relayed");
        None
    }

    fn photo_uploaded(
        &self,
        picture_id: Value,
        image_url: Option<String>,
        pictured_at: Option<String>,
    ) -> Option<Exit> {
        let Some(seq) = self.hub.next_photo_seq(&self.key) else {
            return Some(Exit::Cancelled);
        };
        let event = ServerMessage::PhotoUploaded {
            seq,
            picture_id,
            device_id: self.key.device_id.clone(),
            image_url: image_url.unwrap_or_default(),
            pictured_at,
        };
        let delivered = self.hub.broadcast(&self.key.room, &event, None);
        counter!("shutter_room_photos_uploaded_total", 1);
        debug!(
            room = %self.key.room,
            device_id = %self.key.device_id,
            seq,
            delivered,
            "photo_uploaded relayed"
        );
        None
    }

    fn acquire_lease(&self, ttl_ms: Option<u64>) -> Result<Option<Exit>> {
        let ttl = self.hub.config().lease_ttl_for(ttl_ms);
        let Some(decision) = self.hub.acquire_lease(&self.key, ttl) else {
            return Ok(Some(Exit::Cancelled));
        };
        let reply = match decision {
            LeaseDecision::Granted { ttl, renewed } => ServerMessage::RecorderGranted {
                device_id: self.key.device_id.clone(),
                ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
                renewed,
            },
            LeaseDecision::Denied { reason, holder } => {
                ServerMessage::RecorderDenied { reason, holder }
            }
        };
        self.reply(&reply)?;
        self.hub.broadcast_roster(&self.key.room);
        Ok(None)
    }

    /// Queues a frame for this connection only. A full or closed writer is not
    /// an error here; the broadcaster evicts such connections.
    fn reply(&self, message: &ServerMessage) -> Result<()> {
        let text = serde_json::to_string(message).context("failed to encode reply")?;
        if self.tx.try_send(Message::Text(text)).is_err() {
            debug!(device_id = %self.key.device_id, "reply dropped");
        }
        Ok(())
    }
}
