//! Client gateway.
//!
//! Accepts long-lived websocket sessions at `/ws`, validates and dispatches
//! incoming frames, binds a session to at most one room, and fans committed
//! room state back out to subscribers. The subscriber set lives here, not
//! in the registry — [`GatewayFanout`] is the capability the registry's
//! Raft apply path calls into, which keeps the room state machine itself
//! free of any network concern.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::codec::{self, Frame, DEFAULT_FRAME_CAP_BYTES, MAX_CHAT_TEXT_LEN};
use crate::errors::{ErrorCategory, GatewayError};
use crate::raft::{NodeId, RoomFanout};
use crate::registry::RoomRegistry;
use crate::room_state::{Operation, OperationKind, RoomState};

const LIFECYCLE_CHANNEL_CAP: usize = 256;

/// How long a room may sit with no participants and no local subscriber
/// before this node tears its Raft group down (spec's room lifecycle rule).
const ROOM_IDLE_GRACE: Duration = Duration::from_secs(30);
const REAPER_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn gen_session_id() -> String {
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap())
        .collect()
}

// ── Subscriber bookkeeping ───────────────────────────────────────────────────

struct Subscriber {
    state_tx: watch::Sender<Option<(String, RoomState)>>,
    lifecycle_tx: mpsc::Sender<Frame>,
}

/// `room_code -> session_id -> Subscriber`.
type SubscriberMap = DashMap<String, DashMap<String, Subscriber>>;

/// The apply-path capability handed to each room's Raft group. Holds only a
/// `Weak` reference back to the registry — the registry's rooms strongly
/// own this fanout (via `Arc<dyn RoomFanout>`), so a strong back-reference
/// would leak every room forever.
struct GatewayFanout {
    room_code: String,
    subscribers: Arc<SubscriberMap>,
    last_leader: Arc<DashMap<String, NodeId>>,
    registry: Weak<RoomRegistry>,
}

impl RoomFanout for GatewayFanout {
    fn on_apply(&self, state: &RoomState) {
        let Some(room_subs) = self.subscribers.get(&self.room_code) else {
            return;
        };

        if let Some(registry) = self.registry.upgrade() {
            if let Some(group) = registry.get_for_read(&self.room_code) {
                if let Some(leader) = group.current_leader() {
                    let changed = self
                        .last_leader
                        .get(&self.room_code)
                        .map(|l| *l != leader)
                        .unwrap_or(true);
                    if changed {
                        self.last_leader.insert(self.room_code.clone(), leader);
                        let frame = Frame {
                            kind: "LEADER_CHANGED".to_string(),
                            payload: json!({
                                "roomCode": self.room_code,
                                "leaderId": leader.to_string(),
                            }),
                        };
                        for sub in room_subs.iter() {
                            let _ = sub.lifecycle_tx.try_send(frame.clone());
                        }
                    }
                }
            }
        }

        for sub in room_subs.iter() {
            let _ = sub.state_tx.send(Some((self.room_code.clone(), state.clone())));
        }
    }
}

// ── Gateway ──────────────────────────────────────────────────────────────────

pub struct Gateway {
    registry: Arc<RoomRegistry>,
    subscribers: Arc<SubscriberMap>,
    last_leader: Arc<DashMap<String, NodeId>>,
    idle_since: DashMap<String, Instant>,
    node_id: String,
}

impl Gateway {
    /// Builds a `RoomRegistry` wired to this gateway's fanout and the
    /// gateway that reads from it, breaking the cyclic-ownership the
    /// room-vs-gateway relationship would otherwise require.
    pub fn new(node_id: impl Into<String>, peers: Vec<(NodeId, String)>, self_node_id: NodeId) -> Arc<Self> {
        let subscribers: Arc<SubscriberMap> = Arc::new(DashMap::new());
        let last_leader: Arc<DashMap<String, NodeId>> = Arc::new(DashMap::new());
        let node_id = node_id.into();

        // `registry` is filled in once `RoomRegistry::new` returns; the
        // factory closure only needs a `Weak` handle, so we build it before
        // the registry exists by routing through a shared cell.
        let registry_cell: Arc<std::sync::OnceLock<Weak<RoomRegistry>>> = Arc::new(std::sync::OnceLock::new());

        let subs_for_factory = subscribers.clone();
        let last_leader_for_factory = last_leader.clone();
        let cell_for_factory = registry_cell.clone();
        let fanout_factory = Arc::new(move |room_code: String| {
            let registry = cell_for_factory.get().cloned().unwrap_or_default();
            Arc::new(GatewayFanout {
                room_code,
                subscribers: subs_for_factory.clone(),
                last_leader: last_leader_for_factory.clone(),
                registry,
            }) as Arc<dyn RoomFanout>
        });

        let registry = RoomRegistry::new(self_node_id, peers, fanout_factory);
        let _ = registry_cell.set(Arc::downgrade(&registry));

        let gateway = Arc::new(Self {
            registry,
            subscribers,
            last_leader,
            idle_since: DashMap::new(),
            node_id,
        });
        gateway.clone().spawn_reaper();
        gateway
    }

    pub fn registry(&self) -> Arc<RoomRegistry> {
        self.registry.clone()
    }

    /// Runs forever, periodically tearing down rooms that have had no
    /// participants and no locally connected subscriber for
    /// `ROOM_IDLE_GRACE` — the room destruction rule from spec §3. Without
    /// this, every created room's Raft group (election + heartbeat timers)
    /// would run for the lifetime of the node.
    fn spawn_reaper(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(REAPER_SWEEP_INTERVAL).await;
                self.reap_idle_rooms().await;
            }
        });
    }

    async fn reap_idle_rooms(&self) {
        for code in self.registry.room_codes() {
            let Some(group) = self.registry.get_for_read(&code) else {
                continue;
            };
            let state = group.current_state();
            let has_subscribers = self
                .subscribers
                .get(&code)
                .map(|m| !m.is_empty())
                .unwrap_or(false);

            if state.participants.is_empty() && !has_subscribers {
                let became_idle_at = *self
                    .idle_since
                    .entry(code.clone())
                    .or_insert_with(Instant::now);
                if became_idle_at.elapsed() >= ROOM_IDLE_GRACE {
                    self.idle_since.remove(&code);
                    self.last_leader.remove(&code);
                    self.subscribers.remove(&code);
                    self.registry.drop_room(&code).await;
                    info!(room = %code, "reaped idle room");
                }
            } else {
                self.idle_since.remove(&code);
            }
        }
    }

    fn subscribe(&self, room_code: &str, session_id: &str, sub_tx: watch::Sender<Option<(String, RoomState)>>, lifecycle_tx: mpsc::Sender<Frame>) {
        self.subscribers
            .entry(room_code.to_string())
            .or_insert_with(DashMap::new)
            .insert(
                session_id.to_string(),
                Subscriber {
                    state_tx: sub_tx,
                    lifecycle_tx,
                },
            );
    }

    fn unsubscribe(&self, room_code: &str, session_id: &str) {
        if let Some(map) = self.subscribers.get(room_code) {
            map.remove(session_id);
        }
    }
}

// ── axum wiring ──────────────────────────────────────────────────────────────

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(gateway)
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, gateway))
}

async fn health(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    axum::Json(json!({ "status": "ok", "nodeId": gateway.node_id }))
}

// ── Session ──────────────────────────────────────────────────────────────────

struct Session {
    id: String,
    user_id: Option<String>,
    bound_room_code: Option<String>,
}

async fn handle_socket(socket: WebSocket, gateway: Arc<Gateway>) {
    let session_id = gen_session_id();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (lifecycle_tx, mut lifecycle_rx) = mpsc::channel::<Frame>(LIFECYCLE_CHANNEL_CAP);
    let (state_tx, mut state_rx) = watch::channel::<Option<(String, RoomState)>>(None);

    let connected = Frame {
        kind: "CONNECTED".to_string(),
        payload: json!({ "clientId": session_id, "nodeId": gateway.node_id }),
    };
    if lifecycle_tx.send(connected).await.is_err() {
        return;
    }

    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe_frame = lifecycle_rx.recv() => {
                    match maybe_frame {
                        Some(frame) => {
                            let bytes = codec::encode_frame(&frame);
                            let text = String::from_utf8_lossy(&bytes).into_owned();
                            if ws_tx.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = state_rx.borrow_and_update().clone();
                    if let Some((room_code, state)) = snapshot {
                        let frame = Frame {
                            kind: "ROOM_STATE_UPDATE".to_string(),
                            payload: json!({ "roomCode": room_code, "roomState": state }),
                        };
                        let bytes = codec::encode_frame(&frame);
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        if ws_tx.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });

    let mut session = Session {
        id: session_id.clone(),
        user_id: None,
        bound_room_code: None,
    };

    while let Some(Ok(msg)) = ws_rx.next().await {
        let raw = match msg {
            Message::Text(t) => t.into_bytes(),
            Message::Binary(b) => b,
            Message::Close(_) => break,
            _ => continue,
        };

        let frame = match codec::decode_frame(&raw, DEFAULT_FRAME_CAP_BYTES) {
            Ok(f) => f,
            Err(e) => {
                let _ = lifecycle_tx
                    .send(error_frame(ErrorCategory::Validation, &e.to_string()))
                    .await;
                continue;
            }
        };

        if let Err(e) = dispatch(&gateway, &mut session, &state_tx, &lifecycle_tx, frame).await {
            let _ = lifecycle_tx.send(error_frame(e.category(), &e.to_string())).await;
        }
    }

    if let Some(room_code) = session.bound_room_code.take() {
        if let Some(user_id) = session.user_id.clone() {
            let leave = Operation::new(OperationKind::RoomLeave { user_id }, &session.id, now_millis());
            let _ = gateway.registry.propose_or_forward(&room_code, leave).await;
        }
        gateway.unsubscribe(&room_code, &session.id);
    }

    writer.abort();
    info!(session = %session.id, "session closed");
}

fn error_frame(category: ErrorCategory, message: &str) -> Frame {
    Frame {
        kind: "ERROR".to_string(),
        payload: json!({ "message": message, "code": category.label() }),
    }
}

fn get_str(payload: &Value, field: &'static str) -> Result<String, GatewayError> {
    payload
        .get(field)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or(GatewayError::MissingField(field))
}

fn get_opt_str(payload: &Value, field: &'static str) -> Option<String> {
    payload.get(field).and_then(|v| v.as_str()).map(|s| s.to_string())
}

fn get_f64(payload: &Value, field: &'static str) -> Result<f64, GatewayError> {
    payload.get(field).and_then(|v| v.as_f64()).ok_or(GatewayError::MissingField(field))
}

fn get_i64(payload: &Value, field: &'static str) -> Result<i64, GatewayError> {
    payload.get(field).and_then(|v| v.as_i64()).ok_or(GatewayError::MissingField(field))
}

fn normalize_room_code(raw: &str) -> Result<String, GatewayError> {
    let upper = raw.to_uppercase();
    if upper.len() == 6 && upper.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()) {
        Ok(upper)
    } else {
        Err(GatewayError::MalformedRoomCode(raw.to_string()))
    }
}

async fn dispatch(
    gateway: &Arc<Gateway>,
    session: &mut Session,
    state_tx: &watch::Sender<Option<(String, RoomState)>>,
    lifecycle_tx: &mpsc::Sender<Frame>,
    frame: Frame,
) -> Result<(), GatewayError> {
    match frame.kind.as_str() {
        "ROOM_CREATE" => {
            let user_id = get_str(&frame.payload, "userId")?;
            let username = get_str(&frame.payload, "username")?;

            let (code, state) = gateway
                .registry
                .create_room(&user_id, &username)
                .await
                .map_err(|_| GatewayError::ForwardFailed {
                    room: "<new room>".to_string(),
                    reason: "failed to seed room".to_string(),
                })?;

            session.user_id = Some(user_id);
            session.bound_room_code = Some(code.clone());
            let _ = state_tx.send(Some((code.clone(), state.clone())));
            gateway.subscribe(&code, &session.id, state_tx.clone(), lifecycle_tx.clone());

            lifecycle_tx
                .send(Frame {
                    kind: "ROOM_CREATED".to_string(),
                    payload: json!({ "roomCode": code, "roomState": state }),
                })
                .await
                .map_err(|_| GatewayError::SessionSendFailure(session.id.clone()))?;
            Ok(())
        }

        "ROOM_JOIN" => {
            let room_code = normalize_room_code(&get_str(&frame.payload, "roomCode")?)?;
            let user_id = get_str(&frame.payload, "userId")?;
            let username = get_str(&frame.payload, "username")?;

            let group = gateway
                .registry
                .get_for_read(&room_code)
                .ok_or_else(|| GatewayError::RoomNotFound(room_code.clone()))?;

            let op = Operation::new(
                OperationKind::RoomJoin {
                    user_id: user_id.clone(),
                    username,
                },
                &user_id,
                now_millis(),
            );
            gateway.registry.propose_or_forward(&room_code, op).await?;

            session.user_id = Some(user_id);
            session.bound_room_code = Some(room_code.clone());
            let snapshot = group.current_state();
            let _ = state_tx.send(Some((room_code.clone(), snapshot.clone())));
            gateway.subscribe(&room_code, &session.id, state_tx.clone(), lifecycle_tx.clone());

            lifecycle_tx
                .send(Frame {
                    kind: "ROOM_JOINED".to_string(),
                    payload: json!({ "roomCode": room_code, "roomState": snapshot }),
                })
                .await
                .map_err(|_| GatewayError::SessionSendFailure(session.id.clone()))?;
            Ok(())
        }

        "ROOM_LEAVE" => {
            let room_code = normalize_room_code(&get_str(&frame.payload, "roomCode")?)?;
            let user_id = get_str(&frame.payload, "userId")?;

            let op = Operation::new(OperationKind::RoomLeave { user_id }, &session.id, now_millis());
            gateway.registry.propose_or_forward(&room_code, op).await?;

            session.bound_room_code = None;
            gateway.unsubscribe(&room_code, &session.id);

            lifecycle_tx
                .send(Frame {
                    kind: "ROOM_LEFT".to_string(),
                    payload: json!({ "roomCode": room_code }),
                })
                .await
                .map_err(|_| GatewayError::SessionSendFailure(session.id.clone()))?;
            Ok(())
        }

        "PLAYBACK_PLAY" => {
            let room_code = normalize_room_code(&get_str(&frame.payload, "roomCode")?)?;
            let video_id = get_str(&frame.payload, "videoId")?;
            let position_seconds = get_f64(&frame.payload, "positionSeconds")?;
            let op = Operation::new(
                OperationKind::PlaybackPlay { video_id, position_seconds },
                session.user_id.as_deref().unwrap_or(&session.id),
                now_millis(),
            );
            gateway.registry.propose_or_forward(&room_code, op).await
        }

        "PLAYBACK_PAUSE" => {
            let room_code = normalize_room_code(&get_str(&frame.payload, "roomCode")?)?;
            let position_seconds = get_f64(&frame.payload, "positionSeconds")?;
            let op = Operation::new(
                OperationKind::PlaybackPause { position_seconds },
                session.user_id.as_deref().unwrap_or(&session.id),
                now_millis(),
            );
            gateway.registry.propose_or_forward(&room_code, op).await
        }

        "PLAYBACK_SEEK" => {
            let room_code = normalize_room_code(&get_str(&frame.payload, "roomCode")?)?;
            let new_position_seconds = get_f64(&frame.payload, "newPositionSeconds")?;
            let op = Operation::new(
                OperationKind::PlaybackSeek { new_position_seconds },
                session.user_id.as_deref().unwrap_or(&session.id),
                now_millis(),
            );
            gateway.registry.propose_or_forward(&room_code, op).await
        }

        "PLAYLIST_ADD" => {
            let room_code = normalize_room_code(&get_str(&frame.payload, "roomCode")?)?;
            let video_id = get_str(&frame.payload, "videoId")?;
            let title = get_opt_str(&frame.payload, "title");
            let position = get_i64(&frame.payload, "newVideoPosition")?;
            let op = Operation::new(
                OperationKind::PlaylistAdd { video_id, title, position },
                session.user_id.as_deref().unwrap_or(&session.id),
                now_millis(),
            );
            gateway.registry.propose_or_forward(&room_code, op).await
        }

        "PLAYLIST_REMOVE" => {
            let room_code = normalize_room_code(&get_str(&frame.payload, "roomCode")?)?;
            let video_id = get_str(&frame.payload, "videoId")?;
            let removed_video_position = get_i64(&frame.payload, "removedVideoPosition")?;
            let op = Operation::new(
                OperationKind::PlaylistRemove { video_id, removed_video_position },
                session.user_id.as_deref().unwrap_or(&session.id),
                now_millis(),
            );
            gateway.registry.propose_or_forward(&room_code, op).await
        }

        "CHAT_MESSAGE" => {
            let room_code = normalize_room_code(&get_str(&frame.payload, "roomCode")?)?;
            let message_text = get_str(&frame.payload, "messageText")?;
            codec::check_chat_text_len(&message_text).map_err(|_| GatewayError::ChatTooLong {
                len: message_text.chars().count().max(MAX_CHAT_TEXT_LEN + 1),
            })?;
            let op = Operation::new(
                OperationKind::ChatMessage { text: message_text },
                session.user_id.as_deref().unwrap_or(&session.id),
                now_millis(),
            );
            gateway.registry.propose_or_forward(&room_code, op).await
        }

        other => Err(GatewayError::UnknownType(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_code_normalization_accepts_lowercase() {
        assert_eq!(normalize_room_code("abcd12").unwrap(), "ABCD12");
    }

    #[test]
    fn room_code_normalization_rejects_wrong_length() {
        assert!(normalize_room_code("abcd1").is_err());
    }

    #[test]
    fn room_code_normalization_rejects_non_alnum() {
        assert!(normalize_room_code("abc-12").is_err());
    }

    #[test]
    fn session_ids_are_sixteen_hex_chars() {
        let id = gen_session_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
