//! WebSocket Signaling Relay with Room Support
//!
//! A pure message relay for voice-channel signaling. It never looks at SDP;
//! it only routes JSON objects between participants of the same room.
//!
//! Routing:
//! - Participants connect to `ws://relay/ws/{room_id}/{session_id}` (any
//!   prefix is accepted; the last two path segments are room and session)
//! - On connect, every other participant in the room receives
//!   `{"type":"user_joined","user_id":...}`; the joiner itself does not
//! - A message with `target_user_id` is delivered only to that participant,
//!   stamped with the sender's `sender_user_id`
//! - A message without a target is broadcast to the rest of the room
//! - `identify` messages also record the participant's display name for the
//!   roster
//! - On disconnect the room receives `{"type":"user_left","user_id":...}`

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::roster::RosterEntry;

/// Ephemeral session id of a connected participant
type SessionId = String;

/// Room ID (string identifier)
type RoomId = String;

/// Message sender for a connected participant
type ClientSender = mpsc::UnboundedSender<Message>;

struct Client {
    sender: ClientSender,
    username: Option<String>,
}

/// Room containing connected participants
struct Room {
    clients: HashMap<SessionId, Client>,
}

impl Room {
    fn new() -> Self {
        Self {
            clients: HashMap::new(),
        }
    }
}

type Rooms = Arc<Mutex<HashMap<RoomId, Room>>>;

/// Signaling relay bound to a TCP listener
pub struct SignalingRelay {
    listener: TcpListener,
    local_addr: SocketAddr,
    rooms: Rooms,
    running: Arc<AtomicBool>,
}

impl SignalingRelay {
    /// Bind the relay (use port 0 for an ephemeral port)
    pub async fn bind(addr: &str) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            rooms: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Check if the relay is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get the total number of connected participants across all rooms
    pub fn client_count(&self) -> usize {
        let rooms = self.rooms.lock();
        rooms.values().map(|r| r.clients.len()).sum()
    }

    /// Get the number of active rooms
    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    /// Handle for reading the roster while the relay runs
    pub fn roster_source(&self) -> RelayRoster {
        RelayRoster {
            rooms: self.rooms.clone(),
        }
    }

    /// Handle for stopping the relay from another task
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Stop the relay
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Run the accept loop until stopped
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        log::info!("[SignalingRelay] Listening on ws://{}", self.local_addr);

        while self.running.load(Ordering::SeqCst) {
            // Use timeout to allow checking running flag
            let accept_result = tokio::time::timeout(
                Duration::from_millis(100),
                self.listener.accept(),
            ).await;

            match accept_result {
                Ok(Ok((stream, addr))) => {
                    let rooms = self.rooms.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, rooms).await {
                            log::warn!("[SignalingRelay] Client {} error: {}", addr, e);
                        }
                    });
                }
                Ok(Err(e)) => {
                    log::error!("[SignalingRelay] Accept error: {}", e);
                }
                Err(_) => {
                    // Timeout - just continue to check running flag
                }
            }
        }

        log::info!("[SignalingRelay] Stopped");
    }
}

/// Read-only view of the relay's rooms for the roster endpoint
#[derive(Clone)]
pub struct RelayRoster {
    rooms: Rooms,
}

impl RelayRoster {
    /// Connected participants per room; unnamed participants show their session id
    pub fn active_users(&self) -> BTreeMap<String, Vec<RosterEntry>> {
        let rooms = self.rooms.lock();
        rooms
            .iter()
            .map(|(room_id, room)| {
                let mut entries: Vec<RosterEntry> = room
                    .clients
                    .iter()
                    .map(|(session_id, client)| RosterEntry {
                        participant_id: session_id.clone(),
                        display_name: client.username.clone().unwrap_or_else(|| session_id.clone()),
                    })
                    .collect();
                entries.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
                (room_id.clone(), entries)
            })
            .collect()
    }
}

/// Extract `(room_id, session_id)` from the last two path segments
fn parse_path(path: &str) -> Option<(String, String)> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 2 {
        return None;
    }
    let room = decode_segment(segments[segments.len() - 2]);
    let session = decode_segment(segments[segments.len() - 1]);
    Some((room, session))
}

fn decode_segment(segment: &str) -> String {
    percent_encoding::percent_decode_str(segment).decode_utf8_lossy().into_owned()
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    rooms: Rooms,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut identity: Option<(String, String)> = None;

    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match parse_path(request.uri().path()) {
                Some(ids) => {
                    identity = Some(ids);
                    Ok(response)
                }
                None => {
                    let mut rejection = ErrorResponse::new(Some("expected /{room_id}/{session_id}".to_string()));
                    *rejection.status_mut() = StatusCode::BAD_REQUEST;
                    Err(rejection)
                }
            }
        },
    ).await?;

    let (room_id, session_id) = match identity {
        Some(ids) => ids,
        None => return Ok(()),
    };

    log::info!("[SignalingRelay] {} connected from {} to room '{}'", session_id, addr, room_id);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Create channel for sending messages to this participant
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Register, then announce to everyone already present
    {
        let mut rooms_guard = rooms.lock();
        let room = rooms_guard.entry(room_id.clone()).or_insert_with(Room::new);
        room.clients.insert(session_id.clone(), Client { sender: tx, username: None });
        log::info!("[SignalingRelay] Room '{}' now has {} participant(s)", room_id, room.clients.len());
    }
    broadcast(
        &rooms,
        &room_id,
        Some(&session_id),
        &json!({ "type": "user_joined", "user_id": session_id }),
    );

    // Spawn task to forward messages from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                route_message(&rooms, &room_id, &session_id, &text);
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                log::warn!("[SignalingRelay] {} receive error: {}", session_id, e);
                break;
            }
        }
    }

    // Unregister participant from its room
    let removed = {
        let mut rooms_guard = rooms.lock();
        let mut removed = false;
        if let Some(room) = rooms_guard.get_mut(&room_id) {
            removed = room.clients.remove(&session_id).is_some();
            let remaining = room.clients.len();
            log::info!("[SignalingRelay] {} left room '{}', {} participant(s) remaining",
                       session_id, room_id, remaining);

            // Remove empty rooms
            if remaining == 0 {
                rooms_guard.remove(&room_id);
                log::info!("[SignalingRelay] Room '{}' deleted (empty)", room_id);
            }
        }
        removed
    };
    if removed {
        broadcast(&rooms, &room_id, None, &json!({ "type": "user_left", "user_id": session_id }));
    }

    send_task.abort();
    Ok(())
}

/// Route one text frame from `sender_id`
fn route_message(rooms: &Rooms, room_id: &str, sender_id: &str, text: &str) {
    let mut message: Value = match serde_json::from_str(text) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(_) | Err(_) => {
            log::warn!("[SignalingRelay] Ignoring non-object frame from {}", sender_id);
            return;
        }
    };

    let kind = message.get("type").and_then(Value::as_str).unwrap_or("").to_string();
    log::debug!("[SignalingRelay] '{}' from {} in '{}'", kind, sender_id, room_id);

    if kind == "identify" {
        let username = message
            .get("username")
            .and_then(Value::as_str)
            .unwrap_or(sender_id)
            .to_string();
        if let Some(client) = rooms.lock().get_mut(room_id).and_then(|r| r.clients.get_mut(sender_id)) {
            client.username = Some(username);
        }
    }

    // The relay is authoritative for the sender
    message["sender_user_id"] = Value::String(sender_id.to_string());

    let target = message.get("target_user_id").and_then(Value::as_str).map(str::to_string);
    match target {
        Some(target) => send_to(rooms, room_id, &target, &message),
        None => broadcast(rooms, room_id, Some(sender_id), &message),
    }
}

/// Deliver to one participant
fn send_to(rooms: &Rooms, room_id: &str, target: &str, message: &Value) {
    let rooms_guard = rooms.lock();
    match rooms_guard.get(room_id).and_then(|r| r.clients.get(target)) {
        Some(client) => {
            let _ = client.sender.send(Message::Text(message.to_string()));
        }
        None => {
            log::debug!("[SignalingRelay] Target {} not in room '{}'", target, room_id);
        }
    }
}

/// Deliver to every participant in the room except `exclude`
fn broadcast(rooms: &Rooms, room_id: &str, exclude: Option<&str>, message: &Value) {
    let text = message.to_string();
    let rooms_guard = rooms.lock();
    if let Some(room) = rooms_guard.get(room_id) {
        for (id, client) in room.clients.iter() {
            if Some(id.as_str()) != exclude {
                let _ = client.sender.send(Message::Text(text.clone()));
            }
        }
    }
}
