//! ShapeSync WebSocket relay.
//!
//! Rebroadcasts frames between clients in the same room, never back to the
//! sender. Each room keeps a merged Loro document so late joiners receive
//! the full state in their `joined` frame. Room snapshots can be persisted
//! through a [`Storage`] backend and restored when the room is reopened.
//!
//! Storage calls run on tokio's blocking pool and are serialized by one lock,
//! so a room is never restored while its last snapshot is still being
//! written.

pub mod config;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use loro::{ExportMode, LoroDoc};
use shapesync_core::sync::{decode_payload, encode_payload, ClientMessage, ServerMessage};
use shapesync_core::storage::StorageResult;
use shapesync_core::{Storage, StorageError};
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use config::{ConfigError, ServerConfig};

const CHANNEL_CAPACITY: usize = 256;

/// Connection id used as `from` for frames the relay itself originates.
pub const RELAY_ID: &str = "relay";

type RoomMessage = (String, ServerMessage);

/// Room state
struct Room {
    /// Broadcast channel for this room
    tx: broadcast::Sender<RoomMessage>,
    /// Connected peer IDs
    peers: HashSet<String>,
    /// Merged state of every sync frame seen in this room
    doc: LoroDoc,
    /// Changed since last persisted
    dirty: bool,
}

impl Room {
    fn new(doc: LoroDoc) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            peers: HashSet::new(),
            doc,
            dirty: false,
        }
    }

    fn snapshot(&self) -> Option<Vec<u8>> {
        if self.doc.oplog_vv().is_empty() {
            return None;
        }
        match self.doc.export(ExportMode::Snapshot) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Failed to export room snapshot: {e}");
                None
            }
        }
    }
}

/// Shared application state
pub struct AppState {
    rooms: DashMap<String, Room>,
    storage: Option<Arc<dyn Storage>>,
    /// Held across restores and writes
    storage_io: Mutex<()>,
}

impl AppState {
    /// Relay without persistence.
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            storage: None,
            storage_io: Mutex::new(()),
        }
    }

    /// Relay that restores and saves room snapshots through `storage`.
    pub fn with_storage(storage: Arc<dyn Storage>) -> Self {
        Self {
            rooms: DashMap::new(),
            storage: Some(storage),
            storage_io: Mutex::new(()),
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn peer_count(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map(|r| r.peers.len()).unwrap_or(0)
    }

    /// Load a persisted room snapshot, if any.
    async fn restore(&self, room_id: &str) -> LoroDoc {
        let doc = LoroDoc::new();
        let Some(storage) = self.storage.clone() else {
            return doc;
        };
        let id = room_id.to_string();
        match blocking_storage(move |rt| rt.block_on(storage.load(&id))).await {
            Ok(bytes) => match doc.import(&bytes) {
                Ok(_) => info!("Restored room {room_id} from storage"),
                Err(e) => warn!("Discarding unreadable snapshot for room {room_id}: {e}"),
            },
            Err(StorageError::NotFound(_)) => {}
            Err(e) => warn!("Failed to load room {room_id}: {e}"),
        }
        doc
    }

    /// Add peer to room, creating or restoring the room as needed.
    async fn join_room(&self, room_id: &str, peer_id: &str) -> (broadcast::Receiver<RoomMessage>, Option<String>, usize) {
        if !self.rooms.contains_key(room_id) {
            let _io = self.storage_io.lock().await;
            // A leave may have reinstated the room while we waited
            if !self.rooms.contains_key(room_id) {
                let doc = self.restore(room_id).await;
                self.rooms.entry(room_id.to_string()).or_insert_with(|| Room::new(doc));
            }
        }
        let mut room = self
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Room::new(LoroDoc::new()));
        room.peers.insert(peer_id.to_string());
        let rx = room.tx.subscribe();
        let initial_sync = room.snapshot().map(|bytes| encode_payload(&bytes));
        (rx, initial_sync, room.peers.len())
    }

    /// Remove peer from room. The last peer out persists and drops the room;
    /// if the write fails the room stays open and dirty for the next autosave.
    async fn leave_room(&self, room_id: &str, peer_id: &str) {
        let now_empty = match self.rooms.get_mut(room_id) {
            Some(mut room) => {
                room.peers.remove(peer_id);
                room.peers.is_empty()
            }
            None => return,
        };
        if !now_empty {
            return;
        }

        let _io = self.storage_io.lock().await;
        let Some((room_id, room)) = self.rooms.remove_if(room_id, |_, r| r.peers.is_empty()) else {
            return;
        };
        if room.dirty && self.storage.is_some() {
            if let Some(snapshot) = room.snapshot() {
                if !self.persist(&room_id, snapshot).await {
                    self.rooms.entry(room_id).or_insert(room);
                    return;
                }
            }
        }
        debug!("Closed empty room {room_id}");
    }

    /// Merge update bytes into the room document.
    fn apply_sync(&self, room_id: &str, bytes: &[u8]) -> Result<(), String> {
        let mut room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| format!("Unknown room {room_id}"))?;
        room.doc.import(bytes).map_err(|e| e.to_string())?;
        room.dirty = true;
        Ok(())
    }

    fn room_snapshot(&self, room_id: &str) -> Option<Vec<u8>> {
        self.rooms.get(room_id).and_then(|r| r.snapshot())
    }

    /// Broadcast message to room
    fn broadcast(&self, room_id: &str, from: &str, msg: ServerMessage) {
        if let Some(room) = self.rooms.get(room_id) {
            let _ = room.tx.send((from.to_string(), msg));
        }
    }

    /// Write a snapshot. Callers hold `storage_io`.
    async fn persist(&self, room_id: &str, snapshot: Vec<u8>) -> bool {
        let Some(storage) = self.storage.clone() else {
            return false;
        };
        let len = snapshot.len();
        let id = room_id.to_string();
        match blocking_storage(move |rt| rt.block_on(storage.save(&id, &snapshot))).await {
            Ok(()) => {
                debug!("Saved room {room_id} ({len} bytes)");
                true
            }
            Err(e) => {
                warn!("Failed to save room {room_id}: {e}");
                false
            }
        }
    }

    /// Persist every room changed since its last successful save. Returns
    /// how many rooms were written. Rooms whose write fails stay dirty, and
    /// empty rooms are closed once saved.
    pub async fn save_dirty(&self) -> usize {
        if self.storage.is_none() {
            return 0;
        }
        let dirty: Vec<String> = self
            .rooms
            .iter()
            .filter(|room| room.dirty)
            .map(|room| room.key().clone())
            .collect();

        let mut saved = 0;
        for room_id in dirty {
            let _io = self.storage_io.lock().await;
            let pending = self
                .rooms
                .get(&room_id)
                .filter(|room| room.dirty)
                .map(|room| (room.snapshot(), room.doc.oplog_vv()));
            let Some((snapshot, version)) = pending else {
                continue;
            };
            if let Some(snapshot) = snapshot {
                if !self.persist(&room_id, snapshot).await {
                    continue;
                }
                saved += 1;
            }
            if let Some(mut room) = self.rooms.get_mut(&room_id) {
                // Frames merged during the write keep the room dirty
                if room.doc.oplog_vv() == version {
                    room.dirty = false;
                }
            }
            self.rooms.remove_if(&room_id, |_, r| r.peers.is_empty() && !r.dirty);
        }
        saved
    }
}

/// Run a storage call on the blocking pool; file-backed storage does
/// synchronous IO inside its futures.
async fn blocking_storage<T, F>(call: F) -> StorageResult<T>
where
    T: Send + 'static,
    F: FnOnce(&tokio::runtime::Handle) -> StorageResult<T> + Send + 'static,
{
    let handle = tokio::runtime::Handle::current();
    tokio::task::spawn_blocking(move || call(&handle))
        .await
        .unwrap_or_else(|e| Err(StorageError::Other(format!("Storage task failed: {e}"))))
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the relay router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Periodically persist dirty rooms.
pub fn spawn_autosave(state: Arc<AppState>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let saved = state.save_dirty().await;
            if saved > 0 {
                debug!("Autosaved {saved} room(s)");
            }
        }
    })
}

/// Index page
async fn index() -> &'static str {
    "ShapeSync Relay Server - Connect via WebSocket at /ws"
}

/// Health check
async fn health() -> &'static str {
    "ok"
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn to_text(msg: &ServerMessage) -> Option<Message> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            warn!("Failed to encode frame: {e}");
            None
        }
    }
}

/// Per-connection state
struct Connection {
    id: String,
    room: Option<String>,
    room_rx: Option<broadcast::Receiver<RoomMessage>>,
}

impl Connection {
    /// Handle one client frame. Returns frames to send back to this client.
    async fn handle(&mut self, state: &AppState, msg: ClientMessage) -> Vec<ServerMessage> {
        match msg {
            ClientMessage::Join { room } => {
                self.leave(state).await;

                let (rx, initial_sync, peer_count) = state.join_room(&room, &self.id).await;
                self.room_rx = Some(rx);
                self.room = Some(room.clone());
                state.broadcast(&room, &self.id, ServerMessage::PeerJoined { peer_id: self.id.clone() });
                info!("Peer {} joined room {} ({peer_count} peer(s))", self.id, room);

                vec![ServerMessage::Joined {
                    room,
                    peer_count,
                    initial_sync,
                }]
            }
            ClientMessage::Leave => {
                self.leave(state).await;
                Vec::new()
            }
            ClientMessage::Sync { data } => match decode_payload(&data) {
                Ok(bytes) => self.relay_sync(state, &bytes, data),
                Err(e) => vec![ServerMessage::Error {
                    message: format!("Invalid sync payload: {e}"),
                }],
            },
            ClientMessage::Awareness { peer_id, state: awareness } => {
                if let Some(room) = &self.room {
                    state.broadcast(
                        room,
                        &self.id,
                        ServerMessage::Awareness {
                            from: self.id.clone(),
                            peer_id,
                            state: awareness,
                        },
                    );
                }
                Vec::new()
            }
        }
    }

    /// Merge update bytes into the room and forward them to the other peers.
    fn relay_sync(&self, state: &AppState, bytes: &[u8], data: String) -> Vec<ServerMessage> {
        let Some(room) = &self.room else {
            return vec![ServerMessage::Error {
                message: "Join a room before syncing".to_string(),
            }];
        };
        if let Err(e) = state.apply_sync(room, bytes) {
            warn!("Rejected sync from {} in room {room}: {e}", self.id);
            return vec![ServerMessage::Error {
                message: format!("Invalid sync data: {e}"),
            }];
        }
        state.broadcast(
            room,
            &self.id,
            ServerMessage::Sync {
                from: self.id.clone(),
                data,
            },
        );
        Vec::new()
    }

    async fn leave(&mut self, state: &AppState) {
        self.room_rx = None;
        if let Some(room) = self.room.take() {
            state.broadcast(&room, &self.id, ServerMessage::PeerLeft { peer_id: self.id.clone() });
            state.leave_room(&room, &self.id).await;
            info!("Peer {} left room {room}", self.id);
        }
    }

    /// Next frame from the room that should go to this client.
    async fn next_room_message(&mut self, state: &AppState) -> Option<ServerMessage> {
        let Some(rx) = self.room_rx.as_mut() else {
            return std::future::pending().await;
        };
        loop {
            match rx.recv().await {
                Ok((from, _)) if from == self.id => continue,
                Ok((_, msg)) => return Some(msg),
                Err(RecvError::Lagged(skipped)) => {
                    // Missed frames are covered by a full room snapshot
                    warn!("Peer {} lagged by {skipped} frame(s), resyncing", self.id);
                    let snapshot = self.room.as_deref().and_then(|room| state.room_snapshot(room));
                    if let Some(snapshot) = snapshot {
                        return Some(ServerMessage::Sync {
                            from: RELAY_ID.to_string(),
                            data: encode_payload(&snapshot),
                        });
                    }
                }
                Err(RecvError::Closed) => {
                    self.room_rx = None;
                    return None;
                }
            }
        }
    }
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let mut conn = Connection {
        id: Uuid::new_v4().to_string(),
        room: None,
        room_rx: None,
    };
    info!("New connection: {}", conn.id);

    let (mut sender, mut receiver) = socket.split();

    loop {
        let replies = tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                    Ok(client_msg) => conn.handle(&state, client_msg).await,
                    Err(e) => {
                        warn!("Invalid message from {}: {e}", conn.id);
                        vec![ServerMessage::Error {
                            message: format!("Invalid message: {e}"),
                        }]
                    }
                },
                // Binary frames are raw Loro update bytes
                Some(Ok(Message::Binary(bytes))) => conn.relay_sync(&state, &bytes, encode_payload(&bytes)),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => Vec::new(),
                Some(Err(e)) => {
                    warn!("WebSocket error for {}: {e}", conn.id);
                    break;
                }
            },
            msg = conn.next_room_message(&state) => match msg {
                Some(msg) => vec![msg],
                None => Vec::new(),
            },
        };

        let mut failed = false;
        for reply in replies.iter().filter_map(to_text) {
            if sender.send(reply).await.is_err() {
                failed = true;
                break;
            }
        }
        if failed {
            break;
        }
    }

    conn.leave(&state).await;
    info!("Connection closed: {}", conn.id);
}
