//! Replication between a local [`ShapeStore`] and a room relay.
//!
//! The replicator never touches the network itself. It turns transport
//! events into store imports and [`SyncEvent`]s, and collects outgoing
//! frames that the caller hands to a [`Transport`](crate::sync::Transport).
//!
//! Every (re)connect rejoins the room. The relay answers with its merged
//! snapshot; we import it and send back whatever it is missing, so edits made
//! while offline reach the room without any replay log.

use crate::crdt::{version_of, ShapeStore, VersionVector};
use crate::sync::{decode_payload, encode_payload, ClientMessage, ServerMessage, SyncEvent, TransportEvent};

/// Outgoing queue and room membership for one replica.
#[derive(Debug)]
pub struct Replicator {
    peer_id: u64,
    /// Room we want to be in
    room: Option<String>,
    /// Whether the relay confirmed the current room
    joined: bool,
    connected: bool,
    /// Local version last sent to the relay
    flushed: VersionVector,
    /// Pending outgoing messages (JSON strings)
    outgoing: Vec<String>,
}

impl Replicator {
    pub fn new(peer_id: u64) -> Self {
        Self {
            peer_id,
            room: None,
            joined: false,
            connected: false,
            flushed: VersionVector::default(),
            outgoing: Vec::new(),
        }
    }

    pub fn peer_id(&self) -> u64 {
        self.peer_id
    }

    pub fn current_room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Connected and confirmed in a room.
    pub fn is_joined(&self) -> bool {
        self.connected && self.joined
    }

    /// Join a room. Sent now if connected, otherwise on the next connect.
    pub fn join_room(&mut self, room: impl Into<String>) {
        let room = room.into();
        self.joined = false;
        if self.connected {
            self.queue(&ClientMessage::Join { room: room.clone() });
        }
        self.room = Some(room);
    }

    pub fn leave_room(&mut self) {
        if self.room.take().is_some() && self.connected {
            self.queue(&ClientMessage::Leave);
        }
        self.joined = false;
    }

    /// Queue a frame for the relay.
    pub fn queue(&mut self, msg: &ClientMessage) {
        match msg.to_json() {
            Ok(json) => self.outgoing.push(json),
            Err(e) => log::error!("Failed to encode outgoing message: {e}"),
        }
    }

    /// Take all pending outgoing messages.
    pub fn take_outgoing(&mut self) -> Vec<String> {
        std::mem::take(&mut self.outgoing)
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Queue local changes the relay has not seen yet. Returns true if a sync
    /// frame was queued.
    pub fn flush_local(&mut self, store: &ShapeStore) -> bool {
        if !self.is_joined() {
            return false;
        }
        let version = store.version();
        if version == self.flushed {
            return false;
        }
        match store.export_updates(&self.flushed) {
            Ok(bytes) => {
                self.queue(&ClientMessage::Sync {
                    data: encode_payload(&bytes),
                });
                self.flushed = version;
                true
            }
            Err(e) => {
                log::error!("Failed to export local updates: {e}");
                false
            }
        }
    }

    /// Handle one transport event.
    pub fn handle_transport_event(&mut self, store: &mut ShapeStore, event: TransportEvent) -> Option<SyncEvent> {
        match event {
            TransportEvent::Connected => {
                log::info!("Connected to relay");
                self.connected = true;
                self.joined = false;
                if let Some(room) = self.room.clone() {
                    self.queue(&ClientMessage::Join { room });
                }
                Some(SyncEvent::Connected)
            }
            TransportEvent::Disconnected => {
                if self.connected {
                    log::info!("Disconnected from relay");
                }
                self.connected = false;
                self.joined = false;
                Some(SyncEvent::Disconnected)
            }
            TransportEvent::Error { message } => {
                log::warn!("Transport error: {message}");
                self.connected = false;
                self.joined = false;
                Some(SyncEvent::Error { message })
            }
            TransportEvent::Message(json) => self.handle_message(store, &json),
        }
    }

    /// Handle a text frame from the relay.
    pub fn handle_message(&mut self, store: &mut ShapeStore, json: &str) -> Option<SyncEvent> {
        let msg = match ServerMessage::from_json(json) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Ignoring malformed relay frame: {e}");
                return None;
            }
        };

        match msg {
            ServerMessage::Joined {
                room,
                peer_count,
                initial_sync,
            } => {
                if self.room.as_deref() != Some(room.as_str()) {
                    log::warn!("Ignoring join confirmation for room {room}");
                    return None;
                }
                log::info!("Joined room {room} with {peer_count} peer(s)");
                let (resynced, relay_version) = match initial_sync {
                    Some(data) => self.import_initial(store, &data),
                    None => (false, VersionVector::default()),
                };
                self.joined = true;
                self.send_missing(store, &relay_version);
                Some(SyncEvent::JoinedRoom {
                    room,
                    peer_count,
                    resynced,
                })
            }
            ServerMessage::PeerJoined { peer_id } => {
                log::debug!("Peer joined: {peer_id}");
                Some(SyncEvent::PeerJoined { peer_id })
            }
            ServerMessage::PeerLeft { peer_id } => {
                log::debug!("Peer left: {peer_id}");
                Some(SyncEvent::PeerLeft { peer_id })
            }
            ServerMessage::Sync { from, data } => {
                let bytes = match decode_payload(&data) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::warn!("Bad sync payload from {from}: {e}");
                        return None;
                    }
                };
                let up_to_date = store.version() == self.flushed;
                match store.import(&bytes) {
                    Ok(true) => {
                        // Nothing local was pending, so the relay already
                        // has everything we now hold.
                        if up_to_date {
                            self.flushed = store.version();
                        }
                        Some(SyncEvent::SyncReceived { from })
                    }
                    Ok(false) => None,
                    Err(e) => {
                        log::warn!("Failed to import sync from {from}: {e}");
                        None
                    }
                }
            }
            ServerMessage::Awareness { from, peer_id, state } => {
                Some(SyncEvent::AwarenessReceived { from, peer_id, state })
            }
            ServerMessage::Error { message } => {
                log::warn!("Relay error: {message}");
                Some(SyncEvent::Error { message })
            }
        }
    }

    fn import_initial(&mut self, store: &mut ShapeStore, data: &str) -> (bool, VersionVector) {
        let bytes = match decode_payload(data) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Bad initial snapshot: {e}");
                return (false, VersionVector::default());
            }
        };
        let relay_version = version_of(&bytes).unwrap_or_else(|e| {
            log::warn!("Unreadable initial snapshot version: {e}");
            VersionVector::default()
        });
        match store.import(&bytes) {
            Ok(changed) => (changed, relay_version),
            Err(e) => {
                log::warn!("Failed to import initial snapshot: {e}");
                (false, VersionVector::default())
            }
        }
    }

    /// Send everything the relay lacks relative to `relay_version`.
    fn send_missing(&mut self, store: &ShapeStore, relay_version: &VersionVector) {
        let version = store.version();
        if &version != relay_version {
            match store.export_updates(relay_version) {
                Ok(bytes) => self.queue(&ClientMessage::Sync {
                    data: encode_payload(&bytes),
                }),
                Err(e) => log::error!("Failed to export updates for resync: {e}"),
            }
        }
        self.flushed = version;
    }
}
