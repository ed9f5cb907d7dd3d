//! One client's view of one room: engine, replication and presence wired
//! to a transport.
//!
//! The host owns the session and calls [`Session::pump`] from its loop. All
//! network effects happen there; editing calls only touch the local store.

use crate::canvas::{Canvas, PASTE_OFFSET};
use crate::collaboration::Replicator;
use crate::crdt::{ObserverId, ShapeStore, StoreEvent};
use crate::error::Result;
use crate::history::MAX_UNDO_HISTORY;
use crate::presence::{PresenceTracker, HEARTBEAT_INTERVAL, PRESENCE_TIMEOUT};
use crate::shapes::{ShapeId, ShapeRecord};
use crate::sync::{ClientMessage, ConnectionState, NativeWebSocket, ReconnectPolicy, SyncEvent, Transport};
use std::time::{Duration, Instant};

/// Tunables for a [`Session`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Maximum number of undo states kept.
    pub history_limit: usize,
    pub heartbeat_interval: Duration,
    /// Silence after which a remote peer's presence is dropped.
    pub presence_timeout: Duration,
    /// Offset applied by duplicate and paste.
    pub paste_offset: f64,
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_limit: MAX_UNDO_HISTORY,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            presence_timeout: PRESENCE_TIMEOUT,
            paste_offset: PASTE_OFFSET,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// A collaborative editing session.
pub struct Session<T: Transport> {
    config: SessionConfig,
    canvas: Canvas,
    replicator: Replicator,
    presence: PresenceTracker,
    transport: T,
}

impl Session<NativeWebSocket> {
    /// Open a WebSocket session to a relay and join `room`.
    pub fn connect(url: &str, room: &str, config: SessionConfig) -> Result<Self> {
        let mut ws = NativeWebSocket::new();
        ws.connect(url, config.reconnect.clone())?;
        let mut session = Self::new(ws, config);
        session.join(room);
        Ok(session)
    }
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self::with_store(ShapeStore::new(), transport, config)
    }

    /// Resume from a snapshot saved with [`Session::snapshot`].
    pub fn from_snapshot(bytes: &[u8], transport: T, config: SessionConfig) -> Result<Self> {
        Ok(Self::with_store(ShapeStore::from_snapshot(bytes)?, transport, config))
    }

    fn with_store(store: ShapeStore, transport: T, config: SessionConfig) -> Self {
        let peer_id = store.peer_id();
        let canvas = Canvas::with_store(store)
            .with_history_limit(config.history_limit)
            .with_paste_offset(config.paste_offset);
        Self {
            canvas,
            replicator: Replicator::new(peer_id),
            presence: PresenceTracker::with_timing(peer_id, config.heartbeat_interval, config.presence_timeout),
            transport,
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn peer_id(&self) -> u64 {
        self.replicator.peer_id()
    }

    pub fn join(&mut self, room: impl Into<String>) {
        self.replicator.join_room(room);
    }

    pub fn leave(&mut self) {
        self.replicator.leave_room();
        self.presence.clear();
    }

    pub fn room(&self) -> Option<&str> {
        self.replicator.current_room()
    }

    /// Full document state for persistence.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        self.canvas.store().export_snapshot()
    }

    /// Materialized shape list in document order.
    pub fn shapes(&self) -> &[ShapeRecord] {
        self.canvas.shapes()
    }

    pub fn selection(&self) -> &[ShapeId] {
        self.canvas.selection()
    }

    pub fn canvas(&self) -> &Canvas {
        &self.canvas
    }

    /// Editing surface. Changes are sent on the next [`Session::pump`].
    pub fn canvas_mut(&mut self) -> &mut Canvas {
        &mut self.canvas
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    /// Register a change observer on the underlying store.
    pub fn observe(&mut self, callback: impl FnMut(&StoreEvent<'_>) + 'static) -> ObserverId {
        self.canvas.store_mut().observe(callback)
    }

    pub fn unobserve(&mut self, id: ObserverId) -> bool {
        self.canvas.store_mut().unobserve(id)
    }

    pub fn set_cursor(&mut self, x: f64, y: f64) {
        let msg = self.presence.set_cursor(x, y);
        self.queue_presence(&msg);
    }

    pub fn clear_cursor(&mut self) {
        let msg = self.presence.clear_cursor();
        self.queue_presence(&msg);
    }

    pub fn set_user(&mut self, name: impl Into<String>, color: Option<String>) {
        let msg = self.presence.set_user(name, color);
        self.queue_presence(&msg);
    }

    fn queue_presence(&mut self, msg: &ClientMessage) {
        if self.replicator.is_joined() {
            self.replicator.queue(msg);
        }
    }

    /// Process transport events, flush local edits and presence, and send
    /// everything queued. Returns the events handled this round.
    pub fn pump(&mut self, now: Instant) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        for event in self.transport.poll_events() {
            let Some(event) = self
                .replicator
                .handle_transport_event(self.canvas.store_mut(), event)
            else {
                continue;
            };
            self.apply_event(&event, now);
            events.push(event);
        }

        if self.replicator.is_joined() {
            self.presence.expire(now);
            if let Some(heartbeat) = self.presence.tick(now) {
                self.replicator.queue(&heartbeat);
            }
        }
        self.replicator.flush_local(self.canvas.store());

        for msg in self.replicator.take_outgoing() {
            if let Err(e) = self.transport.send(&msg) {
                log::warn!("Failed to send frame: {e}");
            }
        }
        events
    }

    fn apply_event(&mut self, event: &SyncEvent, now: Instant) {
        match event {
            SyncEvent::JoinedRoom { resynced, .. } => {
                if *resynced {
                    self.canvas.reset_history();
                    self.canvas.prune_selection();
                }
                let msg = self.presence.local_message();
                self.replicator.queue(&msg);
            }
            SyncEvent::SyncReceived { .. } => self.canvas.prune_selection(),
            SyncEvent::AwarenessReceived { from, peer_id, state } => {
                self.presence.handle_awareness(from, *peer_id, state.clone(), now);
            }
            SyncEvent::PeerLeft { peer_id } => {
                self.presence.remove_peer(peer_id);
            }
            SyncEvent::Disconnected | SyncEvent::Error { .. } => self.presence.clear(),
            SyncEvent::Connected | SyncEvent::PeerJoined { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shapes::ShapeKind;
    use crate::sync::{decode_payload, ServerMessage, TransportEvent};
    use std::collections::VecDeque;

    /// Scripted transport: events are pushed by the test, sends are recorded.
    #[derive(Default)]
    struct ScriptedTransport {
        connected: bool,
        inbox: VecDeque<TransportEvent>,
        sent: Vec<String>,
    }

    impl ScriptedTransport {
        fn push(&mut self, event: TransportEvent) {
            match event {
                TransportEvent::Connected => self.connected = true,
                TransportEvent::Disconnected | TransportEvent::Error { .. } => self.connected = false,
                TransportEvent::Message(_) => {}
            }
            self.inbox.push_back(event);
        }

        fn server(&mut self, msg: ServerMessage) {
            self.push(TransportEvent::Message(serde_json::to_string(&msg).unwrap()));
        }

        fn take_sent(&mut self) -> Vec<ClientMessage> {
            self.sent
                .drain(..)
                .map(|m| serde_json::from_str(&m).unwrap())
                .collect()
        }
    }

    impl Transport for ScriptedTransport {
        fn send(&mut self, msg: &str) -> Result<()> {
            self.sent.push(msg.to_string());
            Ok(())
        }

        fn poll_events(&mut self) -> Vec<TransportEvent> {
            self.inbox.drain(..).collect()
        }

        fn state(&self) -> ConnectionState {
            if self.connected {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            }
        }
    }

    fn joined_session() -> Session<ScriptedTransport> {
        let mut session = Session::new(ScriptedTransport::default(), SessionConfig::default());
        session.join("room");
        session.transport_mut().push(TransportEvent::Connected);
        session.transport_mut().server(ServerMessage::Joined {
            room: "room".into(),
            peer_count: 1,
            initial_sync: None,
        });
        session.pump(Instant::now());
        session.transport_mut().take_sent();
        session
    }

    #[test]
    fn test_join_flow_sends_join_and_presence() {
        let mut session = Session::new(ScriptedTransport::default(), SessionConfig::default());
        session.join("room");
        session.transport_mut().push(TransportEvent::Connected);
        session.pump(Instant::now());
        assert_eq!(
            session.transport_mut().take_sent(),
            vec![ClientMessage::Join { room: "room".into() }]
        );

        session.transport_mut().server(ServerMessage::Joined {
            room: "room".into(),
            peer_count: 1,
            initial_sync: None,
        });
        let events = session.pump(Instant::now());
        assert!(matches!(events[0], SyncEvent::JoinedRoom { .. }));
        let sent = session.transport_mut().take_sent();
        assert!(sent.iter().any(|m| matches!(m, ClientMessage::Awareness { .. })));
        assert!(session.is_connected());
    }

    #[test]
    fn test_local_edits_flushed_on_pump() {
        let mut session = joined_session();
        session
            .canvas_mut()
            .add_shape(ShapeRecord::new(ShapeKind::Rect, 0.0, 0.0).with_size(5.0, 5.0));
        session.pump(Instant::now());

        let sent = session.transport_mut().take_sent();
        let data = sent
            .iter()
            .find_map(|m| match m {
                ClientMessage::Sync { data } => Some(data.clone()),
                _ => None,
            })
            .expect("sync frame");
        let mut remote = ShapeStore::new();
        remote.import(&decode_payload(&data).unwrap()).unwrap();
        assert_eq!(remote.len(), 1);
    }

    #[test]
    fn test_presence_only_sent_when_joined() {
        let mut session = Session::new(ScriptedTransport::default(), SessionConfig::default());
        session.set_cursor(1.0, 2.0);
        session.pump(Instant::now());
        assert!(session.transport_mut().take_sent().is_empty());

        let mut session = joined_session();
        session.set_cursor(1.0, 2.0);
        session.pump(Instant::now());
        assert!(session
            .transport_mut()
            .take_sent()
            .iter()
            .any(|m| matches!(m, ClientMessage::Awareness { state, .. } if state.cursor.is_some())));
    }

    #[test]
    fn test_remote_presence_lifecycle() {
        let mut session = joined_session();
        session.transport_mut().server(ServerMessage::Awareness {
            from: "c2".into(),
            peer_id: 2,
            state: Default::default(),
        });
        session.pump(Instant::now());
        assert_eq!(session.presence().peer_count(), 1);

        session
            .transport_mut()
            .server(ServerMessage::PeerLeft { peer_id: "c2".into() });
        session.pump(Instant::now());
        assert_eq!(session.presence().peer_count(), 0);

        session.transport_mut().server(ServerMessage::Awareness {
            from: "c3".into(),
            peer_id: 3,
            state: Default::default(),
        });
        session.transport_mut().push(TransportEvent::Disconnected);
        session.pump(Instant::now());
        assert_eq!(session.presence().peer_count(), 0);
        assert!(!session.is_connected());
    }

    #[test]
    fn test_resync_resets_history() {
        let mut room = ShapeStore::new();
        room.insert(0, ShapeRecord::new(ShapeKind::Rect, 0.0, 0.0).with_id("r")).unwrap();

        let mut session = Session::new(ScriptedTransport::default(), SessionConfig::default());
        session.canvas_mut().add_shape(ShapeRecord::new(ShapeKind::Circle, 0.0, 0.0));
        assert!(session.canvas().can_undo());

        session.join("room");
        session.transport_mut().push(TransportEvent::Connected);
        session.transport_mut().server(ServerMessage::Joined {
            room: "room".into(),
            peer_count: 2,
            initial_sync: Some(crate::sync::encode_payload(&room.export_snapshot().unwrap())),
        });
        session.pump(Instant::now());

        assert_eq!(session.shapes().len(), 2);
        assert!(!session.canvas().can_undo());
    }

    #[test]
    fn test_snapshot_restore() {
        let mut session = Session::new(ScriptedTransport::default(), SessionConfig::default());
        let id = session
            .canvas_mut()
            .add_shape(ShapeRecord::new(ShapeKind::Text, 3.0, 4.0).with_text("hi"))
            .unwrap();
        let bytes = session.snapshot().unwrap();

        let restored = Session::from_snapshot(&bytes, ScriptedTransport::default(), SessionConfig::default()).unwrap();
        assert_eq!(restored.shapes(), session.shapes());
        assert!(restored.canvas().get(&id).is_some());
        assert_ne!(restored.peer_id(), session.peer_id());
    }
}
