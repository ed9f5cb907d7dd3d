//! Wire protocol and WebSocket transport for collaboration.
//!
//! Frames are JSON text tagged by `type`. Loro update bytes travel as base64
//! strings inside `sync` frames.

use crate::error::{Result, ShapeSyncError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Messages sent to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join a room
    Join { room: String },
    /// Leave current room
    Leave,
    /// Sync CRDT data (base64 encoded Loro bytes)
    Sync { data: String },
    /// Awareness update (cursor position, user info)
    Awareness {
        peer_id: u64,
        #[serde(flatten)]
        state: AwarenessState,
    },
}

/// Messages received from the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Confirm room join with current state
    Joined {
        room: String,
        peer_count: usize,
        /// Merged room snapshot (if the room has content)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initial_sync: Option<String>,
    },
    PeerJoined { peer_id: String },
    PeerLeft { peer_id: String },
    /// Sync data from another peer
    Sync { from: String, data: String },
    /// Awareness update from another peer
    Awareness {
        from: String,
        peer_id: u64,
        #[serde(flatten)]
        state: AwarenessState,
    },
    Error { message: String },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ServerMessage {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Awareness state for a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AwarenessState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    /// Display name and color
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    pub color: String,
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Raw events reported by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Error { message: String },
    /// A text frame from the server
    Message(String),
}

/// Events surfaced by the replication layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// The relay confirmed the join. `resynced` is true when the room's
    /// snapshot changed local state.
    JoinedRoom { room: String, peer_count: usize, resynced: bool },
    PeerJoined { peer_id: String },
    PeerLeft { peer_id: String },
    /// Remote changes were applied to the local store
    SyncReceived { from: String },
    AwarenessReceived { from: String, peer_id: u64, state: AwarenessState },
    Error { message: String },
}

/// Encode binary payload for a JSON frame.
pub fn encode_payload(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode a binary payload from a JSON frame.
pub fn decode_payload(data: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(data)
        .map_err(|e| ShapeSyncError::Decode(e.to_string()))
}

/// A message channel to the relay.
///
/// Implementations never block the caller: I/O happens elsewhere and is
/// reported through [`Transport::poll_events`].
pub trait Transport {
    /// Queue a text frame.
    fn send(&mut self, msg: &str) -> Result<()>;

    /// Drain pending events (non-blocking).
    fn poll_events(&mut self) -> Vec<TransportEvent>;

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

/// Reconnect backoff settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Give up after this many consecutive failures (`None` = never).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Never reconnect.
    pub fn disabled() -> Self {
        Self {
            max_attempts: Some(0),
            ..Self::default()
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based): doubles each time,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn gives_up_after(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt > max)
    }
}

mod native_client {
    use super::*;
    use std::net::TcpStream;
    use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender, TryRecvError};
    use std::thread::{self, JoinHandle};
    use std::time::Instant;
    use tungstenite::stream::MaybeTlsStream;
    use tungstenite::{connect, Message, WebSocket};
    use url::Url;

    /// Commands sent to the WebSocket thread.
    enum WsCommand {
        Send(String),
        Close,
    }

    type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

    /// WebSocket client for native platforms.
    ///
    /// Uses a background thread that reconnects with capped exponential
    /// backoff until [`NativeWebSocket::disconnect`] is called.
    pub struct NativeWebSocket {
        state: ConnectionState,
        cmd_tx: Option<Sender<WsCommand>>,
        event_rx: Option<Receiver<TransportEvent>>,
        _thread: Option<JoinHandle<()>>,
    }

    impl NativeWebSocket {
        /// Create a new disconnected WebSocket client.
        pub fn new() -> Self {
            Self {
                state: ConnectionState::Disconnected,
                cmd_tx: None,
                event_rx: None,
                _thread: None,
            }
        }

        /// Start connecting to a `ws://` or `wss://` URL.
        pub fn connect(&mut self, url: &str, policy: ReconnectPolicy) -> Result<()> {
            if self.cmd_tx.is_some() {
                return Err(ShapeSyncError::Transport("Already connected".to_string()));
            }

            let parsed_url =
                Url::parse(url).map_err(|e| ShapeSyncError::Transport(format!("Invalid URL: {e}")))?;
            if parsed_url.scheme() != "ws" && parsed_url.scheme() != "wss" {
                return Err(ShapeSyncError::Transport(format!(
                    "Invalid WebSocket URL scheme: {}",
                    parsed_url.scheme()
                )));
            }

            self.state = ConnectionState::Connecting;

            let (cmd_tx, cmd_rx) = channel::<WsCommand>();
            let (event_tx, event_rx) = channel::<TransportEvent>();
            let url = parsed_url.to_string();

            let handle = thread::spawn(move || run(url, policy, cmd_rx, event_tx));

            self.cmd_tx = Some(cmd_tx);
            self.event_rx = Some(event_rx);
            self._thread = Some(handle);

            Ok(())
        }

        /// Close the connection and stop reconnecting.
        pub fn disconnect(&mut self) {
            if let Some(tx) = self.cmd_tx.take() {
                let _ = tx.send(WsCommand::Close);
            }
            self.event_rx = None;
            self._thread = None;
            self.state = ConnectionState::Disconnected;
        }
    }

    impl Transport for NativeWebSocket {
        fn send(&mut self, msg: &str) -> Result<()> {
            match &self.cmd_tx {
                Some(tx) => tx
                    .send(WsCommand::Send(msg.to_string()))
                    .map_err(|e| ShapeSyncError::Transport(format!("Send failed: {e}"))),
                None => Err(ShapeSyncError::Transport("Not connected".to_string())),
            }
        }

        fn poll_events(&mut self) -> Vec<TransportEvent> {
            let mut events = Vec::new();
            let Some(rx) = &self.event_rx else {
                return events;
            };
            loop {
                match rx.try_recv() {
                    Ok(event) => {
                        match &event {
                            TransportEvent::Connected => self.state = ConnectionState::Connected,
                            // The thread retries on its own.
                            TransportEvent::Disconnected => self.state = ConnectionState::Connecting,
                            TransportEvent::Error { .. } => self.state = ConnectionState::Error,
                            TransportEvent::Message(_) => {}
                        }
                        events.push(event);
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        // Thread gave up reconnecting.
                        self.state = ConnectionState::Disconnected;
                        break;
                    }
                }
            }
            events
        }

        fn state(&self) -> ConnectionState {
            self.state
        }
    }

    impl Default for NativeWebSocket {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Drop for NativeWebSocket {
        fn drop(&mut self) {
            self.disconnect();
        }
    }

    /// Connection thread: connect, pump, and reconnect until closed.
    fn run(
        url: String,
        policy: ReconnectPolicy,
        cmd_rx: Receiver<WsCommand>,
        event_tx: Sender<TransportEvent>,
    ) {
        let mut attempt = 0u32;
        loop {
            log::info!("WebSocket thread: connecting to {url}");
            match connect(url.as_str()) {
                Ok((mut socket, response)) => {
                    log::info!("WebSocket connected, status: {}", response.status());
                    attempt = 0;

                    // Frames queued for a dead connection are superseded by the
                    // resync that follows the new join.
                    if drain_stale(&cmd_rx) {
                        let _ = socket.close(None);
                        return;
                    }
                    set_timeouts(&mut socket);
                    let _ = event_tx.send(TransportEvent::Connected);

                    let closed = pump(&mut socket, &cmd_rx, &event_tx);
                    let _ = event_tx.send(TransportEvent::Disconnected);
                    if closed {
                        log::info!("WebSocket thread exiting");
                        return;
                    }
                }
                Err(e) => {
                    log::warn!("WebSocket connection failed: {e}");
                    let _ = event_tx.send(TransportEvent::Error {
                        message: format!("Connection failed: {e}"),
                    });
                }
            }

            attempt += 1;
            if policy.gives_up_after(attempt) {
                log::info!("WebSocket giving up after {} attempts", attempt - 1);
                return;
            }
            let delay = policy.delay_for(attempt);
            log::debug!("WebSocket reconnecting in {delay:?}");
            if wait_for_close(&cmd_rx, delay) {
                return;
            }
        }
    }

    /// Discard queued sends. Returns true if a close was requested.
    fn drain_stale(cmd_rx: &Receiver<WsCommand>) -> bool {
        loop {
            match cmd_rx.try_recv() {
                Ok(WsCommand::Send(_)) => continue,
                Ok(WsCommand::Close) | Err(TryRecvError::Disconnected) => return true,
                Err(TryRecvError::Empty) => return false,
            }
        }
    }

    /// Sleep for `delay`, waking early on close. Returns true if closed.
    fn wait_for_close(cmd_rx: &Receiver<WsCommand>, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match cmd_rx.recv_timeout(remaining) {
                Ok(WsCommand::Send(_)) => continue,
                Ok(WsCommand::Close) | Err(RecvTimeoutError::Disconnected) => return true,
                Err(RecvTimeoutError::Timeout) => return false,
            }
        }
    }

    fn set_timeouts(socket: &mut Socket) {
        match socket.get_mut() {
            MaybeTlsStream::Plain(tcp) => {
                let _ = tcp.set_read_timeout(Some(Duration::from_millis(50)));
                let _ = tcp.set_write_timeout(Some(Duration::from_secs(5)));
            }
            #[allow(unreachable_patterns)]
            _ => {
                log::debug!("TLS or other stream - using default timeout handling");
            }
        }
    }

    /// Pump one live connection. Returns true if the caller asked to close.
    fn pump(socket: &mut Socket, cmd_rx: &Receiver<WsCommand>, event_tx: &Sender<TransportEvent>) -> bool {
        loop {
            loop {
                match cmd_rx.try_recv() {
                    Ok(WsCommand::Send(msg)) => {
                        log::debug!("WebSocket sending {} bytes", msg.len());
                        if let Err(e) = socket.send(Message::Text(msg)) {
                            log::error!("WebSocket send error: {e}");
                            return false;
                        }
                    }
                    Ok(WsCommand::Close) => {
                        log::info!("WebSocket close requested");
                        let _ = socket.close(None);
                        return true;
                    }
                    Err(TryRecvError::Disconnected) => {
                        log::info!("WebSocket command channel disconnected");
                        return true;
                    }
                    Err(TryRecvError::Empty) => break,
                }
            }

            match socket.read() {
                Ok(Message::Text(txt)) => {
                    let _ = event_tx.send(TransportEvent::Message(txt));
                }
                Ok(Message::Ping(data)) => {
                    let _ = socket.send(Message::Pong(data));
                }
                Ok(Message::Close(_)) => {
                    log::info!("WebSocket received close frame");
                    return false;
                }
                Ok(_) => {}
                Err(tungstenite::Error::Io(ref e))
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    log::warn!("WebSocket read error: {e}");
                    return false;
                }
            }
        }
    }
}

pub use native_client::NativeWebSocket;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_roundtrip() {
        let data = b"\x00\x01loro\xff";
        assert_eq!(decode_payload(&encode_payload(data)).unwrap(), data.to_vec());
        assert_eq!(encode_payload(b"abc"), "YWJj");
        assert!(matches!(decode_payload("not base64!"), Err(ShapeSyncError::Decode(_))));
    }

    #[test]
    fn test_client_message_wire_format() {
        let join = ClientMessage::Join { room: "test-room".to_string() }.to_json().unwrap();
        assert_eq!(join, r#"{"type":"join","room":"test-room"}"#);

        let awareness = ClientMessage::Awareness {
            peer_id: 7,
            state: AwarenessState {
                cursor: Some(CursorPosition { x: 1.0, y: 2.0 }),
                user: None,
            },
        };
        let json: serde_json::Value = serde_json::from_str(&awareness.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "awareness");
        assert_eq!(json["peer_id"], 7);
        assert_eq!(json["cursor"]["x"], 1.0);
        assert!(json.get("user").is_none());
    }

    #[test]
    fn test_server_message_parse() {
        let msg = ServerMessage::from_json(r#"{"type":"joined","room":"test","peer_count":2}"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::Joined { room: "test".into(), peer_count: 2, initial_sync: None }
        );

        let msg = ServerMessage::from_json(
            r##"{"type":"awareness","from":"c1","peer_id":3,"user":{"name":"Ada","color":"#ff0000"}}"##,
        )
        .unwrap();
        match msg {
            ServerMessage::Awareness { from, peer_id, state } => {
                assert_eq!(from, "c1");
                assert_eq!(peer_id, 3);
                assert_eq!(state.user.unwrap().name, "Ada");
                assert!(state.cursor.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }

        assert!(ServerMessage::from_json(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(700),
            max_attempts: Some(3),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(700));
        assert_eq!(policy.delay_for(60), Duration::from_millis(700));
        assert!(!policy.gives_up_after(3));
        assert!(policy.gives_up_after(4));
        assert!(ReconnectPolicy::disabled().gives_up_after(1));
    }

    #[test]
    fn test_native_rejects_bad_urls() {
        let mut ws = NativeWebSocket::new();
        assert!(ws.connect("http://localhost:1", ReconnectPolicy::disabled()).is_err());
        assert!(ws.connect("not a url", ReconnectPolicy::disabled()).is_err());
        assert_eq!(ws.state(), ConnectionState::Disconnected);
        assert!(ws.send("{}").is_err());
    }
}
