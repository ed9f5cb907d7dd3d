//! Ephemeral presence: cursors, display names and colors of peers in a room.
//!
//! Nothing here is stored in the document. The relay forwards awareness
//! frames live and never replays them to late joiners, so a peer only shows
//! up once it sends its next update or heartbeat.

use crate::sync::{AwarenessState, ClientMessage, CursorPosition, UserInfo};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default interval between local presence heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// Slack on top of one heartbeat before a silent peer counts as gone.
pub const PRESENCE_GRACE: Duration = Duration::from_secs(1);
/// Default silence after which a remote peer is dropped: one missed
/// heartbeat plus [`PRESENCE_GRACE`].
pub const PRESENCE_TIMEOUT: Duration = Duration::from_secs(HEARTBEAT_INTERVAL.as_secs() + PRESENCE_GRACE.as_secs());

/// Presence of one remote peer.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePeer {
    /// Relay connection id
    pub connection: String,
    /// Loro peer id of the remote replica
    pub peer_id: u64,
    pub state: AwarenessState,
    pub last_seen: Instant,
}

impl RemotePeer {
    pub fn cursor(&self) -> Option<CursorPosition> {
        self.state.cursor
    }

    pub fn name(&self) -> Option<&str> {
        self.state.user.as_ref().map(|u| u.name.as_str())
    }

    /// Display color; falls back to one derived from the peer id.
    pub fn color(&self) -> String {
        self.state
            .user
            .as_ref()
            .map(|u| u.color.clone())
            .unwrap_or_else(|| color_for_peer(self.peer_id))
    }
}

/// Local awareness state plus the last known state of every remote peer.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    peer_id: u64,
    local: AwarenessState,
    peers: HashMap<String, RemotePeer>,
    heartbeat_interval: Duration,
    timeout: Duration,
    last_heartbeat: Option<Instant>,
}

impl PresenceTracker {
    pub fn new(peer_id: u64) -> Self {
        Self::with_timing(peer_id, HEARTBEAT_INTERVAL, PRESENCE_TIMEOUT)
    }

    pub fn with_timing(peer_id: u64, heartbeat_interval: Duration, timeout: Duration) -> Self {
        Self {
            peer_id,
            local: AwarenessState::default(),
            peers: HashMap::new(),
            heartbeat_interval,
            timeout,
            last_heartbeat: None,
        }
    }

    pub fn peer_id(&self) -> u64 {
        self.peer_id
    }

    pub fn local(&self) -> &AwarenessState {
        &self.local
    }

    /// Frame carrying the current local state.
    pub fn local_message(&self) -> ClientMessage {
        ClientMessage::Awareness {
            peer_id: self.peer_id,
            state: self.local.clone(),
        }
    }

    pub fn set_cursor(&mut self, x: f64, y: f64) -> ClientMessage {
        self.local.cursor = Some(CursorPosition { x, y });
        self.local_message()
    }

    pub fn clear_cursor(&mut self) -> ClientMessage {
        self.local.cursor = None;
        self.local_message()
    }

    /// Set the display name; without a color one is derived from the peer id.
    pub fn set_user(&mut self, name: impl Into<String>, color: Option<String>) -> ClientMessage {
        self.local.user = Some(UserInfo {
            name: name.into(),
            color: color.unwrap_or_else(|| color_for_peer(self.peer_id)),
        });
        self.local_message()
    }

    /// Heartbeat frame when one is due.
    pub fn tick(&mut self, now: Instant) -> Option<ClientMessage> {
        let due = self
            .last_heartbeat
            .is_none_or(|last| now.saturating_duration_since(last) >= self.heartbeat_interval);
        if !due {
            return None;
        }
        self.last_heartbeat = Some(now);
        Some(self.local_message())
    }

    /// Record an awareness frame. Frames carrying our own peer id are ignored.
    pub fn handle_awareness(&mut self, from: &str, peer_id: u64, state: AwarenessState, now: Instant) -> bool {
        if peer_id == self.peer_id {
            return false;
        }
        self.peers.insert(
            from.to_string(),
            RemotePeer {
                connection: from.to_string(),
                peer_id,
                state,
                last_seen: now,
            },
        );
        true
    }

    /// Drop a peer that left the room.
    pub fn remove_peer(&mut self, connection: &str) -> Option<RemotePeer> {
        self.peers.remove(connection)
    }

    /// Drop peers that have been silent longer than the timeout. Returns
    /// their connection ids.
    pub fn expire(&mut self, now: Instant) -> Vec<String> {
        let timeout = self.timeout;
        let mut expired: Vec<String> = self
            .peers
            .values()
            .filter(|p| now.saturating_duration_since(p.last_seen) > timeout)
            .map(|p| p.connection.clone())
            .collect();
        expired.sort();
        for connection in &expired {
            log::debug!("Presence of {connection} expired");
            self.peers.remove(connection);
        }
        expired
    }

    /// Forget every remote peer, e.g. when our own connection drops.
    pub fn clear(&mut self) {
        self.peers.clear();
        self.last_heartbeat = None;
    }

    pub fn peer(&self, connection: &str) -> Option<&RemotePeer> {
        self.peers.get(connection)
    }

    /// Remote peers ordered by connection id.
    pub fn peers(&self) -> Vec<&RemotePeer> {
        let mut peers: Vec<&RemotePeer> = self.peers.values().collect();
        peers.sort_by(|a, b| a.connection.cmp(&b.connection));
        peers
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

/// Stable, vivid `#rrggbb` color derived from a peer id.
pub fn color_for_peer(peer_id: u64) -> String {
    let hue = (peer_id % 360) as f64 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.55);
    let channel = |v: f64| (v * 255.0).round().clamp(0.0, 255.0) as u8;
    format!("#{:02x}{:02x}{:02x}", channel(r), channel(g), channel(b))
}

fn hsl_to_rgb(h: f64, s: f64, l: f64) -> (f64, f64, f64) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f64, q: f64, mut t: f64) -> f64 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}
