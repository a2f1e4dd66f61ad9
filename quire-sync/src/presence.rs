//! Presence: who else has the document open, and where their cursor is.
//!
//! ```text
//! local set_presence()                      presence feed row
//!       │                                         │
//!       ▼                                         ▼
//! PresenceState::encode()              PresenceState::decode()
//!       │                                         │
//!       ▼   PUT /presence-updates                 ▼
//! Presence Registry ───────────────────► PresenceMap::apply()
//!                                                 │
//!                                                 ▼  (heartbeat tick)
//!                                       PresenceMap::prune_stale()
//! ```
//!
//! The registry stores opaque bytes; [`PresenceState`] is the payload this
//! crate's providers put there. Remote entries are aged by local receipt time
//! so a peer with a skewed clock is judged by when we last heard from it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::{ClientId, ProtocolError};

/// RGBA color for a peer's cursor and selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable color for a client id: hue from the id, fixed saturation and
    /// lightness so every peer gets a vivid, readable color.
    pub fn from_client_id(id: ClientId) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    /// `#rrggbb` form for UIs.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!(
            "#{:02x}{:02x}{:02x}",
            channel(self.r),
            channel(self.g),
            channel(self.b)
        )
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
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

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
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

/// Caret and selection within the document text, in characters.
///
/// `anchor == head` is a collapsed caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextCursor {
    pub anchor: u32,
    pub head: u32,
}

impl TextCursor {
    pub fn caret(at: u32) -> Self {
        Self { anchor: at, head: at }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.head
    }

    /// Selected range as `(start, len)`.
    pub fn range(&self) -> (u32, u32) {
        let start = self.anchor.min(self.head);
        (start, self.anchor.max(self.head) - start)
    }
}

/// Presence payload published by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    pub client_id: ClientId,
    pub name: String,
    pub color: CursorColor,
    pub cursor: Option<TextCursor>,
}

impl PresenceState {
    pub fn new(client_id: ClientId, name: impl Into<String>) -> Self {
        Self {
            client_id,
            name: name.into(),
            color: CursorColor::from_client_id(client_id),
            cursor: None,
        }
    }

    pub fn with_cursor(mut self, cursor: TextCursor) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (state, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(state)
    }
}

/// A remote peer's presence as last received.
#[derive(Debug, Clone)]
pub struct RemotePresence {
    pub client_id: ClientId,
    /// Registry version of the row this entry came from.
    pub version: u64,
    /// Raw payload; kept even when it is not a [`PresenceState`].
    pub payload: Vec<u8>,
    /// Decoded payload, when it decodes.
    pub state: Option<PresenceState>,
    received_at: Instant,
}

impl RemotePresence {
    pub fn age(&self) -> Duration {
        self.received_at.elapsed()
    }

    pub fn is_stale(&self, ttl: Duration) -> bool {
        self.age() > ttl
    }
}

/// Remote presence of one document, keyed by client id.
pub struct PresenceMap {
    local_client_id: ClientId,
    peers: HashMap<ClientId, RemotePresence>,
}

impl PresenceMap {
    pub fn new(local_client_id: ClientId) -> Self {
        Self {
            local_client_id,
            peers: HashMap::new(),
        }
    }

    /// Insert or replace a peer's entry.
    ///
    /// Returns `false` for our own row and for rows older than the entry we
    /// already hold.
    pub fn apply(&mut self, client_id: ClientId, version: u64, payload: Vec<u8>) -> bool {
        if client_id == self.local_client_id {
            return false;
        }
        if self.peers.get(&client_id).is_some_and(|p| p.version > version) {
            return false;
        }
        let state = PresenceState::decode(&payload).ok();
        self.peers.insert(
            client_id,
            RemotePresence {
                client_id,
                version,
                payload,
                state,
                received_at: Instant::now(),
            },
        );
        true
    }

    /// Drop a peer. Returns whether it was present.
    pub fn remove(&mut self, client_id: ClientId) -> bool {
        self.peers.remove(&client_id).is_some()
    }

    /// Drop every peer not heard from within `ttl`; returns their ids.
    pub fn prune_stale(&mut self, ttl: Duration) -> Vec<ClientId> {
        let stale: Vec<ClientId> = self
            .peers
            .values()
            .filter(|p| p.is_stale(ttl))
            .map(|p| p.client_id)
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn get(&self, client_id: &ClientId) -> Option<&RemotePresence> {
        self.peers.get(client_id)
    }

    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.peers.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Copy of every entry, for handing out of a lock.
    pub fn snapshot(&self) -> Vec<RemotePresence> {
        self.peers.values().cloned().collect()
    }

    pub fn local_client_id(&self) -> ClientId {
        self.local_client_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use uuid::Uuid;

    #[test]
    fn test_color_is_stable_per_client() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(CursorColor::from_client_id(id), CursorColor::from_client_id(id));

        let color = CursorColor::from_client_id(Uuid::new_v4());
        for channel in [color.r, color.g, color.b] {
            assert!((0.0..=1.0).contains(&channel));
        }
        assert_eq!(color.a, 1.0);
    }

    #[test]
    fn test_hsl_to_rgb() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 0.01);
        assert!(g.abs() < 0.01);
        assert!(b.abs() < 0.01);

        let (r, g, b) = hsl_to_rgb(0.3, 0.0, 0.5);
        assert_eq!((r, g, b), (0.5, 0.5, 0.5));
    }

    #[test]
    fn test_color_hex() {
        let color = CursorColor { r: 1.0, g: 0.0, b: 0.5, a: 1.0 };
        assert_eq!(color.to_hex(), "#ff0080");
    }

    #[test]
    fn test_text_cursor_range() {
        assert!(TextCursor::caret(4).is_collapsed());
        assert_eq!(TextCursor { anchor: 9, head: 3 }.range(), (3, 6));
        assert_eq!(TextCursor { anchor: 3, head: 9 }.range(), (3, 6));
    }

    #[test]
    fn test_presence_state_encoding() {
        let state = PresenceState::new(Uuid::new_v4(), "Alice").with_cursor(TextCursor::caret(5));
        let decoded = PresenceState::decode(&state.encode().unwrap()).unwrap();
        assert_eq!(decoded, state);
        assert!(PresenceState::decode(&[0xFF]).is_err());
    }

    #[test]
    fn test_map_ignores_local_client() {
        let local = Uuid::new_v4();
        let mut map = PresenceMap::new(local);
        assert!(!map.apply(local, 1, b"me".to_vec()));
        assert!(map.is_empty());
    }

    #[test]
    fn test_map_apply_and_remove() {
        let mut map = PresenceMap::new(Uuid::new_v4());
        let peer = Uuid::new_v4();
        let state = PresenceState::new(peer, "Bob");

        assert!(map.apply(peer, 1, state.encode().unwrap()));
        let entry = map.get(&peer).unwrap();
        assert_eq!(entry.state.as_ref().unwrap().name, "Bob");

        // Opaque payloads are kept undecoded.
        assert!(map.apply(peer, 2, b"opaque".to_vec()));
        assert!(map.get(&peer).unwrap().state.is_none());
        assert_eq!(map.get(&peer).unwrap().payload, b"opaque");

        assert!(map.remove(peer));
        assert!(!map.remove(peer));
    }

    #[test]
    fn test_map_rejects_older_versions() {
        let mut map = PresenceMap::new(Uuid::new_v4());
        let peer = Uuid::new_v4();
        assert!(map.apply(peer, 5, b"new".to_vec()));
        assert!(!map.apply(peer, 3, b"old".to_vec()));
        assert_eq!(map.get(&peer).unwrap().payload, b"new");
    }

    #[test]
    fn test_prune_stale() {
        let mut map = PresenceMap::new(Uuid::new_v4());
        let (quiet, chatty) = (Uuid::new_v4(), Uuid::new_v4());
        map.apply(quiet, 1, vec![1]);
        thread::sleep(Duration::from_millis(60));
        map.apply(chatty, 2, vec![2]);

        let pruned = map.prune_stale(Duration::from_millis(30));
        assert_eq!(pruned, vec![quiet]);
        assert!(map.contains(&chatty));
        assert_eq!(map.len(), 1);
    }
}
