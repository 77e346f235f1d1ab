use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::extract::ws::Message;
use tokio::sync::{RwLock, mpsc};
use webrtc::peer_connection::RTCPeerConnection;

use squawk_protocol::ServerMessage;

use crate::sender::MediaSender;

/// Server-side per-client runtime state.
///
/// A session owns exactly one peer connection and exactly one media sender;
/// both are closed with the session. Cross-references between sessions are
/// by client id through the registry, never by direct pointer.
pub struct PeerSession {
    pub client_id: String,
    pub display_name: String,
    pub is_observer: bool,
    /// Monotonic connect instant, for durations
    pub connected_at: Instant,
    /// Wall-clock connect instant, for monitor snapshots
    pub connected_at_wall: SystemTime,
    /// Control-channel sink; the WebSocket loop drains this in FIFO order
    outbox: mpsc::UnboundedSender<Message>,
    pc: Mutex<Option<Arc<RTCPeerConnection>>>,
    media_sender: Mutex<Option<MediaSender>>,
    /// Track id of the client's inbound audio, once one has arrived
    remote_track: Mutex<Option<String>>,
    /// Guards teardown effects: whichever close path runs first wins
    closing: AtomicBool,
}

impl PeerSession {
    pub fn new(
        client_id: String,
        display_name: String,
        is_observer: bool,
        outbox: mpsc::UnboundedSender<Message>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client_id,
            display_name,
            is_observer,
            connected_at: Instant::now(),
            connected_at_wall: SystemTime::now(),
            outbox,
            pc: Mutex::new(None),
            media_sender: Mutex::new(None),
            remote_track: Mutex::new(None),
            closing: AtomicBool::new(false),
        })
    }

    /// Queue a message on the control channel. Best-effort: a closed channel
    /// is logged and ignored, never surfaced to other sessions.
    pub fn send(&self, msg: &ServerMessage) {
        match serde_json::to_string(msg) {
            Ok(json) => self.send_text(json),
            Err(e) => {
                tracing::error!(client_id = %self.client_id, "Failed to serialize message: {e}")
            }
        }
    }

    /// Queue pre-rendered JSON, used by the signaling router so relayed
    /// bodies pass through byte-identical.
    pub fn send_text(&self, json: String) {
        if self.outbox.send(Message::Text(json.into())).is_err() {
            tracing::debug!(client_id = %self.client_id, "Control channel gone, message dropped");
        }
    }

    pub fn set_peer_connection(&self, pc: Arc<RTCPeerConnection>) {
        *self.pc.lock().unwrap_or_else(|e| e.into_inner()) = Some(pc);
    }

    pub fn peer_connection(&self) -> Option<Arc<RTCPeerConnection>> {
        self.pc.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_media_sender(&self, sender: MediaSender) {
        *self.media_sender.lock().unwrap_or_else(|e| e.into_inner()) = Some(sender);
    }

    pub fn take_media_sender(&self) -> Option<MediaSender> {
        self.media_sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    pub fn set_remote_track(&self, track_id: String) {
        *self.remote_track.lock().unwrap_or_else(|e| e.into_inner()) = Some(track_id);
    }

    pub fn has_remote_track(&self) -> bool {
        self.remote_track
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Enter the closing state. Returns true exactly once; the control
    /// channel close and a terminal peer-connection state may race here and
    /// the loser becomes a no-op.
    pub fn begin_close(&self) -> bool {
        !self.closing.swap(true, Ordering::AcqRel)
    }

    /// Unix timestamp of the connect instant, for monitor snapshots.
    pub fn connected_at_unix(&self) -> f64 {
        self.connected_at_wall
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }
}

/// Authoritative set of live sessions, keyed by client id.
///
/// The source of truth for broadcasts: iteration clones a point-in-time
/// snapshot, so mutations during a broadcast walk never invalidate it.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<PeerSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub async fn insert(&self, session: Arc<PeerSession>) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.client_id.clone(), session);
    }

    pub async fn remove(&self, client_id: &str) -> Option<Arc<PeerSession>> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(client_id)
    }

    pub async fn get(&self, client_id: &str) -> Option<Arc<PeerSession>> {
        let sessions = self.sessions.read().await;
        sessions.get(client_id).cloned()
    }

    /// Point-in-time member snapshot, optionally including observers.
    pub async fn members(&self, include_observers: bool) -> Vec<Arc<PeerSession>> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|s| include_observers || !s.is_observer)
            .cloned()
            .collect()
    }

    /// (members, observers) counts for monitor snapshots.
    pub async fn counts(&self) -> (usize, usize) {
        let sessions = self.sessions.read().await;
        let observers = sessions.values().filter(|s| s.is_observer).count();
        (sessions.len() - observers, observers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, observer: bool) -> Arc<PeerSession> {
        let (tx, _rx) = mpsc::unbounded_channel();
        PeerSession::new(
            id.to_string(),
            squawk_protocol::default_display_name(id),
            observer,
            tx,
        )
    }

    #[tokio::test]
    async fn registry_insert_get_remove() {
        let registry = SessionRegistry::new();
        registry.insert(session("aaaa1111", false)).await;
        assert!(registry.get("aaaa1111").await.is_some());
        assert!(registry.get("bbbb2222").await.is_none());

        let removed = registry.remove("aaaa1111").await.unwrap();
        assert_eq!(removed.client_id, "aaaa1111");
        assert!(registry.get("aaaa1111").await.is_none());
        assert!(registry.remove("aaaa1111").await.is_none());
    }

    #[tokio::test]
    async fn members_filters_observers() {
        let registry = SessionRegistry::new();
        registry.insert(session("aaaa1111", false)).await;
        registry.insert(session("bbbb2222", false)).await;
        registry.insert(session("monitor1", true)).await;

        assert_eq!(registry.members(false).await.len(), 2);
        assert_eq!(registry.members(true).await.len(), 3);
        assert_eq!(registry.counts().await, (2, 1));
    }

    #[tokio::test]
    async fn member_snapshot_survives_mutation() {
        let registry = SessionRegistry::new();
        registry.insert(session("aaaa1111", false)).await;
        registry.insert(session("bbbb2222", false)).await;

        let snapshot = registry.members(false).await;
        registry.remove("aaaa1111").await;

        // The snapshot still holds both sessions
        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.members(false).await.len(), 1);
    }

    #[tokio::test]
    async fn begin_close_fires_exactly_once() {
        let s = session("aaaa1111", false);
        assert!(s.begin_close());
        assert!(!s.begin_close());
    }

    #[tokio::test]
    async fn send_to_closed_channel_is_silent() {
        let (tx, rx) = mpsc::unbounded_channel();
        let s = PeerSession::new("aaaa1111".into(), "Client-aaaa".into(), false, tx);
        drop(rx);
        // Must not panic
        s.send(&ServerMessage::PttGranted);
    }
}
