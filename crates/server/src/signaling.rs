use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::extract::ws::{Message, WebSocket};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{Duration, interval};
use tracing::{debug, info, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use squawk_protocol::{
    CandidateInit, ClientSummary, ServerMessage, default_display_name, new_client_id,
};

use crate::broadcast::{BroadcastEvent, floor_status};
use crate::floor::{FloorDecision, ReleaseOutcome};
use crate::monitor;
use crate::peer;
use crate::sender::MediaSender;
use crate::session::PeerSession;
use crate::web::AppState;

/// Interval between WebSocket ping frames.
const WS_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum time without a pong before the connection is considered dead.
/// Allows 3 missed pings.
const WS_PONG_TIMEOUT: Duration = Duration::from_secs(90);

/// Cadence of observer snapshots.
const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Handle a member control channel from accept to teardown.
///
/// The session state machine lives in this loop: the handshake (`config` +
/// current `ptt_status`) runs before the first select, the offer/answer
/// exchange happens inside `handle_client_text`, and any exit path funnels
/// into `teardown`.
pub async fn handle_member_ws(mut socket: WebSocket, state: Arc<AppState>) {
    let client_id = new_client_id();
    let display_name = default_display_name(&client_id);
    info!(client_id, display_name, "Client connected");

    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel();
    let session = PeerSession::new(client_id.clone(), display_name, false, outbox_tx);

    // Capacity-1 channel: a terminal peer-connection state wakes the loop
    // even when the socket is quiet
    let (pc_event_tx, mut pc_event_rx) = mpsc::channel::<()>(1);

    session.send(&ServerMessage::Config {
        ice_servers: state.config.ice_servers(),
        client_id: Some(client_id.clone()),
        monitor_id: None,
    });
    session.send(&floor_status(&state.arbiter));

    // Handshake emission complete: the session appears in the registry
    state.registry.insert(Arc::clone(&session)).await;

    let mut ping_interval = interval(WS_PING_INTERVAL);
    ping_interval.tick().await; // consume the immediate first tick
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            // Drain queued messages (direct replies and broadcasts) in FIFO order
            Some(msg) = outbox_rx.recv() => {
                if socket.send(msg).await.is_err() {
                    debug!(client_id, "WebSocket send failed");
                    break;
                }
            }
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > WS_PONG_TIMEOUT {
                    debug!(client_id, "WebSocket ping timeout, closing");
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    debug!(client_id, "WebSocket ping send failed");
                    break;
                }
            }
            _ = pc_event_rx.recv() => {
                info!(client_id, "Peer connection reached a terminal state");
                break;
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = handle_client_text(&state, &session, &pc_event_tx, &text).await {
                            warn!(client_id, "Session-fatal signaling error: {e:#}");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(client_id, "WebSocket closed");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(client_id, "WebSocket error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    teardown(&state, &session).await;
}

/// Handle an observer channel: handshake with a monitor identity, an
/// immediate snapshot, then 1 Hz snapshots until disconnect. Observers may
/// send an `offer` to attach a media sender; everything else is dropped.
pub async fn handle_monitor_ws(mut socket: WebSocket, state: Arc<AppState>) {
    let monitor_id = format!("monitor-{}", new_client_id());
    info!(monitor_id, "Observer connected");

    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel();
    let session = PeerSession::new(monitor_id.clone(), monitor_id.clone(), true, outbox_tx);
    let (pc_event_tx, mut pc_event_rx) = mpsc::channel::<()>(1);

    session.send(&ServerMessage::Config {
        ice_servers: state.config.ice_servers(),
        client_id: None,
        monitor_id: Some(monitor_id.clone()),
    });
    state.registry.insert(Arc::clone(&session)).await;

    // Full snapshot on attach, periodic ones thereafter
    session.send(&monitor::snapshot(&state.registry, &state.arbiter, state.started_at).await);

    let mut snapshot_interval = interval(MONITOR_INTERVAL);
    snapshot_interval.tick().await;
    let mut ping_interval = interval(WS_PING_INTERVAL);
    ping_interval.tick().await;
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            Some(msg) = outbox_rx.recv() => {
                if socket.send(msg).await.is_err() {
                    debug!(monitor_id, "Observer send failed");
                    break;
                }
            }
            _ = snapshot_interval.tick() => {
                session.send(&monitor::snapshot(&state.registry, &state.arbiter, state.started_at).await);
            }
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > WS_PONG_TIMEOUT {
                    debug!(monitor_id, "Observer ping timeout, closing");
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            _ = pc_event_rx.recv() => {
                info!(monitor_id, "Observer peer connection reached a terminal state");
                break;
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = handle_client_text(&state, &session, &pc_event_tx, &text).await {
                            warn!(monitor_id, "Observer signaling error: {e:#}");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(monitor_id, "Observer closed");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(monitor_id, "Observer WebSocket error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    teardown(&state, &session).await;
}

/// Dispatch one control-channel message.
///
/// Only a failed offer/answer exchange is session-fatal; protocol errors
/// (invalid JSON, unknown type, malformed candidate) are logged and the
/// session continues.
async fn handle_client_text(
    state: &Arc<AppState>,
    session: &Arc<PeerSession>,
    pc_event_tx: &mpsc::Sender<()>,
    text: &str,
) -> anyhow::Result<()> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!(client_id = %session.client_id, "Invalid JSON discarded: {e}");
            return Ok(());
        }
    };
    let msg_type = value.get("type").and_then(Value::as_str).unwrap_or("");

    // Observers only negotiate server audio; they have no floor or mesh role
    if session.is_observer && !matches!(msg_type, "offer" | "ice-candidate") {
        debug!(client_id = %session.client_id, msg_type, "Observer message dropped");
        return Ok(());
    }

    match msg_type {
        "offer" => {
            let Some(sdp) = value.get("sdp").and_then(Value::as_str) else {
                warn!(client_id = %session.client_id, "Offer without sdp discarded");
                return Ok(());
            };
            handle_offer(state, session, pc_event_tx, sdp).await?;
        }
        "ice-candidate" => {
            let Some(payload) = value.get("candidate") else {
                warn!(client_id = %session.client_id, "Candidate message without payload discarded");
                return Ok(());
            };
            match serde_json::from_value::<CandidateInit>(payload.clone()) {
                Ok(init) => {
                    if let Some(pc) = session.peer_connection() {
                        if let Err(e) = peer::add_remote_candidate(&pc, &init).await {
                            warn!(client_id = %session.client_id, "Discarding ICE candidate: {e:#}");
                        }
                    } else {
                        debug!(client_id = %session.client_id, "Candidate before offer dropped");
                    }
                }
                Err(e) => {
                    warn!(client_id = %session.client_id, "Malformed candidate discarded: {e}");
                }
            }
        }
        "ptt_request" => {
            match state
                .arbiter
                .request(&session.client_id, &session.display_name, Instant::now())
            {
                FloorDecision::Granted => {
                    session.send(&ServerMessage::PttGranted);
                    state.dispatcher.emit(BroadcastEvent::FloorChanged);
                }
                FloorDecision::Denied {
                    speaker,
                    speaker_name,
                } => {
                    session.send(&ServerMessage::PttDenied {
                        speaker: Some(speaker),
                        speaker_name: Some(speaker_name),
                    });
                }
            }
        }
        "ptt_release" => {
            if state.arbiter.release(&session.client_id) == ReleaseOutcome::Released {
                state.dispatcher.emit(BroadcastEvent::FloorChanged);
            }
        }
        "p2p_offer" | "p2p_answer" | "p2p_ice_candidate" => {
            route_p2p(state, session, value).await;
        }
        other => {
            warn!(client_id = %session.client_id, msg_type = other, "Unknown message type discarded");
        }
    }

    Ok(())
}

/// Relay a client-to-client signaling message: look up the target, rewrite
/// `to` into `from`, forward the body untouched. Unknown targets are
/// dropped and logged; no SDP or candidate parsing happens here.
async fn route_p2p(state: &Arc<AppState>, sender: &PeerSession, mut value: Value) {
    let Some(target_id) = value.get("to").and_then(Value::as_str).map(str::to_string) else {
        warn!(client_id = %sender.client_id, "Routed message without 'to' dropped");
        return;
    };
    let Some(target) = state.registry.get(&target_id).await else {
        debug!(
            client_id = %sender.client_id,
            target_id,
            "Routed message to unknown client dropped"
        );
        return;
    };

    if let Some(body) = value.as_object_mut() {
        body.remove("to");
        body.insert("from".to_string(), Value::String(sender.client_id.clone()));
    }
    match serde_json::to_string(&value) {
        Ok(json) => target.send_text(json),
        Err(e) => {
            warn!(client_id = %sender.client_id, "Failed to re-serialize routed message: {e}")
        }
    }
}

/// `ready → negotiating → active`: terminate the client's offer against a
/// fresh peer connection with this session's media sender attached, then
/// make the membership visible.
async fn handle_offer(
    state: &Arc<AppState>,
    session: &Arc<PeerSession>,
    pc_event_tx: &mpsc::Sender<()>,
    sdp: &str,
) -> anyhow::Result<()> {
    if session.peer_connection().is_some() {
        warn!(client_id = %session.client_id, "Repeated offer ignored");
        return Ok(());
    }

    let pc = peer::create_peer_connection(&state.config.ice_servers())
        .await
        .context("Failed to create peer connection")?;

    let tx = pc_event_tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |pc_state| {
        match pc_state {
            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                let _ = tx.try_send(());
            }
            _ => {
                debug!(?pc_state, "Peer connection state changed");
            }
        }
        Box::pin(async {})
    }));

    let track_session = Arc::clone(session);
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        info!(
            client_id = %track_session.client_id,
            track_id = %track.id(),
            "Remote audio track received"
        );
        track_session.set_remote_track(track.id());
        Box::pin(async {})
    }));

    // The sender must exist before the answer so its track is part of the
    // local description
    let sender = MediaSender::attach(&pc, &state.capture)
        .await
        .context("Failed to attach media sender")?;
    session.set_media_sender(sender);
    session.set_peer_connection(Arc::clone(&pc));

    let answer_sdp = peer::answer_offer(&pc, sdp).await?;
    session.send(&ServerMessage::Answer { sdp: answer_sdp });
    info!(client_id = %session.client_id, "Answer sent");

    if !session.is_observer {
        let clients: Vec<ClientSummary> = state
            .registry
            .members(false)
            .await
            .into_iter()
            .filter(|m| m.client_id != session.client_id)
            .map(|m| ClientSummary {
                client_id: m.client_id.clone(),
                display_name: m.display_name.clone(),
            })
            .collect();
        session.send(&ServerMessage::ClientList { clients });
        state.dispatcher.emit(BroadcastEvent::MemberJoined {
            client_id: session.client_id.clone(),
            display_name: session.display_name.clone(),
        });
    }

    Ok(())
}

/// Tear a session down exactly once: release the floor, leave the registry,
/// broadcast departure, stop the media sender and await the peer-connection
/// close. Errors here never cross to other sessions.
pub async fn teardown(state: &Arc<AppState>, session: &Arc<PeerSession>) {
    if !session.begin_close() {
        return;
    }
    let client_id = &session.client_id;

    // Floor first: the status broadcast that follows must observe idle
    if !session.is_observer && state.arbiter.release(client_id) == ReleaseOutcome::Released {
        state.dispatcher.emit(BroadcastEvent::FloorChanged);
    }

    state.registry.remove(client_id).await;

    if !session.is_observer {
        state.dispatcher.emit(BroadcastEvent::MemberLeft {
            client_id: client_id.clone(),
        });
    }

    if let Some(sender) = session.take_media_sender() {
        sender.stop();
    }

    if let Some(pc) = session.peer_connection() {
        if let Err(e) = pc.close().await {
            debug!(client_id, "Peer connection close failed: {e}");
        }
    }

    info!(
        client_id,
        had_remote_track = session.has_remote_track(),
        "Session closed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::broadcast::Dispatcher;
    use crate::capture::CaptureHub;
    use crate::floor::FloorArbiter;
    use crate::recordings::RecordingStore;
    use crate::session::SessionRegistry;
    use squawk_protocol::Config;

    fn test_state() -> Arc<AppState> {
        let registry = SessionRegistry::new();
        let arbiter = Arc::new(FloorArbiter::new(Duration::from_secs(30)));
        let dispatcher = Dispatcher::spawn(Arc::clone(&registry), Arc::clone(&arbiter));
        Arc::new(AppState {
            config: Config::default(),
            registry,
            arbiter,
            dispatcher,
            capture: CaptureHub::new(48000),
            recordings: RecordingStore::new(std::env::temp_dir()),
            started_at: Instant::now(),
        })
    }

    async fn member(
        state: &Arc<AppState>,
        id: &str,
    ) -> (Arc<PeerSession>, UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = PeerSession::new(
            id.to_string(),
            default_display_name(id),
            false,
            tx,
        );
        state.registry.insert(Arc::clone(&session)).await;
        (session, rx)
    }

    async fn next_json(rx: &mut UnboundedReceiver<Message>) -> serde_json::Value {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("message not delivered")
            .expect("outbox closed")
        {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn relay_rewrites_routing_and_preserves_body() {
        let state = test_state();
        let (alice, _alice_rx) = member(&state, "aaaa1111").await;
        let (_bob, mut bob_rx) = member(&state, "bbbb2222").await;

        // Unknown extra fields must survive the relay untouched
        let raw = r#"{"type":"p2p_offer","to":"bbbb2222","sdp":"v=0","renegotiate":true}"#;
        let value: Value = serde_json::from_str(raw).unwrap();
        route_p2p(&state, &alice, value).await;

        let forwarded = next_json(&mut bob_rx).await;
        assert_eq!(forwarded["type"], "p2p_offer");
        assert_eq!(forwarded["from"], "aaaa1111");
        assert!(forwarded.get("to").is_none());
        assert_eq!(forwarded["sdp"], "v=0");
        assert_eq!(forwarded["renegotiate"], true);
    }

    #[tokio::test]
    async fn relay_to_unknown_target_is_dropped() {
        let state = test_state();
        let (alice, mut alice_rx) = member(&state, "aaaa1111").await;

        let raw = r#"{"type":"p2p_answer","to":"gone0000","sdp":"v=0"}"#;
        let value: Value = serde_json::from_str(raw).unwrap();
        route_p2p(&state, &alice, value).await;

        // Nothing bounces back to the sender either
        tokio::task::yield_now().await;
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn floor_request_grants_then_denies() {
        let state = test_state();
        let (alice, mut alice_rx) = member(&state, "aaaa1111").await;
        let (bob, mut bob_rx) = member(&state, "bbbb2222").await;
        let (pc_tx, _pc_rx) = mpsc::channel(1);

        handle_client_text(&state, &alice, &pc_tx, r#"{"type":"ptt_request"}"#)
            .await
            .unwrap();
        let granted = next_json(&mut alice_rx).await;
        assert_eq!(granted["type"], "ptt_granted");
        assert_eq!(state.arbiter.snapshot().unwrap().client_id, "aaaa1111");

        // The grant is also broadcast as a floor status to everyone
        let status = next_json(&mut bob_rx).await;
        assert_eq!(status["type"], "ptt_status");
        assert_eq!(status["state"], "transmitting");
        assert_eq!(status["speaker"], "aaaa1111");

        handle_client_text(&state, &bob, &pc_tx, r#"{"type":"ptt_request"}"#)
            .await
            .unwrap();
        let denied = next_json(&mut bob_rx).await;
        assert_eq!(denied["type"], "ptt_denied");
        assert_eq!(denied["speaker"], "aaaa1111");
        assert_eq!(denied["speakerName"], "Client-aaaa");

        // Only the owner's release clears the floor
        handle_client_text(&state, &bob, &pc_tx, r#"{"type":"ptt_release"}"#)
            .await
            .unwrap();
        assert!(state.arbiter.snapshot().is_some());
        handle_client_text(&state, &alice, &pc_tx, r#"{"type":"ptt_release"}"#)
            .await
            .unwrap();
        assert!(state.arbiter.snapshot().is_none());
    }

    #[tokio::test]
    async fn protocol_errors_are_not_fatal() {
        let state = test_state();
        let (alice, mut alice_rx) = member(&state, "aaaa1111").await;
        let (pc_tx, _pc_rx) = mpsc::channel(1);

        // Invalid JSON, unknown type, offer without sdp: all logged and dropped
        for text in [
            "{not json",
            r#"{"type":"warp_drive"}"#,
            r#"{"type":"offer"}"#,
            r#"{"type":"ice-candidate"}"#,
        ] {
            handle_client_text(&state, &alice, &pc_tx, text).await.unwrap();
        }

        tokio::task::yield_now().await;
        assert!(alice_rx.try_recv().is_err());
        assert!(state.registry.get("aaaa1111").await.is_some());
    }

    #[tokio::test]
    async fn teardown_releases_floor_and_departs_once() {
        let state = test_state();
        let (alice, _alice_rx) = member(&state, "aaaa1111").await;
        let (_bob, mut bob_rx) = member(&state, "bbbb2222").await;

        state
            .arbiter
            .request("aaaa1111", "Client-aaaa", Instant::now());

        teardown(&state, &alice).await;
        // Floor is idle before any later status broadcast is rendered
        assert!(state.arbiter.snapshot().is_none());
        assert!(state.registry.get("aaaa1111").await.is_none());

        let status = next_json(&mut bob_rx).await;
        assert_eq!(status["type"], "ptt_status");
        assert_eq!(status["state"], "idle");
        let left = next_json(&mut bob_rx).await;
        assert_eq!(left["type"], "client_left");
        assert_eq!(left["clientId"], "aaaa1111");

        // Second close is a no-op: no duplicate client_left
        teardown(&state, &alice).await;
        tokio::task::yield_now().await;
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn observer_messages_outside_negotiation_are_dropped() {
        let state = test_state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let observer = PeerSession::new(
            "monitor-aaaa1111".to_string(),
            "monitor-aaaa1111".to_string(),
            true,
            tx,
        );
        state.registry.insert(Arc::clone(&observer)).await;
        let (pc_tx, _pc_rx) = mpsc::channel(1);

        handle_client_text(&state, &observer, &pc_tx, r#"{"type":"ptt_request"}"#)
            .await
            .unwrap();

        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        assert!(state.arbiter.snapshot().is_none());
    }
}
