use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use squawk_protocol::{FloorPhase, ServerMessage};

use crate::floor::FloorArbiter;
use crate::session::SessionRegistry;

/// Events the dispatcher turns into broadcasts.
#[derive(Debug)]
pub enum BroadcastEvent {
    /// Floor ownership changed (grant, release or revoke); the dispatcher
    /// re-reads the arbiter so the emitted status reflects the latest state.
    FloorChanged,
    MemberJoined {
        client_id: String,
        display_name: String,
    },
    MemberLeft {
        client_id: String,
    },
}

/// Handle to the broadcast dispatcher task.
///
/// One task drains the event queue, so all recipients observe broadcasts in
/// a single total order; per-recipient FIFO is the session outbox.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<BroadcastEvent>,
}

impl Dispatcher {
    /// Spawn the dispatcher task over the given registry and arbiter.
    pub fn spawn(registry: Arc<SessionRegistry>, arbiter: Arc<FloorArbiter>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                dispatch(&registry, &arbiter, event).await;
            }
            debug!("Broadcast dispatcher stopped");
        });
        Self { tx }
    }

    /// Queue an event. Never blocks; the dispatcher being gone means the
    /// process is shutting down and the event is moot.
    pub fn emit(&self, event: BroadcastEvent) {
        let _ = self.tx.send(event);
    }
}

/// Render the current floor state as a `ptt_status` message.
pub fn floor_status(arbiter: &FloorArbiter) -> ServerMessage {
    match arbiter.snapshot() {
        Some(owner) => ServerMessage::PttStatus {
            state: FloorPhase::Transmitting,
            speaker: Some(owner.client_id),
            speaker_name: Some(owner.display_name),
        },
        None => ServerMessage::PttStatus {
            state: FloorPhase::Idle,
            speaker: None,
            speaker_name: None,
        },
    }
}

async fn dispatch(registry: &SessionRegistry, arbiter: &FloorArbiter, event: BroadcastEvent) {
    match event {
        BroadcastEvent::FloorChanged => {
            let status = floor_status(arbiter);
            send_to_members(registry, &status, None).await;
        }
        BroadcastEvent::MemberJoined {
            client_id,
            display_name,
        } => {
            let joined = ServerMessage::ClientJoined {
                client_id: client_id.clone(),
                display_name,
            };
            send_to_members(registry, &joined, Some(&client_id)).await;
            // Late joiners still need to know who is talking
            if arbiter.snapshot().is_some() {
                let status = floor_status(arbiter);
                send_to_members(registry, &status, None).await;
            }
        }
        BroadcastEvent::MemberLeft { client_id } => {
            let left = ServerMessage::ClientLeft {
                client_id: client_id.clone(),
            };
            send_to_members(registry, &left, Some(&client_id)).await;
            if arbiter.snapshot().is_some() {
                let status = floor_status(arbiter);
                send_to_members(registry, &status, None).await;
            }
        }
    }
}

/// Deliver one message to every non-observer member except `skip`.
/// Best-effort per recipient: a dead outbox is logged by the session and
/// delivery continues.
async fn send_to_members(registry: &SessionRegistry, msg: &ServerMessage, skip: Option<&str>) {
    for member in registry.members(false).await {
        if skip.is_some_and(|id| id == member.client_id) {
            continue;
        }
        member.send(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use axum::extract::ws::Message;
    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::session::PeerSession;

    fn member(id: &str) -> (Arc<PeerSession>, UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = PeerSession::new(
            id.to_string(),
            squawk_protocol::default_display_name(id),
            false,
            tx,
        );
        (session, rx)
    }

    fn observer(id: &str) -> (Arc<PeerSession>, UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = PeerSession::new(id.to_string(), id.to_string(), true, tx);
        (session, rx)
    }

    async fn next_json(rx: &mut UnboundedReceiver<Message>) -> serde_json::Value {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("broadcast not delivered")
            .expect("outbox closed")
        {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn floor_change_reaches_all_members_in_order() {
        let registry = SessionRegistry::new();
        let arbiter = Arc::new(FloorArbiter::new(Duration::from_secs(30)));
        let (a, mut a_rx) = member("aaaa1111");
        let (b, mut b_rx) = member("bbbb2222");
        registry.insert(a).await;
        registry.insert(b).await;

        let dispatcher = Dispatcher::spawn(Arc::clone(&registry), Arc::clone(&arbiter));

        arbiter.request("aaaa1111", "Client-aaaa", Instant::now());
        dispatcher.emit(BroadcastEvent::FloorChanged);
        // Wait for delivery before mutating the floor again: the dispatcher
        // renders the arbiter state at processing time
        for rx in [&mut a_rx, &mut b_rx] {
            let first = next_json(rx).await;
            assert_eq!(first["type"], "ptt_status");
            assert_eq!(first["state"], "transmitting");
            assert_eq!(first["speaker"], "aaaa1111");
        }

        arbiter.release("aaaa1111");
        dispatcher.emit(BroadcastEvent::FloorChanged);
        for rx in [&mut a_rx, &mut b_rx] {
            let second = next_json(rx).await;
            assert_eq!(second["state"], "idle");
            assert_eq!(second["speaker"], serde_json::Value::Null);
        }
    }

    #[tokio::test]
    async fn membership_deltas_skip_subject_and_observers() {
        let registry = SessionRegistry::new();
        let arbiter = Arc::new(FloorArbiter::new(Duration::from_secs(30)));
        let (a, mut a_rx) = member("aaaa1111");
        let (b, mut b_rx) = member("bbbb2222");
        let (m, mut m_rx) = observer("monitor-1");
        registry.insert(a).await;
        registry.insert(b).await;
        registry.insert(m).await;

        let dispatcher = Dispatcher::spawn(Arc::clone(&registry), arbiter);
        dispatcher.emit(BroadcastEvent::MemberJoined {
            client_id: "bbbb2222".into(),
            display_name: "Client-bbbb".into(),
        });

        let msg = next_json(&mut a_rx).await;
        assert_eq!(msg["type"], "client_joined");
        assert_eq!(msg["clientId"], "bbbb2222");

        // Subject and observer see nothing
        tokio::task::yield_now().await;
        assert!(b_rx.try_recv().is_err());
        assert!(m_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn member_left_with_live_floor_appends_status() {
        let registry = SessionRegistry::new();
        let arbiter = Arc::new(FloorArbiter::new(Duration::from_secs(30)));
        let (a, mut a_rx) = member("aaaa1111");
        registry.insert(a).await;

        arbiter.request("bbbb2222", "Client-bbbb", Instant::now());
        let dispatcher = Dispatcher::spawn(Arc::clone(&registry), arbiter);
        dispatcher.emit(BroadcastEvent::MemberLeft {
            client_id: "cccc3333".into(),
        });

        let left = next_json(&mut a_rx).await;
        assert_eq!(left["type"], "client_left");
        assert_eq!(left["clientId"], "cccc3333");

        let status = next_json(&mut a_rx).await;
        assert_eq!(status["type"], "ptt_status");
        assert_eq!(status["state"], "transmitting");
    }

    #[tokio::test]
    async fn dead_recipient_does_not_halt_delivery() {
        let registry = SessionRegistry::new();
        let arbiter = Arc::new(FloorArbiter::new(Duration::from_secs(30)));
        let (dead, dead_rx) = member("aaaa1111");
        let (live, mut live_rx) = member("bbbb2222");
        registry.insert(dead).await;
        registry.insert(live).await;
        drop(dead_rx);

        let dispatcher = Dispatcher::spawn(Arc::clone(&registry), arbiter);
        dispatcher.emit(BroadcastEvent::FloorChanged);

        let msg = next_json(&mut live_rx).await;
        assert_eq!(msg["type"], "ptt_status");
    }
}
