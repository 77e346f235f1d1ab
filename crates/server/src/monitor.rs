use std::time::{Instant, SystemTime, UNIX_EPOCH};

use squawk_protocol::{FloorPhase, MonitorClient, MonitorFloor, MonitorStats, ServerMessage};

use crate::floor::FloorArbiter;
use crate::session::SessionRegistry;

/// Assemble a monitor snapshot: the registry members projected to their
/// connection view, the floor state with elapsed hold time, and coarse
/// counters. Sent to every observer on attach and at 1 Hz thereafter.
pub async fn snapshot(
    registry: &SessionRegistry,
    arbiter: &FloorArbiter,
    started_at: Instant,
) -> ServerMessage {
    let now = Instant::now();

    let mut clients = Vec::new();
    for member in registry.members(false).await {
        let (connection_state, ice_state) = match member.peer_connection() {
            Some(pc) => (
                pc.connection_state().to_string(),
                pc.ice_connection_state().to_string(),
            ),
            None => ("new".to_string(), "new".to_string()),
        };
        clients.push(MonitorClient {
            client_id: member.client_id.clone(),
            display_name: member.display_name.clone(),
            connected_at: member.connected_at_unix(),
            duration: now.duration_since(member.connected_at).as_secs_f64(),
            connection_state,
            ice_state,
        });
    }

    let ptt = match arbiter.snapshot() {
        Some(owner) => MonitorFloor {
            state: FloorPhase::Transmitting,
            elapsed: now.duration_since(owner.since).as_secs_f64(),
            speaker: Some(owner.client_id),
            speaker_name: Some(owner.display_name),
        },
        None => MonitorFloor {
            state: FloorPhase::Idle,
            speaker: None,
            speaker_name: None,
            elapsed: 0.0,
        },
    };

    let (members, observers) = registry.counts().await;

    ServerMessage::MonitorState {
        timestamp: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64(),
        clients,
        ptt,
        stats: MonitorStats {
            clients: members,
            observers,
            uptime: now.duration_since(started_at).as_secs_f64(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use crate::session::PeerSession;

    #[tokio::test]
    async fn snapshot_projects_members_and_floor() {
        let registry = SessionRegistry::new();
        let arbiter = FloorArbiter::new(Duration::from_secs(30));
        let started_at = Instant::now();

        let (tx, _rx) = mpsc::unbounded_channel();
        registry
            .insert(PeerSession::new(
                "aaaa1111".into(),
                "Client-aaaa".into(),
                false,
                tx,
            ))
            .await;
        let (tx, _rx) = mpsc::unbounded_channel();
        registry
            .insert(PeerSession::new(
                "monitor-b".into(),
                "monitor-b".into(),
                true,
                tx,
            ))
            .await;

        arbiter.request("aaaa1111", "Client-aaaa", Instant::now());

        let msg = snapshot(&registry, &arbiter, started_at).await;
        let ServerMessage::MonitorState {
            clients,
            ptt,
            stats,
            timestamp,
        } = msg
        else {
            panic!("expected monitor_state");
        };

        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].client_id, "aaaa1111");
        // No peer connection yet: states report as fresh
        assert_eq!(clients[0].connection_state, "new");
        assert_eq!(ptt.state, FloorPhase::Transmitting);
        assert_eq!(ptt.speaker.as_deref(), Some("aaaa1111"));
        assert_eq!(stats.clients, 1);
        assert_eq!(stats.observers, 1);
        assert!(timestamp > 0.0);
        assert!(stats.uptime >= 0.0);
    }

    #[tokio::test]
    async fn idle_floor_reports_zero_elapsed() {
        let registry = SessionRegistry::new();
        let arbiter = FloorArbiter::new(Duration::from_secs(30));

        let msg = snapshot(&registry, &arbiter, Instant::now()).await;
        let ServerMessage::MonitorState { ptt, stats, .. } = msg else {
            panic!("expected monitor_state");
        };
        assert_eq!(ptt.state, FloorPhase::Idle);
        assert_eq!(ptt.elapsed, 0.0);
        assert_eq!(stats.clients, 0);
    }
}
