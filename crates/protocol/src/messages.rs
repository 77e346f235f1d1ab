use serde::{Deserialize, Serialize};

/// Floor phase as reported in `ptt_status` and monitor snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FloorPhase {
    Idle,
    Transmitting,
}

/// ICE candidate payload as exchanged with browsers.
///
/// Field names follow the W3C `RTCIceCandidateInit` dictionary, so a browser
/// can pass the object straight to `addIceCandidate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// ICE server entry delivered in the `config` handshake message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerInfo {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// One member as listed in `client_list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSummary {
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
}

/// Messages a client may send on the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// SDP offer initiating the server-sourced audio session
    Offer { sdp: String },
    /// ICE candidate for the server peer connection
    #[serde(rename = "ice-candidate")]
    IceCandidate { candidate: CandidateInit },
    /// Ask for the floor
    PttRequest,
    /// Give the floor back
    PttRelease,
    /// Routed client-to-client SDP offer
    P2pOffer { to: String, sdp: String },
    /// Routed client-to-client SDP answer
    P2pAnswer { to: String, sdp: String },
    /// Routed client-to-client ICE candidate
    P2pIceCandidate { to: String, candidate: CandidateInit },
}

/// Messages the server sends on the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message after accept: ICE servers plus the assigned identity.
    /// Members get `clientId`, observers get `monitorId`.
    Config {
        #[serde(rename = "iceServers")]
        ice_servers: Vec<IceServerInfo>,
        #[serde(rename = "clientId", skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(rename = "monitorId", skip_serializing_if = "Option::is_none")]
        monitor_id: Option<String>,
    },
    /// SDP answer to a client `offer`
    Answer { sdp: String },
    /// Server-side ICE candidate (usually none: candidates are embedded in
    /// the answer once gathering completes)
    #[serde(rename = "ice-candidate")]
    IceCandidate { candidate: CandidateInit },
    /// Floor state broadcast
    PttStatus {
        state: FloorPhase,
        speaker: Option<String>,
        #[serde(rename = "speakerName")]
        speaker_name: Option<String>,
    },
    /// The floor is yours
    PttGranted,
    /// Someone else holds the floor
    PttDenied {
        speaker: Option<String>,
        #[serde(rename = "speakerName")]
        speaker_name: Option<String>,
    },
    /// Full member list, delivered once to a newly-joined session
    ClientList { clients: Vec<ClientSummary> },
    ClientJoined {
        #[serde(rename = "clientId")]
        client_id: String,
        #[serde(rename = "displayName")]
        display_name: String,
    },
    ClientLeft {
        #[serde(rename = "clientId")]
        client_id: String,
    },
    /// Routed client-to-client signaling, `from` rewritten by the server
    P2pOffer { from: String, sdp: String },
    P2pAnswer { from: String, sdp: String },
    P2pIceCandidate { from: String, candidate: CandidateInit },
    /// Observer-only periodic snapshot
    MonitorState {
        timestamp: f64,
        clients: Vec<MonitorClient>,
        ptt: MonitorFloor,
        stats: MonitorStats,
    },
}

/// One member as seen by an observer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorClient {
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    /// Unix timestamp of the connect instant
    #[serde(rename = "connectedAt")]
    pub connected_at: f64,
    /// Seconds since connect
    pub duration: f64,
    #[serde(rename = "connectionState")]
    pub connection_state: String,
    #[serde(rename = "iceState")]
    pub ice_state: String,
}

/// Floor view inside a monitor snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorFloor {
    pub state: FloorPhase,
    pub speaker: Option<String>,
    #[serde(rename = "speakerName")]
    pub speaker_name: Option<String>,
    /// Seconds the current speaker has held the floor (0 when idle)
    pub elapsed: f64,
}

/// Coarse counters inside a monitor snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorStats {
    pub clients: usize,
    pub observers: usize,
    pub uptime: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_roundtrip() {
        let json = r#"{"type":"offer","sdp":"v=0\r\n..."}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::Offer { sdp } => assert_eq!(sdp, "v=0\r\n..."),
            _ => panic!("Expected Offer"),
        }
    }

    #[test]
    fn ice_candidate_is_kebab_case_with_camel_fields() {
        let msg = ClientMessage::IceCandidate {
            candidate: CandidateInit {
                candidate: "candidate:1 1 udp 2130706431 192.168.1.1 50000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        // Browsers send "ice-candidate", NOT snake_case
        assert!(json.contains(r#""type":"ice-candidate""#));
        assert!(json.contains(r#""sdpMid":"0""#));
        assert!(json.contains(r#""sdpMLineIndex":0"#));

        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            ClientMessage::IceCandidate { candidate } => {
                assert!(candidate.candidate.starts_with("candidate:"));
            }
            _ => panic!("Expected IceCandidate"),
        }
    }

    #[test]
    fn ptt_request_is_bare() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ptt_request"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::PttRequest));
        let json = serde_json::to_string(&ClientMessage::PttRelease).unwrap();
        assert_eq!(json, r#"{"type":"ptt_release"}"#);
    }

    #[test]
    fn p2p_messages_carry_routing_ids() {
        let json = r#"{"type":"p2p_offer","to":"abcd1234","sdp":"v=0"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::P2pOffer { to, sdp } => {
                assert_eq!(to, "abcd1234");
                assert_eq!(sdp, "v=0");
            }
            _ => panic!("Expected P2pOffer"),
        }

        let routed = ServerMessage::P2pAnswer {
            from: "abcd1234".into(),
            sdp: "v=0".into(),
        };
        let json = serde_json::to_string(&routed).unwrap();
        assert!(json.contains(r#""type":"p2p_answer""#));
        assert!(json.contains(r#""from":"abcd1234""#));
    }

    #[test]
    fn config_omits_absent_identity() {
        let member = ServerMessage::Config {
            ice_servers: vec![IceServerInfo {
                urls: vec!["stun:stun.l.google.com:19302".into()],
                username: None,
                credential: None,
            }],
            client_id: Some("a1b2c3d4".into()),
            monitor_id: None,
        };
        let json = serde_json::to_string(&member).unwrap();
        assert!(json.contains(r#""clientId":"a1b2c3d4""#));
        assert!(!json.contains("monitorId"));
        // STUN-only entries must not serialize empty credentials
        assert!(!json.contains("username"));
    }

    #[test]
    fn ptt_status_wire_shape() {
        let msg = ServerMessage::PttStatus {
            state: FloorPhase::Transmitting,
            speaker: Some("a1b2c3d4".into()),
            speaker_name: Some("Client-a1b2".into()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"ptt_status""#));
        assert!(json.contains(r#""state":"transmitting""#));
        assert!(json.contains(r#""speakerName":"Client-a1b2""#));

        let idle = ServerMessage::PttStatus {
            state: FloorPhase::Idle,
            speaker: None,
            speaker_name: None,
        };
        let json = serde_json::to_string(&idle).unwrap();
        assert!(json.contains(r#""state":"idle""#));
        assert!(json.contains(r#""speaker":null"#));
    }

    #[test]
    fn membership_messages_use_camel_case() {
        let joined = ServerMessage::ClientJoined {
            client_id: "a1b2c3d4".into(),
            display_name: "Client-a1b2".into(),
        };
        let json = serde_json::to_string(&joined).unwrap();
        assert!(json.contains(r#""type":"client_joined""#));
        assert!(json.contains(r#""clientId":"a1b2c3d4""#));
        assert!(json.contains(r#""displayName":"Client-a1b2""#));

        let list = ServerMessage::ClientList {
            clients: vec![ClientSummary {
                client_id: "a1b2c3d4".into(),
                display_name: "Client-a1b2".into(),
            }],
        };
        let json = serde_json::to_string(&list).unwrap();
        assert!(json.contains(r#""clients":[{"clientId""#));
    }

    #[test]
    fn monitor_state_wire_shape() {
        let msg = ServerMessage::MonitorState {
            timestamp: 1_700_000_000.5,
            clients: vec![MonitorClient {
                client_id: "a1b2c3d4".into(),
                display_name: "Client-a1b2".into(),
                connected_at: 1_699_999_990.0,
                duration: 10.5,
                connection_state: "connected".into(),
                ice_state: "connected".into(),
            }],
            ptt: MonitorFloor {
                state: FloorPhase::Idle,
                speaker: None,
                speaker_name: None,
                elapsed: 0.0,
            },
            stats: MonitorStats {
                clients: 1,
                observers: 1,
                uptime: 60.0,
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"monitor_state""#));
        assert!(json.contains(r#""connectedAt""#));
        assert!(json.contains(r#""connectionState":"connected""#));
        assert!(json.contains(r#""stats":{"clients":1,"observers":1,"uptime":60.0}"#));
    }
}
