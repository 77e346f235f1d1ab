mod audio;
mod p2p;
mod peer;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use squawk_protocol::{ClientMessage, FloorPhase, IceServerInfo, ServerMessage};

use crate::audio::{MicCapture, MicSwitch, SpeakerOutput};
use crate::p2p::P2pManager;

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

struct ClientConfig {
    server_url: String,
    mic_source: Option<String>,
    speaker_sink: Option<String>,
    sample_rate: u32,
}

impl ClientConfig {
    fn from_env() -> Self {
        Self {
            server_url: env_nonempty("SQUAWK_SERVER_URL")
                .unwrap_or_else(|| "ws://localhost:8080/ws".to_string()),
            mic_source: env_nonempty("SQUAWK_MIC_SOURCE"),
            speaker_sink: env_nonempty("SQUAWK_SPEAKER_SINK"),
            sample_rate: env_nonempty("SQUAWK_SAMPLE_RATE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(48000),
        }
    }
}

/// Local floor view, mirroring what the server's `ptt_status` implies for us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PttState {
    Idle,
    Transmitting,
    Receiving,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ClientConfig::from_env();

    info!("==================================");
    info!("  Squawk Transceiver");
    info!("  Server: {}", config.server_url);
    info!("==================================");

    // Connect with exponential backoff retry
    let mut backoff = Duration::from_secs(2);
    let max_backoff = Duration::from_secs(60);
    loop {
        match run_session(&config).await {
            Ok(()) => {
                info!("Session closed cleanly");
                break;
            }
            Err(e) => {
                warn!("Session error: {e:#}");
                info!("Reconnecting in {} seconds...", backoff.as_secs());
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        }
    }

    Ok(())
}

async fn run_session(config: &ClientConfig) -> Result<()> {
    info!(url = config.server_url, "Connecting to server");
    let (ws_stream, _) = tokio_tungstenite::connect_async(config.server_url.as_str())
        .await
        .context("WebSocket connection failed")?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (client_id, ice_servers) = wait_for_config(&mut ws_rx).await?;
    info!(client_id, "Registered with server");

    // Outgoing WebSocket traffic from every task funnels through one queue
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    let speaker = SpeakerOutput::start(config.speaker_sink.clone(), config.sample_rate)?;
    let (mic, mic_switch) = MicCapture::start(config.mic_source.clone(), config.sample_rate)?;
    let mic_track = peer::new_mic_track();
    let mic_pump = peer::spawn_mic_pump(mic, Arc::clone(&mic_track), config.sample_rate)?;

    // Server audio session
    let pc = peer::create_peer(&ice_servers).await?;
    peer::add_mic_track(&pc, &mic_track).await?;
    {
        let speaker = speaker.clone();
        let sample_rate = config.sample_rate;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            peer::spawn_track_player("server".to_string(), track, speaker.clone(), sample_rate);
            Box::pin(async {})
        }));
    }
    let offer_sdp = peer::create_mono_offer(&pc).await?;
    send_json(&out_tx, &ClientMessage::Offer { sdp: offer_sdp });
    info!("Offer sent");

    let mesh = P2pManager::new(
        ice_servers,
        Arc::clone(&mic_track),
        speaker,
        out_tx.clone(),
        config.sample_rate,
    );

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    println!("[t] talk toggle   [q] quit");

    let mut ptt = PttState::Idle;
    let mut wants_floor = false;

    let result = loop {
        tokio::select! {
            Some(msg) = out_rx.recv() => {
                if let Err(e) = ws_tx.send(msg).await {
                    break Err(anyhow::anyhow!("WebSocket send failed: {e}"));
                }
            }
            line = stdin.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => match line.trim() {
                        "t" => {
                            if wants_floor {
                                wants_floor = false;
                                mic_switch.set(false);
                                send_json(&out_tx, &ClientMessage::PttRelease);
                            } else {
                                wants_floor = true;
                                send_json(&out_tx, &ClientMessage::PttRequest);
                            }
                        }
                        "q" => break Ok(()),
                        "" => {}
                        other => println!("Unknown command {other:?} - [t] talk toggle, [q] quit"),
                    },
                    // stdin closed (piped usage): keep running on network events
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        debug!("stdin error: {e}");
                        stdin_open = false;
                    }
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = handle_server_message(
                            &text,
                            &client_id,
                            &pc,
                            &mesh,
                            &mic_switch,
                            &mut ptt,
                            &mut wants_floor,
                        )
                        .await
                        {
                            warn!("Message handling failed: {e:#}");
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            break Err(anyhow::anyhow!("WebSocket pong failed"));
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break Err(anyhow::anyhow!("Server closed the connection"));
                    }
                    Some(Err(e)) => {
                        break Err(anyhow::anyhow!("WebSocket error: {e}"));
                    }
                    _ => {}
                }
            }
        }
    };

    // Teardown: mesh first, then the server session
    mesh.close_all().await;
    mic_pump.abort();
    if let Err(e) = pc.close().await {
        debug!("Peer connection close failed: {e}");
    }
    let _ = ws_tx.send(Message::Close(None)).await;

    result
}

fn send_json(out: &mpsc::UnboundedSender<Message>, msg: &ClientMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = out.send(Message::Text(json.into()));
        }
        Err(e) => warn!("Failed to serialize message: {e}"),
    }
}

/// Wait for the `config` handshake; an early `ptt_status` may precede it.
async fn wait_for_config<S>(ws_rx: &mut S) -> Result<(String, Vec<IceServerInfo>)>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = ws_rx.next().await {
        let Ok(Message::Text(text)) = msg else {
            continue;
        };
        match serde_json::from_str::<ServerMessage>(&text) {
            Ok(ServerMessage::Config {
                ice_servers,
                client_id: Some(client_id),
                ..
            }) => {
                info!(
                    "ICE servers: {:?}",
                    ice_servers.iter().map(|s| &s.urls).collect::<Vec<_>>()
                );
                return Ok((client_id, ice_servers));
            }
            Ok(ServerMessage::PttStatus { state, .. }) => {
                info!(?state, "Initial floor state");
            }
            Ok(_) | Err(_) => {}
        }
    }
    bail!("Connection closed before config")
}

#[allow(clippy::too_many_arguments)]
async fn handle_server_message(
    text: &str,
    client_id: &str,
    pc: &webrtc::peer_connection::RTCPeerConnection,
    mesh: &Arc<P2pManager>,
    mic_switch: &MicSwitch,
    ptt: &mut PttState,
    wants_floor: &mut bool,
) -> Result<()> {
    let msg: ServerMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("Unhandled server message: {e}");
            return Ok(());
        }
    };

    match msg {
        ServerMessage::Answer { sdp } => {
            let answer =
                webrtc::peer_connection::sdp::session_description::RTCSessionDescription::answer(
                    sdp,
                )
                .context("Failed to parse answer")?;
            pc.set_remote_description(answer)
                .await
                .context("Failed to set answer")?;
            info!("Answer received and set");
        }
        ServerMessage::IceCandidate { candidate } => {
            let result = pc
                .add_ice_candidate(
                    webrtc::ice_transport::ice_candidate::RTCIceCandidateInit {
                        candidate: candidate.candidate,
                        sdp_mid: candidate.sdp_mid,
                        sdp_mline_index: candidate.sdp_mline_index,
                        ..Default::default()
                    },
                )
                .await;
            if let Err(e) = result {
                warn!("Failed to add server ICE candidate: {e}");
            }
        }
        ServerMessage::PttStatus {
            state,
            speaker,
            speaker_name,
        } => {
            let old = *ptt;
            *ptt = if speaker.as_deref() == Some(client_id) {
                PttState::Transmitting
            } else if state == FloorPhase::Transmitting {
                PttState::Receiving
            } else {
                PttState::Idle
            };
            if *ptt != PttState::Transmitting {
                mic_switch.set(false);
                if state == FloorPhase::Idle {
                    *wants_floor = false;
                }
            }
            if old != *ptt {
                info!(
                    "PTT state: {:?} (speaker: {})",
                    *ptt,
                    speaker_name.as_deref().unwrap_or("none")
                );
            }
        }
        ServerMessage::PttGranted => {
            info!("Floor granted, transmitting");
            mic_switch.set(true);
        }
        ServerMessage::PttDenied { speaker_name, .. } => {
            *wants_floor = false;
            info!(
                "Floor denied, {} is talking",
                speaker_name.as_deref().unwrap_or("someone")
            );
        }
        ServerMessage::ClientList { clients } => {
            info!("Client list: {} clients", clients.len());
            // Existing members get an offer from us, like the browser does
            for client in clients {
                if let Err(e) = mesh.connect_to(&client.client_id).await {
                    warn!(remote_id = client.client_id, "Mesh connect failed: {e:#}");
                }
            }
        }
        ServerMessage::ClientJoined {
            client_id,
            display_name,
        } => {
            // The newcomer sees us in their client_list and offers to us
            info!(client_id, display_name, "Client joined");
        }
        ServerMessage::ClientLeft { client_id } => {
            info!(client_id, "Client left");
            mesh.close_peer(&client_id).await;
        }
        ServerMessage::P2pOffer { from, sdp } => {
            if let Err(e) = mesh.handle_offer(&from, sdp).await {
                warn!(from, "Mesh offer handling failed: {e:#}");
            }
        }
        ServerMessage::P2pAnswer { from, sdp } => {
            if let Err(e) = mesh.handle_answer(&from, sdp).await {
                warn!(from, "Mesh answer handling failed: {e:#}");
            }
        }
        ServerMessage::P2pIceCandidate { from, candidate } => {
            if let Err(e) = mesh.handle_candidate(&from, candidate).await {
                warn!(from, "Mesh candidate handling failed: {e:#}");
            }
        }
        ServerMessage::Config { .. } | ServerMessage::MonitorState { .. } => {}
    }

    Ok(())
}
