use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use squawk_protocol::{CandidateInit, ClientMessage, IceServerInfo};

use crate::audio::SpeakerOutput;
use crate::peer;

pub type WsOut = tokio::sync::mpsc::UnboundedSender<Message>;

struct MeshPeer {
    pc: Arc<RTCPeerConnection>,
    /// Candidates arriving before the remote description are buffered here
    pending_candidates: Vec<CandidateInit>,
    remote_description_set: bool,
}

/// Direct connections to the other members.
///
/// The policy mirrors the browser client: we offer to everyone already in
/// the `client_list`; newcomers offer to us. All mesh peers share the one
/// microphone track and the one speaker device.
pub struct P2pManager {
    peers: Mutex<HashMap<String, MeshPeer>>,
    ice_servers: Vec<IceServerInfo>,
    mic_track: Arc<TrackLocalStaticSample>,
    speaker: SpeakerOutput,
    ws_out: WsOut,
    sample_rate: u32,
}

impl P2pManager {
    pub fn new(
        ice_servers: Vec<IceServerInfo>,
        mic_track: Arc<TrackLocalStaticSample>,
        speaker: SpeakerOutput,
        ws_out: WsOut,
        sample_rate: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(HashMap::new()),
            ice_servers,
            mic_track,
            speaker,
            ws_out,
            sample_rate,
        })
    }

    fn send(&self, msg: &ClientMessage) {
        match serde_json::to_string(msg) {
            Ok(json) => {
                let _ = self.ws_out.send(Message::Text(json.into()));
            }
            Err(e) => warn!("Failed to serialize P2P message: {e}"),
        }
    }

    /// Get the connection to `remote_id`, creating it when absent.
    async fn ensure_peer(
        self: &Arc<Self>,
        remote_id: &str,
    ) -> anyhow::Result<Arc<RTCPeerConnection>> {
        {
            let peers = self.peers.lock().await;
            if let Some(peer) = peers.get(remote_id) {
                return Ok(Arc::clone(&peer.pc));
            }
        }

        info!(remote_id, "Creating mesh connection");
        let pc = peer::create_peer(&self.ice_servers).await?;
        peer::add_mic_track(&pc, &self.mic_track).await?;

        let speaker = self.speaker.clone();
        let sample_rate = self.sample_rate;
        let label = remote_id.to_string();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            peer::spawn_track_player(label.clone(), track, speaker.clone(), sample_rate);
            Box::pin(async {})
        }));

        // Mesh candidates trickle through the server relay
        let manager = Arc::clone(self);
        let to = remote_id.to_string();
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => manager.send(&ClientMessage::P2pIceCandidate {
                        to: to.clone(),
                        candidate: CandidateInit {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        },
                    }),
                    Err(e) => warn!("Failed to serialize ICE candidate: {e}"),
                }
            }
            Box::pin(async {})
        }));

        let manager = Arc::clone(self);
        let gone = remote_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            if matches!(
                state,
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
            ) {
                let manager = Arc::clone(&manager);
                let gone = gone.clone();
                tokio::spawn(async move {
                    manager.close_peer(&gone).await;
                });
            }
            Box::pin(async {})
        }));

        let mut peers = self.peers.lock().await;
        peers.insert(
            remote_id.to_string(),
            MeshPeer {
                pc: Arc::clone(&pc),
                pending_candidates: Vec::new(),
                remote_description_set: false,
            },
        );
        Ok(pc)
    }

    /// Offer to a member we saw in the `client_list`.
    pub async fn connect_to(self: &Arc<Self>, remote_id: &str) -> anyhow::Result<()> {
        if self.peers.lock().await.contains_key(remote_id) {
            return Ok(());
        }
        let pc = self.ensure_peer(remote_id).await?;
        let sdp = peer::create_mono_offer(&pc).await?;
        self.send(&ClientMessage::P2pOffer {
            to: remote_id.to_string(),
            sdp,
        });
        info!(remote_id, "Mesh offer sent");
        Ok(())
    }

    /// Answer an incoming mesh offer.
    pub async fn handle_offer(self: &Arc<Self>, from: &str, sdp: String) -> anyhow::Result<()> {
        info!(from, "Mesh offer received");
        let pc = self.ensure_peer(from).await?;

        let offer = RTCSessionDescription::offer(sdp).context("Failed to parse mesh offer")?;
        pc.set_remote_description(offer)
            .await
            .context("Failed to set mesh remote description")?;
        self.drain_pending(from, &pc).await;

        let answer_sdp = peer::create_mono_answer(&pc).await?;
        self.send(&ClientMessage::P2pAnswer {
            to: from.to_string(),
            sdp: answer_sdp,
        });
        info!(from, "Mesh answer sent");
        Ok(())
    }

    /// Apply an incoming mesh answer to our earlier offer.
    pub async fn handle_answer(&self, from: &str, sdp: String) -> anyhow::Result<()> {
        let pc = {
            let peers = self.peers.lock().await;
            match peers.get(from) {
                Some(peer) => Arc::clone(&peer.pc),
                None => {
                    warn!(from, "Mesh answer from unknown client dropped");
                    return Ok(());
                }
            }
        };

        let answer = RTCSessionDescription::answer(sdp).context("Failed to parse mesh answer")?;
        pc.set_remote_description(answer)
            .await
            .context("Failed to set mesh remote description")?;
        self.drain_pending(from, &pc).await;
        info!(from, "Mesh answer applied");
        Ok(())
    }

    /// Apply or buffer a relayed mesh candidate.
    pub async fn handle_candidate(
        self: &Arc<Self>,
        from: &str,
        candidate: CandidateInit,
    ) -> anyhow::Result<()> {
        let pc = self.ensure_peer(from).await?;

        let ready = {
            let mut peers = self.peers.lock().await;
            match peers.get_mut(from) {
                Some(peer) if peer.remote_description_set => true,
                Some(peer) => {
                    peer.pending_candidates.push(candidate.clone());
                    false
                }
                None => return Ok(()),
            }
        };

        if ready {
            apply_candidate(&pc, &candidate).await;
        }
        Ok(())
    }

    /// Release buffered candidates once the remote description is in place.
    async fn drain_pending(&self, remote_id: &str, pc: &RTCPeerConnection) {
        let pending = {
            let mut peers = self.peers.lock().await;
            match peers.get_mut(remote_id) {
                Some(peer) => {
                    peer.remote_description_set = true;
                    std::mem::take(&mut peer.pending_candidates)
                }
                None => return,
            }
        };
        for candidate in &pending {
            apply_candidate(pc, candidate).await;
        }
    }

    pub async fn close_peer(&self, remote_id: &str) {
        let removed = self.peers.lock().await.remove(remote_id);
        if let Some(peer) = removed {
            if let Err(e) = peer.pc.close().await {
                debug!(remote_id, "Mesh close failed: {e}");
            }
            info!(remote_id, "Mesh connection closed");
        }
    }

    pub async fn close_all(&self) {
        let peers: Vec<String> = self.peers.lock().await.keys().cloned().collect();
        for remote_id in peers {
            self.close_peer(&remote_id).await;
        }
    }
}

async fn apply_candidate(pc: &RTCPeerConnection, candidate: &CandidateInit) {
    let result = pc
        .add_ice_candidate(RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        })
        .await;
    if let Err(e) = result {
        warn!("Failed to add mesh ICE candidate: {e}");
    }
}
