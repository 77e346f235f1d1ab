use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};

use squawk_protocol::{CandidateInit, IceServerInfo, force_opus_mono};

/// Bounded wait for local ICE gathering before the answer is sent.
pub const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(10);

/// Create a server-side peer connection.
///
/// Registers ONLY Opus. The service is audio-only and mono; letting the
/// default codec set through would invite browsers to negotiate payloads we
/// never send.
pub async fn create_peer_connection(
    ice_servers: &[IceServerInfo],
) -> anyhow::Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let rtc_ice_servers: Vec<RTCIceServer> = ice_servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone().unwrap_or_default(),
            credential: s.credential.clone().unwrap_or_default(),
        })
        .collect();

    let config = RTCConfiguration {
        ice_servers: rtc_ice_servers,
        ..Default::default()
    };

    let pc = Arc::new(api.new_peer_connection(config).await?);
    info!("Peer connection created");
    Ok(pc)
}

/// Terminate a client offer: set it as the remote description and produce a
/// mono-forced answer.
///
/// The answer is non-trickle: local ICE gathering is awaited (bounded by
/// [`ICE_GATHER_TIMEOUT`]) so the SDP embeds every server candidate. The
/// caller must attach the media sender BEFORE calling this, so the track is
/// part of the local description.
pub async fn answer_offer(pc: &RTCPeerConnection, offer_sdp: &str) -> anyhow::Result<String> {
    let offer =
        RTCSessionDescription::offer(offer_sdp.to_string()).context("Failed to parse SDP offer")?;
    pc.set_remote_description(offer)
        .await
        .context("Failed to set remote description")?;

    let answer = pc
        .create_answer(None)
        .await
        .context("Failed to create answer")?;

    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(answer)
        .await
        .context("Failed to set local description")?;

    if tokio::time::timeout(ICE_GATHER_TIMEOUT, gather_complete.recv())
        .await
        .is_err()
    {
        warn!("ICE gathering timed out, answering with partial candidates");
    }

    let local = pc
        .local_description()
        .await
        .context("No local description after answer")?;
    Ok(force_opus_mono(&local.sdp))
}

/// Validate and apply a client ICE candidate.
///
/// Validation is strict (attribute form, 8+ tokens, `typ` keyword) so a
/// malformed candidate is rejected here and logged by the caller instead of
/// surfacing an error to the peer.
pub async fn add_remote_candidate(
    pc: &RTCPeerConnection,
    init: &CandidateInit,
) -> anyhow::Result<()> {
    squawk_protocol::parse_candidate(&init.candidate)
        .map_err(|e| anyhow::anyhow!("Invalid ICE candidate: {e}"))?;

    pc.add_ice_candidate(RTCIceCandidateInit {
        candidate: init.candidate.clone(),
        sdp_mid: init.sdp_mid.clone(),
        sdp_mline_index: init.sdp_mline_index,
        ..Default::default()
    })
    .await
    .context("Failed to add ICE candidate")?;
    Ok(())
}
