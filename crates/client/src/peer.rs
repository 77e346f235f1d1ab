use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use audiopus::coder::{Decoder as OpusDecoder, Encoder as OpusEncoder};
use audiopus::{Application, Channels, SampleRate};
use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use squawk_protocol::{FRAME_DURATION_MS, IceServerInfo, force_opus_mono, frame_samples};

use crate::audio::{MicCapture, SpeakerOutput};

/// Bounded wait for ICE gathering before an offer or answer is sent;
/// the server side embeds candidates rather than trickling.
const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(10);

/// Worst-case decoded Opus frame (120 ms at 48 kHz).
const MAX_DECODED_SAMPLES: usize = 5760;

fn opus_sample_rate(rate: u32) -> anyhow::Result<SampleRate> {
    Ok(match rate {
        48000 => SampleRate::Hz48000,
        24000 => SampleRate::Hz24000,
        16000 => SampleRate::Hz16000,
        12000 => SampleRate::Hz12000,
        8000 => SampleRate::Hz8000,
        _ => anyhow::bail!("Unsupported sample rate for Opus: {rate}"),
    })
}

/// Create a peer connection with an Opus-only media engine, for both the
/// server session and mesh peers.
pub async fn create_peer(ice_servers: &[IceServerInfo]) -> anyhow::Result<Arc<RTCPeerConnection>> {
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

    let rtc_ice_servers = ice_servers
        .iter()
        .map(|s| webrtc::ice_transport::ice_server::RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone().unwrap_or_default(),
            credential: s.credential.clone().unwrap_or_default(),
        })
        .collect();

    let config = RTCConfiguration {
        ice_servers: rtc_ice_servers,
        ..Default::default()
    };
    Ok(Arc::new(api.new_peer_connection(config).await?))
}

/// The shared outbound microphone track. One track, added to the server
/// peer connection and every mesh peer; `write_sample` fans out to all
/// bindings.
pub fn new_mic_track() -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        "audio".to_string(),
        "squawk-client".to_string(),
    ))
}

/// Add the mic track to a peer connection.
pub async fn add_mic_track(
    pc: &RTCPeerConnection,
    track: &Arc<TrackLocalStaticSample>,
) -> anyhow::Result<()> {
    pc.add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .context("Failed to add mic track")?;
    Ok(())
}

async fn wait_ice_gathering(pc: &RTCPeerConnection) {
    let mut gather_complete = pc.gathering_complete_promise().await;
    if tokio::time::timeout(ICE_GATHER_TIMEOUT, gather_complete.recv())
        .await
        .is_err()
    {
        warn!("ICE gathering timed out, proceeding with partial candidates");
    }
}

/// Produce a mono-forced offer with gathering complete, ready to send.
pub async fn create_mono_offer(pc: &RTCPeerConnection) -> anyhow::Result<String> {
    let offer = pc.create_offer(None).await.context("Failed to create offer")?;
    let mono = RTCSessionDescription::offer(force_opus_mono(&offer.sdp))
        .context("Failed to build mono offer")?;
    pc.set_local_description(mono)
        .await
        .context("Failed to set local description")?;
    wait_ice_gathering(pc).await;
    Ok(pc
        .local_description()
        .await
        .context("No local description")?
        .sdp)
}

/// Produce a mono-forced answer with gathering complete, ready to send.
pub async fn create_mono_answer(pc: &RTCPeerConnection) -> anyhow::Result<String> {
    let answer = pc
        .create_answer(None)
        .await
        .context("Failed to create answer")?;
    let mono = RTCSessionDescription::answer(force_opus_mono(&answer.sdp))
        .context("Failed to build mono answer")?;
    pc.set_local_description(mono)
        .await
        .context("Failed to set local description")?;
    wait_ice_gathering(pc).await;
    Ok(pc
        .local_description()
        .await
        .context("No local description")?
        .sdp)
}

/// Pump microphone frames into the shared track: encode each 20 ms frame
/// (silence while muted, handled by the mic thread) and write it with a
/// contiguous timeline.
pub fn spawn_mic_pump(
    mut mic: MicCapture,
    track: Arc<TrackLocalStaticSample>,
    sample_rate: u32,
) -> anyhow::Result<JoinHandle<()>> {
    let mut encoder = OpusEncoder::new(
        opus_sample_rate(sample_rate)?,
        Channels::Mono,
        Application::LowDelay,
    )
    .map_err(|e| anyhow::anyhow!("Failed to create Opus encoder: {e:?}"))?;

    let samples = frame_samples(sample_rate);
    let frame_duration = Duration::from_millis(FRAME_DURATION_MS);

    Ok(tokio::spawn(async move {
        let mut opus_buf = vec![0u8; 4000];
        while let Some(frame) = mic.recv().await {
            if frame.len() != samples {
                continue;
            }
            let encoded_len = match encoder.encode(&frame[..], &mut opus_buf[..]) {
                Ok(n) => n,
                Err(e) => {
                    warn!("Opus encode failed: {e:?}");
                    continue;
                }
            };
            let sample = Sample {
                data: Bytes::copy_from_slice(&opus_buf[..encoded_len]),
                duration: frame_duration,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                debug!("Mic sample write failed: {e}");
            }
        }
        info!("Mic pump stopped");
    }))
}

/// Decode a received audio track to the speaker until the track ends.
pub fn spawn_track_player(
    label: String,
    track: Arc<TrackRemote>,
    speaker: SpeakerOutput,
    sample_rate: u32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut decoder = match opus_sample_rate(sample_rate)
            .and_then(|rate| {
                OpusDecoder::new(rate, Channels::Mono)
                    .map_err(|e| anyhow::anyhow!("Failed to create Opus decoder: {e:?}"))
            }) {
            Ok(decoder) => decoder,
            Err(e) => {
                warn!(label, "{e:#}");
                return;
            }
        };

        info!(label, "Audio receive loop started");
        let mut pcm = vec![0i16; MAX_DECODED_SAMPLES];
        loop {
            let (packet, _) = match track.read_rtp().await {
                Ok(read) => read,
                Err(e) => {
                    debug!(label, "Track ended: {e}");
                    break;
                }
            };
            if packet.payload.is_empty() {
                continue;
            }
            match decoder.decode(Some(&packet.payload[..]), &mut pcm[..], false) {
                Ok(decoded) => speaker.play(pcm[..decoded].to_vec()),
                Err(e) => debug!(label, "Opus decode failed: {e:?}"),
            }
        }
        info!(label, "Audio receive loop ended");
    })
}
