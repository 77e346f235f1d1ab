use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use audiopus::coder::Encoder as OpusEncoder;
use audiopus::{Application, Bitrate, Channels, SampleRate};
use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use squawk_protocol::FRAME_DURATION_MS;

use crate::capture::{CaptureFrame, CaptureHub};

/// Opus target bitrate for mono voice.
const OPUS_BITRATE: i32 = 64_000;

/// Max encoded Opus frame size
const OPUS_BUF_SIZE: usize = 4000;

pub(crate) fn opus_sample_rate(rate: u32) -> anyhow::Result<SampleRate> {
    Ok(match rate {
        48000 => SampleRate::Hz48000,
        24000 => SampleRate::Hz24000,
        16000 => SampleRate::Hz16000,
        12000 => SampleRate::Hz12000,
        8000 => SampleRate::Hz8000,
        _ => anyhow::bail!("Unsupported sample rate for Opus: {rate}"),
    })
}

/// Per-session adapter binding the shared capture to one outbound track.
///
/// Each sender has its own capture subscription and Opus encoder; the track
/// is attached to the peer connection before the local description is
/// generated. Presentation time advances by exactly one frame per write:
/// when the capture queue starves, a silence frame is substituted so the
/// timeline stays contiguous.
pub struct MediaSender {
    task: JoinHandle<()>,
}

impl MediaSender {
    /// Create the outbound Opus track on `pc` and start the encode loop.
    pub async fn attach(pc: &RTCPeerConnection, hub: &Arc<CaptureHub>) -> anyhow::Result<Self> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_string(),
            "squawk".to_string(),
        ));
        pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("Failed to add audio track")?;

        let mut encoder = OpusEncoder::new(
            opus_sample_rate(hub.sample_rate())?,
            Channels::Mono,
            Application::LowDelay,
        )
        .map_err(|e| anyhow::anyhow!("Failed to create Opus encoder: {e:?}"))?;
        encoder
            .set_bitrate(Bitrate::BitsPerSecond(OPUS_BITRATE))
            .map_err(|e| anyhow::anyhow!("Failed to set Opus bitrate: {e:?}"))?;

        let mut subscription = hub.subscribe();
        let frame_samples = hub.frame_samples();
        let frame_duration = Duration::from_millis(FRAME_DURATION_MS);
        // A starved subscriber substitutes silence after 2x frame duration
        let recv_timeout = frame_duration * 2;

        let task = tokio::spawn(async move {
            let silence: CaptureFrame = Arc::new(vec![0i16; frame_samples]);
            let mut opus_buf = vec![0u8; OPUS_BUF_SIZE];
            let mut pts: u64 = 0;

            loop {
                let frame = match tokio::time::timeout(recv_timeout, subscription.recv()).await {
                    Ok(Some(frame)) => frame,
                    // Hub gone: capture source stopped, nothing more to send
                    Ok(None) => break,
                    Err(_) => Arc::clone(&silence),
                };
                if frame.len() != frame_samples {
                    warn!(got = frame.len(), want = frame_samples, "Skipping odd-sized frame");
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
                    // Not bound yet, or the peer connection is closing
                    debug!("Audio sample write failed: {e}");
                }

                pts += frame_samples as u64;
                if pts.is_multiple_of(frame_samples as u64 * 500) {
                    trace!(pts, lost = subscription.lost_frames(), "Audio sender progress");
                }
            }
        });

        Ok(Self { task })
    }

    /// Stop the encode loop and detach from the capture source. Safe to call
    /// exactly once per sender; the session guarantees that.
    pub fn stop(self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opus_rate_mapping_covers_valid_rates() {
        for rate in [8000u32, 12000, 16000, 24000, 48000] {
            assert!(opus_sample_rate(rate).is_ok());
        }
        assert!(opus_sample_rate(44100).is_err());
    }
}
