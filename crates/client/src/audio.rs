use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use libpulse_binding as pulse;
use libpulse_simple_binding::Simple;
use tokio::sync::mpsc;
use tracing::{info, warn};

use squawk_protocol::frame_samples;

/// Frames queued between a device thread and the async side; drop on
/// overflow keeps latency bounded.
const AUDIO_QUEUE_DEPTH: usize = 100;

/// Transmit switch shared with the microphone thread. While off, the mic
/// keeps its cadence but substitutes silence, so the outbound track never
/// starves.
#[derive(Clone)]
pub struct MicSwitch(Arc<AtomicBool>);

impl MicSwitch {
    pub fn set(&self, enabled: bool) {
        if self.0.swap(enabled, Ordering::Relaxed) != enabled {
            info!("Microphone {}", if enabled { "enabled" } else { "muted" });
        }
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Microphone capture: one PulseAudio record stream on a dedicated thread,
/// delivering 20 ms S16LE mono frames. Starts muted.
pub struct MicCapture {
    rx: mpsc::Receiver<Vec<i16>>,
    stop: Arc<AtomicBool>,
}

impl MicCapture {
    pub fn start(
        source: Option<String>,
        sample_rate: u32,
    ) -> anyhow::Result<(Self, MicSwitch)> {
        let spec = pulse::sample::Spec {
            format: pulse::sample::Format::S16le,
            channels: 1,
            rate: sample_rate,
        };
        let samples = frame_samples(sample_rate);
        let frame_bytes = samples * 2;
        let buf_attr = pulse::def::BufferAttr {
            maxlength: u32::MAX,
            tlength: u32::MAX,
            prebuf: u32::MAX,
            minreq: u32::MAX,
            fragsize: frame_bytes as u32,
        };

        let (tx, rx) = mpsc::channel(AUDIO_QUEUE_DEPTH);
        let enabled = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let thread_enabled = Arc::clone(&enabled);
        let thread_stop = Arc::clone(&stop);
        std::thread::Builder::new()
            .name("mic".to_string())
            .spawn(move || {
                let simple = match Simple::new(
                    None,
                    "squawk-client",
                    pulse::stream::Direction::Record,
                    source.as_deref(),
                    "mic-capture",
                    &spec,
                    None,
                    Some(&buf_attr),
                ) {
                    Ok(s) => {
                        let _ = ready_tx.send(Ok(()));
                        s
                    }
                    Err(e) => {
                        let _ = ready_tx
                            .send(Err(anyhow::anyhow!("PulseAudio mic open failed: {e}")));
                        return;
                    }
                };
                info!(sample_rate, "Microphone stream started");

                let mut pcm = vec![0u8; frame_bytes];
                while !thread_stop.load(Ordering::Relaxed) {
                    if let Err(e) = simple.read(&mut pcm) {
                        warn!("Microphone read failed: {e}");
                        break;
                    }
                    let frame = if thread_enabled.load(Ordering::Relaxed) {
                        pcm.chunks_exact(2)
                            .map(|c| i16::from_le_bytes([c[0], c[1]]))
                            .collect()
                    } else {
                        vec![0i16; samples]
                    };
                    // Overflow means the async side is behind; drop and move on
                    let _ = tx.try_send(frame);
                }
                info!("Microphone stream stopped");
            })
            .context("Failed to spawn mic thread")?;

        ready_rx
            .recv()
            .context("Mic thread exited before reporting readiness")??;

        Ok((Self { rx, stop }, MicSwitch(enabled)))
    }

    pub async fn recv(&mut self) -> Option<Vec<i16>> {
        self.rx.recv().await
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Speaker playback: one PulseAudio playback stream on a dedicated thread.
/// Cloneable so every receive loop (server audio plus each mesh peer) can
/// queue into the same device.
#[derive(Clone)]
pub struct SpeakerOutput {
    tx: mpsc::Sender<Vec<i16>>,
}

impl SpeakerOutput {
    pub fn start(sink: Option<String>, sample_rate: u32) -> anyhow::Result<Self> {
        let spec = pulse::sample::Spec {
            format: pulse::sample::Format::S16le,
            channels: 1,
            rate: sample_rate,
        };

        let (tx, mut rx) = mpsc::channel::<Vec<i16>>(AUDIO_QUEUE_DEPTH);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        std::thread::Builder::new()
            .name("speaker".to_string())
            .spawn(move || {
                let simple = match Simple::new(
                    None,
                    "squawk-client",
                    pulse::stream::Direction::Playback,
                    sink.as_deref(),
                    "speaker-output",
                    &spec,
                    None,
                    None,
                ) {
                    Ok(s) => {
                        let _ = ready_tx.send(Ok(()));
                        s
                    }
                    Err(e) => {
                        let _ = ready_tx
                            .send(Err(anyhow::anyhow!("PulseAudio speaker open failed: {e}")));
                        return;
                    }
                };
                info!(sample_rate, "Speaker stream started");

                while let Some(samples) = rx.blocking_recv() {
                    let mut bytes = Vec::with_capacity(samples.len() * 2);
                    for sample in &samples {
                        bytes.extend_from_slice(&sample.to_le_bytes());
                    }
                    if let Err(e) = simple.write(&bytes) {
                        warn!("Speaker write failed: {e}");
                        break;
                    }
                }
                info!("Speaker stream stopped");
            })
            .context("Failed to spawn speaker thread")?;

        ready_rx
            .recv()
            .context("Speaker thread exited before reporting readiness")??;

        Ok(Self { tx })
    }

    /// Queue decoded samples for playback; drops when the device is behind.
    pub fn play(&self, samples: Vec<i16>) {
        let _ = self.tx.try_send(samples);
    }
}
