use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::Context;
use libpulse_binding as pulse;
use libpulse_simple_binding::Simple;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use squawk_protocol::frame_samples;

/// One 20 ms block of S16LE mono PCM. Immutable once published; subscribers
/// share the allocation.
pub type CaptureFrame = Arc<Vec<i16>>;

/// Per-subscriber queue depth: 100 frames = 2 s of audio.
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 100;

struct Slot {
    tx: mpsc::Sender<CaptureFrame>,
    lost: Arc<AtomicU64>,
}

/// Fan-out hub between the capture device thread and the per-session media
/// senders (plus any observer sinks).
///
/// The hub is separate from the device so the publish path can be exercised
/// without audio hardware. The subscriber set is guarded by its own mutex,
/// held only long enough to enumerate the queues.
pub struct CaptureHub {
    subscribers: Mutex<HashMap<u64, Slot>>,
    next_id: AtomicU64,
    sample_rate: u32,
    frame_samples: usize,
}

impl CaptureHub {
    pub fn new(sample_rate: u32) -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            sample_rate,
            frame_samples: frame_samples(sample_rate),
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Attach a subscriber. Dropping the returned handle detaches it.
    pub fn subscribe(self: &Arc<Self>) -> CaptureSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let lost = Arc::new(AtomicU64::new(0));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id,
                Slot {
                    tx,
                    lost: Arc::clone(&lost),
                },
            );
        debug!(subscriber = id, "Capture subscriber attached");
        CaptureSubscription {
            id,
            rx,
            lost,
            hub: Arc::downgrade(self),
        }
    }

    fn unsubscribe(&self, id: u64) {
        let removed = self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        if removed.is_some() {
            debug!(subscriber = id, "Capture subscriber detached");
        }
    }

    /// Publish one frame to every subscriber.
    ///
    /// Never blocks: a subscriber whose queue is full loses this frame and
    /// has its loss counter incremented; other subscribers are unaffected.
    /// Callable from the device thread (no async context required).
    pub fn publish(&self, frame: CaptureFrame) {
        let slots: Vec<(mpsc::Sender<CaptureFrame>, Arc<AtomicU64>)> = {
            let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            subscribers
                .values()
                .map(|s| (s.tx.clone(), Arc::clone(&s.lost)))
                .collect()
        };
        for (tx, lost) in slots {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(Arc::clone(&frame)) {
                lost.fetch_add(1, Ordering::Relaxed);
            }
            // Closed receivers are cleaned up by the subscription's Drop
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// Handle returned by [`CaptureHub::subscribe`]. Receives frames in order;
/// detaches from the hub on drop.
pub struct CaptureSubscription {
    id: u64,
    rx: mpsc::Receiver<CaptureFrame>,
    lost: Arc<AtomicU64>,
    hub: Weak<CaptureHub>,
}

impl CaptureSubscription {
    pub async fn recv(&mut self) -> Option<CaptureFrame> {
        self.rx.recv().await
    }

    /// Frames this subscriber has lost to backpressure.
    pub fn lost_frames(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }
}

impl Drop for CaptureSubscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
    }
}

/// The process-wide capture device: one PulseAudio record stream on a
/// dedicated thread, publishing 20 ms frames into a [`CaptureHub`].
///
/// Runs for process lifetime; there is no teardown on transient
/// zero-subscriber states.
pub struct CaptureSource {
    hub: Arc<CaptureHub>,
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CaptureSource {
    /// Open the named PulseAudio source (default source when `None`) and
    /// start the capture thread.
    pub fn start(source_name: Option<String>, sample_rate: u32) -> anyhow::Result<Self> {
        let hub = CaptureHub::new(sample_rate);
        let stop = Arc::new(AtomicBool::new(false));

        let spec = pulse::sample::Spec {
            format: pulse::sample::Format::S16le,
            channels: 1,
            rate: sample_rate,
        };
        let samples = hub.frame_samples();
        let frame_bytes = samples * 2;

        // fragsize = one frame so reads wake at 20 ms cadence
        let buf_attr = pulse::def::BufferAttr {
            maxlength: u32::MAX,
            tlength: u32::MAX,
            prebuf: u32::MAX,
            minreq: u32::MAX,
            fragsize: frame_bytes as u32,
        };

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let thread_hub = Arc::clone(&hub);
        let thread_stop = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                let simple = match Simple::new(
                    None,
                    "squawk-server",
                    pulse::stream::Direction::Record,
                    source_name.as_deref(),
                    "ptt-capture",
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
                            .send(Err(anyhow::anyhow!("PulseAudio connection failed: {e}")));
                        return;
                    }
                };

                info!(sample_rate, frame_bytes, "Capture stream started");

                let mut pcm = vec![0u8; frame_bytes];
                while !thread_stop.load(Ordering::Relaxed) {
                    if let Err(e) = simple.read(&mut pcm) {
                        warn!("PulseAudio read failed: {e}");
                        break;
                    }
                    let mut frame = Vec::with_capacity(samples);
                    for chunk in pcm.chunks_exact(2) {
                        frame.push(i16::from_le_bytes([chunk[0], chunk[1]]));
                    }
                    thread_hub.publish(Arc::new(frame));
                }

                info!("Capture stream stopped");
            })
            .context("Failed to spawn capture thread")?;

        ready_rx
            .recv()
            .context("Capture thread exited before reporting readiness")??;

        Ok(Self {
            hub,
            stop,
            thread: Some(thread),
        })
    }

    pub fn hub(&self) -> Arc<CaptureHub> {
        Arc::clone(&self.hub)
    }

    /// Stop the capture thread and wait for it to exit.
    pub fn stop(mut self) {
        info!(
            subscribers = self.hub.subscriber_count(),
            "Stopping capture source"
        );
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(hub: &CaptureHub, value: i16) -> CaptureFrame {
        Arc::new(vec![value; hub.frame_samples()])
    }

    #[tokio::test]
    async fn fanout_delivers_each_frame_to_every_subscriber() {
        let hub = CaptureHub::new(48000);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        hub.publish(frame(&hub, 1));
        hub.publish(frame(&hub, 2));

        assert_eq!(a.recv().await.unwrap()[0], 1);
        assert_eq!(a.recv().await.unwrap()[0], 2);
        assert_eq!(b.recv().await.unwrap()[0], 1);
        assert_eq!(b.recv().await.unwrap()[0], 2);
        assert_eq!(a.lost_frames(), 0);
        assert_eq!(b.lost_frames(), 0);
    }

    #[tokio::test]
    async fn overflow_drops_newest_and_counts_per_subscriber() {
        let hub = CaptureHub::new(48000);
        let mut blocked = hub.subscribe();
        let mut draining = hub.subscribe();

        for i in 0..(SUBSCRIBER_QUEUE_DEPTH + 5) {
            hub.publish(frame(&hub, i as i16));
            // Keep the healthy subscriber drained so only the blocked one overflows
            draining.recv().await.unwrap();
        }

        assert_eq!(blocked.lost_frames(), 5);
        assert_eq!(draining.lost_frames(), 0);

        // The blocked queue holds the oldest frames; the newest were dropped
        assert_eq!(blocked.recv().await.unwrap()[0], 0);
    }

    #[tokio::test]
    async fn drop_detaches_subscriber() {
        let hub = CaptureHub::new(48000);
        let a = hub.subscribe();
        let _b = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        drop(a);
        assert_eq!(hub.subscriber_count(), 1);

        // Publishing past a departed subscriber must not panic or miscount
        hub.publish(frame(&hub, 7));
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn frame_geometry_follows_sample_rate() {
        let hub = CaptureHub::new(16000);
        assert_eq!(hub.sample_rate(), 16000);
        assert_eq!(hub.frame_samples(), 320);
    }
}
