use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Current holder of the floor.
#[derive(Debug, Clone)]
pub struct FloorOwner {
    pub client_id: String,
    pub display_name: String,
    pub since: Instant,
}

/// Outcome of a floor request.
#[derive(Debug, Clone)]
pub enum FloorDecision {
    Granted,
    Denied {
        speaker: String,
        speaker_name: String,
    },
}

/// Outcome of a floor release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    NoOp,
}

/// Global single-speaker lock.
///
/// All operations are serialized by one mutex; critical sections are a few
/// loads and stores, so callers may invoke these from async context without
/// a suspension point. At most one owner exists at any instant, and `tick`
/// enforces the maximum transmit time.
pub struct FloorArbiter {
    state: Mutex<Option<FloorOwner>>,
    max_transmit: Duration,
}

impl FloorArbiter {
    pub fn new(max_transmit: Duration) -> Self {
        Self {
            state: Mutex::new(None),
            max_transmit,
        }
    }

    /// Request the floor. First-come-first-served: granted only when idle.
    pub fn request(&self, client_id: &str, display_name: &str, now: Instant) -> FloorDecision {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &*state {
            None => {
                *state = Some(FloorOwner {
                    client_id: client_id.to_string(),
                    display_name: display_name.to_string(),
                    since: now,
                });
                tracing::info!(client_id, "Floor granted");
                FloorDecision::Granted
            }
            Some(owner) => FloorDecision::Denied {
                speaker: owner.client_id.clone(),
                speaker_name: owner.display_name.clone(),
            },
        }
    }

    /// Release the floor. A release by anyone but the owner is a no-op.
    pub fn release(&self, client_id: &str) -> ReleaseOutcome {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &*state {
            Some(owner) if owner.client_id == client_id => {
                *state = None;
                tracing::info!(client_id, "Floor released");
                ReleaseOutcome::Released
            }
            _ => ReleaseOutcome::NoOp,
        }
    }

    /// Revoke the floor if the owner has exceeded the maximum transmit time.
    /// Called at 1 Hz; returns the revoked owner for broadcast.
    pub fn tick(&self, now: Instant) -> Option<FloorOwner> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &*state {
            Some(owner) if now.duration_since(owner.since) > self.max_transmit => {
                let revoked = state.take();
                if let Some(ref owner) = revoked {
                    tracing::info!(
                        client_id = %owner.client_id,
                        held_secs = now.duration_since(owner.since).as_secs(),
                        "Floor revoked after transmit timeout"
                    );
                }
                revoked
            }
            _ => None,
        }
    }

    /// Immutable copy of the current floor state.
    pub fn snapshot(&self) -> Option<FloorOwner> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
