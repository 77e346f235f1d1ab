pub mod config;
pub mod messages;
pub mod sdp;

pub use config::*;
pub use messages::*;
pub use sdp::*;

/// Audio frame cadence shared by the capture source, the media senders and
/// the headless client. One frame is 20 ms of S16LE mono PCM.
pub const FRAME_DURATION_MS: u64 = 20;

/// Channel count is fixed: the whole pipeline is mono end to end.
pub const CHANNELS: u16 = 1;

/// Samples in one 20 ms frame at the given rate (960 at 48 kHz).
pub const fn frame_samples(sample_rate: u32) -> usize {
    (sample_rate as u64 * FRAME_DURATION_MS / 1000) as usize
}

/// Floor owner id used when the server's own capture source holds the floor.
pub const LOCAL_CAPTURE_ID: &str = "local-capture";

/// Generate a fresh 8-character client identifier.
///
/// Identity is ephemeral: ids are unique per process lifetime and are not
/// reused across reconnects.
pub fn new_client_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Default display name derived from a client id.
pub fn default_display_name(client_id: &str) -> String {
    let prefix = &client_id[..client_id.len().min(4)];
    format!("Client-{prefix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_samples_at_48k() {
        assert_eq!(frame_samples(48000), 960);
    }

    #[test]
    fn frame_samples_at_16k() {
        assert_eq!(frame_samples(16000), 320);
    }

    #[test]
    fn client_ids_are_short_and_unique() {
        let a = new_client_id();
        let b = new_client_id();
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn display_name_uses_id_prefix() {
        assert_eq!(default_display_name("a1b2c3d4"), "Client-a1b2");
        assert_eq!(default_display_name("ab"), "Client-ab");
    }
}
