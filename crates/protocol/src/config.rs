use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::messages::IceServerInfo;

/// Server configuration, sourced from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Capture sample rate in Hz
    pub sample_rate: u32,
    /// PulseAudio source name for the local capture device (default source
    /// when unset)
    pub capture_source: Option<String>,
    /// Maximum transmit time in seconds before the floor is revoked
    pub ptt_timeout_secs: f64,
    /// STUN server url
    pub stun_server: String,
    /// Optional TURN server url
    pub turn_server: Option<String>,
    pub turn_username: Option<String>,
    pub turn_password: Option<String>,
    /// Directory the recording pipeline drops `.wav`/`.srt` pairs into
    pub recordings_dir: PathBuf,
    /// Static files for the browser client
    pub web_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            sample_rate: 48000,
            capture_source: None,
            ptt_timeout_secs: 30.0,
            stun_server: "stun:stun.l.google.com:19302".to_string(),
            turn_server: None,
            turn_username: None,
            turn_password: None,
            recordings_dir: PathBuf::from("./recordings"),
            web_root: PathBuf::from("./web"),
        }
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

impl Config {
    /// Load configuration from the environment, falling back to defaults
    /// for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env_nonempty("SQUAWK_HOST").unwrap_or(defaults.host),
            port: env_nonempty("SQUAWK_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            sample_rate: env_nonempty("SQUAWK_SAMPLE_RATE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.sample_rate),
            capture_source: env_nonempty("SQUAWK_CAPTURE_SOURCE"),
            ptt_timeout_secs: env_nonempty("PTT_TIMEOUT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.ptt_timeout_secs),
            stun_server: env_nonempty("STUN_SERVER").unwrap_or(defaults.stun_server),
            turn_server: env_nonempty("TURN_SERVER"),
            turn_username: env_nonempty("TURN_USERNAME"),
            turn_password: env_nonempty("TURN_PASSWORD"),
            recordings_dir: env_nonempty("RECORDINGS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.recordings_dir),
            web_root: env_nonempty("SQUAWK_WEB_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.web_root),
        }
    }

    pub fn ptt_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.ptt_timeout_secs)
    }

    /// ICE server list handed to clients in the `config` handshake and used
    /// for the server's own peer connections.
    pub fn ice_servers(&self) -> Vec<IceServerInfo> {
        let mut servers = vec![IceServerInfo {
            urls: vec![self.stun_server.clone()],
            username: None,
            credential: None,
        }];
        if let Some(turn) = &self.turn_server {
            servers.push(IceServerInfo {
                urls: vec![turn.clone()],
                username: self.turn_username.clone(),
                credential: self.turn_password.clone(),
            });
        }
        servers
    }

    /// Validate configuration semantics, returning all issues found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.port == 0 {
            issues.push("ERROR: SQUAWK_PORT must be non-zero".to_string());
        }
        // Opus only accepts a fixed set of rates
        if ![8000, 12000, 16000, 24000, 48000].contains(&self.sample_rate) {
            issues.push(format!(
                "ERROR: SQUAWK_SAMPLE_RATE {} is not a valid Opus rate (8000/12000/16000/24000/48000)",
                self.sample_rate
            ));
        }
        if !(self.ptt_timeout_secs.is_finite() && self.ptt_timeout_secs > 0.0) {
            issues.push("ERROR: PTT_TIMEOUT must be a positive number of seconds".to_string());
        }
        if self.turn_server.is_some()
            && (self.turn_username.is_none() || self.turn_password.is_none())
        {
            issues.push(
                "WARNING: TURN_SERVER is set without TURN_USERNAME/TURN_PASSWORD; \
                 most TURN deployments require long-term credentials"
                    .to_string(),
            );
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_service_contract() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.ptt_timeout_secs, 30.0);
        assert!(config.turn_server.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn ice_servers_stun_only_by_default() {
        let servers = Config::default().ice_servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, vec!["stun:stun.l.google.com:19302"]);
        assert!(servers[0].username.is_none());
    }

    #[test]
    fn ice_servers_include_turn_when_configured() {
        let config = Config {
            turn_server: Some("turn:turn.example.net:3478".into()),
            turn_username: Some("user".into()),
            turn_password: Some("pass".into()),
            ..Config::default()
        };
        let servers = config.ice_servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].urls, vec!["turn:turn.example.net:3478"]);
        assert_eq!(servers[1].username.as_deref(), Some("user"));
    }

    #[test]
    fn validate_flags_bad_sample_rate_and_port() {
        let config = Config {
            port: 0,
            sample_rate: 44100,
            ..Config::default()
        };
        let issues = config.validate().unwrap_err();
        assert_eq!(issues.iter().filter(|i| i.starts_with("ERROR:")).count(), 2);
    }

    #[test]
    fn validate_warns_on_credentialless_turn() {
        let config = Config {
            turn_server: Some("turn:turn.example.net:3478".into()),
            ..Config::default()
        };
        let issues = config.validate().unwrap_err();
        assert!(issues[0].starts_with("WARNING:"));
    }
}
