use clap::Args;
use std::time::Duration;

use crate::reconcile::ReconcileSettings;

pub const DEFAULT_SERVER_URL: &str = "ws://localhost:3001/ws";

#[derive(Debug, Clone, Args)]
pub struct ClientConfig {
    /// WebSocket endpoint of the sync server
    #[arg(long, env = "SYNCSTREAM_SERVER_URL", default_value = DEFAULT_SERVER_URL)]
    pub server_url: String,

    /// Name shown to other participants
    #[arg(long, env = "SYNCSTREAM_NAME")]
    pub display_name: Option<String>,

    /// Drift beyond this many milliseconds is reported as out of sync
    #[arg(long, env = "SYNCSTREAM_DRIFT_THRESHOLD_MS", default_value_t = 2000)]
    pub drift_threshold_ms: u64,

    /// Seconds between drift checks
    #[arg(long, env = "SYNCSTREAM_DRIFT_INTERVAL_SECS", default_value_t = 5)]
    pub drift_interval_secs: u64,

    /// Seconds to wait for a server acknowledgment
    #[arg(long, env = "SYNCSTREAM_REQUEST_TIMEOUT_SECS", default_value_t = 8)]
    pub request_timeout_secs: u64,

    /// Echo suppression after applying a remote event
    #[arg(long, env = "SYNCSTREAM_REMOTE_WINDOW_MS", default_value_t = 1000)]
    pub remote_window_ms: u64,

    /// Echo suppression after the initial late-join sync
    #[arg(long, env = "SYNCSTREAM_INITIAL_WINDOW_MS", default_value_t = 2000)]
    pub initial_window_ms: u64,

    /// The server lets every participant control playback
    #[arg(long, env = "SYNCSTREAM_EVERYONE_CONTROLS")]
    pub everyone_controls: bool,

    /// Pretend the runtime allows autoplay without a user gesture
    #[arg(long)]
    pub autoplay: bool,
}

impl ClientConfig {
    pub fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            drift_threshold_ms: self.drift_threshold_ms as f64,
            remote_window_ms: self.remote_window_ms as i64,
            initial_window_ms: self.initial_window_ms as i64,
        }
    }

    pub fn drift_interval(&self) -> Duration {
        Duration::from_secs(self.drift_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        config: ClientConfig,
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Harness::parse_from(["syncstream-client"]).config;
        assert_eq!(config.server_url, DEFAULT_SERVER_URL);
        assert_eq!(config.drift_interval(), Duration::from_secs(5));
        assert_eq!(config.request_timeout(), Duration::from_secs(8));
        assert_eq!(config.reconcile_settings(), ReconcileSettings::default());
        assert!(!config.everyone_controls);
    }

    #[test]
    fn flags_override_defaults() {
        let config = Harness::parse_from([
            "syncstream-client",
            "--drift-threshold-ms",
            "500",
            "--everyone-controls",
            "--display-name",
            "Ana",
        ])
        .config;
        assert_eq!(config.reconcile_settings().drift_threshold_ms, 500.0);
        assert!(config.everyone_controls);
        assert_eq!(config.display_name.as_deref(), Some("Ana"));
    }
}
