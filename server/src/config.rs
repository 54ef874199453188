use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::room::AuthorityPolicy;

const DEFAULT_PORT: u16 = 3001;
const DEFAULT_MAX_PARTICIPANTS: usize = 20;
const DEFAULT_ROOM_TIMEOUT_SECS: u64 = 30 * 60;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;
const DEFAULT_RATE_LIMIT_MAX_CREATIONS: u32 = 10;

/// Runtime settings, read from the process environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_participants: usize,
    pub room_timeout: Duration,
    pub sweep_interval: Duration,
    pub rate_limit_window: Duration,
    pub rate_limit_max_creations: u32,
    pub authority_policy: AuthorityPolicy,
    /// Extra origin allowed by CORS besides localhost dev servers
    pub client_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_participants: DEFAULT_MAX_PARTICIPANTS,
            room_timeout: Duration::from_secs(DEFAULT_ROOM_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            rate_limit_window: Duration::from_secs(DEFAULT_RATE_LIMIT_WINDOW_SECS),
            rate_limit_max_creations: DEFAULT_RATE_LIMIT_MAX_CREATIONS,
            authority_policy: AuthorityPolicy::Host,
            client_url: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_or("PORT", defaults.port),
            max_participants: env_or("MAX_PARTICIPANTS", defaults.max_participants),
            room_timeout: Duration::from_secs(env_or(
                "ROOM_TIMEOUT_SECS",
                DEFAULT_ROOM_TIMEOUT_SECS,
            )),
            sweep_interval: Duration::from_secs(
                env_or("SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS).max(1),
            ),
            rate_limit_window: Duration::from_secs(env_or(
                "RATE_LIMIT_WINDOW_SECS",
                DEFAULT_RATE_LIMIT_WINDOW_SECS,
            )),
            rate_limit_max_creations: env_or(
                "RATE_LIMIT_MAX_CREATIONS",
                defaults.rate_limit_max_creations,
            ),
            authority_policy: env::var("AUTHORITY_POLICY")
                .ok()
                .map(|raw| parse_policy(&raw))
                .unwrap_or(defaults.authority_policy),
            client_url: env::var("CLIENT_URL").ok().filter(|url| !url.is_empty()),
        }
    }
}

fn env_or<T: FromStr + Copy + std::fmt::Display>(key: &str, fallback: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid {key}={raw:?}, using {fallback}");
            fallback
        }),
        Err(_) => fallback,
    }
}

fn parse_policy(raw: &str) -> AuthorityPolicy {
    match raw.trim().to_ascii_lowercase().as_str() {
        "any" | "any_participant" | "anyone" => AuthorityPolicy::AnyParticipant,
        "host" => AuthorityPolicy::Host,
        other => {
            tracing::warn!("Unknown AUTHORITY_POLICY {other:?}, using host");
            AuthorityPolicy::Host
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_names() {
        assert_eq!(parse_policy("ANY"), AuthorityPolicy::AnyParticipant);
        assert_eq!(parse_policy("host"), AuthorityPolicy::Host);
        assert_eq!(parse_policy("sometimes"), AuthorityPolicy::Host);
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = ServerConfig::default();
        assert_eq!(config.max_participants, 20);
        assert_eq!(config.room_timeout, Duration::from_secs(1800));
        assert_eq!(config.rate_limit_max_creations, 10);
    }
}
