//! Authoritative room state and event fan-out for synchronized playback.

pub mod config;
pub mod error;
pub mod protocol;
pub mod rate_limit;
pub mod registry;
pub mod room;
pub mod session;

pub use config::ServerConfig;
pub use error::{ErrorKind, SyncError, SyncResult};
pub use registry::RoomRegistry;
pub use room::AuthorityPolicy;
pub use session::SessionHub;

/// Wall-clock time in Unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
