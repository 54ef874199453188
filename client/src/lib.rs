pub mod clock;
pub mod config;
pub mod error;
pub mod invite;
pub mod media;
pub mod protocol;
pub mod reconcile;
pub mod session;
pub mod suppression;
pub mod sync;

pub use config::ClientConfig;
pub use error::SyncError;
pub use media::{MediaElement, SimulatedPlayer};
pub use reconcile::{ReconcileSettings, Reconciler};
pub use session::WatchSession;
pub use sync::SyncClient;
