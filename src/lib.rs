// Job control core
pub mod jobs;
pub mod status;
pub mod system;

// Control surface and ambient plumbing
pub mod config;
pub mod logging;
pub mod network;

// Public exports
pub use config::Config;
pub use jobs::{JobError, JobKind, JobRunner, LockManager};
pub use network::{ApiContext, ConnectivityProbe};
pub use status::StatusProvider;
pub use system::{HostSystem, SystemControl};
