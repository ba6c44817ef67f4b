//! oomwatch-app: Session integration for oomwatch
//!
//! This crate wires the core primitives to a running application: it tracks
//! the live session, checkpoints it on every lifecycle notification, and runs
//! the one-time start-up evaluation that reports a previous OOM kill through
//! the host's upload transport.

pub mod collaborators;
pub mod config;
pub mod debugger;
pub mod tracker;
pub mod watcher;

pub use collaborators::{CrashReporter, MarkerCrashReporter, UploadCallback, UploadGateway};
pub use config::{load_config, save_config, ConfigError, OomConfig};
pub use tracker::{LifecycleEvent, LifecycleTracker};
pub use watcher::OomWatcher;
