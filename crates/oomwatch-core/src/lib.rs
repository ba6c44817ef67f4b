//! oomwatch-core: OOM termination detection primitives
//!
//! This crate contains everything that does not depend on a host runtime:
//! the persisted application state record, the store that owns it on disk,
//! the decision procedure run at start-up, and the report bundle builder.

pub mod bundle;
pub mod decision;
pub mod state;
pub mod store;

pub use bundle::{build_bundle, Bundle, CrashKind, CrashMarker};
pub use decision::{decide, Decision, DecisionEngine, DecisionInput, SuppressReason};
pub use state::{now_millis, ApplicationState};
pub use store::{PendingReport, StateStore, StoreError, MAX_PENDING};
