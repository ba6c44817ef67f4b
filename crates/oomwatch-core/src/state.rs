//! Application state record
//!
//! The snapshot of a session that is checkpointed to disk so the next start
//! can tell what happened to the previous process.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch, or 0 if the clock is before it
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Lifecycle state of one application session
///
/// No field carries `#[serde(default)]`: a record missing any field must fail
/// to decode rather than come back with silently substituted values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationState {
    /// Whether the application was in the foreground at the last checkpoint
    pub foreground: bool,
    /// Time of the most recent low memory warning (ms since epoch)
    pub last_memory_warning_time: Option<u64>,
    /// Custom attributes known at the last checkpoint
    pub attributes: BTreeMap<String, String>,
    /// Attachment file paths known at the last checkpoint
    pub attachment_paths: Vec<String>,
    /// Whether a debugger was attached when the state was written
    pub debug_mode: bool,
    /// Version of the application that wrote this state
    pub app_version: Option<String>,
}

impl ApplicationState {
    /// Create the state of a session that is just starting
    ///
    /// A starting process is presumed to be in the foreground.
    pub fn new(debug_mode: bool) -> Self {
        Self {
            foreground: true,
            last_memory_warning_time: None,
            attributes: BTreeMap::new(),
            attachment_paths: Vec::new(),
            debug_mode,
            app_version: None,
        }
    }

    /// Merge attributes into the state, new values win on collision
    pub fn merge_attributes(&mut self, attributes: &BTreeMap<String, String>) {
        for (key, value) in attributes {
            self.attributes.insert(key.clone(), value.clone());
        }
    }

    /// Add attachment paths that are not already tracked
    pub fn merge_attachments<S: AsRef<str>>(&mut self, paths: &[S]) {
        for path in paths {
            let path = path.as_ref();
            if !self.attachment_paths.iter().any(|p| p == path) {
                self.attachment_paths.push(path.to_string());
            }
        }
    }
}

impl Default for ApplicationState {
    fn default() -> Self {
        Self::new(false)
    }
}
