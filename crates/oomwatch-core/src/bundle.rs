//! Report bundle assembly

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::state::{now_millis, ApplicationState};

/// `error.type` value stamped on OOM reports
pub const OOM_ERROR_TYPE: &str = "Low Memory";

/// Attribute keys written by the assembler
pub mod keys {
    pub const ERROR_TYPE: &str = "error.type";
    pub const STATE: &str = "oom.state";
    pub const MEMORY_WARNING_TIME: &str = "oom.memory_warning_time";
    pub const APP_VERSION: &str = "application.version";
}

/// Kind of crash a bundle describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrashKind {
    /// Killed by the OS under memory pressure
    OutOfMemory,
}

/// Synthetic crash marker standing in for a captured crash payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashMarker {
    pub kind: CrashKind,
    /// When the termination was detected (ms since epoch)
    pub detected_at: u64,
}

/// Payload handed to the upload transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub marker: CrashMarker,
    pub attributes: BTreeMap<String, String>,
    pub attachment_paths: Vec<String>,
}

/// Build the OOM report bundle for a previous session
///
/// Fresh attributes win over the recorded ones. Attachment paths are carried
/// over as recorded, minus duplicates; whether the files still exist is left
/// to the transport.
pub fn build_bundle(prior: &ApplicationState, fresh_attributes: &BTreeMap<String, String>) -> Bundle {
    let mut attributes = prior.attributes.clone();

    attributes.insert(keys::ERROR_TYPE.into(), OOM_ERROR_TYPE.into());
    attributes.insert(
        keys::STATE.into(),
        if prior.foreground { "foreground" } else { "background" }.into(),
    );
    if let Some(time) = prior.last_memory_warning_time {
        attributes.insert(keys::MEMORY_WARNING_TIME.into(), time.to_string());
    }
    if let Some(ref version) = prior.app_version {
        attributes.insert(keys::APP_VERSION.into(), version.clone());
    }

    for (key, value) in fresh_attributes {
        attributes.insert(key.clone(), value.clone());
    }

    let mut attachment_paths: Vec<String> = Vec::with_capacity(prior.attachment_paths.len());
    for path in &prior.attachment_paths {
        if !attachment_paths.contains(path) {
            attachment_paths.push(path.clone());
        }
    }

    Bundle {
        marker: CrashMarker {
            kind: CrashKind::OutOfMemory,
            detected_at: now_millis(),
        },
        attributes,
        attachment_paths,
    }
}
