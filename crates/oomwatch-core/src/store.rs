//! Application state persistence
//!
//! Handles writing, reading and clearing the checkpointed application state,
//! the disabled flag, and reports awaiting transport confirmation. Every
//! write goes to a temporary sibling file which is then renamed over the
//! target, so a process killed mid-write leaves either the previous record
//! or the new one, never a mix.
//!
//! Record layout on disk:
//!
//! ```text
//! +-------+------------------------------+----------------------+
//! | magic |  bincode(StoredRecord)       |  sha256(payload)     |
//! | 4 B   |  variable                    |  32 B                |
//! +-------+------------------------------+----------------------+
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use directories::ProjectDirs;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::bundle::Bundle;
use crate::state::{now_millis, ApplicationState};

/// File magic for state records
const MAGIC: &[u8; 4] = b"OOMW";

/// Length of the trailing SHA-256 digest
const DIGEST_LEN: usize = 32;

/// Name of the checkpoint file
const STATE_FILE: &str = "oom_state.bin";

/// Directory of reports awaiting transport confirmation
const PENDING_DIR: &str = "pending";

/// Extension of committed record files
const RECORD_EXT: &str = "bin";

/// Name of the disabled flag file
const DISABLED_FILE: &str = "oom_disabled";

/// Most pending reports kept; the oldest are dropped beyond this
pub const MAX_PENDING: usize = 8;

/// Disambiguates pending reports stashed within the same millisecond
static PENDING_SEQ: AtomicU64 = AtomicU64::new(0);

/// Errors from state persistence
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to encode state: {0}")]
    Encode(#[from] bincode::Error),

    #[error("State record is truncated ({0} bytes)")]
    Truncated(usize),

    #[error("State record has an unknown file signature")]
    BadMagic,

    #[error("State record checksum mismatch")]
    ChecksumMismatch,

    #[error("Unsupported state format version {0}")]
    UnsupportedVersion(u32),
}

/// Envelope around a record as it is written to disk
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord<T> {
    /// Version of the serialization format
    format_version: u32,
    /// Timestamp when the record was written (ms since epoch)
    written_at: u64,
    /// PID of the process that wrote the record
    pid: u32,
    /// The record itself
    payload: T,
}

impl<T> StoredRecord<T> {
    /// Current format version
    const FORMAT_VERSION: u32 = 2;

    fn new(payload: T) -> Self {
        Self {
            format_version: Self::FORMAT_VERSION,
            written_at: now_millis(),
            pid: std::process::id(),
            payload,
        }
    }
}

/// A report bundle the transport has not confirmed yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReport {
    /// Identifier used to clear the record once confirmed
    pub id: String,
    /// The bundle exactly as it was handed to the transport
    pub bundle: Bundle,
}

/// Durable store for the application state record and the disabled flag
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Create a store rooted at the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Create a store in the default private cache directory
    pub fn default_location() -> Self {
        Self::new(default_state_dir())
    }

    /// Directory holding all store files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the checkpoint record
    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    /// Directory of pending report records
    pub fn pending_dir(&self) -> PathBuf {
        self.dir.join(PENDING_DIR)
    }

    /// Path of a pending report record
    pub fn pending_path(&self, id: &str) -> PathBuf {
        self.pending_dir().join(format!("{}.{}", id, RECORD_EXT))
    }

    /// Path of the disabled flag
    pub fn disabled_path(&self) -> PathBuf {
        self.dir.join(DISABLED_FILE)
    }

    /// Read the checkpointed state
    ///
    /// Returns `None` when the record is missing or fails verification.
    pub fn read(&self) -> Option<ApplicationState> {
        read_soft(&self.state_path())
    }

    /// Atomically write the checkpointed state
    pub fn write(&self, state: &ApplicationState) -> Result<(), StoreError> {
        let bytes = encode_record(state)?;
        write_atomic(&self.state_path(), &bytes)?;
        log::trace!("Wrote application state: {} bytes", bytes.len());
        Ok(())
    }

    /// Remove the checkpointed state
    pub fn clear(&self) -> Result<(), StoreError> {
        remove_if_present(&self.state_path())
    }

    /// Keep a bundle until the transport confirms it was delivered
    ///
    /// Returns the identifier to pass to [`StateStore::clear_pending`]. Only
    /// the newest [`MAX_PENDING`] reports are kept.
    pub fn stash_pending(&self, bundle: &Bundle) -> Result<String, StoreError> {
        let id = format!(
            "{:013}_{}_{:04}",
            now_millis(),
            std::process::id(),
            PENDING_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let bytes = encode_record(bundle)?;
        write_atomic(&self.pending_path(&id), &bytes)?;
        log::debug!("Stashed pending OOM report {}: {} bytes", id, bytes.len());

        self.prune_pending();
        Ok(id)
    }

    /// Reports the transport has not confirmed, oldest first
    ///
    /// Records that fail verification are skipped, not removed.
    pub fn pending_reports(&self) -> Vec<PendingReport> {
        self.pending_ids()
            .into_iter()
            .filter_map(|id| {
                let bundle = read_soft(&self.pending_path(&id))?;
                Some(PendingReport { id, bundle })
            })
            .collect()
    }

    /// Remove a pending report record
    pub fn clear_pending(&self, id: &str) -> Result<(), StoreError> {
        remove_if_present(&self.pending_path(id))
    }

    /// Whether OOM detection has been disabled
    pub fn is_disabled(&self) -> bool {
        let path = self.disabled_path();
        match fs::read(&path) {
            Ok(bytes) => bytes.first() == Some(&1),
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                log::warn!("Failed to read disabled flag {}: {}", path.display(), e);
                false
            }
        }
    }

    /// Persist the disabled flag
    pub fn set_disabled(&self) -> Result<(), StoreError> {
        write_atomic(&self.disabled_path(), &[1])?;
        log::info!("OOM detection disabled");
        Ok(())
    }

    /// Remove the disabled flag
    pub fn clear_disabled(&self) -> Result<(), StoreError> {
        remove_if_present(&self.disabled_path())?;
        log::info!("OOM detection re-enabled");
        Ok(())
    }

    /// Committed pending record ids, oldest first
    fn pending_ids(&self) -> Vec<String> {
        let dir = self.pending_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                log::warn!("Failed to list {}: {}", dir.display(), e);
                return Vec::new();
            }
        };

        let mut ids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let id = name.strip_suffix(RECORD_EXT)?.strip_suffix('.')?;
                Some(id.to_string())
            })
            .collect();
        ids.sort();
        ids
    }

    /// Drop invalid pending records and the oldest beyond the cap
    fn prune_pending(&self) {
        let mut valid = Vec::new();
        for id in self.pending_ids() {
            if read_soft::<Bundle>(&self.pending_path(&id)).is_some() {
                valid.push(id);
            } else {
                self.remove_pending_logged(&id, "invalid");
            }
        }

        let excess = valid.len().saturating_sub(MAX_PENDING);
        for id in &valid[..excess] {
            self.remove_pending_logged(id, "over the limit");
        }
    }

    fn remove_pending_logged(&self, id: &str, why: &str) {
        match self.clear_pending(id) {
            Ok(()) => log::info!("Dropped pending OOM report {} ({})", id, why),
            Err(e) => log::warn!("Failed to remove pending OOM report {}: {}", id, e),
        }
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::default_location()
    }
}

/// Get the default directory for oomwatch state
pub fn default_state_dir() -> PathBuf {
    ProjectDirs::from("com", "oomwatch", "oomwatch")
        .map(|dirs| dirs.cache_dir().join("oom"))
        .unwrap_or_else(|| std::env::temp_dir().join("oomwatch"))
}

fn encode_record<T: Serialize>(payload: &T) -> Result<Vec<u8>, StoreError> {
    let payload = bincode::serialize(&StoredRecord::new(payload))?;
    let digest = Sha256::digest(&payload);

    let mut bytes = Vec::with_capacity(MAGIC.len() + payload.len() + DIGEST_LEN);
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&payload);
    bytes.extend_from_slice(&digest);
    Ok(bytes)
}

fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    if bytes.len() < MAGIC.len() + DIGEST_LEN {
        return Err(StoreError::Truncated(bytes.len()));
    }
    if &bytes[..MAGIC.len()] != MAGIC {
        return Err(StoreError::BadMagic);
    }

    let (payload, digest) = bytes[MAGIC.len()..].split_at(bytes.len() - MAGIC.len() - DIGEST_LEN);
    if Sha256::digest(payload).as_slice() != digest {
        return Err(StoreError::ChecksumMismatch);
    }

    let record: StoredRecord<T> = bincode::deserialize(payload)?;
    if record.format_version != StoredRecord::<T>::FORMAT_VERSION {
        return Err(StoreError::UnsupportedVersion(record.format_version));
    }

    log::debug!(
        "Read record written by PID {} at {}",
        record.pid,
        record.written_at
    );

    Ok(record.payload)
}

fn read_soft<T: DeserializeOwned>(path: &Path) -> Option<T> {
    // A symlink planted at our path is never followed
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_symlink() => {
            log::warn!("{} is a symlink, ignoring", path.display());
            return None;
        }
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            log::warn!("Failed to stat {}: {}", path.display(), e);
            return None;
        }
    }

    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("Failed to read {}: {}", path.display(), e);
            return None;
        }
    };

    match decode_record(&bytes) {
        Ok(record) => Some(record),
        Err(e) => {
            log::warn!("Ignoring invalid record {}: {}", path.display(), e);
            None
        }
    }
}

/// Write a file atomically using temp file + rename
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    // State may contain user attributes
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(&temp_path, perms)?;
    }

    fs::rename(&temp_path, path)
}

fn remove_if_present(path: &Path) -> Result<(), StoreError> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    // Refuse to remove through a symlink; reads ignore it as well
    if meta.is_symlink() {
        log::warn!("{} is a symlink, refusing to remove", path.display());
        return Ok(());
    }

    fs::remove_file(path)?;
    Ok(())
}
