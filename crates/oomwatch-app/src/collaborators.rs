//! Interfaces to the crash reporter and the upload transport
//!
//! Neither is implemented here beyond [`MarkerCrashReporter`], which reads the
//! crash marker file a signal handler leaves behind.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use oomwatch_core::Bundle;

use crate::debugger;

/// Name of the crash marker file inside the crash directory
const CRASH_MARKER_FILE: &str = "crash_marker";

/// Facts supplied by the signaled-crash reporter
pub trait CrashReporter: Send + Sync {
    /// Whether a debugger is attached to the current process
    fn is_debugger_attached(&self) -> bool;

    /// Whether a signaled crash was captured since the reporter last cleared
    fn has_signaled_crash(&self) -> bool;

    /// Called once the start-up decision has accounted for a signaled crash
    ///
    /// The crash belongs to the previous session only; after this call
    /// `has_signaled_crash` should report `false` until the next crash.
    fn acknowledge_crash(&self) {}
}

/// Completion callback for an upload
///
/// Receives `true` when the local record of the report may be deleted.
pub type UploadCallback = Box<dyn FnOnce(bool) + Send + 'static>;

/// Transport that delivers report bundles
pub trait UploadGateway: Send + Sync {
    /// Submit a bundle; `on_complete` may run on any thread
    fn upload(&self, bundle: Bundle, on_complete: UploadCallback);
}

/// Crash reporter backed by a crash marker file
///
/// The marker holds the signal number and the PID of the crashed process,
/// one per line. The signal handler writes it; it is removed once the
/// start-up decision has consumed it.
#[derive(Debug, Clone)]
pub struct MarkerCrashReporter {
    crash_dir: PathBuf,
}

impl MarkerCrashReporter {
    pub fn new(crash_dir: impl Into<PathBuf>) -> Self {
        Self {
            crash_dir: crash_dir.into(),
        }
    }

    /// Path to the crash marker file
    pub fn marker_path(&self) -> PathBuf {
        self.crash_dir.join(CRASH_MARKER_FILE)
    }

    /// Read the crash marker, returning the signal and PID
    pub fn read_marker(&self) -> Option<(i32, u32)> {
        read_crash_marker(&self.marker_path())
    }
}

impl CrashReporter for MarkerCrashReporter {
    fn is_debugger_attached(&self) -> bool {
        debugger::is_debugger_attached()
    }

    fn has_signaled_crash(&self) -> bool {
        match self.read_marker() {
            Some((signal, pid)) => {
                log::info!("Crash marker found: signal {} in PID {}", signal, pid);
                true
            }
            None => false,
        }
    }

    fn acknowledge_crash(&self) {
        let path = self.marker_path();
        if let Err(e) = remove_crash_marker(&path) {
            log::warn!("Failed to remove crash marker {}: {}", path.display(), e);
        }
    }
}

/// Write a crash marker (used by signal handlers)
pub fn write_crash_marker(crash_dir: &Path, signal: i32) -> io::Result<()> {
    fs::create_dir_all(crash_dir)?;
    let path = crash_dir.join(CRASH_MARKER_FILE);
    fs::write(&path, format!("{}\n{}", signal, std::process::id()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        let _ = fs::set_permissions(&path, perms);
    }

    Ok(())
}

fn read_crash_marker(path: &Path) -> Option<(i32, u32)> {
    // Check for symlink before reading
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_symlink() => {
            log::warn!("Crash marker path is a symlink, ignoring");
            return None;
        }
        Ok(_) => {}
        Err(_) => return None,
    }

    let content = fs::read_to_string(path).ok()?;
    let mut lines = content.lines();
    let signal: i32 = lines.next()?.trim().parse().ok()?;
    let pid: u32 = lines.next()?.trim().parse().ok()?;

    Some((signal, pid))
}

fn remove_crash_marker(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_symlink() => {
            log::warn!("Crash marker path is a symlink, refusing to remove");
            Ok(())
        }
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
