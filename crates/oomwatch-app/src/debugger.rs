//! Debugger detection
//!
//! A debugger can suspend or kill the process in ways that look exactly like
//! an OOM kill, so sessions run under one are never reported.

/// Check whether a debugger is attached to this process
#[cfg(target_os = "linux")]
pub fn is_debugger_attached() -> bool {
    match std::fs::read_to_string("/proc/self/status") {
        Ok(status) => tracer_pid(&status).is_some_and(|pid| pid != 0),
        Err(e) => {
            log::debug!("Cannot read /proc/self/status: {}", e);
            false
        }
    }
}

/// Check whether a debugger is attached to this process
#[cfg(not(target_os = "linux"))]
pub fn is_debugger_attached() -> bool {
    false
}

/// Parse the `TracerPid` field of a `/proc/<pid>/status` file
pub fn tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|value| value.trim().parse().ok())
}
