//! Lifecycle tracking
//!
//! Holds the authoritative state of the current session and checkpoints it
//! to the store after every mutation, so the next start has fresh data even
//! if this process dies without any shutdown hook running.
//!
//! Nothing is written until [`LifecycleTracker::initialize_defaults`] has run.
//! Until then the store still holds the previous session's record, which the
//! start-up decision has not read yet.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use oomwatch_core::{now_millis, ApplicationState, StateStore};

use crate::collaborators::CrashReporter;

/// Notification from the host runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The application moved to the foreground
    Foreground,
    /// The application moved to the background
    Background,
    /// The OS reported memory pressure
    LowMemoryWarning,
    /// Custom attributes changed
    Attributes(BTreeMap<String, String>),
    /// Attachment paths changed
    Attachments(Vec<String>),
    /// The application is terminating normally
    Terminate,
}

struct TrackerInner {
    state: ApplicationState,
    enabled: bool,
    initialized: bool,
}

/// In-memory session state plus its checkpoint
///
/// A single mutex covers both the state and the checkpoint write, so
/// notifications arriving from several threads are applied one at a time and
/// the file always holds the state of the last applied notification.
pub struct LifecycleTracker {
    inner: Mutex<TrackerInner>,
    store: StateStore,
    reporter: Arc<dyn CrashReporter>,
    app_version: Option<String>,
}

impl LifecycleTracker {
    pub fn new(
        store: StateStore,
        reporter: Arc<dyn CrashReporter>,
        app_version: Option<String>,
    ) -> Self {
        let enabled = !store.is_disabled();
        Self {
            inner: Mutex::new(TrackerInner {
                state: ApplicationState::default(),
                enabled,
                initialized: false,
            }),
            store,
            reporter,
            app_version,
        }
    }

    /// Reset the session state for a process that is just starting
    ///
    /// Attributes and attachments the host supplied before this call are
    /// kept; `attributes` overrides them key by key.
    pub fn initialize_defaults(&self, attachments: &[String], attributes: &BTreeMap<String, String>) {
        let mut state = ApplicationState::new(self.reporter.is_debugger_attached());
        state.app_version = self.app_version.clone();

        if state.debug_mode {
            log::info!("Debugger attached, this session will not be reported");
        }

        let mut inner = self.inner.lock();
        state.attributes = std::mem::take(&mut inner.state.attributes);
        state.attachment_paths = std::mem::take(&mut inner.state.attachment_paths);
        state.merge_attributes(attributes);
        state.merge_attachments(attachments);

        inner.state = state;
        inner.initialized = true;
        self.checkpoint(&inner);
    }

    pub fn on_background(&self) {
        self.mutate(|state| state.foreground = false);
    }

    pub fn on_foreground(&self) {
        self.mutate(|state| state.foreground = true);
    }

    pub fn on_low_memory_warning(&self) {
        let now = now_millis();
        log::debug!("Low memory warning at {}", now);
        self.mutate(|state| state.last_memory_warning_time = Some(now));
    }

    pub fn update_attributes(&self, attributes: &BTreeMap<String, String>) {
        self.mutate(|state| state.merge_attributes(attributes));
    }

    pub fn update_attachments(&self, attachments: &[String]) {
        self.mutate(|state| state.merge_attachments(attachments));
    }

    /// Stop OOM detection until explicitly re-enabled
    ///
    /// The checkpoint is removed and no further checkpoints are written.
    pub fn disable(&self) {
        let mut inner = self.inner.lock();
        if let Err(e) = self.store.set_disabled() {
            log::warn!("Failed to persist disabled flag: {}", e);
        }
        inner.enabled = false;
        if let Err(e) = self.store.clear() {
            log::warn!("Failed to clear application state: {}", e);
        }
    }

    /// Clear the disabled flag and resume checkpointing
    pub fn enable(&self) {
        let mut inner = self.inner.lock();
        if let Err(e) = self.store.clear_disabled() {
            log::warn!("Failed to clear disabled flag: {}", e);
            return;
        }
        inner.enabled = true;
        self.checkpoint(&inner);
    }

    /// Stop writing checkpoints for this process only
    ///
    /// Unlike [`LifecycleTracker::disable`] nothing is persisted.
    pub fn pause(&self) {
        self.inner.lock().enabled = false;
    }

    /// Record an expected termination
    ///
    /// Removes the checkpoint so the next start does not mistake this exit
    /// for an OOM kill. A tracker that is not checkpointing leaves the store
    /// alone, as any record there is not this session's.
    pub fn on_terminate(&self) {
        let inner = self.inner.lock();
        if !inner.initialized || !inner.enabled {
            log::debug!("Termination while not checkpointing, leaving stored state in place");
            return;
        }
        match self.store.clear() {
            Ok(()) => log::debug!("Application state cleared on termination"),
            Err(e) => log::warn!("Failed to clear application state: {}", e),
        }
    }

    /// Apply a host notification
    pub fn handle(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Foreground => self.on_foreground(),
            LifecycleEvent::Background => self.on_background(),
            LifecycleEvent::LowMemoryWarning => self.on_low_memory_warning(),
            LifecycleEvent::Attributes(attributes) => self.update_attributes(&attributes),
            LifecycleEvent::Attachments(attachments) => self.update_attachments(&attachments),
            LifecycleEvent::Terminate => self.on_terminate(),
        }
    }

    /// Copy of the current session state
    pub fn snapshot(&self) -> ApplicationState {
        self.inner.lock().state.clone()
    }

    /// Whether checkpoints are being written
    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    /// Whether `initialize_defaults` has run
    pub fn is_initialized(&self) -> bool {
        self.inner.lock().initialized
    }

    fn mutate(&self, f: impl FnOnce(&mut ApplicationState)) {
        let mut inner = self.inner.lock();
        f(&mut inner.state);
        self.checkpoint(&inner);
    }

    /// Best effort: a failed checkpoint is logged and skipped
    fn checkpoint(&self, inner: &TrackerInner) {
        if !inner.enabled || !inner.initialized {
            return;
        }
        if let Err(e) = self.store.write(&inner.state) {
            log::warn!("Failed to checkpoint application state: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct FakeReporter {
        debugger: bool,
    }

    impl CrashReporter for FakeReporter {
        fn is_debugger_attached(&self) -> bool {
            self.debugger
        }

        fn has_signaled_crash(&self) -> bool {
            false
        }
    }

    fn tracker(dir: &TempDir, debugger: bool) -> LifecycleTracker {
        LifecycleTracker::new(
            StateStore::new(dir.path()),
            Arc::new(FakeReporter { debugger }),
            Some("1.2.3".into()),
        )
    }

    fn attrs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_initialize_defaults() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir, false);
        tracker.initialize_defaults(&["/logs/app.log".to_string()], &attrs(&[("a", "1")]));

        let state = tracker.snapshot();
        assert!(state.foreground);
        assert!(!state.debug_mode);
        assert!(state.last_memory_warning_time.is_none());
        assert_eq!(state.app_version.as_deref(), Some("1.2.3"));
        assert_eq!(state.attachment_paths, vec!["/logs/app.log"]);

        assert_eq!(StateStore::new(dir.path()).read(), Some(state));
    }

    #[test]
    fn test_initialize_defaults_detects_debugger() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir, true);
        tracker.initialize_defaults(&[], &BTreeMap::new());
        assert!(tracker.snapshot().debug_mode);
    }

    #[test]
    fn test_initialize_resets_previous_warning() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir, false);
        tracker.on_low_memory_warning();
        tracker.on_background();
        tracker.initialize_defaults(&[], &BTreeMap::new());

        let state = tracker.snapshot();
        assert!(state.foreground);
        assert!(state.last_memory_warning_time.is_none());
    }

    #[test]
    fn test_no_checkpoint_before_initialize() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let mut previous = ApplicationState::new(true);
        previous.foreground = false;
        store.write(&previous).unwrap();

        let tracker = tracker(&dir, false);
        assert!(!tracker.is_initialized());
        tracker.handle(LifecycleEvent::Attributes(attrs(&[("early", "1")])));
        tracker.handle(LifecycleEvent::Attachments(vec!["/early.log".into()]));
        tracker.handle(LifecycleEvent::Foreground);
        tracker.handle(LifecycleEvent::LowMemoryWarning);
        tracker.handle(LifecycleEvent::Terminate);
        tracker.enable();

        // The previous session's record is untouched
        assert_eq!(store.read(), Some(previous));

        tracker.initialize_defaults(&["/start.log".to_string()], &attrs(&[("late", "2")]));
        assert!(tracker.is_initialized());
        let state = store.read().unwrap();
        assert!(!state.debug_mode);
        assert_eq!(state.attributes["early"], "1");
        assert_eq!(state.attributes["late"], "2");
        assert_eq!(state.attachment_paths, vec!["/early.log", "/start.log"]);
        assert!(state.last_memory_warning_time.is_none());
    }

    #[test]
    fn test_start_attributes_override_early_updates() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir, false);
        tracker.update_attributes(&attrs(&[("level", "early")]));
        tracker.initialize_defaults(&[], &attrs(&[("level", "start")]));
        assert_eq!(tracker.snapshot().attributes["level"], "start");
    }

    #[test]
    fn test_notifications_are_checkpointed() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let tracker = tracker(&dir, false);
        tracker.initialize_defaults(&[], &BTreeMap::new());

        tracker.on_background();
        assert!(!store.read().unwrap().foreground);

        tracker.on_foreground();
        assert!(store.read().unwrap().foreground);

        tracker.on_low_memory_warning();
        assert!(store.read().unwrap().last_memory_warning_time.is_some());

        tracker.update_attributes(&attrs(&[("level", "high")]));
        assert_eq!(store.read().unwrap().attributes["level"], "high");

        tracker.update_attachments(&["/tmp/x".to_string()]);
        tracker.update_attachments(&["/tmp/x".to_string(), "/tmp/y".to_string()]);
        assert_eq!(store.read().unwrap().attachment_paths, vec!["/tmp/x", "/tmp/y"]);
    }

    #[test]
    fn test_handle_maps_events() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir, false);
        tracker.initialize_defaults(&[], &BTreeMap::new());

        tracker.handle(LifecycleEvent::Background);
        tracker.handle(LifecycleEvent::LowMemoryWarning);
        tracker.handle(LifecycleEvent::Attributes(attrs(&[("k", "v")])));
        tracker.handle(LifecycleEvent::Attachments(vec!["/a".into()]));

        let state = tracker.snapshot();
        assert!(!state.foreground);
        assert!(state.last_memory_warning_time.is_some());
        assert_eq!(state.attributes["k"], "v");
        assert_eq!(state.attachment_paths, vec!["/a"]);

        tracker.handle(LifecycleEvent::Foreground);
        assert!(tracker.snapshot().foreground);
    }

    #[test]
    fn test_terminate_clears_checkpoint() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let tracker = tracker(&dir, false);
        tracker.initialize_defaults(&[], &BTreeMap::new());
        assert!(store.read().is_some());

        tracker.handle(LifecycleEvent::Terminate);
        assert!(store.read().is_none());
    }

    #[test]
    fn test_disable_stops_checkpoints() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let tracker = tracker(&dir, false);
        tracker.initialize_defaults(&[], &BTreeMap::new());

        tracker.disable();
        assert!(store.is_disabled());
        assert!(!tracker.is_enabled());
        assert!(store.read().is_none());

        tracker.on_background();
        assert!(store.read().is_none());
        // The in-memory state still follows the notifications
        assert!(!tracker.snapshot().foreground);

        tracker.enable();
        assert!(!store.is_disabled());
        assert!(!store.read().unwrap().foreground);
    }

    #[test]
    fn test_new_tracker_respects_persisted_flag() {
        let dir = TempDir::new().unwrap();
        StateStore::new(dir.path()).set_disabled().unwrap();
        let tracker = tracker(&dir, false);
        assert!(!tracker.is_enabled());
        tracker.initialize_defaults(&[], &BTreeMap::new());
        assert!(StateStore::new(dir.path()).read().is_none());
    }

    #[test]
    fn test_checkpoint_failure_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        // A file where the store directory should be
        let blocker = dir.path().join("state");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let tracker = LifecycleTracker::new(
            StateStore::new(&blocker),
            Arc::new(FakeReporter { debugger: false }),
            None,
        );

        tracker.initialize_defaults(&[], &BTreeMap::new());
        tracker.on_background();
        assert!(!tracker.snapshot().foreground);
    }

    #[test]
    fn test_concurrent_notifications() {
        let dir = TempDir::new().unwrap();
        let tracker = Arc::new(tracker(&dir, false));
        tracker.initialize_defaults(&[], &BTreeMap::new());

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for j in 0..10 {
                        let key = format!("t{}", i);
                        let value = j.to_string();
                        tracker.update_attributes(&attrs(&[(key.as_str(), value.as_str())]));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let persisted = StateStore::new(dir.path()).read().unwrap();
        assert_eq!(persisted, tracker.snapshot());
        assert_eq!(persisted.attributes.len(), 4);
        assert!(persisted.attributes.values().all(|v| v == "9"));
    }
}
