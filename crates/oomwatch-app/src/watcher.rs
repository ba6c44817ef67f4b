//! Start-up OOM evaluation and reporting
//!
//! [`OomWatcher::start`] runs once per process:
//! 1. Reads the previous session's checkpoint
//! 2. Decides whether that session ended in an OOM kill
//! 3. Acknowledges a signaled crash so it only counts against that session
//! 4. If reporting, keeps a pending copy of the bundle and hands it to the
//!    transport
//! 5. Clears the old checkpoint and starts tracking the new session
//!
//! The decision is made before the new session writes anything, so the
//! evidence from the previous run is never overwritten first.
//!
//! Each start uploads at most one bundle. Bundles the transport did not
//! confirm stay in the store (the newest [`oomwatch_core::MAX_PENDING`] of
//! them) and are listed by [`OomWatcher::pending_reports`]; retrying them is
//! up to the host.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use oomwatch_core::{
    build_bundle, ApplicationState, Bundle, Decision, DecisionEngine, DecisionInput, PendingReport,
    StateStore, StoreError,
};

use crate::collaborators::{CrashReporter, UploadGateway};
use crate::config::OomConfig;
use crate::tracker::{LifecycleEvent, LifecycleTracker};

/// Local record backing a submitted bundle
enum ReportRecord {
    /// A stashed pending bundle
    Pending(String),
    /// The previous session's checkpoint, kept because stashing failed
    Checkpoint,
}

/// Ties the store, decision engine, tracker and collaborators together
pub struct OomWatcher {
    config: OomConfig,
    store: StateStore,
    reporter: Arc<dyn CrashReporter>,
    gateway: Arc<dyn UploadGateway>,
    engine: Mutex<DecisionEngine>,
    tracker: LifecycleTracker,
}

impl OomWatcher {
    pub fn new(
        config: OomConfig,
        reporter: Arc<dyn CrashReporter>,
        gateway: Arc<dyn UploadGateway>,
    ) -> Self {
        let store = config.store();
        let tracker = LifecycleTracker::new(
            store.clone(),
            Arc::clone(&reporter),
            config.app_version.clone(),
        );
        if !config.enabled {
            tracker.pause();
        }

        Self {
            config,
            store,
            reporter,
            gateway,
            engine: Mutex::new(DecisionEngine::new()),
            tracker,
        }
    }

    /// Evaluate the previous session and begin tracking this one
    ///
    /// Calling this again returns the first decision without side effects.
    pub fn start(&self, attachments: &[String], attributes: &BTreeMap<String, String>) -> Decision {
        let mut engine = self.engine.lock();
        if let Some(decision) = engine.decision() {
            log::warn!("OOM watcher already started");
            return decision;
        }

        let fresh = self.fresh_attributes(attributes);
        let disabled = !self.config.enabled || self.store.is_disabled();
        let crashed = self.reporter.has_signaled_crash();

        let prior = self.store.read();
        let input = DecisionInput {
            prior: prior.as_ref(),
            disabled,
            crashed,
            current_version: self.config.app_version.as_deref(),
            suppress_on_version_change: self.config.suppress_on_version_change,
        };
        let decision = engine.evaluate(&input);

        if crashed {
            self.reporter.acknowledge_crash();
        }

        let mut keep_prior = false;
        if let (Decision::Report, Some(prior)) = (decision, prior.as_ref()) {
            keep_prior = self.report(prior, &fresh).is_err();
        }

        if keep_prior {
            // The checkpoint is the only copy of the report; the callback
            // removes it once delivered
            log::warn!("Keeping previous application state, not tracking this session");
            self.tracker.pause();
        } else if let Err(e) = self.store.clear() {
            log::warn!("Failed to clear previous application state: {}", e);
        }

        self.tracker.initialize_defaults(attachments, &fresh);

        decision
    }

    /// The start-up decision, if `start` has run
    pub fn decision(&self) -> Option<Decision> {
        self.engine.lock().decision()
    }

    /// The tracker for the current session
    pub fn tracker(&self) -> &LifecycleTracker {
        &self.tracker
    }

    /// Apply a host notification to the current session
    pub fn handle(&self, event: LifecycleEvent) {
        self.tracker.handle(event);
    }

    /// Disable OOM detection until explicitly re-enabled
    pub fn disable(&self) {
        self.tracker.disable();
    }

    /// Re-enable OOM detection
    pub fn enable(&self) {
        self.tracker.enable();
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Bundles the transport has not confirmed, oldest first
    pub fn pending_reports(&self) -> Vec<PendingReport> {
        self.store.pending_reports()
    }

    /// Drop a pending bundle after the host delivered it
    pub fn confirm_pending(&self, id: &str) -> Result<(), StoreError> {
        self.store.clear_pending(id)
    }

    /// Configured attributes overlaid with the ones supplied by the host
    fn fresh_attributes(&self, attributes: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut fresh = self.config.attributes.clone();
        for (key, value) in attributes {
            fresh.insert(key.clone(), value.clone());
        }
        fresh
    }

    /// Hand the bundle to the transport
    ///
    /// Fails when the bundle could not be stashed. It is still submitted,
    /// backed by the previous checkpoint instead.
    fn report(
        &self,
        prior: &ApplicationState,
        fresh: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        log::info!(
            "Reporting OOM termination of previous session (foreground: {}, memory warning: {:?})",
            prior.foreground,
            prior.last_memory_warning_time
        );

        let bundle = build_bundle(prior, fresh);
        match self.store.stash_pending(&bundle) {
            Ok(id) => {
                self.submit(bundle, ReportRecord::Pending(id));
                Ok(())
            }
            Err(e) => {
                log::warn!("Failed to keep pending OOM report: {}", e);
                self.submit(bundle, ReportRecord::Checkpoint);
                Err(e)
            }
        }
    }

    fn submit(&self, bundle: Bundle, record: ReportRecord) {
        let store = self.store.clone();
        self.gateway.upload(
            bundle,
            Box::new(move |should_delete| {
                if !should_delete {
                    log::info!("OOM report not confirmed, keeping it");
                    return;
                }
                let result = match &record {
                    ReportRecord::Pending(id) => store.clear_pending(id),
                    ReportRecord::Checkpoint => store.clear(),
                };
                if let Err(e) = result {
                    log::warn!("Failed to remove delivered OOM report: {}", e);
                }
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::UploadCallback;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct Reporter {
        crashed: bool,
        acknowledged: AtomicBool,
    }

    impl CrashReporter for Reporter {
        fn is_debugger_attached(&self) -> bool {
            false
        }

        fn has_signaled_crash(&self) -> bool {
            self.crashed
        }

        fn acknowledge_crash(&self) {
            self.acknowledged.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Gateway {
        bundles: Mutex<Vec<Bundle>>,
    }

    impl UploadGateway for Gateway {
        fn upload(&self, bundle: Bundle, on_complete: UploadCallback) {
            self.bundles.lock().push(bundle);
            on_complete(true);
        }
    }

    fn config(dir: &TempDir) -> OomConfig {
        OomConfig {
            state_dir: Some(dir.path().join("oom")),
            ..Default::default()
        }
    }

    #[test]
    fn test_start_twice_keeps_first_decision() {
        let dir = TempDir::new().unwrap();
        config(&dir).store().write(&ApplicationState::new(false)).unwrap();
        let gateway = Arc::new(Gateway::default());
        let watcher = OomWatcher::new(config(&dir), Arc::new(Reporter::default()), gateway.clone());

        assert_eq!(watcher.decision(), None);
        assert_eq!(watcher.start(&[], &BTreeMap::new()), Decision::Report);
        assert_eq!(watcher.start(&[], &BTreeMap::new()), Decision::Report);
        assert_eq!(gateway.bundles.lock().len(), 1);
    }

    #[test]
    fn test_config_attributes_are_overridden_by_host() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.attributes.insert("env".into(), "prod".into());
        config.attributes.insert("team".into(), "mobile".into());
        config.store().write(&ApplicationState::new(false)).unwrap();

        let gateway = Arc::new(Gateway::default());
        let watcher = OomWatcher::new(config, Arc::new(Reporter::default()), gateway.clone());
        let mut host = BTreeMap::new();
        host.insert("env".to_string(), "staging".to_string());
        watcher.start(&[], &host);

        let bundles = gateway.bundles.lock();
        assert_eq!(bundles[0].attributes["env"], "staging");
        assert_eq!(bundles[0].attributes["team"], "mobile");
    }

    #[test]
    fn test_config_disabled_suppresses_without_persisting_flag() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.enabled = false;
        let store = config.store();
        store.write(&ApplicationState::new(false)).unwrap();

        let gateway = Arc::new(Gateway::default());
        let watcher = OomWatcher::new(config, Arc::new(Reporter::default()), gateway.clone());
        assert!(!watcher.start(&[], &BTreeMap::new()).is_report());
        assert!(gateway.bundles.lock().is_empty());
        assert!(!store.is_disabled());
        assert!(store.read().is_none());
    }

    #[test]
    fn test_signaled_crash_is_acknowledged() {
        let dir = TempDir::new().unwrap();
        config(&dir).store().write(&ApplicationState::new(false)).unwrap();
        let reporter = Arc::new(Reporter {
            crashed: true,
            ..Default::default()
        });
        let watcher = OomWatcher::new(config(&dir), reporter.clone(), Arc::new(Gateway::default()));

        assert!(!watcher.start(&[], &BTreeMap::new()).is_report());
        assert!(reporter.acknowledged.load(Ordering::SeqCst));
    }

    #[test]
    fn test_no_crash_is_not_acknowledged() {
        let dir = TempDir::new().unwrap();
        let reporter = Arc::new(Reporter::default());
        let watcher = OomWatcher::new(config(&dir), reporter.clone(), Arc::new(Gateway::default()));

        watcher.start(&[], &BTreeMap::new());
        assert!(!reporter.acknowledged.load(Ordering::SeqCst));
    }

    #[test]
    fn test_confirm_pending() {
        let dir = TempDir::new().unwrap();
        let store = config(&dir).store();
        let id = store
            .stash_pending(&build_bundle(&ApplicationState::new(false), &BTreeMap::new()))
            .unwrap();

        let watcher = OomWatcher::new(
            config(&dir),
            Arc::new(Reporter::default()),
            Arc::new(Gateway::default()),
        );
        let pending = watcher.pending_reports();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);

        watcher.confirm_pending(&id).unwrap();
        assert!(watcher.pending_reports().is_empty());
    }
}
