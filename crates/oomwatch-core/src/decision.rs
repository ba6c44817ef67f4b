//! OOM decision procedure
//!
//! Decides, once per process start, whether the previous session ended in an
//! out-of-memory kill that should be reported. The procedure is total: every
//! input resolves to either [`Decision::Report`] or [`Decision::Suppress`].

use crate::state::ApplicationState;

/// Why a previous session is not reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    /// OOM detection has been disabled
    Disabled,
    /// No valid state record from a previous session
    NoPriorState,
    /// A debugger was attached to the previous session
    DebuggerAttached,
    /// The crash reporter already captured a signaled crash
    AlreadyCrashed,
    /// The application was upgraded between the sessions
    VersionChanged,
}

/// Outcome of the start-up evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Report the previous termination as an OOM event
    Report,
    /// Do not report
    Suppress(SuppressReason),
}

impl Decision {
    pub fn is_report(&self) -> bool {
        matches!(self, Decision::Report)
    }
}

/// Everything the decision depends on
#[derive(Debug, Clone, Copy, Default)]
pub struct DecisionInput<'a> {
    /// The previous session's state, `None` if absent or unverifiable
    pub prior: Option<&'a ApplicationState>,
    /// Whether the disabled flag is set
    pub disabled: bool,
    /// Whether a signaled crash was recorded for the previous session
    pub crashed: bool,
    /// Version of the running application, if known
    pub current_version: Option<&'a str>,
    /// Suppress when the recorded version differs from `current_version`
    pub suppress_on_version_change: bool,
}

/// Decide whether the previous session should be reported as an OOM kill
///
/// Foreground state and memory warnings are evidence only; a kill is not
/// always preceded by an observable warning.
pub fn decide(input: &DecisionInput<'_>) -> Decision {
    if input.disabled {
        return Decision::Suppress(SuppressReason::Disabled);
    }

    let Some(prior) = input.prior else {
        return Decision::Suppress(SuppressReason::NoPriorState);
    };

    if prior.debug_mode {
        return Decision::Suppress(SuppressReason::DebuggerAttached);
    }

    if input.crashed {
        return Decision::Suppress(SuppressReason::AlreadyCrashed);
    }

    if input.suppress_on_version_change {
        if let (Some(previous), Some(current)) = (prior.app_version.as_deref(), input.current_version) {
            if previous != current {
                return Decision::Suppress(SuppressReason::VersionChanged);
            }
        }
    }

    Decision::Report
}

/// Evaluation state of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Unevaluated,
    Evaluated(Decision),
}

/// Runs the decision at most once per process
#[derive(Debug)]
pub struct DecisionEngine {
    state: EngineState,
}

impl DecisionEngine {
    pub fn new() -> Self {
        Self {
            state: EngineState::Unevaluated,
        }
    }

    /// Evaluate the decision, or return the earlier result if already evaluated
    pub fn evaluate(&mut self, input: &DecisionInput<'_>) -> Decision {
        match self.state {
            EngineState::Evaluated(decision) => {
                log::debug!("OOM decision already evaluated: {:?}", decision);
                decision
            }
            EngineState::Unevaluated => {
                let decision = decide(input);
                log::info!("OOM decision: {:?}", decision);
                self.state = EngineState::Evaluated(decision);
                decision
            }
        }
    }

    /// The decision, if one has been made
    pub fn decision(&self) -> Option<Decision> {
        match self.state {
            EngineState::Unevaluated => None,
            EngineState::Evaluated(decision) => Some(decision),
        }
    }
}

impl Default for DecisionEngine {
    fn default() -> Self {
        Self::new()
    }
}
