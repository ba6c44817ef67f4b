//! Command handlers

use std::io::Write;

use anyhow::{bail, Context};

use oomwatch_app::{CrashReporter, MarkerCrashReporter, OomConfig};
use oomwatch_core::{build_bundle, decide, DecisionInput};

use crate::cli::Command;

/// Run a command against the configured state directory
pub fn run(command: &Command, config: &OomConfig, out: &mut impl Write) -> anyhow::Result<()> {
    let store = config.store();

    match command {
        Command::Status => {
            let prior = store.read();
            let disabled = !config.enabled || store.is_disabled();
            let reporter = MarkerCrashReporter::new(config.crash_dir());
            let decision = decide(&DecisionInput {
                prior: prior.as_ref(),
                disabled,
                crashed: reporter.has_signaled_crash(),
                current_version: config.app_version.as_deref(),
                suppress_on_version_change: config.suppress_on_version_change,
            });

            writeln!(out, "state directory: {}", store.dir().display())?;
            writeln!(out, "disabled:        {}", disabled)?;
            match prior {
                Some(ref state) => {
                    writeln!(out, "foreground:      {}", state.foreground)?;
                    writeln!(out, "debug mode:      {}", state.debug_mode)?;
                    match state.last_memory_warning_time {
                        Some(time) => writeln!(out, "memory warning:  {}", time)?,
                        None => writeln!(out, "memory warning:  none")?,
                    }
                    writeln!(out, "attributes:      {}", state.attributes.len())?;
                    writeln!(out, "attachments:     {}", state.attachment_paths.len())?;
                }
                None => writeln!(out, "session state:   none")?,
            }
            writeln!(out, "pending reports: {}", store.pending_reports().len())?;
            writeln!(out, "next start:      {:?}", decision)?;
        }
        Command::Disable => {
            store.set_disabled().context("Failed to set disabled flag")?;
            store.clear().context("Failed to clear session state")?;
            writeln!(out, "OOM detection disabled")?;
        }
        Command::Enable => {
            store.clear_disabled().context("Failed to clear disabled flag")?;
            writeln!(out, "OOM detection enabled")?;
        }
        Command::Clear { pending } => {
            store.clear().context("Failed to clear session state")?;
            if *pending {
                for report in store.pending_reports() {
                    store
                        .clear_pending(&report.id)
                        .with_context(|| format!("Failed to remove pending report {}", report.id))?;
                }
            }
            writeln!(out, "Session state cleared")?;
        }
        Command::Bundle => {
            let Some(state) = store.read() else {
                bail!("No session state in {}", store.dir().display());
            };
            let bundle = build_bundle(&state, &config.attributes);
            serde_json::to_writer_pretty(&mut *out, &bundle)?;
            writeln!(out)?;
        }
    }

    Ok(())
}
