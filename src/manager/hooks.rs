//! Maintenance-enter and -leave hook commands.
//!
//! Hooks let services veto or delay a maintenance window: exit code 69
//! asks for postponement, 75 for a retry on the next agent run. Any other
//! nonzero exit is a hard failure (the host's state is unknown; running
//! maintenance on top of it is unsafe).

use std::collections::BTreeMap;
use std::process::Command;
use thiserror::Error;

use crate::activity::probes::capture_command;
use crate::types::{EXIT_POSTPONE, EXIT_TEMPFAIL};

/// Sentinel outcome of running a hook chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookSignal {
    /// All hooks succeeded.
    Proceed,

    /// A hook asked for postponement; remaining hooks were not run.
    Postpone { hook: String },

    /// A hook asked for a retry; remaining hooks were not run.
    Tempfail { hook: String },
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("hook {hook} could not be started: {source}")]
    Spawn {
        hook: String,
        source: std::io::Error,
    },

    #[error("hook {hook} failed with exit code {returncode}: {stderr}")]
    Failed {
        hook: String,
        returncode: i32,
        stderr: String,
    },
}

/// Runs the hook commands sequentially in name order.
///
/// Stops at the first sentinel or failure. Empty commands are disabled
/// placeholders and are skipped.
pub fn run_hooks(
    hooks: &BTreeMap<String, String>,
    phase: &'static str,
) -> Result<HookSignal, HookError> {
    for (name, command) in hooks {
        if command.trim().is_empty() {
            continue;
        }
        tracing::debug!(phase, hook = %name, command = %command, "hook-run");
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(command);
        let (stdout, stderr, returncode) =
            capture_command(cmd).map_err(|source| HookError::Spawn {
                hook: name.clone(),
                source,
            })?;
        match returncode {
            0 => {
                tracing::debug!(phase, hook = %name, stdout = %stdout.trim_end(), "hook-ok");
            }
            EXIT_POSTPONE => {
                tracing::info!(phase, hook = %name, "hook-postpone");
                return Ok(HookSignal::Postpone { hook: name.clone() });
            }
            EXIT_TEMPFAIL => {
                tracing::info!(phase, hook = %name, "hook-tempfail");
                return Ok(HookSignal::Tempfail { hook: name.clone() });
            }
            _ => {
                tracing::error!(
                    phase,
                    hook = %name,
                    returncode,
                    stderr = %stderr.trim_end(),
                    "hook-failed"
                );
                return Err(HookError::Failed {
                    hook: name.clone(),
                    returncode,
                    stderr,
                });
            }
        }
    }
    Ok(HookSignal::Proceed)
}
