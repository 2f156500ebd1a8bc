//! System probes and the update platform seam.
//!
//! Activities decide whether they are effective by comparing wanted values
//! against the live system. Those reads, and the commands a system update
//! shells out to, sit behind traits so the engine stays testable with mock
//! implementations.

use chrono::{DateTime, Utc};
use std::fs;
use std::process::Command;
use thiserror::Error;

use super::system_update::UnitChanges;

/// Read-only probes of the live system.
pub trait SystemProbes {
    /// Installed main memory in MiB.
    fn memory_mib(&self) -> Result<u64, ProbeError>;

    /// Number of logical CPU cores.
    fn cpu_cores(&self) -> Result<u32, ProbeError>;

    /// When the running system was booted.
    fn boot_time(&self) -> Result<DateTime<Utc>, ProbeError>;
}

#[derive(Debug, Clone, Error)]
#[error("probe {probe} failed: {message}")]
pub struct ProbeError {
    pub probe: &'static str,
    pub message: String,
}

impl ProbeError {
    fn new(probe: &'static str, message: impl Into<String>) -> Self {
        ProbeError {
            probe,
            message: message.into(),
        }
    }
}

/// Probes backed by /proc on the running host.
#[derive(Debug, Default)]
pub struct LiveProbes;

impl SystemProbes for LiveProbes {
    fn memory_mib(&self) -> Result<u64, ProbeError> {
        let meminfo = fs::read_to_string("/proc/meminfo")
            .map_err(|e| ProbeError::new("memory", e.to_string()))?;
        for line in meminfo.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                let kib: u64 = rest
                    .trim()
                    .trim_end_matches("kB")
                    .trim()
                    .parse()
                    .map_err(|_| ProbeError::new("memory", format!("unparseable line {line:?}")))?;
                return Ok(kib / 1024);
            }
        }
        Err(ProbeError::new("memory", "MemTotal not found in /proc/meminfo"))
    }

    fn cpu_cores(&self) -> Result<u32, ProbeError> {
        let cpuinfo = fs::read_to_string("/proc/cpuinfo")
            .map_err(|e| ProbeError::new("cores", e.to_string()))?;
        let count = cpuinfo
            .lines()
            .filter(|l| l.starts_with("processor"))
            .count() as u32;
        if count == 0 {
            return Err(ProbeError::new("cores", "no processor entries in /proc/cpuinfo"));
        }
        Ok(count)
    }

    fn boot_time(&self) -> Result<DateTime<Utc>, ProbeError> {
        let stat =
            fs::read_to_string("/proc/stat").map_err(|e| ProbeError::new("boot_time", e.to_string()))?;
        for line in stat.lines() {
            if let Some(rest) = line.strip_prefix("btime ") {
                let secs: i64 = rest
                    .trim()
                    .parse()
                    .map_err(|_| ProbeError::new("boot_time", format!("unparseable btime {rest:?}")))?;
                return DateTime::from_timestamp(secs, 0)
                    .ok_or_else(|| ProbeError::new("boot_time", "btime out of range"));
            }
        }
        Err(ProbeError::new("boot_time", "btime not found in /proc/stat"))
    }
}

/// Errors from update platform commands, categorized for the exit-code
/// contract: a failed switch is worth retrying in the same window, a failed
/// build is not.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("setting system channel failed: {stderr}")]
    ChannelUpdateFailed { stdout: String, stderr: String },

    #[error("building the target system failed: {stderr}")]
    BuildFailed { stdout: String, stderr: String },

    #[error("switching to the target system failed: {stdout}")]
    SwitchFailed { stdout: String },

    #[error("platform command could not be spawned: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("platform produced unparseable output: {0}")]
    BadOutput(String),
}

/// The commands a system update delegates to.
///
/// The engine does not know how to build OS images; it only sequences the
/// platform's own tooling and maps failures onto the exit-code contract.
pub trait UpdatePlatform {
    /// Points the system at a new channel URL.
    fn set_channel(&self, channel_url: &str) -> Result<(), PlatformError>;

    /// Builds the system for the channel; returns the built system path.
    fn build(&self, channel_url: &str) -> Result<String, PlatformError>;

    /// Predicts the unit changes activating `system` would cause.
    fn dry_activate(&self, system: &str) -> Result<UnitChanges, PlatformError>;

    /// Kernel version inside a built system.
    fn kernel_version(&self, system: &str) -> Result<String, PlatformError>;

    /// Path of the currently running system.
    fn current_system(&self) -> Result<String, PlatformError>;

    /// Activates a built system.
    fn switch(&self, system: &str) -> Result<(), PlatformError>;
}

/// Placeholder platform for hosts without an update stack configured.
///
/// Every call fails; a system update scheduled on such a host ends in a
/// hard failure instead of a surprise.
#[derive(Debug, Default)]
pub struct UnconfiguredPlatform;

impl UpdatePlatform for UnconfiguredPlatform {
    fn set_channel(&self, _channel_url: &str) -> Result<(), PlatformError> {
        Err(PlatformError::BadOutput("update platform not configured".into()))
    }

    fn build(&self, _channel_url: &str) -> Result<String, PlatformError> {
        Err(PlatformError::BadOutput("update platform not configured".into()))
    }

    fn dry_activate(&self, _system: &str) -> Result<UnitChanges, PlatformError> {
        Err(PlatformError::BadOutput("update platform not configured".into()))
    }

    fn kernel_version(&self, _system: &str) -> Result<String, PlatformError> {
        Err(PlatformError::BadOutput("update platform not configured".into()))
    }

    fn current_system(&self) -> Result<String, PlatformError> {
        Err(PlatformError::BadOutput("update platform not configured".into()))
    }

    fn switch(&self, _system: &str) -> Result<(), PlatformError> {
        Err(PlatformError::BadOutput("update platform not configured".into()))
    }
}

/// Shell command templates for [`CommandPlatform`], loaded from the agent
/// config. Arguments are passed via environment variables so the templates
/// never need quoting rules.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PlatformCommands {
    pub set_channel: String,
    pub build: String,
    pub dry_activate: String,
    pub kernel_version: String,
    pub current_system: String,
    pub switch: String,
}

/// An [`UpdatePlatform`] that shells out to configured commands.
#[derive(Debug)]
pub struct CommandPlatform {
    commands: PlatformCommands,
}

impl CommandPlatform {
    pub fn new(commands: PlatformCommands) -> Self {
        CommandPlatform { commands }
    }

    fn run(
        &self,
        template: &str,
        envs: &[(&str, &str)],
    ) -> Result<std::process::Output, PlatformError> {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(template);
        for (key, value) in envs {
            cmd.env(key, value);
        }
        Ok(cmd.output()?)
    }
}

impl UpdatePlatform for CommandPlatform {
    fn set_channel(&self, channel_url: &str) -> Result<(), PlatformError> {
        let output = self.run(&self.commands.set_channel, &[("CHANNEL_URL", channel_url)])?;
        if output.status.success() {
            Ok(())
        } else {
            Err(PlatformError::ChannelUpdateFailed {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }

    fn build(&self, channel_url: &str) -> Result<String, PlatformError> {
        let output = self.run(&self.commands.build, &[("CHANNEL_URL", channel_url)])?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(PlatformError::BuildFailed {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }

    fn dry_activate(&self, system: &str) -> Result<UnitChanges, PlatformError> {
        let output = self.run(&self.commands.dry_activate, &[("SYSTEM", system)])?;
        if !output.status.success() {
            return Err(PlatformError::BuildFailed {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        // The command reports unit changes as JSON on stdout.
        serde_json::from_slice(&output.stdout)
            .map_err(|e| PlatformError::BadOutput(e.to_string()))
    }

    fn kernel_version(&self, system: &str) -> Result<String, PlatformError> {
        let output = self.run(&self.commands.kernel_version, &[("SYSTEM", system)])?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(PlatformError::BadOutput(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ))
        }
    }

    fn current_system(&self) -> Result<String, PlatformError> {
        let output = self.run(&self.commands.current_system, &[])?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(PlatformError::BadOutput(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ))
        }
    }

    fn switch(&self, system: &str) -> Result<(), PlatformError> {
        let output = self.run(&self.commands.switch, &[("SYSTEM", system)])?;
        if output.status.success() {
            Ok(())
        } else {
            Err(PlatformError::SwitchFailed {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            })
        }
    }
}

/// Helper shared by activities and hooks: run a script file or command
/// line, capturing stdout/stderr/exit code.
pub(crate) fn capture_command(mut cmd: Command) -> std::io::Result<(String, String, i32)> {
    let output = cmd.output()?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    // A signal death has no exit code; treat it as EX_SOFTWARE.
    let code = output.status.code().unwrap_or(crate::types::EXIT_SOFTWARE);
    Ok((stdout, stderr, code))
}
