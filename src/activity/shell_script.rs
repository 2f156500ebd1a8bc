//! Ad-hoc shell script activities.
//!
//! The script text is durable state; at run time it is written to `script`
//! in the request's scratch directory and executed from there. Scripts
//! without a shebang line run under /bin/sh.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;

use super::probes::capture_command;
use super::{ActivityError, RunContext, RunOutcome};
use crate::types::Estimate;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellScriptActivity {
    pub script: String,
}

impl ShellScriptActivity {
    pub fn new(script: impl Into<String>) -> Self {
        ShellScriptActivity {
            script: script.into(),
        }
    }

    pub fn comment(&self) -> String {
        // First non-empty, non-shebang line gives operators a hint.
        self.script
            .lines()
            .find(|l| !l.trim().is_empty() && !l.starts_with("#!"))
            .map(|l| format!("Run script: {}", l.trim()))
            .unwrap_or_else(|| "Run script".to_string())
    }

    pub fn estimate(&self) -> Estimate {
        Estimate::default()
    }

    fn script_path(dir: &Path) -> std::path::PathBuf {
        dir.join("script")
    }

    fn write_script(&self, dir: &Path) -> std::io::Result<std::path::PathBuf> {
        let path = Self::script_path(dir);
        let mut file = fs::File::create(&path)?;
        if !self.script.starts_with("#!") {
            file.write_all(b"#!/bin/sh\n")?;
        }
        file.write_all(self.script.as_bytes())?;
        let mut perms = file.metadata()?.permissions();
        perms.set_mode(0o755);
        file.set_permissions(perms)?;
        Ok(path)
    }

    pub fn run(&mut self, ctx: &RunContext<'_>) -> Result<RunOutcome, ActivityError> {
        let path = self.write_script(ctx.dir)?;
        let mut cmd = Command::new(&path);
        cmd.current_dir(ctx.dir);
        let (stdout, stderr, returncode) = capture_command(cmd)?;
        Ok(RunOutcome {
            stdout: Some(stdout),
            stderr: Some(stderr),
            returncode,
            duration: None,
        })
    }

    /// The scratch copy of the script is also written at save time so
    /// operators can inspect what will run without decoding JSON.
    pub fn dump(&self, dir: &Path) -> std::io::Result<()> {
        self.write_script(dir).map(|_| ())
    }

    pub fn load(&mut self, _dir: &Path) -> std::io::Result<()> {
        // The JSON record is authoritative; the scratch copy is rewritten
        // on the next dump/run.
        Ok(())
    }
}
