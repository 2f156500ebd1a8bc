//! Agent configuration.
//!
//! Loaded from a TOML file. The hook tables mirror the classic agent
//! config sections: every entry is `name = "command"`, run through
//! /bin/sh in name order; an empty command is a disabled placeholder.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::activity::PlatformCommands;
use crate::directory::DirectoryEndpoint;

pub const DEFAULT_SPOOLDIR: &str = "/var/spool/maintenance";
pub const DEFAULT_CONFIG_FILE: &str = "/etc/maintd.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_spooldir")]
    pub spooldir: PathBuf,

    /// Enclave file carrying node identity and the Directory secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enc_path: Option<PathBuf>,

    /// Commands run when entering maintenance mode, in name order.
    #[serde(
        default,
        rename = "maintenance-enter",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub maintenance_enter: BTreeMap<String, String>,

    /// Commands run when leaving maintenance mode, in name order.
    #[serde(
        default,
        rename = "maintenance-leave",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub maintenance_leave: BTreeMap<String, String>,

    /// Notice window requested from the Directory after a significant
    /// merge, in seconds.
    #[serde(default = "default_significant_notice_secs")]
    pub significant_notice_secs: u64,

    /// How far past its due time a request may slip before it is
    /// postponed instead of run, in seconds.
    #[serde(default = "default_overdue_grace_secs")]
    pub overdue_grace_secs: u64,

    /// Slack added behind each due request when chaining scheduled
    /// requests into one window, in seconds.
    #[serde(default = "default_due_chain_buffer_secs")]
    pub due_chain_buffer_secs: u64,

    /// Command used for a warm reboot.
    #[serde(default = "default_reboot_cmd")]
    pub reboot_cmd: String,

    /// Command used for a cold boot.
    #[serde(default = "default_poweroff_cmd")]
    pub poweroff_cmd: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<DirectoryEndpoint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformCommands>,
}

fn default_spooldir() -> PathBuf {
    PathBuf::from(DEFAULT_SPOOLDIR)
}

fn default_significant_notice_secs() -> u64 {
    8 * 3600
}

fn default_overdue_grace_secs() -> u64 {
    30 * 60
}

fn default_due_chain_buffer_secs() -> u64 {
    10 * 60
}

fn default_reboot_cmd() -> String {
    "reboot".to_string()
}

fn default_poweroff_cmd() -> String {
    "poweroff".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            spooldir: default_spooldir(),
            enc_path: None,
            maintenance_enter: BTreeMap::new(),
            maintenance_leave: BTreeMap::new(),
            significant_notice_secs: default_significant_notice_secs(),
            overdue_grace_secs: default_overdue_grace_secs(),
            due_chain_buffer_secs: default_due_chain_buffer_secs(),
            reboot_cmd: default_reboot_cmd(),
            poweroff_cmd: default_poweroff_cmd(),
            directory: None,
            platform: None,
        }
    }
}

impl Config {
    /// Loads the config file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(config = %path.display(), "config-file-missing-using-defaults");
                return Ok(Config::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn with_spooldir(mut self, spooldir: impl Into<PathBuf>) -> Self {
        self.spooldir = spooldir.into();
        self
    }

    pub fn significant_notice(&self) -> Duration {
        Duration::seconds(self.significant_notice_secs as i64)
    }

    pub fn overdue_grace(&self) -> Duration {
        Duration::seconds(self.overdue_grace_secs as i64)
    }

    pub fn due_chain_buffer(&self) -> Duration {
        Duration::seconds(self.due_chain_buffer_secs as i64)
    }
}
