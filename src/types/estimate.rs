//! Duration estimates for time budgeting.
//!
//! Estimates are non-negative whole-second durations. Operators write them
//! as "10m", "1h 30m" or plain seconds; the Directory receives them as
//! integer seconds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Add;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default estimate applied when neither the request nor its activity
/// specifies one.
const DEFAULT_SECS: u64 = 10 * 60;

/// A non-negative duration estimate, stored as whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Estimate(u64);

/// Error parsing an estimate from its textual form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EstimateParseError {
    #[error("empty estimate")]
    Empty,

    #[error("invalid estimate component {0:?} (expected NUMBER[s|m|h])")]
    InvalidComponent(String),
}

impl Estimate {
    pub fn from_secs(secs: u64) -> Self {
        Estimate(secs)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.0)
    }

    pub fn as_chrono(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.0 as i64)
    }

    /// Returns the larger of the two estimates.
    pub fn max(self, other: Estimate) -> Estimate {
        Estimate(self.0.max(other.0))
    }
}

impl Default for Estimate {
    fn default() -> Self {
        Estimate(DEFAULT_SECS)
    }
}

impl Add for Estimate {
    type Output = Estimate;

    fn add(self, rhs: Estimate) -> Estimate {
        Estimate(self.0 + rhs.0)
    }
}

impl FromStr for Estimate {
    type Err = EstimateParseError;

    /// Parses "90s", "10m", "1h 30m", or bare seconds ("600").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(EstimateParseError::Empty);
        }
        let mut total = 0u64;
        for word in trimmed.split_whitespace() {
            let (digits, unit) = match word.find(|c: char| !c.is_ascii_digit()) {
                Some(idx) => word.split_at(idx),
                None => (word, ""),
            };
            let value: u64 = digits
                .parse()
                .map_err(|_| EstimateParseError::InvalidComponent(word.to_string()))?;
            let secs = match unit {
                "" | "s" => value,
                "m" => value * 60,
                "h" => value * 3600,
                _ => return Err(EstimateParseError::InvalidComponent(word.to_string())),
            };
            total += secs;
        }
        Ok(Estimate(total))
    }
}

impl fmt::Display for Estimate {
    /// Prints in the same vocabulary the parser accepts: "1h 30m", "14m",
    /// "1m 30s", "45s".
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (hours, rest) = (self.0 / 3600, self.0 % 3600);
        let (minutes, seconds) = (rest / 60, rest % 60);
        let mut parts = Vec::new();
        if hours > 0 {
            parts.push(format!("{}h", hours));
        }
        if minutes > 0 {
            parts.push(format!("{}m", minutes));
        }
        if seconds > 0 || parts.is_empty() {
            parts.push(format!("{}s", seconds));
        }
        write!(f, "{}", parts.join(" "))
    }
}
