//! Request lifecycle states and the activity exit-code contract.
//!
//! States move through the machine described in `request::Request::
//! update_state`; the exit codes are the well-known sysexits-style values
//! activities and hooks use to signal retry/postpone semantics.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// The lifecycle state of a maintenance request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Waiting for a due time from the Directory.
    Pending,

    /// The due time has been reached; eligible for execution.
    Due,

    /// An attempt is currently executing (or was interrupted mid-attempt).
    Running,

    /// Finished successfully. Terminal.
    Success,

    /// Failed permanently (hard failure or retry limit). Terminal.
    Error,

    /// Cancelled by an operator or by a merge that cancelled out. Terminal.
    Deleted,

    /// Needs a new execution window from the Directory.
    Postpone,
}

/// The terminal states; requests in these states are moved to the archive.
pub const ARCHIVE: [State; 3] = [State::Success, State::Error, State::Deleted];

impl State {
    /// Single-letter representation for listings.
    pub fn short(&self) -> char {
        match self {
            State::Pending => '-',
            State::Due => '*',
            State::Running => '=',
            State::Success => 's',
            State::Error => 'e',
            State::Deleted => 'd',
            State::Postpone => 'p',
        }
    }

    /// Returns true if the request has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        ARCHIVE.contains(self)
    }

    /// Lenient deserializer: unknown or invalid stored states coerce to
    /// `Pending` so a single bad record never wedges the whole spool.
    pub fn deserialize_lenient<'de, D>(deserializer: D) -> Result<State, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "pending" => State::Pending,
            "due" => State::Due,
            "running" => State::Running,
            "success" => State::Success,
            "error" => State::Error,
            "deleted" => State::Deleted,
            "postpone" => State::Postpone,
            _ => State::Pending,
        })
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Pending => "pending",
            State::Due => "due",
            State::Running => "running",
            State::Success => "success",
            State::Error => "error",
            State::Deleted => "deleted",
            State::Postpone => "postpone",
        };
        write!(f, "{}", name)
    }
}

/// Activity/hook exited successfully.
pub const EXIT_SUCCESS: i32 = 0;

/// Activity/hook asks for rescheduling via the Directory (EX_UNAVAILABLE).
pub const EXIT_POSTPONE: i32 = 69;

/// Captured value for failures that never set a returncode (EX_SOFTWARE).
pub const EXIT_SOFTWARE: i32 = 70;

/// Activity/hook asks for a retry in the same window (EX_TEMPFAIL).
pub const EXIT_TEMPFAIL: i32 = 75;

/// Maps an attempt's exit code to the request state it implies.
///
/// Tempfail keeps the request due so it is retried on the next pass;
/// everything that is neither success nor a sentinel is a hard failure.
pub fn evaluate_state(returncode: i32) -> State {
    match returncode {
        EXIT_SUCCESS => State::Success,
        EXIT_TEMPFAIL => State::Due,
        EXIT_POSTPONE => State::Postpone,
        _ => State::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_state() -> impl Strategy<Value = State> {
        prop_oneof![
            Just(State::Pending),
            Just(State::Due),
            Just(State::Running),
            Just(State::Success),
            Just(State::Error),
            Just(State::Deleted),
            Just(State::Postpone),
        ]
    }

    proptest! {
        #[test]
        fn serde_roundtrip(state in arb_state()) {
            let json = serde_json::to_string(&state).unwrap();
            let parsed: State = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(state, parsed);
        }

        #[test]
        fn lenient_accepts_all_valid(state in arb_state()) {
            let json = serde_json::to_string(&state).unwrap();
            let mut de = serde_json::Deserializer::from_str(&json);
            let parsed = State::deserialize_lenient(&mut de).unwrap();
            prop_assert_eq!(state, parsed);
        }
    }

    #[test]
    fn lenient_coerces_junk_to_pending() {
        for junk in ["\"obsolete\"", "\"tempfail\"", "\"\""] {
            let mut de = serde_json::Deserializer::from_str(junk);
            assert_eq!(State::deserialize_lenient(&mut de).unwrap(), State::Pending);
        }
    }

    #[test]
    fn archive_states_are_terminal() {
        assert!(State::Success.is_terminal());
        assert!(State::Error.is_terminal());
        assert!(State::Deleted.is_terminal());
        assert!(!State::Pending.is_terminal());
        assert!(!State::Due.is_terminal());
        assert!(!State::Running.is_terminal());
        assert!(!State::Postpone.is_terminal());
    }

    #[test]
    fn evaluate_state_contract() {
        assert_eq!(evaluate_state(EXIT_SUCCESS), State::Success);
        assert_eq!(evaluate_state(EXIT_TEMPFAIL), State::Due);
        assert_eq!(evaluate_state(EXIT_POSTPONE), State::Postpone);
        assert_eq!(evaluate_state(1), State::Error);
        assert_eq!(evaluate_state(EXIT_SOFTWARE), State::Error);
        assert_eq!(evaluate_state(-1), State::Error);
    }

    #[test]
    fn short_codes_are_distinct() {
        let all = [
            State::Pending,
            State::Due,
            State::Running,
            State::Success,
            State::Error,
            State::Deleted,
            State::Postpone,
        ];
        let mut codes: Vec<char> = all.iter().map(|s| s.short()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }
}
