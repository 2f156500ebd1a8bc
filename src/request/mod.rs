//! Maintenance requests: the durable wrapper around one activity.
//!
//! A request owns its activity exclusively, tracks every execution attempt,
//! and carries the scheduling metadata the Directory assigns. State only
//! changes through [`Request::update_state`] or the explicit terminal
//! assignments the manager makes.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::activity::{Activity, RunContext};
use crate::types::{evaluate_state, Estimate, RequestId, State};

/// Attempts beyond this force the request into `error`.
pub const MAX_RETRIES: usize = 48;

/// Append-only record of one execution try. Immutable once finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub started: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returncode: Option<i32>,

    /// Seconds. Falls back to `finished - started` when the activity does
    /// not supply its own timing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl Attempt {
    pub fn new(started: DateTime<Utc>) -> Self {
        Attempt {
            started,
            finished: None,
            stdout: None,
            stderr: None,
            returncode: None,
            duration: None,
        }
    }

    /// Records activity outcomes at the end of a run.
    pub fn record(&mut self, activity: &Activity, finished: DateTime<Utc>) {
        self.finished = Some(finished);
        self.stdout = activity.stdout.clone();
        self.stderr = activity.stderr.clone();
        self.returncode = activity.returncode;
        self.duration = activity
            .duration
            .or_else(|| Some((finished - self.started).num_milliseconds() as f64 / 1000.0));
    }
}

/// Outcome of merging a new proposal into an existing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMergeResult {
    /// Incompatible activities; try the next candidate.
    NoMerge,

    /// Absorbed without externally visible impact.
    Update,

    /// Absorbed, and operators deserve a fresh notice window.
    SignificantUpdate,

    /// The merge cancelled the request out; delete it.
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,

    pub activity: Activity,

    #[serde(deserialize_with = "State::deserialize_lenient")]
    pub state: State,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<Attempt>,

    /// Operator comment; falls back to the activity's own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    /// Estimate override; falls back to the activity's own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate: Option<Estimate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scheduled_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_due: Option<DateTime<Utc>>,

    /// Backing-store directory; reattached by the store on load.
    #[serde(skip)]
    pub dir: Option<PathBuf>,
}

impl Request {
    pub fn new(activity: Activity) -> Self {
        Request {
            id: RequestId::generate(),
            activity,
            state: State::Pending,
            attempts: Vec::new(),
            comment: None,
            estimate: None,
            added_at: None,
            updated_at: None,
            last_scheduled_at: None,
            next_due: None,
            dir: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_estimate(mut self, estimate: Estimate) -> Self {
        self.estimate = Some(estimate);
        self
    }

    /// The comment shown to operators and the Directory.
    pub fn effective_comment(&self) -> String {
        self.comment
            .clone()
            .unwrap_or_else(|| self.activity.comment())
    }

    /// The estimate submitted to the Directory.
    pub fn effective_estimate(&self) -> Estimate {
        self.estimate.unwrap_or_else(|| self.activity.estimate())
    }

    /// Duration of the last attempt in seconds.
    pub fn duration(&self) -> Option<f64> {
        self.attempts.last().and_then(|a| a.duration)
    }

    /// True when the last attempt hit the tempfail sentinel and the
    /// request is still live.
    pub fn tempfail(&self) -> bool {
        !self.state.is_terminal()
            && self
                .attempts
                .last()
                .and_then(|a| a.returncode)
                .map_or(false, |rc| rc == crate::types::EXIT_TEMPFAIL)
    }

    /// True when the due time passed more than `grace` ago.
    pub fn overdue(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        match self.next_due {
            Some(due) => now > due + grace,
            None => false,
        }
    }

    /// Sort key for execution and evaluation order: `(next_due, added_at,
    /// id)`, with missing timestamps ordering last.
    pub fn sort_key(&self) -> (bool, Option<DateTime<Utc>>, bool, Option<DateTime<Utc>>, RequestId) {
        (
            self.next_due.is_none(),
            self.next_due,
            self.added_at.is_none(),
            self.added_at,
            self.id.clone(),
        )
    }

    /// Sets a new due time (always tz-aware by construction) and reapplies
    /// the state machine. Returns true if the due time actually changed.
    pub fn update_due(
        &mut self,
        due: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        overdue_grace: Duration,
    ) -> bool {
        let old = self.next_due;
        self.next_due = due;
        self.update_state(now, overdue_grace);
        self.next_due != old
    }

    /// Applies time-dependent state transitions for the instant `now`.
    ///
    /// Pure in `now`: applying the same instant twice yields the same
    /// state both times. Terminal states never change.
    pub fn update_state(&mut self, now: DateTime<Utc>, overdue_grace: Duration) -> State {
        if self.state.is_terminal() {
            return self.state;
        }
        if self.state == State::Postpone {
            self.state = State::Pending;
        }
        if self.state == State::Pending && self.next_due.is_some_and(|due| now >= due) {
            self.state = State::Due;
        }
        if self.state == State::Due {
            // Overdue wins over the retry limit: a request that slid past
            // its window needs rescheduling, not a failure verdict.
            if self.overdue(now, overdue_grace) {
                self.state = State::Postpone;
            } else if self.attempts.len() > MAX_RETRIES {
                self.state = State::Error;
            }
        }
        self.state
    }

    /// Executes the activity for one attempt.
    ///
    /// The caller is responsible for persisting before (state `running`)
    /// and after. Failures never escape: they are captured into the
    /// attempt record and the resulting state.
    pub fn execute(&mut self, ctx: &RunContext<'_>) -> State {
        let mut attempt = Attempt::new(Utc::now());
        self.state = State::Running;
        self.activity.run(ctx);
        attempt.record(&self.activity, Utc::now());
        self.attempts.push(attempt);
        self.state = evaluate_state(self.activity.returncode.unwrap_or(crate::types::EXIT_SOFTWARE));
        self.updated_at = Some(Utc::now());
        self.state
    }

    /// Merges another request's proposal into this one.
    ///
    /// On an effective merge the latest comment wins (distinct comments
    /// concatenate) and the larger estimate is kept.
    pub fn merge(&mut self, other: &Request) -> RequestMergeResult {
        let result = self.activity.merge(&other.activity);
        if !result.merged {
            return RequestMergeResult::NoMerge;
        }
        if !result.is_effective {
            return RequestMergeResult::Remove;
        }

        self.comment = match (self.comment.take(), other.comment.clone()) {
            (Some(mine), Some(theirs)) if mine != theirs => {
                Some(format!("{}\n\n{}", mine, theirs))
            }
            (Some(mine), _) => Some(mine),
            (None, theirs) => theirs,
        };
        self.estimate = Some(self.effective_estimate().max(other.effective_estimate()));

        if result.is_significant {
            tracing::info!(
                request = %self.id,
                changes = ?result.changes,
                "request-merge-significant"
            );
            RequestMergeResult::SignificantUpdate
        } else {
            RequestMergeResult::Update
        }
    }

    /// One listing line: state code, short id, schedule, estimate, comment.
    pub fn list_line(&self) -> String {
        let mut line = format!(
            "{}  {}  {:20}  {:8}  {}",
            self.state.short(),
            self.id.short(),
            self.next_due
                .map(|due| due.format("%Y-%m-%d %H:%M UTC").to_string())
                .unwrap_or_else(|| "--- TBA ---".to_string()),
            self.effective_estimate().to_string(),
            self.effective_comment().lines().next().unwrap_or(""),
        );
        if let Some(duration) = self.duration() {
            line.push_str(&format!(
                " (duration: {})",
                Estimate::from_secs(duration.max(0.0) as u64)
            ));
        }
        line
    }
}
