//! Execution state of a task group.
//!
//! State transitions:
//! - Idle -> Running            (`start`)
//! - Running -> Idle(StepName)  (`complete`, exit 0)
//! - Running -> Idle(Failed)    (`complete`, non-zero exit)
//! - Running -> Idle(TimedOut)  (`mark_timed_out`, lease-style expiry; nothing is killed)
//!
//! `Failed` and `TimedOut` never match a step name, so a sequence can only
//! continue from a step that actually succeeded.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::errors::TransitionError;
use super::names::{GroupName, StepName};

/// Result of the most recent run of a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "step", rename_all = "snake_case")]
pub enum LastOutcome {
    /// Never run since the record was created.
    None,
    /// That step's process exited 0.
    StepName(StepName),
    /// The last step exited non-zero; remaining steps are abandoned.
    Failed,
    /// The last step outlived its timeout; remaining steps are abandoned.
    TimedOut,
}

impl fmt::Display for LastOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LastOutcome::None => f.write_str("none"),
            LastOutcome::StepName(step) => write!(f, "step:{step}"),
            LastOutcome::Failed => f.write_str("failed"),
            LastOutcome::TimedOut => f.write_str("timed-out"),
        }
    }
}

/// Identity of one loaded copy of a state record, assigned by the store.
///
/// The store only accepts `save` for the copy it currently tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceTag(pub u64);

/// Per-group execution record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionState {
    group_name: GroupName,
    is_running: bool,
    last_outcome: LastOutcome,
    /// The step currently being attempted; becomes `last_outcome` only on success.
    running_step: Option<StepName>,
    run_started_at: DateTime<Utc>,
    run_timeout_at: DateTime<Utc>,
    run_completed_at: DateTime<Utc>,

    /// Process-local cache hint, never persisted.
    #[serde(skip)]
    refresh_at: Option<DateTime<Utc>>,

    #[serde(skip)]
    instance: Option<InstanceTag>,
}

impl ExecutionState {
    /// Record for a group seen for the first time.
    ///
    /// All instants are set to `now`, so the first run waits for the next
    /// schedule boundary instead of starting immediately on deploy.
    pub fn baseline(group_name: GroupName, now: DateTime<Utc>) -> Self {
        Self {
            group_name,
            is_running: false,
            last_outcome: LastOutcome::None,
            running_step: None,
            run_started_at: now,
            run_timeout_at: now,
            run_completed_at: now,
            refresh_at: None,
            instance: None,
        }
    }

    pub fn group_name(&self) -> &GroupName {
        &self.group_name
    }

    pub fn is_running(&self) -> bool {
        self.is_running
    }

    pub fn last_outcome(&self) -> &LastOutcome {
        &self.last_outcome
    }

    pub fn running_step(&self) -> Option<&StepName> {
        self.running_step.as_ref()
    }

    pub fn run_started_at(&self) -> DateTime<Utc> {
        self.run_started_at
    }

    pub fn run_timeout_at(&self) -> DateTime<Utc> {
        self.run_timeout_at
    }

    pub fn run_completed_at(&self) -> DateTime<Utc> {
        self.run_completed_at
    }

    pub fn refresh_at(&self) -> Option<DateTime<Utc>> {
        self.refresh_at
    }

    pub fn instance(&self) -> Option<InstanceTag> {
        self.instance
    }

    /// Attach store-side bookkeeping to a freshly loaded copy.
    pub fn tagged(mut self, instance: InstanceTag, refresh_at: Option<DateTime<Utc>>) -> Self {
        self.instance = Some(instance);
        self.refresh_at = refresh_at;
        self
    }

    /// Copy without process-local fields, as it would be persisted.
    pub fn persisted(&self) -> Self {
        Self {
            refresh_at: None,
            instance: None,
            ..self.clone()
        }
    }

    pub fn is_timed_out_at(&self, now: DateTime<Utc>) -> bool {
        self.is_running && self.run_timeout_at <= now
    }

    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.refresh_at.is_some_and(|at| at <= now)
    }

    pub fn start(
        &mut self,
        step: StepName,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<(), TransitionError> {
        if self.is_running {
            return Err(TransitionError::AlreadyRunning {
                group: self.group_name.clone(),
                step,
            });
        }
        self.is_running = true;
        self.running_step = Some(step);
        self.run_started_at = now;
        self.run_timeout_at = add_duration(now, timeout);
        Ok(())
    }

    pub fn complete(&mut self, now: DateTime<Utc>, succeeded: bool) -> Result<(), TransitionError> {
        if !self.is_running {
            return Err(TransitionError::NotRunning(self.group_name.clone()));
        }
        let step = self.running_step.take();
        self.is_running = false;
        self.run_completed_at = now;
        self.last_outcome = match step {
            Some(step) if succeeded => LastOutcome::StepName(step),
            _ => LastOutcome::Failed,
        };
        Ok(())
    }

    pub fn mark_timed_out(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.is_running {
            return Err(TransitionError::NotRunning(self.group_name.clone()));
        }
        if self.run_timeout_at > now {
            return Err(TransitionError::NotTimedOut {
                group: self.group_name.clone(),
                timeout_at: self.run_timeout_at,
            });
        }
        self.is_running = false;
        self.running_step = None;
        self.run_completed_at = now;
        self.last_outcome = LastOutcome::TimedOut;
        Ok(())
    }
}

fn add_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
