//! Static task group definitions.
//!
//! A definition is validated once when it is built and never changes for the
//! lifetime of the process.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::errors::ConfigError;
use super::names::{GroupName, StepName};
use super::schedule::Schedule;
use super::state::LastOutcome;

/// Default staleness window for the health check (24h).
pub const DEFAULT_HEALTHCHECK_STALENESS: Duration = Duration::from_secs(24 * 60 * 60);

/// One executable step of a group: a name and the argv to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDefinition {
    name: StepName,
    command: Vec<String>,
}

impl StepDefinition {
    pub fn new(name: impl Into<StepName>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command,
        }
    }

    pub fn name(&self) -> &StepName {
        &self.name
    }

    /// argv: program followed by its arguments.
    pub fn command(&self) -> &[String] {
        &self.command
    }
}

/// A named, scheduled sequence of steps.
#[derive(Debug, Clone)]
pub struct TaskGroupDefinition {
    name: GroupName,
    enabled: bool,
    steps: Vec<StepDefinition>,
    step_timeout: Duration,
    schedule: Schedule,
    healthcheck_staleness: Duration,
}

impl TaskGroupDefinition {
    /// Validates and builds a definition.
    ///
    /// Fails when the group name is blank, there are no steps, a step name is
    /// blank or repeated, a command is empty, or the timeout is zero.
    pub fn new(
        name: GroupName,
        enabled: bool,
        steps: Vec<StepDefinition>,
        step_timeout: Duration,
        schedule: Schedule,
        healthcheck_staleness: Duration,
    ) -> Result<Self, ConfigError> {
        if name.is_blank() {
            return Err(ConfigError::BlankGroupName);
        }
        if steps.is_empty() {
            return Err(ConfigError::NoSteps(name));
        }
        if step_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout(name));
        }

        let mut seen = HashSet::new();
        for step in &steps {
            if step.name.is_blank() {
                return Err(ConfigError::BlankStepName { group: name });
            }
            if !seen.insert(step.name.as_str()) {
                return Err(ConfigError::DuplicateStep {
                    group: name,
                    step: step.name.clone(),
                });
            }
            if step.command.first().is_none_or(|program| program.is_empty()) {
                return Err(ConfigError::EmptyCommand {
                    group: name,
                    step: step.name.clone(),
                });
            }
        }

        Ok(Self {
            name,
            enabled,
            steps,
            step_timeout,
            schedule,
            healthcheck_staleness,
        })
    }

    pub fn name(&self) -> &GroupName {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn step_names(&self) -> impl Iterator<Item = &StepName> {
        self.steps.iter().map(|s| &s.name)
    }

    pub fn first_step(&self) -> &StepDefinition {
        // non-empty: checked in `new`
        &self.steps[0]
    }

    /// The step to run right after `previous`, if the sequence should continue.
    ///
    /// Only a successful step that is not the last one has a successor.
    /// `None`, `Failed`, `TimedOut` and names that are no longer defined
    /// (e.g. after a redeploy) all mean "wait for the next schedule window".
    pub fn step_after(&self, previous: &LastOutcome) -> Option<&StepDefinition> {
        let LastOutcome::StepName(previous) = previous else {
            return None;
        };
        let last = self.steps.len() - 1;
        self.steps[..last]
            .iter()
            .position(|s| &s.name == previous)
            .map(|idx| &self.steps[idx + 1])
    }

    pub fn step_timeout(&self) -> Duration {
        self.step_timeout
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn healthcheck_staleness(&self) -> Duration {
        self.healthcheck_staleness
    }

    pub fn next_due_after(&self, reference: DateTime<Utc>) -> DateTime<Utc> {
        self.schedule.next_due_after(reference)
    }
}
