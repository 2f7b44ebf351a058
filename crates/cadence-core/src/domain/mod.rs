//! Domain model (names, schedules, definitions, execution state, errors).
//!
//! I/O を一切持たない純粋なモデルです。時刻は常に引数で受け取ります。

pub mod names;
pub mod schedule;
pub mod definition;
pub mod state;
pub mod errors;

pub use self::names::{GroupName, Name, NameMarker, StepName};
pub use self::schedule::{CronExpression, CronFieldValue, CronFields, Schedule};
pub use self::definition::{StepDefinition, TaskGroupDefinition, DEFAULT_HEALTHCHECK_STALENESS};
pub use self::state::{ExecutionState, InstanceTag, LastOutcome};
pub use self::errors::{
    CadenceError, ConfigError, CoordinationError, ErrorKind, InfrastructureError, Result,
    ScheduleError, TransitionError,
};
