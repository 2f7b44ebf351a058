//! Errors - エラー型と分類
//!
//! スケジューラのエラーは運用上 3 種類に分類されます。
//! - Configuration: 起動時に検出（fail-fast）。dispatch 中には発生しない
//! - Coordination: 状態管理の使い方の誤り（バグ）。正しい使い方では発生しない
//! - Infrastructure: lease / state store / process 起動などの外部障害
//!
//! タスクの非ゼロ終了やタイムアウトはエラーではなく、通常の結果として扱います。

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::names::{GroupName, StepName};

/// ErrorKind は運用分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Coordination,
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid interval schedule `{0}` (expected `every N seconds` with N > 0)")]
    InvalidInterval(String),

    #[error("cron expression `{expression}` has {found} fields, expected 5")]
    FieldCount { expression: String, found: usize },

    #[error("invalid {field} field `{value}`: {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("cron expression `{0}` can never fire")]
    NeverFires(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("task group name must not be blank")]
    BlankGroupName,

    #[error("duplicate task group `{0}`")]
    DuplicateGroup(GroupName),

    #[error("task group `{0}` has no steps")]
    NoSteps(GroupName),

    #[error("task group `{group}` has a step with a blank name")]
    BlankStepName { group: GroupName },

    #[error("task group `{group}` defines step `{step}` more than once")]
    DuplicateStep { group: GroupName, step: StepName },

    #[error("step `{group}:{step}` has an empty command")]
    EmptyCommand { group: GroupName, step: StepName },

    #[error("task group `{0}` must have a timeout greater than zero")]
    ZeroTimeout(GroupName),

    #[error("task group `{group}` has an invalid schedule: {source}")]
    Schedule {
        group: GroupName,
        #[source]
        source: ScheduleError,
    },

    #[error("controller setting `{0}` must be greater than zero")]
    ZeroControllerSetting(&'static str),
}

/// ExecutionState の遷移条件違反
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("cannot start `{group}:{step}`: group is already running")]
    AlreadyRunning { group: GroupName, step: StepName },

    #[error("task group `{0}` is not running")]
    NotRunning(GroupName),

    #[error("task group `{group}` has not timed out (timeout at {timeout_at})")]
    NotTimedOut {
        group: GroupName,
        timeout_at: DateTime<Utc>,
    },
}

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("state object for `{0}` is out of sync with the store")]
    StateOutOfSync(GroupName),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("lease backend error: {0}")]
    Lease(String),

    #[error("state store error: {0}")]
    StateStore(String),

    #[error("execution history error: {0}")]
    History(String),

    #[error("pause list error: {0}")]
    PauseList(String),

    #[error("failed to start `{group}:{step}`: {source}")]
    Spawn {
        group: GroupName,
        step: StepName,
        #[source]
        source: std::io::Error,
    },
}

/// CadenceError は crate 全体のエラー
#[derive(Debug, Error)]
pub enum CadenceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error(transparent)]
    Infrastructure(#[from] InfrastructureError),
}

impl CadenceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CadenceError::Config(_) => ErrorKind::Configuration,
            CadenceError::Coordination(_) => ErrorKind::Coordination,
            CadenceError::Infrastructure(_) => ErrorKind::Infrastructure,
        }
    }
}

impl From<TransitionError> for CadenceError {
    fn from(err: TransitionError) -> Self {
        CadenceError::Coordination(CoordinationError::Transition(err))
    }
}

pub type Result<T, E = CadenceError> = std::result::Result<T, E>;
