//! SchedulerBuilder - scheduler の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 開発体験の改善（明確なエラーメッセージ）

use std::collections::HashSet;
use std::sync::Arc;

use super::controller::{Controller, ControllerOptions, RunReport, TerminationSignal};
use super::dispatcher::Dispatcher;
use super::health::{HealthReport, HealthReporter};
use super::status::StatusReporter;
use crate::config::TaskGroups;
use crate::domain::{GroupName, Result, TaskGroupDefinition};
use crate::impls::{MemoryHistory, RefreshingPauseList, StaticPauseSource};
use crate::ports::{Clock, HistoryRecorder, Lease, PauseList, ProcessRunner, StateStore, SystemClock};

/// SchedulerBuilder は scheduler を構築
///
/// # 使用例
/// ```ignore
/// let scheduler = SchedulerBuilder::new()
///     .task_groups(config.task_groups()?)
///     .lease(Arc::new(lease))
///     .state_store(Arc::new(store))
///     .process_runner(Arc::new(TokioProcessRunner::new(".")))
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - lease / state store / process runner は必須（なければ BuildError）
/// - clock / history / pause list は省略するとプロセス内のデフォルト
/// - group 名の重複、ゼロの TTL・待機間隔は build() 時に拒否
#[derive(Default)]
pub struct SchedulerBuilder {
    groups: Vec<TaskGroupDefinition>,
    options: ControllerOptions,
    clock: Option<Arc<dyn Clock>>,
    lease: Option<Arc<dyn Lease>>,
    state_store: Option<Arc<dyn StateStore>>,
    runner: Option<Arc<dyn ProcessRunner>>,
    history: Option<Arc<dyn HistoryRecorder>>,
    pause_list: Option<Arc<dyn PauseList>>,
}

/// BuildError は scheduler 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing collaborator: {0}. It must be provided before build().")]
    MissingCollaborator(&'static str),

    #[error("Task group `{0}` is registered more than once.")]
    DuplicateGroup(GroupName),

    #[error("Controller option `{0}` must be greater than zero.")]
    ZeroOption(&'static str),
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group(mut self, group: TaskGroupDefinition) -> Self {
        self.groups.push(group);
        self
    }

    pub fn task_groups(mut self, groups: TaskGroups) -> Self {
        self.groups.extend(groups.into_definitions());
        self
    }

    pub fn options(mut self, options: ControllerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn lease(mut self, lease: Arc<dyn Lease>) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn state_store(mut self, state_store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(state_store);
        self
    }

    pub fn process_runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn history(mut self, history: Arc<dyn HistoryRecorder>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn pause_list(mut self, pause_list: Arc<dyn PauseList>) -> Self {
        self.pause_list = Some(pause_list);
        self
    }

    pub fn build(self) -> std::result::Result<Scheduler, BuildError> {
        let lease = self.lease.ok_or(BuildError::MissingCollaborator("lease"))?;
        let state_store = self
            .state_store
            .ok_or(BuildError::MissingCollaborator("state_store"))?;
        let runner = self
            .runner
            .ok_or(BuildError::MissingCollaborator("process_runner"))?;

        if self.options.lease_ttl.is_zero() {
            return Err(BuildError::ZeroOption("lease_ttl"));
        }
        if self.options.lease_check_interval.is_zero() {
            return Err(BuildError::ZeroOption("lease_check_interval"));
        }

        let mut seen = HashSet::new();
        if let Some(duplicate) = self.groups.iter().find(|g| !seen.insert(g.name())) {
            return Err(BuildError::DuplicateGroup(duplicate.name().clone()));
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let history = self
            .history
            .unwrap_or_else(|| Arc::new(MemoryHistory::new()));
        let pause_list = self.pause_list.unwrap_or_else(|| {
            Arc::new(RefreshingPauseList::new(
                Arc::new(StaticPauseSource::new()),
                clock.clone(),
            ))
        });

        let health = HealthReporter::new(self.groups.clone(), history.clone(), clock.clone());
        let dispatcher = Dispatcher::new(
            self.groups,
            clock.clone(),
            state_store,
            pause_list,
            runner,
            StatusReporter::new(history),
        );
        let controller = Controller::new(dispatcher, lease, clock, self.options);

        Ok(Scheduler { controller, health })
    }
}

/// Scheduler は構築済みの controller と health 評価のまとまり
pub struct Scheduler {
    controller: Controller<Dispatcher>,
    health: HealthReporter,
}

impl Scheduler {
    pub fn termination_signal(&self) -> TerminationSignal {
        self.controller.termination_signal()
    }

    pub fn controller(&self) -> &Controller<Dispatcher> {
        &self.controller
    }

    pub async fn run(&mut self) -> RunReport {
        self.controller.run().await
    }

    pub async fn health_state(&self) -> Result<HealthReport> {
        self.health.health_state().await
    }
}
