//! Dispatcher - poll ごとの起動判定
//!
//! # 1 tick の流れ
//! 1. reconcile: 終了した子プロセスを回収し、state を complete して保存してから履歴に記録
//! 2. 有効な group を設定順に評価
//!    - 実行中: timeout していれば TimedOut にする（プロセスは kill しない）
//!    - 一時停止中: 何もしない（state も触らない）
//!    - 前回成功した step の続きがあれば即起動
//!    - なければ `next_due_after(run_completed_at) <= now` のとき最初の step を起動
//!
//! in-flight のハンドルは group ごとに最大 1 つで、このインスタンスだけが持ちます。

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::status::StatusReporter;
use crate::domain::{ExecutionState, GroupName, Result, StepDefinition, StepName, TaskGroupDefinition};
use crate::ports::{Clock, PauseList, ProcessHandle, ProcessRunner, StateStore};

/// Controller から見た dispatcher の境界
#[async_trait::async_trait]
pub trait Dispatch: Send {
    /// reconcile の後、起動すべき group を起動する
    async fn tick(&mut self) -> Result<()>;

    /// 終了した子プロセスだけを回収する（drain 中も呼ばれる）
    async fn reconcile(&mut self) -> Result<()>;

    fn has_in_flight_work(&self) -> bool;
}

struct InFlight {
    step: StepName,
    started_at: DateTime<Utc>,
    handle: Box<dyn ProcessHandle>,
}

pub struct Dispatcher {
    groups: Arc<[TaskGroupDefinition]>,
    clock: Arc<dyn Clock>,
    state_store: Arc<dyn StateStore>,
    pause_list: Arc<dyn PauseList>,
    runner: Arc<dyn ProcessRunner>,
    reporter: StatusReporter,
    in_flight: BTreeMap<GroupName, InFlight>,
}

impl Dispatcher {
    pub fn new(
        groups: Vec<TaskGroupDefinition>,
        clock: Arc<dyn Clock>,
        state_store: Arc<dyn StateStore>,
        pause_list: Arc<dyn PauseList>,
        runner: Arc<dyn ProcessRunner>,
        reporter: StatusReporter,
    ) -> Self {
        Self {
            groups: groups.into(),
            clock,
            state_store,
            pause_list,
            runner,
            reporter,
            in_flight: BTreeMap::new(),
        }
    }

    pub fn groups(&self) -> &[TaskGroupDefinition] {
        &self.groups
    }

    /// このインスタンスが起動して、まだ回収していない group
    pub fn in_flight_groups(&self) -> impl Iterator<Item = &GroupName> {
        self.in_flight.keys()
    }

    async fn dispatch_group(&mut self, group: &TaskGroupDefinition) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state_store.get_state(group.name()).await?;

        if state.is_running() {
            if state.is_timed_out_at(now) {
                self.reporter.timed_out(&state, now);
                state.mark_timed_out(now)?;
                self.state_store.save(&state).await?;
                if self.in_flight.remove(group.name()).is_some() {
                    tracing::debug!(group = %group.name(), "abandoned handle of timed-out step");
                }
            }
            return Ok(());
        }

        if self.pause_list.is_paused(group.name()).await? {
            tracing::debug!(group = %group.name(), "task group is paused");
            return Ok(());
        }

        let step = match group.step_after(state.last_outcome()) {
            Some(next) => next,
            None => {
                let due = group.next_due_after(state.run_completed_at());
                if due > now {
                    return Ok(());
                }
                group.first_step()
            }
        };

        self.launch(group, step, state, now).await
    }

    async fn launch(
        &mut self,
        group: &TaskGroupDefinition,
        step: &StepDefinition,
        mut state: ExecutionState,
        now: DateTime<Utc>,
    ) -> Result<()> {
        state.start(step.name().clone(), now, group.step_timeout())?;
        self.state_store.save(&state).await?;
        self.reporter.starting(group.name(), step.name());

        let handle = self
            .runner
            .run(group.name(), step, group.step_timeout())
            .await?;

        let previous = self.in_flight.insert(
            group.name().clone(),
            InFlight {
                step: step.name().clone(),
                started_at: now,
                handle,
            },
        );
        if let Some(previous) = previous {
            tracing::warn!(
                group = %group.name(),
                step = %previous.step,
                "replaced a handle whose run was already settled elsewhere"
            );
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Dispatch for Dispatcher {
    async fn tick(&mut self) -> Result<()> {
        self.reconcile().await?;

        let groups = Arc::clone(&self.groups);
        for group in groups.iter().filter(|g| g.is_enabled()) {
            self.dispatch_group(group).await?;
        }
        Ok(())
    }

    async fn reconcile(&mut self) -> Result<()> {
        let finished: Vec<GroupName> = self
            .in_flight
            .iter_mut()
            .filter_map(|(group, flight)| flight.handle.is_terminated().then(|| group.clone()))
            .collect();

        for group in finished {
            let Some(flight) = self.in_flight.get_mut(&group) else {
                continue;
            };
            flight.handle.flush_output().await;
            let step = flight.step.clone();
            let started_at = flight.started_at;
            let exit_code = flight.handle.exit_code();

            let now = self.clock.now();
            let mut state = self.state_store.get_state(&group).await?;
            let same_run = state.is_running()
                && state.running_step() == Some(&step)
                && state.run_started_at() == started_at;
            if same_run {
                state.complete(now, exit_code == 0)?;
                self.state_store.save(&state).await?;
            } else {
                tracing::warn!(
                    group = %group,
                    step = %step,
                    exit_code,
                    last_outcome = %state.last_outcome(),
                    "step finished after its run was already settled; state left unchanged"
                );
            }

            // state を保存できたときだけ手放す。失敗すれば次の reconcile でやり直す
            self.in_flight.remove(&group);
            self.reporter
                .completed(&group, &step, started_at, now, exit_code)
                .await?;
        }
        Ok(())
    }

    fn has_in_flight_work(&self) -> bool {
        !self.in_flight.is_empty()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedRunner;
    use super::*;
    use crate::domain::definition::fixtures::group;
    use crate::domain::{InfrastructureError, LastOutcome};
    use crate::impls::{MemoryHistory, MemoryStateBackend, RefreshingPauseList, StaticPauseSource};
    use crate::ports::{HistoryRecorder, ManualClock};
    use chrono::{TimeDelta, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Harness {
        dispatcher: Dispatcher,
        clock: Arc<ManualClock>,
        backend: MemoryStateBackend,
        runner: ScriptedRunner,
        pauses: StaticPauseSource,
        history: MemoryHistory,
    }

    impl Harness {
        fn new(groups: Vec<TaskGroupDefinition>) -> Self {
            let clock = Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 30).unwrap(),
            ));
            let backend = MemoryStateBackend::new();
            Self::with_backend(groups, clock, backend)
        }

        fn with_backend(
            groups: Vec<TaskGroupDefinition>,
            clock: Arc<ManualClock>,
            backend: MemoryStateBackend,
        ) -> Self {
            let runner = ScriptedRunner::default();
            let pauses = StaticPauseSource::new();
            let history = MemoryHistory::new();
            let dispatcher = Dispatcher::new(
                groups,
                clock.clone(),
                Arc::new(backend.store(clock.clone())),
                Arc::new(RefreshingPauseList::new(Arc::new(pauses.clone()), clock.clone())),
                Arc::new(runner.clone()),
                StatusReporter::new(Arc::new(history.clone())),
            );
            Self {
                dispatcher,
                clock,
                backend,
                runner,
                pauses,
                history,
            }
        }

        async fn row(&self, name: &str) -> Option<ExecutionState> {
            self.backend.row(&GroupName::new(name)).await
        }

        fn advance(&self, secs: u64) {
            self.clock.advance(Duration::from_secs(secs));
        }
    }

    fn launched(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(g, s)| (g.to_string(), s.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn first_observation_creates_baseline_without_launching() {
        let mut h = Harness::new(vec![group("per-minute", "* * * * *", &["only"])]);

        h.dispatcher.tick().await.unwrap();
        assert!(h.runner.launches().is_empty());
        let row = h.row("per-minute").await.unwrap();
        assert_eq!(row.last_outcome(), &LastOutcome::None);
        assert_eq!(row.run_completed_at(), h.clock.now());

        // 12:00:59 ではまだ
        h.advance(29);
        h.dispatcher.tick().await.unwrap();
        assert!(h.runner.launches().is_empty());

        // 12:01:00 で起動
        h.advance(1);
        h.dispatcher.tick().await.unwrap();
        assert_eq!(h.runner.launches(), launched(&[("per-minute", "only")]));
        assert!(h.dispatcher.has_in_flight_work());
    }

    #[tokio::test]
    async fn running_group_is_not_started_twice() {
        let mut h = Harness::new(vec![group("g", "every 10 seconds", &["only"])]);
        h.dispatcher.tick().await.unwrap();
        h.advance(10);
        h.dispatcher.tick().await.unwrap();

        for _ in 0..5 {
            h.advance(5);
            h.dispatcher.tick().await.unwrap();
        }
        assert_eq!(h.runner.launches().len(), 1);
        assert!(h.row("g").await.unwrap().is_running());
    }

    #[tokio::test]
    async fn successful_step_continues_with_the_next_one_in_the_same_tick() {
        let mut h = Harness::new(vec![group("g", "* * * * *", &["first", "second"])]);
        h.dispatcher.tick().await.unwrap();
        h.advance(30);
        h.dispatcher.tick().await.unwrap();

        h.runner.finish("g", 0);
        h.advance(1);
        h.dispatcher.tick().await.unwrap();
        assert_eq!(
            h.runner.launches(),
            launched(&[("g", "first"), ("g", "second")])
        );
        let row = h.row("g").await.unwrap();
        assert_eq!(row.running_step().map(|s| s.as_str()), Some("second"));
        assert_eq!(
            row.last_outcome(),
            &LastOutcome::StepName(StepName::new("first"))
        );

        h.runner.finish("g", 0);
        h.advance(1);
        h.dispatcher.tick().await.unwrap();
        assert_eq!(h.runner.launches().len(), 2);
        assert!(!h.dispatcher.has_in_flight_work());

        let row = h.row("g").await.unwrap();
        assert_eq!(
            row.last_outcome(),
            &LastOutcome::StepName(StepName::new("second"))
        );
        assert_eq!(h.history.list_current_states().await.unwrap().len(), 2);

        // 次の窓（12:02:00）で最初から
        h.advance(57);
        h.dispatcher.tick().await.unwrap();
        assert_eq!(h.runner.launches().len(), 2);
        h.advance(1);
        h.dispatcher.tick().await.unwrap();
        assert_eq!(h.runner.launches().last().unwrap().1, "first");
    }

    #[tokio::test]
    async fn failed_step_abandons_the_rest_of_the_sequence() {
        let mut h = Harness::new(vec![group("g", "* * * * *", &["first", "second"])]);
        h.dispatcher.tick().await.unwrap();
        h.advance(30);
        h.dispatcher.tick().await.unwrap();

        h.runner.finish("g", 2);
        h.advance(1);
        h.dispatcher.tick().await.unwrap();

        assert_eq!(h.runner.launches(), launched(&[("g", "first")]));
        let row = h.row("g").await.unwrap();
        assert_eq!(row.last_outcome(), &LastOutcome::Failed);
        let history = h.history.list_current_states().await.unwrap();
        assert_eq!(history[0].last_exit_code, 2);
        assert!(history[0].last_success_at.is_none());
    }

    #[tokio::test]
    async fn paused_group_is_skipped_and_left_untouched() {
        let mut h = Harness::new(vec![group("g", "every 10 seconds", &["only"])]);
        h.dispatcher.tick().await.unwrap();
        let before = h.row("g").await.unwrap();

        h.pauses
            .pause(GroupName::new("g"), h.clock.now() + TimeDelta::minutes(5))
            .await;
        // pause list は 60 秒ごとに読み直す
        h.advance(60);
        h.dispatcher.tick().await.unwrap();
        assert!(h.runner.launches().is_empty());
        assert_eq!(h.row("g").await.unwrap(), before);

        h.advance(240);
        h.dispatcher.tick().await.unwrap();
        assert_eq!(h.runner.launches().len(), 1);
    }

    #[tokio::test]
    async fn pause_also_holds_back_the_continuation_step() {
        let mut h = Harness::new(vec![group("g", "* * * * *", &["first", "second"])]);
        h.dispatcher.tick().await.unwrap();
        h.advance(30);
        h.dispatcher.tick().await.unwrap();
        assert_eq!(h.runner.launches(), launched(&[("g", "first")]));

        // 12:01:00 に 12:06:00 まで停止
        h.pauses
            .pause(GroupName::new("g"), h.clock.now() + TimeDelta::minutes(5))
            .await;
        h.runner.finish("g", 0);

        // 12:01:30: first の完了は回収されるが second は起動しない
        h.advance(30);
        h.dispatcher.tick().await.unwrap();
        assert_eq!(h.runner.launches(), launched(&[("g", "first")]));
        let settled = h.row("g").await.unwrap();
        assert!(!settled.is_running());
        assert_eq!(
            settled.last_outcome(),
            &LastOutcome::StepName(StepName::new("first"))
        );

        h.advance(60);
        h.dispatcher.tick().await.unwrap();
        assert_eq!(h.runner.launches(), launched(&[("g", "first")]));
        assert_eq!(h.row("g").await.unwrap(), settled);

        // 12:06:00 で停止が切れ、続きの second から
        h.advance(210);
        h.dispatcher.tick().await.unwrap();
        assert_eq!(
            h.runner.launches(),
            launched(&[("g", "first"), ("g", "second")])
        );
    }

    #[tokio::test]
    async fn overdue_step_is_marked_timed_out_and_its_handle_abandoned() {
        let mut h = Harness::new(vec![group("g", "* * * * *", &["first", "second"])]);
        h.dispatcher.tick().await.unwrap();
        h.advance(30);
        h.dispatcher.tick().await.unwrap();
        assert!(h.dispatcher.has_in_flight_work());

        h.advance(59);
        h.dispatcher.tick().await.unwrap();
        assert!(h.row("g").await.unwrap().is_running());

        h.advance(1);
        h.dispatcher.tick().await.unwrap();
        let row = h.row("g").await.unwrap();
        assert!(!row.is_running());
        assert_eq!(row.last_outcome(), &LastOutcome::TimedOut);
        assert!(!h.dispatcher.has_in_flight_work());
        assert_eq!(h.runner.launches().len(), 1);

        // 遅れて終了しても何も起きない（ハンドルは既に手放している）
        h.runner.finish("g", 0);
        h.dispatcher.tick().await.unwrap();
        assert_eq!(h.runner.launches().len(), 1);
        assert!(h.history.list_current_states().await.unwrap().is_empty());

        // 次は timeout 時刻 (12:02:00) から数えた次の窓で、最初の step から
        h.advance(59);
        h.dispatcher.tick().await.unwrap();
        assert_eq!(h.runner.launches().len(), 1);

        h.advance(1);
        h.dispatcher.tick().await.unwrap();
        assert_eq!(
            h.runner.launches(),
            launched(&[("g", "first"), ("g", "first")])
        );
    }

    #[tokio::test]
    async fn completion_after_another_instance_settled_the_run_leaves_state_alone() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 30).unwrap(),
        ));
        let backend = MemoryStateBackend::new();
        let groups = vec![group("g", "* * * * *", &["only"])];
        let mut a = Harness::with_backend(groups.clone(), clock.clone(), backend.clone());
        let mut b = Harness::with_backend(groups, clock.clone(), backend);

        a.dispatcher.tick().await.unwrap();
        a.advance(30);
        a.dispatcher.tick().await.unwrap();

        // b が timeout を判定
        a.advance(60);
        b.dispatcher.tick().await.unwrap();
        assert_eq!(
            a.row("g").await.unwrap().last_outcome(),
            &LastOutcome::TimedOut
        );

        // a のプロセスが後から終了
        a.runner.finish("g", 0);
        a.advance(1);
        a.dispatcher.reconcile().await.unwrap();

        assert!(!a.dispatcher.has_in_flight_work());
        assert_eq!(
            a.row("g").await.unwrap().last_outcome(),
            &LastOutcome::TimedOut
        );
        // 履歴には残る
        assert_eq!(a.history.list_current_states().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disabled_groups_are_never_touched() {
        let disabled = TaskGroupDefinition::new(
            GroupName::new("off"),
            false,
            vec![StepDefinition::new("s", vec!["true".to_string()])],
            Duration::from_secs(60),
            crate::domain::Schedule::every_seconds(1).unwrap(),
            crate::domain::DEFAULT_HEALTHCHECK_STALENESS,
        )
        .unwrap();
        let mut h = Harness::new(vec![disabled, group("on", "every 1 seconds", &["s"])]);

        h.dispatcher.tick().await.unwrap();
        h.advance(5);
        h.dispatcher.tick().await.unwrap();

        assert!(h.row("off").await.is_none());
        assert_eq!(h.runner.launches(), launched(&[("on", "s")]));
        assert_eq!(
            h.dispatcher.in_flight_groups().map(|g| g.as_str()).collect::<Vec<_>>(),
            vec!["on"]
        );
    }

    /// save を指定回数だけ失敗させる
    struct FlakyStore {
        inner: crate::impls::MemoryStateStore,
        failures: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl StateStore for FlakyStore {
        async fn get_state(&self, group: &GroupName) -> Result<ExecutionState> {
            self.inner.get_state(group).await
        }

        async fn save(&self, state: &ExecutionState) -> Result<()> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(InfrastructureError::StateStore("disk full".into()).into());
            }
            self.inner.save(state).await
        }
    }

    #[derive(Default)]
    struct CountingHistory {
        inner: MemoryHistory,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl HistoryRecorder for CountingHistory {
        async fn record_completion(
            &self,
            group: &GroupName,
            step: &StepName,
            end: DateTime<Utc>,
            exit_code: i32,
        ) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.record_completion(group, step, end, exit_code).await
        }

        async fn list_current_states(&self) -> Result<Vec<crate::ports::HistoryEntry>> {
            self.inner.list_current_states().await
        }
    }

    #[tokio::test]
    async fn completion_is_recorded_once_after_a_failed_save() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 30).unwrap(),
        ));
        let backend = MemoryStateBackend::new();
        let store = Arc::new(FlakyStore {
            inner: backend.store(clock.clone()),
            failures: AtomicUsize::new(0),
        });
        let runner = ScriptedRunner::default();
        let history = Arc::new(CountingHistory::default());
        let mut dispatcher = Dispatcher::new(
            vec![group("g", "* * * * *", &["only"])],
            clock.clone(),
            store.clone(),
            Arc::new(RefreshingPauseList::new(
                Arc::new(StaticPauseSource::new()),
                clock.clone(),
            )),
            Arc::new(runner.clone()),
            StatusReporter::new(history.clone()),
        );

        dispatcher.tick().await.unwrap();
        clock.advance(Duration::from_secs(30));
        dispatcher.tick().await.unwrap();
        assert_eq!(runner.launches(), launched(&[("g", "only")]));

        store.failures.store(1, Ordering::SeqCst);
        runner.finish("g", 0);
        clock.advance(Duration::from_secs(1));
        assert!(dispatcher.reconcile().await.is_err());
        assert!(dispatcher.has_in_flight_work());
        assert_eq!(history.calls.load(Ordering::SeqCst), 0);
        assert!(backend.row(&GroupName::new("g")).await.unwrap().is_running());

        dispatcher.reconcile().await.unwrap();
        assert!(!dispatcher.has_in_flight_work());
        assert_eq!(history.calls.load(Ordering::SeqCst), 1);
        let row = backend.row(&GroupName::new("g")).await.unwrap();
        assert_eq!(row.last_outcome(), &LastOutcome::StepName(StepName::new("only")));

        dispatcher.reconcile().await.unwrap();
        assert_eq!(history.calls.load(Ordering::SeqCst), 1);
    }
}
