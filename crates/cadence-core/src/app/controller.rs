//! Controller - lease 取得、primary ループ、drain
//!
//! # フェーズ
//! ```text
//! AcquiringLease ──取得──▶ Primary ──signal/deadline──▶ (release) ──▶ Draining ──▶ Terminated
//!        │                    │
//!        │                    └──エラー──▶ (release しない) ──▶ Draining
//!        └──signal/deadline──────────────────────────────────────▶ Draining
//! ```
//!
//! - deadline は構築時に `now + max_runtime` で一度だけ計算し、待機と primary の両方に効く
//! - primary 中は 1 秒ごとに tick し、残り時間が TTL の半分を切ったら lease を延長する
//! - drain は自分が起動した子プロセスがすべて終わるまで続く（signal も deadline も無視）
//! - signal はループの区切りでのみ確認する

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::watch;

use super::dispatcher::{Dispatch, Dispatcher};
use crate::domain::Result;
use crate::ports::{Clock, Lease};

pub const DEFAULT_LEASE_NAME: &str = "primary-cron-controller";
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_LEASE_CHECK_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RUNTIME: Duration = Duration::from_secs(3600);

/// primary ループと drain の間隔（固定）
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AcquiringLease,
    Primary,
    Draining,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerOptions {
    pub lease_ttl: Duration,
    pub lease_check_interval: Duration,
    pub max_runtime: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            lease_ttl: DEFAULT_LEASE_TTL,
            lease_check_interval: DEFAULT_LEASE_CHECK_INTERVAL,
            max_runtime: DEFAULT_MAX_RUNTIME,
        }
    }
}

/// 終了要求のハンドル（clone して signal handler などに渡す）
///
/// 要求は助言的で、controller はループの区切りでのみ確認します。
#[derive(Debug, Clone)]
pub struct TerminationSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl TerminationSignal {
    fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn signal(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_signalled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// primary ループを抜けた理由
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunExit {
    /// lease を一度も取れなかった
    NeverPrimary,
    Signalled,
    DeadlineReached,
    /// primary ループがエラーで終わった（lease は解放していない）
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub became_primary: bool,
    pub ticks: u64,
    pub exit: RunExit,
}

pub struct Controller<D: Dispatch = Dispatcher> {
    dispatcher: D,
    lease: Arc<dyn Lease>,
    clock: Arc<dyn Clock>,
    options: ControllerOptions,
    deadline: DateTime<Utc>,
    phase: Phase,
    signal: TerminationSignal,
    termination: watch::Receiver<bool>,
}

impl<D: Dispatch> Controller<D> {
    pub fn new(
        dispatcher: D,
        lease: Arc<dyn Lease>,
        clock: Arc<dyn Clock>,
        options: ControllerOptions,
    ) -> Self {
        let now = clock.now();
        let deadline = TimeDelta::from_std(options.max_runtime)
            .ok()
            .and_then(|runtime| now.checked_add_signed(runtime))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let (signal, termination) = TerminationSignal::new();
        Self {
            dispatcher,
            lease,
            clock,
            options,
            deadline,
            phase: Phase::AcquiringLease,
            signal,
            termination,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    pub fn termination_signal(&self) -> TerminationSignal {
        self.signal.clone()
    }

    pub fn signal_termination(&self) {
        self.signal.signal();
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut D {
        &mut self.dispatcher
    }

    /// 全フェーズを実行し、Terminated で戻る
    pub async fn run(&mut self) -> RunReport {
        let mut report = RunReport {
            became_primary: false,
            ticks: 0,
            exit: RunExit::NeverPrimary,
        };

        self.enter(Phase::AcquiringLease);
        if self.acquire_lease().await {
            report.became_primary = true;
            self.enter(Phase::Primary);

            report.exit = match self.run_primary(&mut report.ticks).await {
                Ok(exit) => {
                    if let Err(e) = self.lease.release().await {
                        tracing::error!(error = %e, kind = ?e.kind(), "failed to release lease");
                    }
                    exit
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        kind = ?e.kind(),
                        ticks = report.ticks,
                        "unhandled error while running task groups; lease is kept until it expires"
                    );
                    RunExit::Failed(e.to_string())
                }
            };
        }

        self.enter(Phase::Draining);
        self.drain().await;
        self.enter(Phase::Terminated);
        report
    }

    fn enter(&mut self, phase: Phase) {
        tracing::info!(from = ?self.phase, to = ?phase, "controller phase");
        self.phase = phase;
    }

    fn is_signalled(&self) -> bool {
        *self.termination.borrow()
    }

    fn should_stop(&self) -> bool {
        self.is_signalled() || self.clock.now() >= self.deadline
    }

    async fn acquire_lease(&mut self) -> bool {
        loop {
            match self.lease.acquire().await {
                Ok(true) => {
                    tracing::info!("acquired lease; running as primary");
                    return true;
                }
                Ok(false) => tracing::debug!("lease is held by another instance"),
                Err(e) => tracing::warn!(error = %e, "failed to acquire lease"),
            }

            if self.should_stop() {
                return false;
            }
            self.clock.sleep(self.options.lease_check_interval).await;
        }
    }

    async fn run_primary(&mut self, ticks: &mut u64) -> Result<RunExit> {
        loop {
            let remaining = self.lease.remaining_lifetime().await?;
            if remaining < self.options.lease_ttl / 2 {
                self.lease.refresh(self.options.lease_ttl).await?;
                tracing::debug!(remaining_secs = remaining.as_secs(), "refreshed lease");
            }

            self.dispatcher.tick().await?;
            *ticks += 1;

            if self.is_signalled() {
                return Ok(RunExit::Signalled);
            }
            if self.clock.now() >= self.deadline {
                return Ok(RunExit::DeadlineReached);
            }
            self.clock.sleep(POLL_INTERVAL).await;
        }
    }

    async fn drain(&mut self) {
        loop {
            match self.dispatcher.reconcile().await {
                Ok(()) if !self.dispatcher.has_in_flight_work() => return,
                Ok(()) => {}
                Err(e) => {
                    tracing::error!(error = %e, kind = ?e.kind(), "failed to reconcile while draining");
                }
            }
            self.clock.sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::InfrastructureError;
    use crate::ports::ManualClock;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Tick(DateTime<Utc>),
        Reconcile,
        Refresh(DateTime<Utc>),
        Release,
    }

    type Events = Arc<Mutex<Vec<Event>>>;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    struct ScriptedLease {
        clock: Arc<ManualClock>,
        grants: Mutex<VecDeque<bool>>,
        default_grant: bool,
        expires_at: Mutex<Option<DateTime<Utc>>>,
        events: Events,
    }

    impl ScriptedLease {
        fn new(clock: Arc<ManualClock>, grants: &[bool], default_grant: bool, events: Events) -> Self {
            Self {
                clock,
                grants: Mutex::new(grants.iter().copied().collect()),
                default_grant,
                expires_at: Mutex::new(None),
                events,
            }
        }

        fn is_held(&self) -> bool {
            self.expires_at.lock().unwrap().is_some()
        }

        fn expire_at(&self, ttl: Duration) {
            *self.expires_at.lock().unwrap() =
                Some(self.clock.now() + TimeDelta::from_std(ttl).unwrap());
        }
    }

    #[async_trait::async_trait]
    impl Lease for ScriptedLease {
        async fn acquire(&self) -> Result<bool> {
            let grant = self
                .grants
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(self.default_grant);
            if grant {
                self.expire_at(DEFAULT_LEASE_TTL);
            }
            Ok(grant)
        }

        async fn release(&self) -> Result<()> {
            self.events.lock().unwrap().push(Event::Release);
            *self.expires_at.lock().unwrap() = None;
            Ok(())
        }

        async fn refresh(&self, ttl: Duration) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(Event::Refresh(self.clock.now()));
            self.expire_at(ttl);
            Ok(())
        }

        async fn remaining_lifetime(&self) -> Result<Duration> {
            let now = self.clock.now();
            Ok(self
                .expires_at
                .lock()
                .unwrap()
                .and_then(|at| (at - now).to_std().ok())
                .unwrap_or(Duration::ZERO))
        }
    }

    struct FakeDispatch {
        clock: Arc<ManualClock>,
        events: Events,
        ticks: u64,
        in_flight: usize,
        fail_on_tick: Option<u64>,
        signal_on_tick: Option<(u64, TerminationSignal)>,
    }

    impl FakeDispatch {
        fn new(clock: Arc<ManualClock>, events: Events) -> Self {
            Self {
                clock,
                events,
                ticks: 0,
                in_flight: 0,
                fail_on_tick: None,
                signal_on_tick: None,
            }
        }
    }

    #[async_trait::async_trait]
    impl Dispatch for FakeDispatch {
        async fn tick(&mut self) -> Result<()> {
            self.ticks += 1;
            self.events
                .lock()
                .unwrap()
                .push(Event::Tick(self.clock.now()));
            if self.fail_on_tick == Some(self.ticks) {
                return Err(InfrastructureError::StateStore("connection reset".into()).into());
            }
            if let Some((at, signal)) = &self.signal_on_tick
                && *at == self.ticks
            {
                signal.signal();
            }
            Ok(())
        }

        async fn reconcile(&mut self) -> Result<()> {
            self.events.lock().unwrap().push(Event::Reconcile);
            self.in_flight = self.in_flight.saturating_sub(1);
            Ok(())
        }

        fn has_in_flight_work(&self) -> bool {
            self.in_flight > 0
        }
    }

    struct Setup {
        clock: Arc<ManualClock>,
        lease: Arc<ScriptedLease>,
        events: Events,
        controller: Controller<FakeDispatch>,
    }

    fn setup(grants: &[bool], default_grant: bool, options: ControllerOptions) -> Setup {
        let clock = Arc::new(ManualClock::new(t0()));
        let events: Events = Arc::default();
        let lease = Arc::new(ScriptedLease::new(
            clock.clone(),
            grants,
            default_grant,
            events.clone(),
        ));
        let dispatch = FakeDispatch::new(clock.clone(), events.clone());
        let controller = Controller::new(dispatch, lease.clone(), clock.clone(), options);
        Setup {
            clock,
            lease,
            events,
            controller,
        }
    }

    fn options(check_secs: u64, max_runtime_secs: u64) -> ControllerOptions {
        ControllerOptions {
            lease_ttl: DEFAULT_LEASE_TTL,
            lease_check_interval: Duration::from_secs(check_secs),
            max_runtime: Duration::from_secs(max_runtime_secs),
        }
    }

    fn ticks(events: &Events) -> Vec<DateTime<Utc>> {
        events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Event::Tick(at) => Some(*at),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn waits_for_the_lease_then_ticks_until_the_deadline() {
        let mut s = setup(&[false], true, options(300, 360));

        let report = s.controller.run().await;

        assert_eq!(
            report,
            RunReport {
                became_primary: true,
                ticks: 61,
                exit: RunExit::DeadlineReached,
            }
        );
        let ticks = ticks(&s.events);
        assert_eq!(ticks.first(), Some(&(t0() + TimeDelta::seconds(300))));
        assert_eq!(ticks.last(), Some(&(t0() + TimeDelta::seconds(360))));

        let sleeps = s.clock.sleeps();
        assert_eq!(sleeps[0], Duration::from_secs(300));
        assert!(sleeps[1..].iter().all(|d| *d == POLL_INTERVAL));
        assert_eq!(sleeps.len(), 61);

        assert!(!s.lease.is_held());
        assert_eq!(s.controller.phase(), Phase::Terminated);
    }

    #[tokio::test]
    async fn lease_is_refreshed_only_below_half_its_ttl() {
        let mut s = setup(&[], true, options(30, 400));

        s.controller.run().await;

        let refreshes: Vec<_> = s
            .events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Event::Refresh(at) => Some(*at),
                _ => None,
            })
            .collect();
        // 残り 149 秒になった時点で延長
        assert_eq!(
            refreshes,
            vec![t0() + TimeDelta::seconds(151), t0() + TimeDelta::seconds(302)]
        );
    }

    #[tokio::test]
    async fn gives_up_waiting_for_the_lease_at_the_deadline() {
        let mut s = setup(&[], false, options(300, 1800));

        let report = s.controller.run().await;

        assert_eq!(report.exit, RunExit::NeverPrimary);
        assert!(!report.became_primary);
        assert_eq!(s.clock.sleeps(), vec![Duration::from_secs(300); 6]);
        assert!(ticks(&s.events).is_empty());
        // 待機だけで終わっても drain は行う
        assert_eq!(*s.events.lock().unwrap(), vec![Event::Reconcile]);
    }

    #[tokio::test]
    async fn signal_before_acquiring_stops_after_one_attempt() {
        let mut s = setup(&[], false, options(300, 3600));
        s.controller.termination_signal().signal();

        let report = s.controller.run().await;

        assert_eq!(report.exit, RunExit::NeverPrimary);
        assert!(s.clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn signal_releases_the_lease_before_draining() {
        let mut s = setup(&[], true, options(30, 3600));
        let signal = s.controller.termination_signal();
        s.controller.dispatcher_mut().signal_on_tick = Some((3, signal));
        s.controller.dispatcher_mut().in_flight = 2;

        let report = s.controller.run().await;

        assert_eq!(report.exit, RunExit::Signalled);
        assert_eq!(report.ticks, 3);
        assert!(!s.lease.is_held());

        let events = s.events.lock().unwrap().clone();
        let tail: Vec<_> = events
            .into_iter()
            .filter(|e| !matches!(e, Event::Tick(_)))
            .collect();
        assert_eq!(tail, vec![Event::Release, Event::Reconcile, Event::Reconcile]);
        assert!(!s.controller.dispatcher().has_in_flight_work());
    }

    #[tokio::test]
    async fn primary_error_drains_without_releasing_the_lease() {
        let mut s = setup(&[], true, options(30, 3600));
        s.controller.dispatcher_mut().fail_on_tick = Some(2);

        let report = s.controller.run().await;

        assert!(matches!(report.exit, RunExit::Failed(ref msg) if msg.contains("connection reset")));
        assert_eq!(report.ticks, 1);
        assert!(s.lease.is_held());
        assert!(!s.events.lock().unwrap().contains(&Event::Release));
        assert_eq!(s.controller.phase(), Phase::Terminated);
    }

    #[tokio::test]
    async fn drain_polls_until_no_work_remains() {
        let mut s = setup(&[], true, options(30, 0));
        s.controller.dispatcher_mut().in_flight = 3;

        let report = s.controller.run().await;

        assert_eq!(report.exit, RunExit::DeadlineReached);
        assert_eq!(report.ticks, 1);
        let reconciles = s
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| **e == Event::Reconcile)
            .count();
        assert_eq!(reconciles, 3);
        // drain 中の sleep は reconcile の間だけ
        assert_eq!(s.clock.sleeps(), vec![POLL_INTERVAL; 2]);
    }
}
