//! Clock port - 時刻と待機の抽象化
//!
//! controller / dispatcher の待機点はすべて `Clock::sleep` を経由します。
//! テストでは ManualClock を使い、sleep した分だけ時刻を進めます。

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Clock は現在時刻と待機を提供
#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

/// 本番用: wall clock + tokio timer
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait::async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// テスト用: sleep すると即座に時刻が進む
///
/// 呼ばれた sleep はすべて記録され、`sleeps()` で確認できます。
#[derive(Debug)]
pub struct ManualClock {
    inner: Mutex<ManualClockState>,
}

#[derive(Debug)]
struct ManualClockState {
    now: DateTime<Utc>,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new(ManualClockState {
                now: start,
                sleeps: Vec::new(),
            }),
        }
    }

    /// sleep を記録せずに時刻を進める
    pub fn advance(&self, duration: Duration) {
        let mut state = self.lock();
        state.now = advance(state.now, duration);
    }

    pub fn set(&self, now: DateTime<Utc>) {
        self.lock().now = now;
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.lock().sleeps.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualClockState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.lock().now
    }

    async fn sleep(&self, duration: Duration) {
        {
            let mut state = self.lock();
            state.sleeps.push(duration);
            state.now = advance(state.now, duration);
        }
        // 他の task（シグナル送信側など）に実行機会を渡す
        tokio::task::yield_now().await;
    }
}

fn advance(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
