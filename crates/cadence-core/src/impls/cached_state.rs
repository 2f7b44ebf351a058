//! CachedStateStore - 行ストレージの前にインスタンスごとのキャッシュを置く StateStore
//!
//! # 実装詳細
//! - 行の読み書きは `StateRows` に任せる（メモリ / SQLite）
//! - 実行中の state は `RUNNING_REFRESH` 経過後に行から読み直す
//!   （他インスタンスによる timeout 判定などを拾うため）
//! - 読み直すたびに新しい InstanceTag を発行し、古いコピーの save を拒否する
//! - 実行中でない state は読み直さない

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;

use crate::domain::{CoordinationError, ExecutionState, GroupName, InstanceTag, Result};
use crate::ports::{Clock, StateStore};

/// 実行中 state のキャッシュ有効期間
pub const RUNNING_REFRESH: Duration = Duration::from_secs(60);

/// 永続化された行へのアクセス
#[async_trait::async_trait]
pub trait StateRows: Send + Sync {
    /// 行を読む。なければ `ExecutionState::baseline(group, now)` を書き込んでから返す
    async fn load_or_init(&self, group: &GroupName, now: DateTime<Utc>) -> Result<ExecutionState>;

    /// `state.persisted()` を上書き保存する
    async fn write(&self, state: &ExecutionState) -> Result<()>;
}

pub struct CachedStateStore<R> {
    rows: R,
    clock: Arc<dyn Clock>,
    cache: Mutex<HashMap<GroupName, ExecutionState>>,
    next_tag: AtomicU64,
}

impl<R: StateRows> CachedStateStore<R> {
    /// 空のキャッシュで新しいインスタンスを作る
    pub fn with_rows(rows: R, clock: Arc<dyn Clock>) -> Self {
        Self {
            rows,
            clock,
            cache: Mutex::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
        }
    }

    pub fn rows(&self) -> &R {
        &self.rows
    }

    fn refresh_at_for(state: &ExecutionState, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !state.is_running() {
            return None;
        }
        TimeDelta::from_std(RUNNING_REFRESH)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
    }
}

#[async_trait::async_trait]
impl<R: StateRows> StateStore for CachedStateStore<R> {
    async fn get_state(&self, group: &GroupName) -> Result<ExecutionState> {
        let now = self.clock.now();
        let mut cache = self.cache.lock().await;

        if let Some(cached) = cache.get(group)
            && !cached.needs_refresh(now)
        {
            return Ok(cached.clone());
        }

        let row = self.rows.load_or_init(group, now).await?;
        let tag = InstanceTag(self.next_tag.fetch_add(1, Ordering::Relaxed));
        let refresh_at = Self::refresh_at_for(&row, now);
        let loaded = row.tagged(tag, refresh_at);
        cache.insert(group.clone(), loaded.clone());
        Ok(loaded)
    }

    async fn save(&self, state: &ExecutionState) -> Result<()> {
        let now = self.clock.now();
        let mut cache = self.cache.lock().await;

        let tracked = cache
            .get(state.group_name())
            .and_then(|cached| cached.instance());
        let Some(tag) = tracked.filter(|tag| Some(*tag) == state.instance()) else {
            return Err(CoordinationError::StateOutOfSync(state.group_name().clone()).into());
        };

        self.rows.write(state).await?;

        let refresh_at = Self::refresh_at_for(state, now);
        cache.insert(
            state.group_name().clone(),
            state.persisted().tagged(tag, refresh_at),
        );
        Ok(())
    }
}
