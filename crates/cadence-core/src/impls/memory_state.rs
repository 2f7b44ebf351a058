//! MemoryStateBackend - プロセス内の state 行
//!
//! `MemoryStateBackend` が「永続化された」行を持ち、複数インスタンスで共有できます。
//! キャッシュとインスタンスタグの扱いは `CachedStateStore` 側にあります。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::cached_state::{CachedStateStore, StateRows};
use crate::domain::{ExecutionState, GroupName, Result};
use crate::ports::Clock;

/// 共有される「永続化」行
#[derive(Clone, Default)]
pub struct MemoryStateBackend {
    rows: Arc<Mutex<HashMap<GroupName, ExecutionState>>>,
}

pub type MemoryStateStore = CachedStateStore<MemoryStateBackend>;

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// この backend を使う新しいインスタンス（キャッシュは空）
    pub fn store(&self, clock: Arc<dyn Clock>) -> MemoryStateStore {
        CachedStateStore::with_rows(self.clone(), clock)
    }

    /// 永続化された行をそのまま読む（キャッシュを経由しない）
    pub async fn row(&self, group: &GroupName) -> Option<ExecutionState> {
        self.rows.lock().await.get(group).cloned()
    }
}

impl CachedStateStore<MemoryStateBackend> {
    /// 専用の backend を持つ store
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        MemoryStateBackend::new().store(clock)
    }

    pub fn backend(&self) -> &MemoryStateBackend {
        self.rows()
    }
}

#[async_trait::async_trait]
impl StateRows for MemoryStateBackend {
    async fn load_or_init(&self, group: &GroupName, now: DateTime<Utc>) -> Result<ExecutionState> {
        let mut rows = self.rows.lock().await;
        let row = rows.entry(group.clone()).or_insert_with(|| {
            tracing::warn!(group = %group, "initialised state for new task group");
            ExecutionState::baseline(group.clone(), now)
        });
        Ok(row.clone())
    }

    async fn write(&self, state: &ExecutionState) -> Result<()> {
        self.rows
            .lock()
            .await
            .insert(state.group_name().clone(), state.persisted());
        Ok(())
    }
}
