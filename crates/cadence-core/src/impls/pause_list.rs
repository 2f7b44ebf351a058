//! Pause list 実装
//!
//! - **RefreshingPauseList**: PauseSource を一定間隔でだけ読み直すキャッシュ
//! - **StaticPauseSource**: プロセス内で変更できる source（テスト・埋め込み用）
//! - **JsonFilePauseSource**: `{"group": "2024-01-01T00:00:00Z"}` 形式の JSON ファイル

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;

use crate::domain::{CadenceError, GroupName, InfrastructureError, Result};
use crate::ports::{Clock, PauseList, PauseSource};

/// 再読み込み間隔のデフォルト
pub const DEFAULT_PAUSE_REFRESH: Duration = Duration::from_secs(60);

struct Snapshot {
    paused_until: HashMap<GroupName, DateTime<Utc>>,
    reload_at: DateTime<Utc>,
}

/// group は `now < paused_until` の間だけ一時停止とみなす
pub struct RefreshingPauseList {
    source: Arc<dyn PauseSource>,
    clock: Arc<dyn Clock>,
    refresh_interval: Duration,
    snapshot: Mutex<Option<Snapshot>>,
}

impl RefreshingPauseList {
    pub fn new(source: Arc<dyn PauseSource>, clock: Arc<dyn Clock>) -> Self {
        Self::with_refresh_interval(source, clock, DEFAULT_PAUSE_REFRESH)
    }

    pub fn with_refresh_interval(
        source: Arc<dyn PauseSource>,
        clock: Arc<dyn Clock>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            source,
            clock,
            refresh_interval,
            snapshot: Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl PauseList for RefreshingPauseList {
    async fn is_paused(&self, group: &GroupName) -> Result<bool> {
        let now = self.clock.now();
        let mut snapshot = self.snapshot.lock().await;

        let stale = snapshot.as_ref().is_none_or(|s| s.reload_at <= now);
        if stale {
            let paused_until = self.source.load().await?;
            let reload_at = TimeDelta::from_std(self.refresh_interval)
                .ok()
                .and_then(|interval| now.checked_add_signed(interval))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            *snapshot = Some(Snapshot {
                paused_until,
                reload_at,
            });
        }

        Ok(snapshot
            .as_ref()
            .and_then(|s| s.paused_until.get(group))
            .is_some_and(|until| now < *until))
    }
}

/// プロセス内で pause / resume できる source
#[derive(Clone, Default)]
pub struct StaticPauseSource {
    entries: Arc<Mutex<HashMap<GroupName, DateTime<Utc>>>>,
}

impl StaticPauseSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn pause(&self, group: GroupName, until: DateTime<Utc>) {
        self.entries.lock().await.insert(group, until);
    }

    pub async fn resume(&self, group: &GroupName) {
        self.entries.lock().await.remove(group);
    }
}

#[async_trait::async_trait]
impl PauseSource for StaticPauseSource {
    async fn load(&self) -> Result<HashMap<GroupName, DateTime<Utc>>> {
        Ok(self.entries.lock().await.clone())
    }
}

/// JSON ファイルから読む source。ファイルがなければ一時停止なし
#[derive(Debug, Clone)]
pub struct JsonFilePauseSource {
    path: PathBuf,
}

impl JsonFilePauseSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl PauseSource for JsonFilePauseSource {
    async fn load(&self) -> Result<HashMap<GroupName, DateTime<Utc>>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => {
                return Err(InfrastructureError::PauseList(format!(
                    "failed to read {}: {e}",
                    self.path.display()
                ))
                .into());
            }
        };

        serde_json::from_str(&raw).map_err(|e| {
            CadenceError::from(InfrastructureError::PauseList(format!(
                "failed to parse {}: {e}",
                self.path.display()
            )))
        })
    }
}
