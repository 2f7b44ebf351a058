//! SQLite backend - 同一ホスト上の複数プロセスで共有する永続ストレージ
//!
//! 1 つのデータベースファイルに lease / state / 実行履歴 / pause list を置きます。
//! 同じファイルを開いた `cadence run` 同士は同じ lease を取り合い、
//! 同じ state と履歴を読み書きします。
//!
//! # 実装詳細
//! - 接続は `Arc<std::sync::Mutex<Connection>>`、クエリは `spawn_blocking` で実行
//! - lease の取得は `BEGIN IMMEDIATE` トランザクション内で判定と書き込みを行う
//! - lease の期限はミリ秒（i64）、それ以外の時刻は chrono の TEXT 表現
//! - state 行は `ExecutionState` の JSON

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use ulid::Ulid;

use super::cached_state::{CachedStateStore, StateRows};
use crate::domain::{ExecutionState, GroupName, InfrastructureError, Result, StepName};
use crate::ports::{Clock, HistoryEntry, HistoryRecorder, Lease, PauseSource};

/// 別プロセスが書き込み中のときに待つ上限
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub type SqliteStateStore = CachedStateStore<SqliteBackend>;

fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS leases (
            name           TEXT    NOT NULL PRIMARY KEY,
            token          TEXT    NOT NULL,
            expires_at_ms  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS task_states (
            group_name  TEXT NOT NULL PRIMARY KEY,
            state       TEXT NOT NULL   -- JSON-encoded ExecutionState
        );

        CREATE TABLE IF NOT EXISTS execution_history (
            group_name       TEXT    NOT NULL,
            step_name        TEXT    NOT NULL,
            last_exit_code   INTEGER NOT NULL,
            last_success_at  TEXT,
            last_failure_at  TEXT,
            PRIMARY KEY (group_name, step_name)
        );

        CREATE TABLE IF NOT EXISTS paused_groups (
            group_name    TEXT NOT NULL PRIMARY KEY,
            paused_until  TEXT NOT NULL
        );
        ",
    )
}

/// 共有データベースへのハンドル（clone で同じ接続を共有）
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// ファイルを開く（なければ作る）。スキーマは冪等に作成する
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let opened = Connection::open(path).and_then(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            init_db(&conn)?;
            Ok(conn)
        });
        match opened {
            Ok(conn) => Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            }),
            Err(e) => Err(InfrastructureError::StateStore(format!(
                "failed to open {}: {e}",
                path.display()
            ))
            .into()),
        }
    }

    /// 新しい保持者として lease ハンドルを作る
    pub fn lease(&self, name: impl Into<String>, ttl: Duration, clock: Arc<dyn Clock>) -> SqliteLease {
        SqliteLease {
            backend: self.clone(),
            name: name.into(),
            token: Ulid::new(),
            ttl,
            clock,
        }
    }

    /// このデータベースを使う新しい state store（キャッシュは空）
    pub fn state_store(&self, clock: Arc<dyn Clock>) -> SqliteStateStore {
        CachedStateStore::with_rows(self.clone(), clock)
    }

    /// `until` まで group を一時停止する（既存の停止は上書き）
    pub async fn pause(&self, group: &GroupName, until: DateTime<Utc>) -> Result<()> {
        let group = group.to_string();
        self.call(InfrastructureError::PauseList, move |conn| {
            conn.execute(
                "INSERT INTO paused_groups (group_name, paused_until) VALUES (?1, ?2)
                 ON CONFLICT(group_name) DO UPDATE SET paused_until = excluded.paused_until",
                params![group, until],
            )
            .map(drop)
        })
        .await
    }

    pub async fn resume(&self, group: &GroupName) -> Result<()> {
        let group = group.to_string();
        self.call(InfrastructureError::PauseList, move |conn| {
            conn.execute("DELETE FROM paused_groups WHERE group_name = ?1", [group])
                .map(drop)
        })
        .await
    }

    async fn call<T, F>(&self, wrap: fn(String) -> InfrastructureError, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let joined = tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut conn)
        })
        .await;

        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(wrap(e.to_string()).into()),
            Err(e) => Err(wrap(format!("database task failed: {e}")).into()),
        }
    }
}

#[async_trait::async_trait]
impl StateRows for SqliteBackend {
    async fn load_or_init(&self, group: &GroupName, now: DateTime<Utc>) -> Result<ExecutionState> {
        let baseline = serde_json::to_string(&ExecutionState::baseline(group.clone(), now))
            .map_err(|e| InfrastructureError::StateStore(e.to_string()))?;
        let name = group.to_string();

        let (created, json) = self
            .call(InfrastructureError::StateStore, move |conn| {
                let created = conn.execute(
                    "INSERT OR IGNORE INTO task_states (group_name, state) VALUES (?1, ?2)",
                    params![name, baseline],
                )?;
                let json: String = conn.query_row(
                    "SELECT state FROM task_states WHERE group_name = ?1",
                    [&name],
                    |row| row.get(0),
                )?;
                Ok((created > 0, json))
            })
            .await?;

        if created {
            tracing::warn!(group = %group, "initialised state for new task group");
        }
        serde_json::from_str(&json).map_err(|e| {
            InfrastructureError::StateStore(format!("corrupt state row for `{group}`: {e}")).into()
        })
    }

    async fn write(&self, state: &ExecutionState) -> Result<()> {
        let json = serde_json::to_string(&state.persisted())
            .map_err(|e| InfrastructureError::StateStore(e.to_string()))?;
        let name = state.group_name().to_string();

        self.call(InfrastructureError::StateStore, move |conn| {
            conn.execute(
                "INSERT INTO task_states (group_name, state) VALUES (?1, ?2)
                 ON CONFLICT(group_name) DO UPDATE SET state = excluded.state",
                params![name, json],
            )
            .map(drop)
        })
        .await
    }
}

#[async_trait::async_trait]
impl HistoryRecorder for SqliteBackend {
    async fn record_completion(
        &self,
        group: &GroupName,
        step: &StepName,
        end: DateTime<Utc>,
        exit_code: i32,
    ) -> Result<()> {
        let group = group.to_string();
        let step = step.to_string();
        let (success, failure) = if exit_code == 0 {
            (Some(end), None)
        } else {
            (None, Some(end))
        };

        self.call(InfrastructureError::History, move |conn| {
            conn.execute(
                "INSERT INTO execution_history
                     (group_name, step_name, last_exit_code, last_success_at, last_failure_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(group_name, step_name) DO UPDATE SET
                     last_exit_code  = excluded.last_exit_code,
                     last_success_at = COALESCE(excluded.last_success_at, last_success_at),
                     last_failure_at = COALESCE(excluded.last_failure_at, last_failure_at)",
                params![group, step, exit_code, success, failure],
            )
            .map(drop)
        })
        .await
    }

    async fn list_current_states(&self) -> Result<Vec<HistoryEntry>> {
        self.call(InfrastructureError::History, |conn| {
            let mut stmt = conn.prepare(
                "SELECT group_name, step_name, last_exit_code, last_success_at, last_failure_at
                 FROM execution_history ORDER BY group_name, step_name",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(HistoryEntry {
                    group_name: GroupName::new(row.get::<_, String>(0)?),
                    step_name: StepName::new(row.get::<_, String>(1)?),
                    last_exit_code: row.get(2)?,
                    last_success_at: row.get(3)?,
                    last_failure_at: row.get(4)?,
                })
            })?;
            let entries = rows.collect::<rusqlite::Result<Vec<_>>>();
            entries
        })
        .await
    }
}

#[async_trait::async_trait]
impl PauseSource for SqliteBackend {
    async fn load(&self) -> Result<HashMap<GroupName, DateTime<Utc>>> {
        self.call(InfrastructureError::PauseList, |conn| {
            let mut stmt = conn.prepare("SELECT group_name, paused_until FROM paused_groups")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    GroupName::new(row.get::<_, String>(0)?),
                    row.get::<_, DateTime<Utc>>(1)?,
                ))
            })?;
            let paused = rows.collect::<rusqlite::Result<HashMap<_, _>>>();
            paused
        })
        .await
    }
}

/// `leases` テーブルの 1 行に対する、このプロセスのハンドル
pub struct SqliteLease {
    backend: SqliteBackend,
    name: String,
    token: Ulid,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl SqliteLease {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }
}

fn expiry_ms(now_ms: i64, ttl: Duration) -> i64 {
    now_ms.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

#[async_trait::async_trait]
impl Lease for SqliteLease {
    async fn acquire(&self) -> Result<bool> {
        let now_ms = self.now_ms();
        let name = self.name.clone();
        let token = self.token.to_string();
        let expires_at_ms = expiry_ms(now_ms, self.ttl);

        self.backend
            .call(InfrastructureError::Lease, move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let current: Option<(String, i64)> = tx
                    .query_row(
                        "SELECT token, expires_at_ms FROM leases WHERE name = ?1",
                        [&name],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;

                let acquired = match current {
                    Some((holder, expires)) if expires > now_ms => holder == token,
                    _ => {
                        tx.execute(
                            "INSERT INTO leases (name, token, expires_at_ms) VALUES (?1, ?2, ?3)
                             ON CONFLICT(name) DO UPDATE SET
                                 token = excluded.token,
                                 expires_at_ms = excluded.expires_at_ms",
                            params![name, token, expires_at_ms],
                        )?;
                        true
                    }
                };
                tx.commit()?;
                Ok(acquired)
            })
            .await
    }

    async fn release(&self) -> Result<()> {
        let name = self.name.clone();
        let token = self.token.to_string();
        self.backend
            .call(InfrastructureError::Lease, move |conn| {
                conn.execute(
                    "DELETE FROM leases WHERE name = ?1 AND token = ?2",
                    params![name, token],
                )
                .map(drop)
            })
            .await
    }

    async fn refresh(&self, ttl: Duration) -> Result<()> {
        let now_ms = self.now_ms();
        let name = self.name.clone();
        let token = self.token.to_string();

        let updated = self
            .backend
            .call(InfrastructureError::Lease, move |conn| {
                conn.execute(
                    "UPDATE leases SET expires_at_ms = ?3
                     WHERE name = ?1 AND token = ?2 AND expires_at_ms > ?4",
                    params![name, token, expiry_ms(now_ms, ttl), now_ms],
                )
            })
            .await?;

        if updated == 0 {
            return Err(InfrastructureError::Lease(format!(
                "cannot refresh `{}`: lease is not held",
                self.name
            ))
            .into());
        }
        Ok(())
    }

    async fn remaining_lifetime(&self) -> Result<Duration> {
        let now_ms = self.now_ms();
        let name = self.name.clone();
        let token = self.token.to_string();

        let expires: Option<i64> = self
            .backend
            .call(InfrastructureError::Lease, move |conn| {
                conn.query_row(
                    "SELECT expires_at_ms FROM leases WHERE name = ?1 AND token = ?2",
                    params![name, token],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;

        let remaining = expires
            .map(|at| at.saturating_sub(now_ms))
            .filter(|ms| *ms > 0)
            .and_then(|ms| u64::try_from(ms).ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::ZERO);
        Ok(remaining)
    }
}
