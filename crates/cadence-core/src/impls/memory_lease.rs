//! MemoryLeaseStore - プロセス内の lease 実装
//!
//! # 実装詳細
//! - lease 名 → (token, expires_at) の HashMap を tokio Mutex で保護
//! - 期限は Clock から計算する（ManualClock で期限切れを再現できる）
//! - 期限切れの lease は誰でも取得できる（takeover）
//!
//! 同じ store から作った複数の `MemoryLease` は同じ lease を取り合うため、
//! テストで複数インスタンスの選出を再現できます。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::domain::{InfrastructureError, Result};
use crate::ports::{Clock, Lease};

#[derive(Debug, Clone)]
struct LeaseEntry {
    token: Ulid,
    expires_at: DateTime<Utc>,
}

/// 共有 backend。`lease()` で保持者ごとのハンドルを発行する
#[derive(Clone)]
pub struct MemoryLeaseStore {
    leases: Arc<Mutex<HashMap<String, LeaseEntry>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryLeaseStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    /// 新しい保持者として lease ハンドルを作る（token は保持者ごとに一意）
    pub fn lease(&self, name: impl Into<String>, ttl: Duration) -> MemoryLease {
        MemoryLease {
            store: self.clone(),
            name: name.into(),
            token: Ulid::new(),
            ttl,
        }
    }

    async fn holder(&self, name: &str) -> Option<Ulid> {
        let now = self.clock.now();
        let leases = self.leases.lock().await;
        leases
            .get(name)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.token)
    }
}

pub struct MemoryLease {
    store: MemoryLeaseStore,
    name: String,
    token: Ulid,
    ttl: Duration,
}

impl MemoryLease {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 現在この保持者が有効な lease を持っているか
    pub async fn is_held(&self) -> bool {
        self.store.holder(&self.name).await == Some(self.token)
    }

    fn expiry(&self, now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
        TimeDelta::from_std(ttl)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[async_trait::async_trait]
impl Lease for MemoryLease {
    async fn acquire(&self) -> Result<bool> {
        let now = self.store.clock.now();
        let mut leases = self.store.leases.lock().await;

        if let Some(entry) = leases.get(&self.name)
            && entry.expires_at > now
        {
            return Ok(entry.token == self.token);
        }

        leases.insert(
            self.name.clone(),
            LeaseEntry {
                token: self.token,
                expires_at: self.expiry(now, self.ttl),
            },
        );
        Ok(true)
    }

    async fn release(&self) -> Result<()> {
        let mut leases = self.store.leases.lock().await;
        if leases
            .get(&self.name)
            .is_some_and(|entry| entry.token == self.token)
        {
            leases.remove(&self.name);
        }
        Ok(())
    }

    async fn refresh(&self, ttl: Duration) -> Result<()> {
        let now = self.store.clock.now();
        let mut leases = self.store.leases.lock().await;
        match leases.get_mut(&self.name) {
            Some(entry) if entry.token == self.token && entry.expires_at > now => {
                entry.expires_at = self.expiry(now, ttl);
                Ok(())
            }
            _ => Err(InfrastructureError::Lease(format!(
                "cannot refresh `{}`: lease is not held",
                self.name
            ))
            .into()),
        }
    }

    async fn remaining_lifetime(&self) -> Result<Duration> {
        let now = self.store.clock.now();
        let leases = self.store.leases.lock().await;
        let remaining = leases
            .get(&self.name)
            .filter(|entry| entry.token == self.token)
            .and_then(|entry| (entry.expires_at - now).to_std().ok())
            .unwrap_or(Duration::ZERO);
        Ok(remaining)
    }
}
