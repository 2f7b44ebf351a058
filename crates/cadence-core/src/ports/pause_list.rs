//! PauseList port - 運用者による一時停止
//!
//! 一時停止中の group は dispatch されません（状態も変更されません）。

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::domain::{GroupName, Result};

#[async_trait::async_trait]
pub trait PauseList: Send + Sync {
    async fn is_paused(&self, group: &GroupName) -> Result<bool>;
}

/// group → paused_until の読み出し元
#[async_trait::async_trait]
pub trait PauseSource: Send + Sync {
    async fn load(&self) -> Result<HashMap<GroupName, DateTime<Utc>>>;
}
