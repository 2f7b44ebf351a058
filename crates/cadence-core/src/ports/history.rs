//! HistoryRecorder port - step ごとの最終成功/失敗の記録
//!
//! health 評価はこの履歴だけを見ます。
//! dispatcher は state の保存に成功した後で 1 回だけ記録します。
//! 記録に失敗した完了は再送されません。

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{GroupName, Result, StepName};

/// group + step ごとの最新の実行結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub group_name: GroupName,
    pub step_name: StepName,
    pub last_exit_code: i32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[async_trait::async_trait]
pub trait HistoryRecorder: Send + Sync {
    /// exit_code 0 なら成功、それ以外は失敗として記録する
    async fn record_completion(
        &self,
        group: &GroupName,
        step: &StepName,
        end: DateTime<Utc>,
        exit_code: i32,
    ) -> Result<()>;

    async fn list_current_states(&self) -> Result<Vec<HistoryEntry>>;
}
