//! Status - step の開始・完了・timeout の報告
//!
//! ログは tracing の構造化フィールド（group, step, exit_code, elapsed_secs）で出し、
//! 完了は HistoryRecorder にも記録します（health 評価の入力）。

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::domain::{ExecutionState, GroupName, Result, StepName};
use crate::ports::HistoryRecorder;

/// StatusReporter は dispatcher から呼ばれる報告窓口
#[derive(Clone)]
pub struct StatusReporter {
    history: Arc<dyn HistoryRecorder>,
}

impl StatusReporter {
    pub fn new(history: Arc<dyn HistoryRecorder>) -> Self {
        Self { history }
    }

    pub fn history(&self) -> &Arc<dyn HistoryRecorder> {
        &self.history
    }

    pub fn starting(&self, group: &GroupName, step: &StepName) {
        tracing::info!(group = %group, step = %step, "starting task step");
    }

    /// 完了をログに出し、履歴に記録する
    pub async fn completed(
        &self,
        group: &GroupName,
        step: &StepName,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        exit_code: i32,
    ) -> Result<()> {
        let elapsed_secs = (ended_at - started_at).num_milliseconds() as f64 / 1000.0;
        if exit_code == 0 {
            tracing::info!(
                group = %group,
                step = %step,
                exit_code,
                elapsed_secs,
                "task step completed"
            );
        } else {
            tracing::error!(
                group = %group,
                step = %step,
                exit_code,
                elapsed_secs,
                "task step failed"
            );
        }

        self.history
            .record_completion(group, step, ended_at, exit_code)
            .await
    }

    pub fn timed_out(&self, state: &ExecutionState, now: DateTime<Utc>) {
        tracing::error!(
            group = %state.group_name(),
            step = state.running_step().map(|s| s.as_str()).unwrap_or("<unknown>"),
            started_at = %state.run_started_at(),
            timeout_at = %state.run_timeout_at(),
            now = %now,
            "task step timed out; giving up on it"
        );
    }
}
