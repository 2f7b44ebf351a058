//! MemoryHistory - プロセス内の実行履歴

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{GroupName, Result, StepName};
use crate::ports::{HistoryEntry, HistoryRecorder};

/// group + step ごとに最新の結果だけを保持する（clone で共有）
#[derive(Clone, Default)]
pub struct MemoryHistory {
    entries: Arc<Mutex<BTreeMap<(GroupName, StepName), HistoryEntry>>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl HistoryRecorder for MemoryHistory {
    async fn record_completion(
        &self,
        group: &GroupName,
        step: &StepName,
        end: DateTime<Utc>,
        exit_code: i32,
    ) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry((group.clone(), step.clone()))
            .or_insert_with(|| HistoryEntry {
                group_name: group.clone(),
                step_name: step.clone(),
                last_exit_code: exit_code,
                last_success_at: None,
                last_failure_at: None,
            });

        entry.last_exit_code = exit_code;
        if exit_code == 0 {
            entry.last_success_at = Some(end);
        } else {
            entry.last_failure_at = Some(end);
        }
        Ok(())
    }

    async fn list_current_states(&self) -> Result<Vec<HistoryEntry>> {
        Ok(self.entries.lock().await.values().cloned().collect())
    }
}
