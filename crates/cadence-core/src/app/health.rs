//! Health - 期待される step が最近成功しているかの評価
//!
//! 有効な group の各 step について、最後の成功が
//! `now - healthcheck_staleness` より新しくなければ "missing" とみなします。
//! 定義から消えた group や無効な group の履歴は無視します。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::domain::{Result, TaskGroupDefinition};
use crate::ports::{Clock, HistoryRecorder};

pub const HTTP_OK: u16 = 200;
/// 監視側が「scheduler は生きているが仕事が欠けている」と区別するための独自コード
pub const HTTP_MISSING_TASKS: u16 = 599;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub is_healthy: bool,
    /// `group--step` → 最後の成功時刻（なければ null）
    pub missing: BTreeMap<String, Option<DateTime<Utc>>>,
}

impl HealthReport {
    pub fn http_status(&self) -> u16 {
        if self.is_healthy {
            HTTP_OK
        } else {
            HTTP_MISSING_TASKS
        }
    }

    pub fn status_name(&self) -> &'static str {
        if self.is_healthy {
            "OK"
        } else {
            "Missing expected tasks"
        }
    }
}

pub struct HealthReporter {
    groups: Vec<TaskGroupDefinition>,
    history: Arc<dyn HistoryRecorder>,
    clock: Arc<dyn Clock>,
}

impl HealthReporter {
    /// 無効な group は評価対象から外す
    pub fn new(
        groups: Vec<TaskGroupDefinition>,
        history: Arc<dyn HistoryRecorder>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            groups: groups.into_iter().filter(|g| g.is_enabled()).collect(),
            history,
            clock,
        }
    }

    pub async fn health_state(&self) -> Result<HealthReport> {
        let now = self.clock.now();
        let entries = self.history.list_current_states().await?;
        let last_success: HashMap<(&str, &str), Option<DateTime<Utc>>> = entries
            .iter()
            .map(|e| {
                (
                    (e.group_name.as_str(), e.step_name.as_str()),
                    e.last_success_at,
                )
            })
            .collect();

        let mut missing = BTreeMap::new();
        for group in &self.groups {
            let threshold = TimeDelta::from_std(group.healthcheck_staleness())
                .ok()
                .and_then(|staleness| now.checked_sub_signed(staleness))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);

            for step in group.step_names() {
                let succeeded_at = last_success
                    .get(&(group.name().as_str(), step.as_str()))
                    .copied()
                    .flatten();
                if succeeded_at.is_none_or(|at| at <= threshold) {
                    missing.insert(format!("{}--{}", group.name(), step), succeeded_at);
                }
            }
        }

        Ok(HealthReport {
            is_healthy: missing.is_empty(),
            missing,
        })
    }
}
