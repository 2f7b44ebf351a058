//! Config - JSON 設定の読み込みと検証
//!
//! ```json
//! {
//!   "controller": { "lease_ttl_secs": 300, "max_runtime_secs": 3600 },
//!   "groups": [
//!     { "name": "per-minute",
//!       "steps": [ { "name": "only-step", "cmd": ["php", "task.php"] } ],
//!       "schedule": "* * * * *" }
//!   ]
//! }
//! ```
//!
//! 不明なキーは拒否します（typo で設定が黙って無視されないように）。

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::app::controller::{
    ControllerOptions, DEFAULT_LEASE_CHECK_INTERVAL, DEFAULT_LEASE_NAME, DEFAULT_LEASE_TTL,
    DEFAULT_MAX_RUNTIME,
};
use crate::domain::{
    ConfigError, CronFields, GroupName, Schedule, StepDefinition, StepName, TaskGroupDefinition,
    DEFAULT_HEALTHCHECK_STALENESS,
};
use crate::impls::DEFAULT_PAUSE_REFRESH;

pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub controller: ControllerSettings,
    pub groups: Vec<TaskGroupConfig>,
}

impl SchedulerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.controller.validate()?;
        Ok(config)
    }

    /// 全 group を検証して definition にする
    pub fn task_groups(&self) -> Result<TaskGroups, ConfigError> {
        let definitions = self
            .groups
            .iter()
            .map(TaskGroupConfig::to_definition)
            .collect::<Result<Vec<_>, _>>()?;
        TaskGroups::new(definitions)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ControllerSettings {
    pub lease_name: String,
    pub lease_ttl_secs: u64,
    pub lease_check_interval_secs: u64,
    pub max_runtime_secs: u64,
    pub pause_refresh_secs: u64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            lease_name: DEFAULT_LEASE_NAME.to_string(),
            lease_ttl_secs: DEFAULT_LEASE_TTL.as_secs(),
            lease_check_interval_secs: DEFAULT_LEASE_CHECK_INTERVAL.as_secs(),
            max_runtime_secs: DEFAULT_MAX_RUNTIME.as_secs(),
            pause_refresh_secs: DEFAULT_PAUSE_REFRESH.as_secs(),
        }
    }
}

impl ControllerSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        let settings = [
            ("lease_ttl_secs", self.lease_ttl_secs),
            ("lease_check_interval_secs", self.lease_check_interval_secs),
            ("pause_refresh_secs", self.pause_refresh_secs),
        ];
        match settings.into_iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(ConfigError::ZeroControllerSetting(name)),
            None => Ok(()),
        }
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn pause_refresh(&self) -> Duration {
        Duration::from_secs(self.pause_refresh_secs)
    }

    pub fn options(&self) -> ControllerOptions {
        ControllerOptions {
            lease_ttl: self.lease_ttl(),
            lease_check_interval: Duration::from_secs(self.lease_check_interval_secs),
            max_runtime: Duration::from_secs(self.max_runtime_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskGroupConfig {
    pub name: GroupName,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub steps: Vec<StepConfig>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    pub schedule: ScheduleConfig,
    #[serde(default = "default_healthcheck_staleness_secs")]
    pub healthcheck_staleness_secs: u64,
}

fn enabled_by_default() -> bool {
    true
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_STEP_TIMEOUT_SECS
}

fn default_healthcheck_staleness_secs() -> u64 {
    DEFAULT_HEALTHCHECK_STALENESS.as_secs()
}

impl TaskGroupConfig {
    pub fn to_definition(&self) -> Result<TaskGroupDefinition, ConfigError> {
        let schedule = self.schedule.to_schedule().map_err(|source| ConfigError::Schedule {
            group: self.name.clone(),
            source,
        })?;
        TaskGroupDefinition::new(
            self.name.clone(),
            self.enabled,
            self.steps.iter().map(StepConfig::to_definition).collect(),
            Duration::from_secs(self.timeout_seconds),
            schedule,
            Duration::from_secs(self.healthcheck_staleness_secs),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepConfig {
    pub name: StepName,
    pub cmd: CommandConfig,
}

impl StepConfig {
    fn to_definition(&self) -> StepDefinition {
        StepDefinition::new(self.name.clone(), self.cmd.to_argv())
    }
}

/// argv の配列か、`sh -c` で実行する 1 行のコマンド
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    Argv(Vec<String>),
    Shell(String),
}

impl CommandConfig {
    pub fn to_argv(&self) -> Vec<String> {
        match self {
            CommandConfig::Argv(argv) => argv.clone(),
            CommandConfig::Shell(line) if line.trim().is_empty() => Vec::new(),
            CommandConfig::Shell(line) => {
                vec!["sh".to_string(), "-c".to_string(), line.clone()]
            }
        }
    }
}

/// `"* * * * *"` / `"every 30 seconds"` / `{ "minute": "*/5" }`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ScheduleConfig {
    Expression(String),
    Fields(CronFields),
}

impl ScheduleConfig {
    pub fn to_schedule(&self) -> Result<Schedule, crate::domain::ScheduleError> {
        match self {
            ScheduleConfig::Expression(expression) => Schedule::parse(expression),
            ScheduleConfig::Fields(fields) => Schedule::from_fields(fields),
        }
    }
}

/// 検証済みの group 一覧（設定順）
#[derive(Debug, Clone)]
pub struct TaskGroups {
    groups: Vec<TaskGroupDefinition>,
}

impl TaskGroups {
    pub fn new(groups: Vec<TaskGroupDefinition>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        if let Some(duplicate) = groups.iter().find(|g| !seen.insert(g.name())) {
            return Err(ConfigError::DuplicateGroup(duplicate.name().clone()));
        }
        Ok(Self { groups })
    }

    pub fn all(&self) -> &[TaskGroupDefinition] {
        &self.groups
    }

    /// 有効な group のみ（設定順）
    pub fn active(&self) -> impl Iterator<Item = &TaskGroupDefinition> {
        self.groups.iter().filter(|g| g.is_enabled())
    }

    pub fn get(&self, name: &str) -> Option<&TaskGroupDefinition> {
        self.groups.iter().find(|g| g.name().as_str() == name)
    }

    pub fn into_definitions(self) -> Vec<TaskGroupDefinition> {
        self.groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rstest::rstest;

    const SAMPLE: &str = r#"{
        "controller": { "lease_ttl_secs": 120, "max_runtime_secs": 600 },
        "groups": [
            { "name": "per-minute",
              "steps": [ { "name": "only-step", "cmd": ["php", "task.php"] } ],
              "schedule": "* * * * *" },
            { "name": "nightly",
              "enabled": false,
              "steps": [
                { "name": "export", "cmd": "./export.sh --all" },
                { "name": "upload", "cmd": ["./upload.sh"] }
              ],
              "timeout_seconds": 900,
              "schedule": { "minute": 30, "hour": "2" },
              "healthcheck_staleness_secs": 172800 },
            { "name": "poller",
              "steps": [ { "name": "poll", "cmd": ["./poll"] } ],
              "schedule": "every 30 seconds" }
        ]
    }"#;

    #[test]
    fn sample_config_loads_with_defaults() {
        let config = SchedulerConfig::from_json_str(SAMPLE).unwrap();
        assert_eq!(config.controller.lease_ttl_secs, 120);
        assert_eq!(config.controller.lease_name, DEFAULT_LEASE_NAME);
        assert_eq!(
            config.controller.options().lease_check_interval,
            DEFAULT_LEASE_CHECK_INTERVAL
        );

        let groups = config.task_groups().unwrap();
        assert_eq!(groups.all().len(), 3);
        assert_eq!(
            groups.active().map(|g| g.name().as_str()).collect::<Vec<_>>(),
            vec!["per-minute", "poller"]
        );

        let per_minute = groups.get("per-minute").unwrap();
        assert_eq!(per_minute.step_timeout(), Duration::from_secs(60));
        assert_eq!(per_minute.healthcheck_staleness(), DEFAULT_HEALTHCHECK_STALENESS);

        let nightly = groups.get("nightly").unwrap();
        assert_eq!(
            nightly.steps()[0].command(),
            ["sh", "-c", "./export.sh --all"]
        );
        let reference = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(
            nightly.next_due_after(reference),
            Utc.with_ymd_and_hms(2024, 1, 2, 2, 30, 0).unwrap()
        );
    }

    #[rstest]
    #[case::unknown_key(r#"{"groups": [], "extra": 1}"#)]
    #[case::unknown_group_key(
        r#"{"groups": [{"name": "g", "steps": [{"name": "s", "cmd": ["x"]}], "schedule": "* * * * *", "timout_seconds": 5}]}"#
    )]
    #[case::zero_ttl(r#"{"controller": {"lease_ttl_secs": 0}, "groups": []}"#)]
    #[case::unknown_schedule_field(
        r#"{"groups": [{"name": "g", "steps": [{"name": "s", "cmd": ["x"]}], "schedule": {"minute": "*", "second": 1}}]}"#
    )]
    #[case::not_json("groups:")]
    fn malformed_documents_are_rejected(#[case] raw: &str) {
        assert!(SchedulerConfig::from_json_str(raw).is_err());
    }

    fn single(group: &str) -> Result<TaskGroups, ConfigError> {
        SchedulerConfig::from_json_str(&format!(r#"{{"groups": [{group}]}}"#))
            .unwrap()
            .task_groups()
    }

    #[test]
    fn invalid_groups_fail_validation() {
        assert!(matches!(
            single(r#"{"name": "g", "steps": [], "schedule": "* * * * *"}"#),
            Err(ConfigError::NoSteps(_))
        ));
        assert!(matches!(
            single(r#"{"name": "g", "steps": [{"name": "s", "cmd": []}], "schedule": "* * * * *"}"#),
            Err(ConfigError::EmptyCommand { .. })
        ));
        assert!(matches!(
            single(r#"{"name": "g", "steps": [{"name": "s", "cmd": "  "}], "schedule": "* * * * *"}"#),
            Err(ConfigError::EmptyCommand { .. })
        ));
        assert!(matches!(
            single(r#"{"name": "g", "steps": [{"name": "s", "cmd": ["x"]}], "schedule": "* * * * *", "timeout_seconds": 0}"#),
            Err(ConfigError::ZeroTimeout(_))
        ));
        assert!(matches!(
            single(r#"{"name": "g", "steps": [{"name": "s", "cmd": ["x"]}], "schedule": "0 0 31 2 *"}"#),
            Err(ConfigError::Schedule { .. })
        ));
    }

    #[test]
    fn duplicate_group_names_are_rejected() {
        let raw = r#"{"groups": [
            {"name": "g", "steps": [{"name": "s", "cmd": ["x"]}], "schedule": "* * * * *"},
            {"name": "g", "steps": [{"name": "t", "cmd": ["y"]}], "schedule": "every 5 seconds"}
        ]}"#;
        let result = SchedulerConfig::from_json_str(raw).unwrap().task_groups();
        assert!(matches!(result, Err(ConfigError::DuplicateGroup(name)) if name.as_str() == "g"));
    }
}
