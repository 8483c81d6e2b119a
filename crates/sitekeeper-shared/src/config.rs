//! # SiteKeeper Configuration
//!
//! Layered configuration: a base `config/base.toml`, an optional
//! environment-specific override file, and `SITEKEEPER_*` environment
//! variables on top — the same layering the teacher applies for
//! `TaskerConfig` (base TOML + per-environment TOML + env vars).
//!
//! Recognized options mirror spec §6 exactly: `environment_name`
//! (required), the timeout table of §5, `journal_root`,
//! `max_concurrent_master_actions`, and per-`TaskType` overrides.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SiteKeeperError, SiteKeeperResult};

/// Per-TaskType override of the default execution timeout (§4.6, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTypeOverrides {
    #[serde(default)]
    pub execution_timeout_sec: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// Timeout table, all overridable, defaults per spec §5.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub heartbeat_interval_sec: u64,
    pub offline_after_missed_intervals: u32,
    pub readiness_timeout_sec: u64,
    pub execution_timeout_sec: u64,
    pub cancel_grace_sec: u64,
    pub log_flush_timeout_sec: u64,
    pub action_id_grace_sec: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_sec: 15,
            offline_after_missed_intervals: 3,
            readiness_timeout_sec: 30,
            execution_timeout_sec: 600,
            cancel_grace_sec: 15,
            log_flush_timeout_sec: 10,
            action_id_grace_sec: 60,
        }
    }
}

impl TimeoutsConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_sec)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_sec)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_sec)
    }

    pub fn log_flush_timeout(&self) -> Duration {
        Duration::from_secs(self.log_flush_timeout_sec)
    }

    pub fn action_id_grace(&self) -> Duration {
        Duration::from_secs(self.action_id_grace_sec)
    }

    /// Execution timeout for a TaskType, falling back to the default (§4.6).
    pub fn execution_timeout_for(
        &self,
        task_type: &str,
        overrides: &HashMap<String, TaskTypeOverrides>,
    ) -> Duration {
        let secs = overrides
            .get(task_type)
            .and_then(|o| o.execution_timeout_sec)
            .unwrap_or(self.execution_timeout_sec);
        Duration::from_secs(secs)
    }

    /// Max retries for a TaskType; default is 0 (open question resolved in
    /// DESIGN.md: source exposes no visible default retry policy).
    pub fn max_retries_for(
        &self,
        task_type: &str,
        overrides: &HashMap<String, TaskTypeOverrides>,
    ) -> u32 {
        overrides
            .get(task_type)
            .and_then(|o| o.max_retries)
            .unwrap_or(0)
    }
}

/// Top-level SiteKeeper configuration (§6 "Configuration").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteKeeperConfig {
    pub environment_name: String,
    #[serde(default = "default_journal_root")]
    pub journal_root: PathBuf,
    #[serde(default = "default_max_concurrent_master_actions")]
    pub max_concurrent_master_actions: usize,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub per_task_type: HashMap<String, TaskTypeOverrides>,
    /// Whether a non-terminal MasterAction of the *same* OperationType
    /// conflicts with a new submission, vs. any non-terminal action at all
    /// (§4.8 default policy: one active MasterAction total).
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Only one MasterAction may be non-terminal at a time, regardless of type.
    #[default]
    SingleGlobal,
    /// Multiple MasterActions may run concurrently as long as their
    /// OperationType differs.
    PerOperationType,
}

fn default_journal_root() -> PathBuf {
    PathBuf::from("./journal")
}

fn default_max_concurrent_master_actions() -> usize {
    1
}

impl SiteKeeperConfig {
    /// Load configuration layering `<dir>/base.toml`, then
    /// `<dir>/environments/<env>.toml` if present, then `SITEKEEPER_*`
    /// environment variables, matching the teacher's layered config
    /// loading approach.
    pub fn load(dir: &Path, environment: &str) -> SiteKeeperResult<Self> {
        let base = dir.join("base.toml");
        let env_override = dir.join("environments").join(format!("{environment}.toml"));

        let mut builder = config::Config::builder()
            .set_default("environment_name", environment)
            .map_err(|e| SiteKeeperError::Config(e.to_string()))?;

        if base.exists() {
            builder = builder.add_source(config::File::from(base).required(false));
        }
        if env_override.exists() {
            builder = builder.add_source(config::File::from(env_override).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("SITEKEEPER")
                .separator("__")
                .try_parsing(true),
        );

        let built = builder
            .build()
            .map_err(|e| SiteKeeperError::Config(e.to_string()))?;
        built
            .try_deserialize()
            .map_err(|e| SiteKeeperError::Config(e.to_string()))
    }

    /// A config sufficient for tests and the in-memory scenarios in §8 —
    /// no files on disk required.
    pub fn for_testing(environment_name: impl Into<String>, journal_root: PathBuf) -> Self {
        Self {
            environment_name: environment_name.into(),
            journal_root,
            max_concurrent_master_actions: default_max_concurrent_master_actions(),
            timeouts: TimeoutsConfig::default(),
            per_task_type: HashMap::new(),
            conflict_policy: ConflictPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeouts_match_spec() {
        let t = TimeoutsConfig::default();
        assert_eq!(t.heartbeat_interval_sec, 15);
        assert_eq!(t.offline_after_missed_intervals, 3);
        assert_eq!(t.readiness_timeout_sec, 30);
        assert_eq!(t.execution_timeout_sec, 600);
        assert_eq!(t.cancel_grace_sec, 15);
        assert_eq!(t.log_flush_timeout_sec, 10);
        assert_eq!(t.action_id_grace_sec, 60);
    }

    #[test]
    fn execution_timeout_override_applies_per_task_type() {
        let t = TimeoutsConfig::default();
        let mut overrides = HashMap::new();
        overrides.insert(
            "VerifyConfiguration".to_string(),
            TaskTypeOverrides {
                execution_timeout_sec: Some(120),
                max_retries: Some(2),
            },
        );

        assert_eq!(
            t.execution_timeout_for("VerifyConfiguration", &overrides),
            Duration::from_secs(120)
        );
        assert_eq!(
            t.execution_timeout_for("OtherTask", &overrides),
            Duration::from_secs(600)
        );
        assert_eq!(t.max_retries_for("VerifyConfiguration", &overrides), 2);
        assert_eq!(t.max_retries_for("OtherTask", &overrides), 0);
    }

    #[test]
    fn for_testing_builds_usable_config() {
        let cfg = SiteKeeperConfig::for_testing("test", PathBuf::from("/tmp/journal"));
        assert_eq!(cfg.environment_name, "test");
        assert_eq!(cfg.max_concurrent_master_actions, 1);
        assert_eq!(cfg.conflict_policy, ConflictPolicy::SingleGlobal);
    }
}
