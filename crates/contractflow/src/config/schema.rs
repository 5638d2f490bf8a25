use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    pub data_directory: String,
    /// Defaults to `<data_directory>/contractflow.db`.
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub workers: WorkerSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub resilience: ResilienceSettings,
    #[serde(default)]
    pub broadcast: BroadcastSettings,
    #[serde(default)]
    pub mirror: MirrorSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Builds a configuration with every section at its default.
    pub fn with_data_directory(data_directory: impl Into<String>) -> Self {
        Self {
            version: "1.0".to_string(),
            data_directory: data_directory.into(),
            database_path: None,
            environment: Environment::default(),
            workers: WorkerSettings::default(),
            queue: QueueSettings::default(),
            pipeline: PipelineSettings::default(),
            resilience: ResilienceSettings::default(),
            broadcast: BroadcastSettings::default(),
            mirror: MirrorSettings::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        match &self.database_path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(&self.data_directory).join("contractflow.db"),
        }
    }

    /// Directory holding chunk parts and assembled documents.
    pub fn storage_directory(&self) -> PathBuf {
        PathBuf::from(&self.data_directory).join("storage")
    }
}

/// Controls how much error detail reaches callers.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Development,
}

impl Environment {
    pub fn exposes_error_detail(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_lease_timeout_secs")]
    pub lease_timeout_secs: u64,
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_lease_timeout_secs() -> u64 {
    300
}

impl WorkerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_timeout_secs: default_lease_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Lower is more urgent.
    #[serde(default = "default_priority")]
    pub default_priority: i32,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_priority() -> i32 {
    50
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    300_000
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            default_priority: default_priority(),
            default_max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default = "default_extraction_priority")]
    pub extraction_priority: i32,
    #[serde(default = "default_priority")]
    pub analysis_priority: i32,
    #[serde(default = "default_merge_priority")]
    pub merge_priority: i32,
    #[serde(default = "default_rule_priority")]
    pub rule_extraction_priority: i32,
    /// Chain a rule-extraction job after a document completes.
    #[serde(default = "default_true")]
    pub rule_extraction_enabled: bool,
    /// How many times a FAILED document may be sent back through extraction.
    #[serde(default = "default_max_retries")]
    pub max_document_retries: u32,
}

fn default_extraction_priority() -> i32 {
    40
}

fn default_merge_priority() -> i32 {
    60
}

fn default_rule_priority() -> i32 {
    70
}

fn default_true() -> bool {
    true
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            extraction_priority: default_extraction_priority(),
            analysis_priority: default_priority(),
            merge_priority: default_merge_priority(),
            rule_extraction_priority: default_rule_priority(),
            rule_extraction_enabled: true,
            max_document_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Occurrences of one error signature before a warning is logged.
    #[serde(default = "default_pattern_threshold")]
    pub error_pattern_threshold: u64,
    #[serde(default = "default_pattern_window_secs")]
    pub error_pattern_window_secs: u64,
    #[serde(default)]
    pub retry: RetrySettings,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_call_timeout_secs() -> u64 {
    60
}

fn default_pattern_threshold() -> u64 {
    10
}

fn default_pattern_window_secs() -> u64 {
    300
}

impl ResilienceSettings {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn error_pattern_window(&self) -> Duration {
        Duration::from_secs(self.error_pattern_window_secs)
    }
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            error_pattern_threshold: default_pattern_threshold(),
            error_pattern_window_secs: default_pattern_window_secs(),
            retry: RetrySettings::default(),
        }
    }
}

/// Per-category retry policies. Validation and authentication errors are
/// never retried and have no entry here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_network_policy")]
    pub network: RetryPolicySettings,
    #[serde(default = "default_database_policy")]
    pub database: RetryPolicySettings,
    #[serde(default = "default_unknown_policy")]
    pub unknown: RetryPolicySettings,
}

fn default_network_policy() -> RetryPolicySettings {
    RetryPolicySettings {
        max_attempts: 3,
        base_delay_ms: 500,
        max_delay_ms: 10_000,
        backoff: BackoffCurve::Exponential,
    }
}

fn default_database_policy() -> RetryPolicySettings {
    RetryPolicySettings {
        max_attempts: 3,
        base_delay_ms: 250,
        max_delay_ms: 5_000,
        backoff: BackoffCurve::Linear,
    }
}

fn default_unknown_policy() -> RetryPolicySettings {
    RetryPolicySettings {
        max_attempts: 2,
        base_delay_ms: 1_000,
        max_delay_ms: 1_000,
        backoff: BackoffCurve::Fixed,
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            network: default_network_policy(),
            database: default_database_policy(),
            unknown: default_unknown_policy(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicySettings {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    #[serde(default)]
    pub backoff: BackoffCurve,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffCurve {
    #[default]
    Exponential,
    Linear,
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastSettings {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_capacity() -> usize {
    256
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorSettings {
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    #[serde(default)]
    pub state_file: Option<String>,
}

fn default_grace_period_secs() -> u64 {
    10
}

impl MirrorSettings {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

impl Default for MirrorSettings {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
            state_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}
