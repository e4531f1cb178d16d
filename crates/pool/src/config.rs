//! Pool configuration and service definitions

use std::collections::HashMap;
use std::time::Duration;

use cannon_ledger::{Block, Fields};
use serde::{Deserialize, Serialize};

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Period between controller stats reports
    #[serde(with = "duration_millis")]
    pub cooldown: Duration,

    /// Read timeout of workers spawned on `Hot`
    #[serde(with = "duration_millis")]
    pub hot_block: Duration,

    /// Read timeout of workers spawned on `Idle`
    #[serde(with = "duration_millis")]
    pub idle_block: Duration,

    /// Messages each worker reads before exiting
    #[serde(deserialize_with = "at_least_one")]
    pub batch_count: usize,

    /// Capacity of the controller's signal channel
    #[serde(deserialize_with = "at_least_one")]
    pub signal_capacity: usize,

    /// Sleep after an ingestion iteration that did nothing
    #[serde(with = "duration_millis")]
    pub idle_sleep: Duration,

    /// Write collected data without signalling `Hot`
    pub lazy: bool,

    /// Build a fresh shell for every message instead of once per worker
    pub recall_shell: bool,

    /// Spawn a backlog worker at controller start
    pub reclaim_backlog: bool,

    /// Pending entries a backlog worker claims
    #[serde(deserialize_with = "at_least_one")]
    pub backlog_count: usize,

    /// Minimum idle time before a pending entry may be claimed
    #[serde(with = "duration_millis")]
    pub backlog_min_idle: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(60),
            hot_block: Duration::from_millis(1000),
            idle_block: Duration::from_millis(30_000),
            batch_count: 1,
            signal_capacity: 2,
            idle_sleep: Duration::from_millis(5),
            lazy: false,
            recall_shell: false,
            reclaim_backlog: false,
            backlog_count: 100,
            backlog_min_idle: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `CANNON_COOLDOWN_SECS`: Stats period (default: 60)
    /// - `CANNON_HOT_BLOCK_MS`: Hot worker read timeout (default: 1000)
    /// - `CANNON_IDLE_BLOCK_MS`: Idle worker read timeout (default: 30000)
    /// - `CANNON_LAZY`: Skip `Hot` signals ("true" to enable)
    /// - `CANNON_RECALL_SHELL`: Fresh shell per message ("true" to enable)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            cooldown: env_u64("CANNON_COOLDOWN_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.cooldown),
            hot_block: env_u64("CANNON_HOT_BLOCK_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.hot_block),
            idle_block: env_u64("CANNON_IDLE_BLOCK_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.idle_block),
            lazy: env_flag("CANNON_LAZY"),
            recall_shell: env_flag("CANNON_RECALL_SHELL"),
            ..defaults
        }
    }

    /// Set stats period
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Set hot and idle worker read timeouts
    pub fn with_blocks(mut self, hot: Duration, idle: Duration) -> Self {
        self.hot_block = hot;
        self.idle_block = idle;
        self
    }

    /// Set messages per worker
    pub fn with_batch_count(mut self, count: usize) -> Self {
        self.batch_count = count.max(1);
        self
    }

    /// Set signal channel capacity
    pub fn with_signal_capacity(mut self, capacity: usize) -> Self {
        self.signal_capacity = capacity.max(1);
        self
    }

    /// Set sleep after an idle ingestion iteration
    pub fn with_idle_sleep(mut self, sleep: Duration) -> Self {
        self.idle_sleep = sleep;
        self
    }

    /// Enable or disable lazy ingestion
    pub fn with_lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    /// Enable or disable per-message shells
    pub fn with_recall_shell(mut self, recall: bool) -> Self {
        self.recall_shell = recall;
        self
    }

    /// Enable backlog reclaim at start
    pub fn with_backlog_reclaim(mut self, count: usize, min_idle: Duration) -> Self {
        self.reclaim_backlog = true;
        self.backlog_count = count.max(1);
        self.backlog_min_idle = min_idle;
        self
    }

    pub(crate) fn hot_read(&self) -> Block {
        Block::For(self.hot_block)
    }

    pub(crate) fn idle_read(&self) -> Block {
        Block::For(self.idle_block)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

/// Registry entry plus the params key it reads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySpec {
    /// Registered factory name
    pub entry_point: String,

    /// Key into [`ServiceDefinition::params`]
    #[serde(default)]
    pub config_key: Option<String>,
}

/// One step of a service's task pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub entry_point: String,
    #[serde(default)]
    pub config_key: Option<String>,
    /// Whether the task is handed the service shell
    #[serde(default)]
    pub uses_shell: bool,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entry_point: entry_point.into(),
            config_key: None,
            uses_shell: false,
        }
    }

    pub fn with_config_key(mut self, key: impl Into<String>) -> Self {
        self.config_key = Some(key.into());
        self
    }

    pub fn with_shell(mut self) -> Self {
        self.uses_shell = true;
        self
    }
}

/// Parsed service definition
///
/// Loading the definition from a file is left to the caller; any serde
/// format works.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,

    #[serde(default)]
    pub shell: Option<EntrySpec>,

    /// Ordered pipeline
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,

    /// Params blocks referenced by `config_key`
    #[serde(default)]
    pub params: HashMap<String, Fields>,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_task(mut self, task: TaskSpec) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_shell(mut self, entry_point: impl Into<String>, config_key: Option<&str>) -> Self {
        self.shell = Some(EntrySpec {
            entry_point: entry_point.into(),
            config_key: config_key.map(str::to_string),
        });
        self
    }

    pub fn with_params(mut self, key: impl Into<String>, params: Fields) -> Self {
        self.params.insert(key.into(), params);
        self
    }
}

fn at_least_one<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(usize::deserialize(deserializer)?.max(1))
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
