//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::execution::retry::RetryPolicy;

/// Environment variable prefix for every engine setting.
const ENV_PREFIX: &str = "AGENT_DISPATCH_";

/// Order in which queued tasks are handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStrategy {
    Fifo,
    Lifo,
    #[default]
    Priority,
}

impl FromStr for QueueStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fifo" => Ok(Self::Fifo),
            "lifo" => Ok(Self::Lifo),
            "priority" => Ok(Self::Priority),
            other => Err(ConfigError::ParseError(format!(
                "unknown queue strategy '{other}' (expected fifo, lifo or priority)"
            ))),
        }
    }
}

/// Task queue configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of queued (not yet dispatched) tasks.
    pub max_size: usize,
    /// Admission strategy.
    pub strategy: QueueStrategy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            strategy: QueueStrategy::Priority,
        }
    }
}

/// Agent pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Upper bound on live instances (idle + in use) per agent type.
    pub max_agents_per_type: usize,
    /// Construct `warm_agents_per_type` instances of every type at startup.
    pub initialize_on_startup: bool,
    /// Instances per type built by `initialize_pools()`.
    pub warm_agents_per_type: usize,
    /// How often idle instances are checked for eviction.
    pub health_check_interval: Duration,
    /// Idle instances older than this are destroyed.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_agents_per_type: 3,
            initialize_on_startup: false,
            warm_agents_per_type: 1,
            health_check_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(300), // 5 minutes
        }
    }
}

/// What `TaskScheduler::shutdown` does with outstanding work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPolicy {
    /// Let queued and in-flight tasks finish (bounded by the grace period).
    #[default]
    Drain,
    /// Cancel queued tasks and flag in-flight ones.
    Cancel,
}

impl FromStr for ShutdownPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drain" => Ok(Self::Drain),
            "cancel" => Ok(Self::Cancel),
            other => Err(ConfigError::ParseError(format!(
                "unknown shutdown policy '{other}' (expected drain or cancel)"
            ))),
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Maximum number of tasks executing at once.
    pub max_concurrency: usize,
    /// Default retry limit for transient failures (tasks may override).
    pub max_retries: u32,
    /// Advisory deadline applied to tasks that don't carry their own.
    pub default_timeout: Option<Duration>,
    /// Delay curve between attempts.
    pub retry: RetryPolicy,
    pub shutdown_policy: ShutdownPolicy,
    /// How long `shutdown()` waits for outstanding work before cancelling it.
    pub shutdown_grace: Duration,
    /// Drop the worker call future once its deadline passes instead of
    /// waiting for it to return.
    pub enforce_deadlines: bool,
    /// Finished task records kept for `task_context()` lookups.
    pub retained_contexts: usize,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            max_retries: 3,
            default_timeout: Some(Duration::from_secs(120)),
            retry: RetryPolicy::default(),
            shutdown_policy: ShutdownPolicy::Drain,
            shutdown_grace: Duration::from_secs(30),
            enforce_deadlines: false,
            retained_contexts: 500,
            event_capacity: 256,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineConfig {
    pub queue: QueueConfig,
    pub pool: PoolConfig,
    pub scheduler: SchedulerConfig,
}

impl EngineConfig {
    /// Build config from `AGENT_DISPATCH_*` environment variables.
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup (keys include the prefix).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let mut config = Self::default();

        if let Some(v) = env.parse::<usize>("QUEUE_MAX_SIZE")? {
            config.queue.max_size = v;
        }
        if let Some(v) = env.parse::<QueueStrategy>("QUEUE_STRATEGY")? {
            config.queue.strategy = v;
        }

        if let Some(v) = env.parse::<usize>("MAX_AGENTS_PER_TYPE")? {
            config.pool.max_agents_per_type = v;
        }
        if let Some(v) = env.parse::<bool>("INITIALIZE_ON_STARTUP")? {
            config.pool.initialize_on_startup = v;
        }
        if let Some(v) = env.parse::<usize>("WARM_AGENTS_PER_TYPE")? {
            config.pool.warm_agents_per_type = v;
        }
        if let Some(v) = env.millis("HEALTH_CHECK_INTERVAL_MS")? {
            config.pool.health_check_interval = v;
        }
        if let Some(v) = env.millis("IDLE_TIMEOUT_MS")? {
            config.pool.idle_timeout = v;
        }

        if let Some(v) = env.parse::<usize>("MAX_CONCURRENCY")? {
            config.scheduler.max_concurrency = v;
        }
        if let Some(v) = env.parse::<u32>("MAX_RETRIES")? {
            config.scheduler.max_retries = v;
        }
        if let Some(v) = env.parse::<u64>("TASK_TIMEOUT_MS")? {
            // 0 disables the default deadline
            config.scheduler.default_timeout = (v > 0).then(|| Duration::from_millis(v));
        }
        if let Some(v) = env.millis("RETRY_BASE_DELAY_MS")? {
            config.scheduler.retry.base_delay = v;
        }
        if let Some(v) = env.millis("RETRY_MAX_DELAY_MS")? {
            config.scheduler.retry.max_delay = v;
        }
        if let Some(v) = env.parse::<f64>("RETRY_JITTER")? {
            config.scheduler.retry.jitter = v;
        }
        if let Some(v) = env.parse::<ShutdownPolicy>("SHUTDOWN_POLICY")? {
            config.scheduler.shutdown_policy = v;
        }
        if let Some(v) = env.millis("SHUTDOWN_GRACE_MS")? {
            config.scheduler.shutdown_grace = v;
        }
        if let Some(v) = env.parse::<bool>("ENFORCE_DEADLINES")? {
            config.scheduler.enforce_deadlines = v;
        }
        if let Some(v) = env.parse::<usize>("RETAINED_CONTEXTS")? {
            config.scheduler.retained_contexts = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.max_size == 0 {
            return Err(invalid("queue.max_size", "must be at least 1"));
        }
        if self.pool.max_agents_per_type == 0 {
            return Err(invalid("pool.max_agents_per_type", "must be at least 1"));
        }
        if self.pool.health_check_interval.is_zero() {
            return Err(invalid("pool.health_check_interval", "must be non-zero"));
        }
        if self.scheduler.max_concurrency == 0 {
            return Err(invalid("scheduler.max_concurrency", "must be at least 1"));
        }
        if self.scheduler.event_capacity == 0 {
            return Err(invalid("scheduler.event_capacity", "must be at least 1"));
        }
        if self.scheduler.retained_contexts == 0 {
            return Err(invalid("scheduler.retained_contexts", "must be at least 1"));
        }
        self.scheduler.retry.validate()
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T>(&self, name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let key = format!("{ENV_PREFIX}{name}");
        match (self.lookup)(&key) {
            None => Ok(None),
            Some(raw) if raw.trim().is_empty() => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::InvalidValue {
                    key,
                    message: format!("'{raw}': {e}"),
                }),
        }
    }

    fn millis(&self, name: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_millis))
    }
}
