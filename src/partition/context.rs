use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::ConfigurationError, mapping::resolver::template_path};

/// Delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Backoff {
    Fixed {
        #[serde(rename = "delayMillis")]
        delay_millis: u64,
    },
    Exponential {
        #[serde(rename = "initialMillis")]
        initial_millis: u64,
        multiplier: u32,
        #[serde(rename = "maxMillis")]
        max_millis: u64,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed { delay_millis: 1000 }
    }
}

/// How often and how patiently a failing unit of work is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfiguration {
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for RetryConfiguration {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryConfiguration {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Backoff::Fixed { delay_millis: 0 },
        }
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed {
                delay_millis: delay.as_millis() as u64,
            },
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed { delay_millis } => Duration::from_millis(delay_millis),
            Backoff::Exponential {
                initial_millis,
                multiplier,
                max_millis,
            } => {
                let factor = u64::from(multiplier.max(1)).saturating_pow(attempt.saturating_sub(1));
                Duration::from_millis(initial_millis.saturating_mul(factor).min(max_millis))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl FromStr for IsolationLevel {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace([' ', '-'], "_").as_str() {
            "READ_UNCOMMITTED" => Ok(IsolationLevel::ReadUncommitted),
            "READ_COMMITTED" => Ok(IsolationLevel::ReadCommitted),
            "REPEATABLE_READ" => Ok(IsolationLevel::RepeatableRead),
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            other => Err(ConfigurationError::Invalid(format!(
                "unknown isolation level `{other}`"
            ))),
        }
    }
}

/// Where a partition reads from and which mapping it uses.
///
/// `template_path` follows the `{source_system}/{job}/{transaction_type}.yml`
/// naming convention so that partitions without a stored configuration can
/// still resolve a static template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileConfig {
    pub source_system: String,
    pub job: String,
    pub transaction_type: String,
    pub template_path: PathBuf,
    pub input_path: Option<PathBuf>,
    pub config_id: Option<String>,
}

impl FileConfig {
    pub fn new(source_system: &str, job: &str, transaction_type: &str) -> Self {
        Self {
            source_system: source_system.to_string(),
            job: job.to_string(),
            transaction_type: transaction_type.to_string(),
            template_path: template_path(source_system, job, transaction_type),
            input_path: None,
            config_id: None,
        }
    }

    pub fn with_input(mut self, input_path: PathBuf) -> Self {
        self.input_path = Some(input_path);
        self
    }

    pub fn with_config_id(mut self, config_id: Option<String>) -> Self {
        self.config_id = config_id;
        self
    }
}

/// One unit of parallel work, consumed by exactly one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionContext {
    /// Shared by every partition of one job invocation.
    pub execution_id: Uuid,
    pub correlation_id: Uuid,
    pub partition_id: String,
    pub transaction_type: String,
    pub processing_order: u32,
    pub parallel_threads: usize,
    pub chunk_size: usize,
    pub skip_limit: usize,
    pub isolation_level: IsolationLevel,
    pub timeout_seconds: u64,
    pub retry: RetryConfiguration,
    pub compliance_level: String,
    pub encryption_required: bool,
    pub encryption_fields: Vec<String>,
    pub file_config: FileConfig,
    /// Set on partitions produced by the per-file fallback.
    pub fallback: bool,
}

impl PartitionContext {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Rejects contexts that a worker could not run.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.parallel_threads == 0 {
            return Err(ConfigurationError::Invalid(format!(
                "partition {}: parallelThreads must be >= 1",
                self.partition_id
            )));
        }
        if self.chunk_size == 0 {
            return Err(ConfigurationError::Invalid(format!(
                "partition {}: chunkSize must be >= 1",
                self.partition_id
            )));
        }
        Ok(())
    }
}

impl fmt::Display for PartitionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{} threads={} chunk={}{}]",
            self.partition_id,
            self.transaction_type,
            self.parallel_threads,
            self.chunk_size,
            if self.fallback { " fallback" } else { "" }
        )
    }
}
