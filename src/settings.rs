//! Engine-wide settings.
//!
//! Every field has a default, so a settings file only needs the values it
//! changes:
//!
//! ```
//! use etl_batch_rs::settings::EngineSettings;
//!
//! let settings = EngineSettings::from_yaml_str("template_root: /opt/etl/templates\ngrid_size: 8\n").unwrap();
//! assert_eq!(settings.grid_size, 8);
//! assert_eq!(settings.output_delimiter, "|");
//! ```

use std::{fs, path::Path, path::PathBuf, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigurationError,
    mapping::{
        processor::{FieldProtector, HashingProtector},
        resolver::ConfigurationResolverBuilder,
    },
    partition::{
        context::RetryConfiguration,
        partitioner::{TransactionTypePartitionerBuilder, UNBOUNDED_SKIPS},
    },
    tracker::IdempotencyTrackerBuilder,
    BatchError,
};

/// Upper bound for every duration setting: one hundred years.
const MAX_DURATION_SECONDS: u64 = 36_525 * 24 * 3600;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Directory holding `{source_system}/{job}/{transaction_type}.yml` templates
    pub template_root: PathBuf,
    /// Directory receiving one output file per partition
    pub output_dir: PathBuf,
    /// Maximum age of a cached mapping set; absent means until invalidated
    pub cache_ttl_seconds: Option<u64>,
    /// Reject CONDITIONAL mappings without an else branch
    pub strict_conditionals: bool,
    /// Fail a record instead of defaulting an unresolvable field
    pub strict_records: bool,
    /// Lifetime of idempotency records
    pub idempotency_ttl_seconds: u64,
    /// How long audit records are kept
    pub audit_retention_days: u32,
    /// IN_PROGRESS records older than this are reported as stale
    pub staleness_threshold_seconds: u64,
    /// Worker pool size for partition dispatch
    pub grid_size: usize,
    /// Chunk size for partitions created by the per-file fallback
    pub fallback_chunk_size: usize,
    /// Bad rows tolerated by fallback partitions; absent means unbounded
    pub fallback_skip_limit: Option<usize>,
    pub retry: RetryConfiguration,
    /// Delimiter for DELIMITED output when the mapping set does not name one
    pub output_delimiter: String,
    /// Salt for tokenizing encrypted fields
    pub protection_salt: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            template_root: PathBuf::from("templates"),
            output_dir: PathBuf::from("output"),
            cache_ttl_seconds: None,
            strict_conditionals: true,
            strict_records: false,
            idempotency_ttl_seconds: 7 * 24 * 3600,
            audit_retention_days: 7 * 365,
            staleness_threshold_seconds: 4 * 3600,
            grid_size: 4,
            fallback_chunk_size: 1000,
            fallback_skip_limit: None,
            retry: RetryConfiguration::default(),
            output_delimiter: "|".to_string(),
            protection_salt: String::new(),
        }
    }
}

impl EngineSettings {
    pub fn from_yaml_str(raw: &str) -> Result<Self, BatchError> {
        let settings: Self = serde_yaml::from_str(raw).map_err(|e| ConfigurationError::Parse(e.to_string()))?;
        settings.validate()
    }

    pub fn from_json_str(raw: &str) -> Result<Self, BatchError> {
        let settings: Self = serde_json::from_str(raw).map_err(|e| ConfigurationError::Parse(e.to_string()))?;
        settings.validate()
    }

    /// Loads a `.json` file as JSON and anything else as YAML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, BatchError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&raw),
            _ => Self::from_yaml_str(&raw),
        }
    }

    fn validate(self) -> Result<Self, BatchError> {
        if self.grid_size == 0 {
            return Err(ConfigurationError::Invalid("grid_size must be >= 1".to_string()).into());
        }
        if self.fallback_chunk_size == 0 {
            return Err(ConfigurationError::Invalid("fallback_chunk_size must be >= 1".to_string()).into());
        }
        for (name, seconds) in [
            ("idempotency_ttl_seconds", self.idempotency_ttl_seconds),
            ("staleness_threshold_seconds", self.staleness_threshold_seconds),
            ("audit_retention_days", u64::from(self.audit_retention_days).saturating_mul(24 * 3600)),
        ] {
            if seconds > MAX_DURATION_SECONDS {
                return Err(ConfigurationError::Invalid(format!("{name} exceeds one hundred years")).into());
            }
        }
        Ok(self)
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_seconds.map(Duration::from_secs)
    }

    pub fn idempotency_ttl(&self) -> chrono::Duration {
        bounded_seconds(self.idempotency_ttl_seconds)
    }

    pub fn audit_retention(&self) -> chrono::Duration {
        bounded_seconds(u64::from(self.audit_retention_days).saturating_mul(24 * 3600))
    }

    pub fn staleness_threshold(&self) -> chrono::Duration {
        bounded_seconds(self.staleness_threshold_seconds)
    }

    /// Resolver reading templates from `template_root`.
    pub fn resolver_builder(&self) -> ConfigurationResolverBuilder {
        ConfigurationResolverBuilder::new()
            .template_root(&self.template_root)
            .cache_ttl(self.cache_ttl())
            .strict_conditionals(self.strict_conditionals)
            .default_delimiter(&self.output_delimiter)
    }

    pub fn tracker_builder(&self) -> IdempotencyTrackerBuilder {
        IdempotencyTrackerBuilder::new()
            .ttl(self.idempotency_ttl())
            .max_retries(self.retry.max_retries)
    }

    pub fn partitioner_builder<'a>(&self, source_system: &str, job: &str) -> TransactionTypePartitionerBuilder<'a> {
        TransactionTypePartitionerBuilder::new(source_system, job)
            .fallback_chunk_size(self.fallback_chunk_size)
            .fallback_skip_limit(self.fallback_skip_limit.unwrap_or(UNBOUNDED_SKIPS))
            .fallback_retry(self.retry)
    }

    /// Tokenizer for encrypted fields; `None` without a salt.
    pub fn protector(&self) -> Option<Arc<dyn FieldProtector>> {
        if self.protection_salt.is_empty() {
            None
        } else {
            Some(Arc::new(HashingProtector::new(&self.protection_salt)))
        }
    }

    /// Partition worker writing into `output_dir`.
    #[cfg(all(feature = "csv", feature = "logger"))]
    pub fn worker_builder<'a>(&self, run_id: &str) -> crate::pipeline::TransactionTypeWorkerBuilder<'a> {
        let builder = crate::pipeline::TransactionTypeWorkerBuilder::new(run_id)
            .output_dir(&self.output_dir)
            .strict_records(self.strict_records);
        match self.protector() {
            Some(protector) => builder.protector(protector),
            None => builder,
        }
    }
}

/// Values above the validated maximum are clamped to it.
fn bounded_seconds(seconds: u64) -> chrono::Duration {
    let seconds = i64::try_from(seconds.min(MAX_DURATION_SECONDS)).unwrap_or(i64::MAX);
    chrono::Duration::try_seconds(seconds).unwrap_or_else(|| chrono::Duration::days(36_525))
}
