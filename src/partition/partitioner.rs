use std::{collections::BTreeMap, path::PathBuf};

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::ConfigurationError, BatchError};

use super::context::{FileConfig, IsolationLevel, PartitionContext, RetryConfiguration};

/// One row of transaction-type configuration for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionTypeConfig {
    pub transaction_type: String,
    pub processing_order: u32,
    pub parallel_threads: usize,
    pub chunk_size: usize,
    /// Bad rows tolerated before the partition fails; unbounded by default.
    #[serde(default = "default_skip_limit")]
    pub skip_limit: usize,
    #[serde(default)]
    pub isolation_level: IsolationLevel,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub retry_configuration: RetryConfiguration,
    #[serde(default = "default_compliance")]
    pub compliance_level: String,
    #[serde(default)]
    pub encryption_required: bool,
    #[serde(default)]
    pub encryption_fields: Vec<String>,
    #[serde(default = "default_active")]
    pub active_flag: bool,
    /// Stored mapping configuration id, if the type is not template-driven.
    #[serde(default)]
    pub config_id: Option<String>,
    #[serde(default)]
    pub input_path: Option<PathBuf>,
}

/// Skip limit that lets every malformed row be skipped and counted.
pub const UNBOUNDED_SKIPS: usize = usize::MAX;

fn default_skip_limit() -> usize {
    UNBOUNDED_SKIPS
}

fn default_timeout() -> u64 {
    3600
}

fn default_compliance() -> String {
    "STANDARD".to_string()
}

fn default_active() -> bool {
    true
}

impl TransactionTypeConfig {
    pub fn new(transaction_type: &str, processing_order: u32) -> Self {
        Self {
            transaction_type: transaction_type.to_string(),
            processing_order,
            parallel_threads: 1,
            chunk_size: 1000,
            skip_limit: default_skip_limit(),
            isolation_level: IsolationLevel::default(),
            timeout_seconds: default_timeout(),
            retry_configuration: RetryConfiguration::default(),
            compliance_level: default_compliance(),
            encryption_required: false,
            encryption_fields: Vec::new(),
            active_flag: true,
            config_id: None,
            input_path: None,
        }
    }
}

/// Source of transaction-type configuration rows.
pub trait TransactionTypeConfigStore: Send + Sync {
    fn load_for_job(&self, source_system: &str, job: &str) -> Result<Vec<TransactionTypeConfig>, BatchError>;
}

/// Splits a job into independently executable partitions keyed by partition id.
pub trait Partitioner {
    fn partition(&self, grid_size: usize) -> Result<BTreeMap<String, PartitionContext>, BatchError>;
}

/// Partitions a job by transaction type, falling back to one partition per
/// input file when the job has no transaction-type configuration.
///
/// Any store failure is fatal: a partial partition set would silently drop
/// transaction types.
pub struct TransactionTypePartitioner<'a> {
    store: &'a dyn TransactionTypeConfigStore,
    source_system: String,
    job: String,
    fallback_files: Vec<PathBuf>,
    fallback_chunk_size: usize,
    fallback_skip_limit: usize,
    fallback_retry: RetryConfiguration,
}

impl TransactionTypePartitioner<'_> {
    fn active_configs(&self) -> Result<Vec<TransactionTypeConfig>, BatchError> {
        let mut configs = self
            .store
            .load_for_job(&self.source_system, &self.job)
            .map_err(|e| {
                error!(
                    "Loading transaction types for {}/{} failed: {}",
                    self.source_system, self.job, e
                );
                BatchError::Partition(format!(
                    "cannot load transaction types for {}/{}: {}",
                    self.source_system, self.job, e
                ))
            })?;
        configs.retain(|c| c.active_flag);
        configs.sort_by_key(|c| c.processing_order);
        Ok(configs)
    }

    fn by_transaction_type(
        &self,
        configs: Vec<TransactionTypeConfig>,
        execution_id: Uuid,
    ) -> Result<BTreeMap<String, PartitionContext>, BatchError> {
        let mut partitions = BTreeMap::new();

        for config in configs {
            let partition_id = format!("partition-{}", config.transaction_type);
            let file_config = FileConfig::new(&self.source_system, &self.job, &config.transaction_type)
                .with_config_id(config.config_id.clone());
            let file_config = match config.input_path.clone() {
                Some(input) => file_config.with_input(input),
                None => file_config,
            };

            let context = PartitionContext {
                execution_id,
                correlation_id: Uuid::new_v4(),
                partition_id: partition_id.clone(),
                transaction_type: config.transaction_type,
                processing_order: config.processing_order,
                parallel_threads: config.parallel_threads,
                chunk_size: config.chunk_size,
                skip_limit: config.skip_limit,
                isolation_level: config.isolation_level,
                timeout_seconds: config.timeout_seconds,
                retry: config.retry_configuration,
                compliance_level: config.compliance_level,
                encryption_required: config.encryption_required,
                encryption_fields: config.encryption_fields,
                file_config,
                fallback: false,
            };
            context.validate().map_err(BatchError::from)?;

            if partitions.insert(partition_id.clone(), context).is_some() {
                return Err(ConfigurationError::Invalid(format!(
                    "transaction type configured twice: {partition_id}"
                ))
                .into());
            }
        }

        Ok(partitions)
    }

    fn by_file(&self, execution_id: Uuid) -> Result<BTreeMap<String, PartitionContext>, BatchError> {
        if self.fallback_files.is_empty() {
            return Err(BatchError::Partition(format!(
                "no transaction types and no input files for {}/{}",
                self.source_system, self.job
            )));
        }

        let partitions = self
            .fallback_files
            .iter()
            .enumerate()
            .map(|(index, path)| {
                let transaction_type = path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_else(|| format!("file{index}"));
                let partition_id = format!("partition{index}");
                let context = PartitionContext {
                    execution_id,
                    correlation_id: Uuid::new_v4(),
                    partition_id: partition_id.clone(),
                    file_config: FileConfig::new(&self.source_system, &self.job, &transaction_type)
                        .with_input(path.clone()),
                    transaction_type,
                    processing_order: index as u32,
                    parallel_threads: 1,
                    chunk_size: self.fallback_chunk_size,
                    skip_limit: self.fallback_skip_limit,
                    isolation_level: IsolationLevel::default(),
                    timeout_seconds: default_timeout(),
                    retry: self.fallback_retry,
                    compliance_level: default_compliance(),
                    encryption_required: false,
                    encryption_fields: Vec::new(),
                    fallback: true,
                };
                (partition_id, context)
            })
            .collect();

        Ok(partitions)
    }
}

impl Partitioner for TransactionTypePartitioner<'_> {
    fn partition(&self, grid_size: usize) -> Result<BTreeMap<String, PartitionContext>, BatchError> {
        let execution_id = Uuid::new_v4();
        let configs = self.active_configs()?;

        if configs.is_empty() {
            warn!(
                "No transaction types configured for {}/{}, partitioning per input file",
                self.source_system, self.job
            );
            return self.by_file(execution_id);
        }

        let partitions = self.by_transaction_type(configs, execution_id)?;
        if partitions.len() > grid_size {
            info!(
                "{} partitions exceed grid size {}, some will queue",
                partitions.len(),
                grid_size
            );
        }
        info!(
            "Created {} partitions for {}/{} (execution {})",
            partitions.len(),
            self.source_system,
            self.job,
            execution_id
        );
        Ok(partitions)
    }
}

pub struct TransactionTypePartitionerBuilder<'a> {
    store: Option<&'a dyn TransactionTypeConfigStore>,
    source_system: String,
    job: String,
    fallback_files: Vec<PathBuf>,
    fallback_chunk_size: usize,
    fallback_skip_limit: usize,
    fallback_retry: RetryConfiguration,
}

impl<'a> TransactionTypePartitionerBuilder<'a> {
    pub fn new(source_system: &str, job: &str) -> Self {
        Self {
            store: None,
            source_system: source_system.to_string(),
            job: job.to_string(),
            fallback_files: Vec::new(),
            fallback_chunk_size: 1000,
            fallback_skip_limit: UNBOUNDED_SKIPS,
            fallback_retry: RetryConfiguration::default(),
        }
    }

    pub fn store(mut self, store: &'a dyn TransactionTypeConfigStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Input files used when no transaction type is configured.
    pub fn fallback_files(mut self, files: Vec<PathBuf>) -> Self {
        self.fallback_files = files;
        self
    }

    pub fn fallback_chunk_size(mut self, chunk_size: usize) -> Self {
        self.fallback_chunk_size = chunk_size.max(1);
        self
    }

    pub fn fallback_skip_limit(mut self, skip_limit: usize) -> Self {
        self.fallback_skip_limit = skip_limit;
        self
    }

    pub fn fallback_retry(mut self, retry: RetryConfiguration) -> Self {
        self.fallback_retry = retry;
        self
    }

    pub fn build(self) -> Result<TransactionTypePartitioner<'a>, BatchError> {
        let store = self
            .store
            .ok_or_else(|| BatchError::Partition("transaction type store is required".to_string()))?;

        Ok(TransactionTypePartitioner {
            store,
            source_system: self.source_system,
            job: self.job,
            fallback_files: self.fallback_files,
            fallback_chunk_size: self.fallback_chunk_size,
            fallback_skip_limit: self.fallback_skip_limit,
            fallback_retry: self.fallback_retry,
        })
    }
}
