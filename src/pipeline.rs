//! Per-transaction-type worker: CSV extract -> mapped records -> flat file.
//!
//! Each partition is tracked under the idempotency key
//! `{source_system}:{job}:{run_id}-{transaction_type}`, so rerunning the same
//! run skips partitions that already completed. A partition whose record is
//! IN_PROGRESS under another claimant is left alone until an operator cancels it.

use std::{path::PathBuf, sync::Arc, time::Instant};

use log::{error, info, warn};

use crate::{
    core::{
        item::ItemWriter,
        step::{Step, StepBuilder, StepExecution, StepStatus},
    },
    item::{csv::csv_reader::CsvRecordReaderBuilder, flat_file::FlatFileItemWriterBuilder, logger::LoggerWriter},
    mapping::{
        processor::{FieldProtector, OutputRow, RecordProcessor},
        record::Record,
        resolver::{ConfigurationResolver, ResolveRequest},
    },
    partition::{context::PartitionContext, step::PartitionWorker},
    tracker::{idempotency_key, IdempotencyTracker, ProcessingState, TransitionDetails, TransitionOutcome},
    BatchError,
};

pub struct TransactionTypeWorker<'a> {
    resolver: &'a ConfigurationResolver,
    tracker: &'a IdempotencyTracker,
    run_id: String,
    output_dir: PathBuf,
    strict_records: bool,
    protector: Option<Arc<dyn FieldProtector>>,
    dry_run: bool,
}

impl TransactionTypeWorker<'_> {
    /// Output file of a partition: `{output_dir}/{transaction_type}.dat`.
    pub fn output_path(&self, context: &PartitionContext) -> PathBuf {
        self.output_dir.join(format!("{}.dat", context.transaction_type))
    }

    fn transaction_id(&self, context: &PartitionContext) -> String {
        format!("{}-{}", self.run_id, context.transaction_type)
    }

    /// Claims the partition in the tracker. `None` means there is nothing to do.
    fn claim(&self, context: &PartitionContext, execution: &mut StepExecution) -> Result<Option<String>, BatchError> {
        let file_config = &context.file_config;
        let key = idempotency_key(&file_config.source_system, &file_config.job, &self.transaction_id(context));
        let claim = self.tracker.claim_key(&key, context.retry.max_retries)?;
        let record = claim.record;

        match record.state {
            ProcessingState::InProgress if claim.created => Ok(Some(record.key)),
            ProcessingState::InProgress => {
                warn!("Partition {} is held by another execution as {}, skipping", context.partition_id, record.key);
                execution.status = StepStatus::Failed;
                execution.error_message = Some(format!(
                    "{} is in progress elsewhere (v{}, last update {})",
                    record.key, record.lock_version, record.updated_at
                ));
                Ok(None)
            }
            ProcessingState::Completed => {
                info!("Partition {} already completed as {}, skipping", context.partition_id, record.key);
                execution.status = StepStatus::Success;
                Ok(None)
            }
            ProcessingState::Failed if record.retries_exhausted() => {
                execution.status = StepStatus::Failed;
                execution.error_message = Some(format!("{} has no retries left", record.key));
                Ok(None)
            }
            ProcessingState::Failed => {
                let outcome = self.tracker.transition(
                    &record.key,
                    ProcessingState::InProgress,
                    record.lock_version,
                    TransitionDetails::reason("partition rerun").with_context(&context.correlation_id.to_string()),
                )?;
                match outcome {
                    TransitionOutcome::Applied(record) => Ok(Some(record.key)),
                    TransitionOutcome::Conflict { current_version } => Err(BatchError::ConcurrencyConflict {
                        key: record.key,
                        expected: record.lock_version,
                        actual: current_version,
                    }),
                }
            }
        }
    }

    fn process(&self, context: &PartitionContext, execution: &mut StepExecution) -> Result<(), BatchError> {
        let file_config = &context.file_config;
        let request = ResolveRequest {
            source_system: file_config.source_system.clone(),
            job: file_config.job.clone(),
            transaction_type: file_config.transaction_type.clone(),
            config_id: file_config.config_id.clone(),
        };
        let mapping_set = self.resolver.resolve(&request)?;

        let input = file_config
            .input_path
            .as_ref()
            .ok_or_else(|| BatchError::Partition(format!("partition {} has no input file", context.partition_id)))?;
        let reader = CsvRecordReaderBuilder::new().from_path(input)?;

        let mut processor = RecordProcessor::new(Arc::clone(&mapping_set)).strict(self.strict_records);
        if context.encryption_required {
            match &self.protector {
                Some(protector) => {
                    processor = processor.protect_fields(Arc::clone(protector), &context.encryption_fields);
                }
                None => {
                    return Err(BatchError::Partition(format!(
                        "partition {} requires encryption but no protector is configured",
                        context.partition_id
                    )))
                }
            }
        }

        let file_writer;
        let log_writer;
        let writer: &dyn ItemWriter<OutputRow> = if self.dry_run {
            log_writer = LoggerWriter::new(
                &context.transaction_type,
                mapping_set.file_type(),
                mapping_set.delimiter(),
            );
            &log_writer
        } else {
            file_writer = FlatFileItemWriterBuilder::new()
                .layout_of(&mapping_set)
                .from_path(self.output_path(context))?;
            &file_writer
        };

        let step = StepBuilder::new(&context.partition_id)
            .chunk::<Record, OutputRow>(context.chunk_size)
            .reader(&reader)
            .processor(&processor)
            .writer(writer)
            .skip_limit(context.skip_limit)
            .build()?;

        step.execute(execution)
    }
}

impl PartitionWorker for TransactionTypeWorker<'_> {
    fn execute(&self, context: &PartitionContext) -> StepExecution {
        let mut execution = StepExecution::new(&context.partition_id);

        let key = match self.claim(context, &mut execution) {
            Ok(Some(key)) => key,
            Ok(None) => return execution,
            Err(err) => {
                error!("Cannot claim partition {}: {}", context.partition_id, err);
                execution.fail(StepStatus::Failed, &err);
                return execution;
            }
        };

        let started = Instant::now();
        let mut result = self.process(context, &mut execution);
        let elapsed = started.elapsed();
        if result.is_ok() && elapsed > context.timeout() {
            result = Err(BatchError::Partition(format!(
                "partition {} exceeded its timeout of {}s ({:?})",
                context.partition_id, context.timeout_seconds, elapsed
            )));
        }

        let tracked = match &result {
            Ok(()) => {
                let summary = serde_json::json!({
                    "read": execution.read_count,
                    "written": execution.write_count,
                    "skipped": execution.read_error_count + execution.process_error_count,
                    "parallelThreads": context.parallel_threads,
                    "isolationLevel": context.isolation_level,
                });
                self.tracker.complete(&key, Some(&summary.to_string()))
            }
            Err(err) => {
                // Failures before the chunk step started leave the status open.
                if !execution.status.is_terminal() || execution.status == StepStatus::Success {
                    execution.fail(StepStatus::Failed, err);
                }
                let reason = execution.error_message.clone().unwrap_or_else(|| err.to_string());
                warn!("Partition {} failed: {}", context.partition_id, reason);
                self.tracker.fail(&key, &reason)
            }
        };

        if let Err(err) = tracked {
            error!("Cannot record outcome of {}: {}", key, err);
            execution.fail(StepStatus::Failed, &err);
        }
        execution
    }
}

pub struct TransactionTypeWorkerBuilder<'a> {
    resolver: Option<&'a ConfigurationResolver>,
    tracker: Option<&'a IdempotencyTracker>,
    run_id: String,
    output_dir: PathBuf,
    strict_records: bool,
    protector: Option<Arc<dyn FieldProtector>>,
    dry_run: bool,
}

impl<'a> TransactionTypeWorkerBuilder<'a> {
    pub fn new(run_id: &str) -> Self {
        Self {
            resolver: None,
            tracker: None,
            run_id: run_id.to_string(),
            output_dir: PathBuf::from("output"),
            strict_records: false,
            protector: None,
            dry_run: false,
        }
    }

    pub fn resolver(mut self, resolver: &'a ConfigurationResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn tracker(mut self, tracker: &'a IdempotencyTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn output_dir<P: Into<PathBuf>>(mut self, output_dir: P) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    /// Skip records with an unresolvable field instead of defaulting it.
    pub fn strict_records(mut self, strict: bool) -> Self {
        self.strict_records = strict;
        self
    }

    pub fn protector(mut self, protector: Arc<dyn FieldProtector>) -> Self {
        self.protector = Some(protector);
        self
    }

    /// Log output lines instead of writing files.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn build(self) -> Result<TransactionTypeWorker<'a>, BatchError> {
        let resolver = self
            .resolver
            .ok_or_else(|| BatchError::Step("worker requires a configuration resolver".to_string()))?;
        let tracker = self
            .tracker
            .ok_or_else(|| BatchError::Step("worker requires an idempotency tracker".to_string()))?;

        Ok(TransactionTypeWorker {
            resolver,
            tracker,
            run_id: self.run_id,
            output_dir: self.output_dir,
            strict_records: self.strict_records,
            protector: self.protector,
            dry_run: self.dry_run,
        })
    }
}
