use std::{
    collections::BTreeMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use log::{error, info, warn};
use rayon::{prelude::*, ThreadPoolBuilder};

use crate::{
    core::step::{Step, StepExecution, StepStatus},
    BatchError,
};

use super::{context::PartitionContext, partitioner::Partitioner};

/// Runs the work of a single partition.
///
/// Implementations report failure through the returned execution's status and
/// `error_message`; they never panic across the pool boundary.
pub trait PartitionWorker: Sync {
    fn execute(&self, context: &PartitionContext) -> StepExecution;
}

/// A step that partitions its work and runs one worker per partition on a
/// fixed-size pool sized to the grid.
///
/// The step succeeds only when every partition succeeds. A failing partition
/// fails only itself; the other partitions run to completion.
pub struct PartitionStep<'a> {
    name: String,
    partitioner: &'a dyn Partitioner,
    worker: &'a dyn PartitionWorker,
    grid_size: usize,
    partition_executions: Mutex<Vec<StepExecution>>,
}

impl PartitionStep<'_> {
    /// Executions of every partition from the last run, in partition-key order.
    pub fn partition_executions(&self) -> Vec<StepExecution> {
        self.partition_executions
            .lock()
            .map(|executions| executions.clone())
            .unwrap_or_default()
    }

    fn run_partitions(&self, partitions: BTreeMap<String, PartitionContext>) -> Result<Vec<StepExecution>, BatchError> {
        let threads = self.grid_size.min(partitions.len()).max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("partition-worker-{index}"))
            .build()
            .map_err(|e| BatchError::Partition(format!("cannot start worker pool: {e}")))?;

        info!("Dispatching {} partitions on {} threads", partitions.len(), threads);

        let contexts: Vec<PartitionContext> = partitions.into_values().collect();
        let worker = self.worker;
        let executions = pool.install(|| {
            contexts
                .par_iter()
                .map(|context| {
                    let execution = worker.execute(context);
                    if execution.status == StepStatus::Success {
                        info!("Partition {} completed: {} written", context, execution.write_count);
                    } else {
                        warn!(
                            "Partition {} ended with {:?}: {}",
                            context,
                            execution.status,
                            execution.error_message.as_deref().unwrap_or("no reason given")
                        );
                    }
                    execution
                })
                .collect::<Vec<_>>()
        });

        Ok(executions)
    }
}

impl Step for PartitionStep<'_> {
    fn execute(&self, step_execution: &mut StepExecution) -> Result<(), BatchError> {
        let start = Instant::now();
        step_execution.start_time = Some(start);
        step_execution.status = StepStatus::Started;

        let result = self
            .partitioner
            .partition(self.grid_size)
            .and_then(|partitions| self.run_partitions(partitions));

        let executions = match result {
            Ok(executions) => executions,
            Err(err) => {
                error!("Partitioning of step {} failed: {}", self.name, err);
                step_execution.fail(StepStatus::Failed, &err);
                self.finish(step_execution, start, Vec::new());
                return Err(err);
            }
        };

        for execution in &executions {
            step_execution.read_count += execution.read_count;
            step_execution.write_count += execution.write_count;
            step_execution.read_error_count += execution.read_error_count;
            step_execution.process_error_count += execution.process_error_count;
            step_execution.write_error_count += execution.write_error_count;
        }

        let failed: Vec<&str> = executions
            .iter()
            .filter(|e| e.status != StepStatus::Success)
            .map(|e| e.name.as_str())
            .collect();

        let outcome = if failed.is_empty() {
            step_execution.status = StepStatus::Success;
            Ok(())
        } else {
            let err = BatchError::Step(format!("partitions failed: {}", failed.join(", ")));
            step_execution.fail(StepStatus::Failed, &err);
            Err(err)
        };

        self.finish(step_execution, start, executions);
        outcome
    }

    fn get_name(&self) -> &str {
        &self.name
    }
}

impl PartitionStep<'_> {
    fn finish(&self, step_execution: &mut StepExecution, start: Instant, executions: Vec<StepExecution>) {
        let end = Instant::now();
        step_execution.end_time = Some(end);
        step_execution.duration = Some(end.duration_since(start));
        if let Ok(mut slot) = self.partition_executions.lock() {
            *slot = executions;
        }
        info!(
            "End of partitioned step {}: {:?} in {:?}",
            self.name,
            step_execution.status,
            step_execution.duration.unwrap_or(Duration::ZERO)
        );
    }
}

pub struct PartitionStepBuilder<'a> {
    name: String,
    partitioner: Option<&'a dyn Partitioner>,
    worker: Option<&'a dyn PartitionWorker>,
    grid_size: usize,
}

impl<'a> PartitionStepBuilder<'a> {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            partitioner: None,
            worker: None,
            grid_size: 1,
        }
    }

    pub fn partitioner(mut self, partitioner: &'a dyn Partitioner) -> Self {
        self.partitioner = Some(partitioner);
        self
    }

    pub fn worker(mut self, worker: &'a dyn PartitionWorker) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Size of the worker pool; at least 1.
    pub fn grid_size(mut self, grid_size: usize) -> Self {
        self.grid_size = grid_size.max(1);
        self
    }

    pub fn build(self) -> Result<PartitionStep<'a>, BatchError> {
        let partitioner = self
            .partitioner
            .ok_or_else(|| BatchError::Step(format!("partition step {} has no partitioner", self.name)))?;
        let worker = self
            .worker
            .ok_or_else(|| BatchError::Step(format!("partition step {} has no worker", self.name)))?;

        Ok(PartitionStep {
            name: self.name,
            partitioner,
            worker,
            grid_size: self.grid_size,
            partition_executions: Mutex::new(Vec::new()),
        })
    }
}
