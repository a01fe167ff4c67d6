use std::time::{Duration, Instant};

use log::{error, info};
use uuid::Uuid;

use crate::BatchError;

use super::{
    build_name,
    step::{Step, StepExecution},
};

/// Type alias for job execution results.
type JobResult<T> = Result<T, BatchError>;

/// Job-level status reported to the surrounding scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    /// The batch job has successfully completed its execution.
    Completed,
    /// Status of a batch job prior to its execution.
    Starting,
    /// Status of a batch job that is running.
    Started,
    /// Status of a batch job that has failed during its execution.
    Failed,
}

/// Represents a job that can be executed.
///
/// A job is a container for a sequence of steps that are executed in order.
pub trait Job {
    /// Runs the job.
    ///
    /// # Returns
    /// - `Ok(JobExecution)` when every step succeeded
    /// - `Err(BatchError)` naming the first step that failed
    fn run(&self) -> JobResult<JobExecution>;
}

/// Timing, status and per-step details of one job run.
#[derive(Debug)]
pub struct JobExecution {
    pub id: Uuid,
    pub name: String,
    pub status: BatchStatus,
    pub start: Instant,
    pub end: Instant,
    pub duration: Duration,
    pub step_executions: Vec<StepExecution>,
    pub error_message: Option<String>,
}

/// A named sequence of steps, built by [`JobBuilder`].
pub struct JobInstance<'a> {
    id: Uuid,
    name: String,
    steps: Vec<&'a dyn Step>,
}

impl JobInstance<'_> {
    pub fn get_name(&self) -> &str {
        &self.name
    }

    /// Runs all steps and returns the execution whatever the outcome.
    ///
    /// Unlike [`Job::run`], failures are reported through `status` and
    /// `error_message` rather than as an error.
    pub fn execute(&self) -> JobExecution {
        let start = Instant::now();

        info!("Start of job: {}, id: {}", self.name, self.id);

        let mut step_executions = Vec::with_capacity(self.steps.len());
        let mut status = BatchStatus::Completed;
        let mut error_message = None;

        for step in &self.steps {
            let mut step_execution = StepExecution::new(step.get_name());
            let result = step.execute(&mut step_execution);
            step_executions.push(step_execution);

            if let Err(err) = result {
                error!("Step {} of job {} failed: {}", step.get_name(), self.name, err);
                status = BatchStatus::Failed;
                error_message = Some(err.to_string());
                break;
            }
        }

        info!("End of job: {}, id: {}, status: {:?}", self.name, self.id, status);

        JobExecution {
            id: self.id,
            name: self.name.clone(),
            status,
            start,
            end: Instant::now(),
            duration: start.elapsed(),
            step_executions,
            error_message,
        }
    }
}

impl Job for JobInstance<'_> {
    fn run(&self) -> JobResult<JobExecution> {
        let execution = self.execute();

        match execution.status {
            BatchStatus::Completed => Ok(execution),
            _ => {
                let failed = execution
                    .step_executions
                    .last()
                    .map(|step| step.name.clone())
                    .unwrap_or_else(|| self.name.clone());
                Err(BatchError::Step(failed))
            }
        }
    }
}

/// Builder for creating a job instance.
///
/// ```rust,no_run,compile_fail
/// let job = JobBuilder::new()
///     .name("load-deposits".to_string())
///     .start(&partition_step)
///     .next(&bulk_load_step)
///     .build();
/// ```
#[derive(Default)]
pub struct JobBuilder<'a> {
    /// Optional name for the job (generated randomly if not specified)
    name: Option<String>,
    steps: Vec<&'a dyn Step>,
}

impl<'a> JobBuilder<'a> {
    pub fn new() -> Self {
        Self {
            name: None,
            steps: Vec::new(),
        }
    }

    pub fn name(mut self, name: String) -> JobBuilder<'a> {
        self.name = Some(name);
        self
    }

    /// Sets the first step of the job; same as `next`.
    pub fn start(mut self, step: &'a dyn Step) -> JobBuilder<'a> {
        self.steps.push(step);
        self
    }

    pub fn next(mut self, step: &'a dyn Step) -> JobBuilder<'a> {
        self.steps.push(step);
        self
    }

    pub fn build(self) -> JobInstance<'a> {
        JobInstance {
            id: Uuid::new_v4(),
            name: self.name.unwrap_or_else(build_name),
            steps: self.steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::{BatchStatus, Job, JobBuilder};
    use crate::{
        core::step::{RepeatStatus, StepBuilder, StepExecution, Tasklet},
        BatchError,
    };

    struct FlagTasklet {
        fail: bool,
        calls: Cell<usize>,
    }

    impl Tasklet for FlagTasklet {
        fn execute(&self, _step_execution: &StepExecution) -> Result<RepeatStatus, BatchError> {
            self.calls.set(self.calls.get() + 1);
            if self.fail {
                Err(BatchError::Tasklet("boom".to_string()))
            } else {
                Ok(RepeatStatus::Finished)
            }
        }
    }

    #[test]
    fn job_runs_steps_in_order_and_completes() {
        let first = FlagTasklet { fail: false, calls: Cell::new(0) };
        let second = FlagTasklet { fail: false, calls: Cell::new(0) };
        let step1 = StepBuilder::new("first").tasklet(&first).build().unwrap();
        let step2 = StepBuilder::new("second").tasklet(&second).build().unwrap();

        let job = JobBuilder::new()
            .name("load".to_string())
            .start(&step1)
            .next(&step2)
            .build();

        let execution = job.run().unwrap();

        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(execution.step_executions.len(), 2);
        assert_eq!(first.calls.get(), 1);
        assert_eq!(second.calls.get(), 1);
    }

    #[test]
    fn job_stops_at_first_failed_step() {
        let failing = FlagTasklet { fail: true, calls: Cell::new(0) };
        let never = FlagTasklet { fail: false, calls: Cell::new(0) };
        let step1 = StepBuilder::new("failing").tasklet(&failing).build().unwrap();
        let step2 = StepBuilder::new("never").tasklet(&never).build().unwrap();

        let job = JobBuilder::new().start(&step1).next(&step2).build();
        let execution = job.execute();

        assert_eq!(execution.status, BatchStatus::Failed);
        assert!(execution.error_message.is_some());
        assert_eq!(never.calls.get(), 0);
        assert!(job.run().is_err());
    }
}
