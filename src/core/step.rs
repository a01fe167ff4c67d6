use std::time::{Duration, Instant};

use log::{debug, info, warn};
use uuid::Uuid;

use crate::BatchError;

use super::{
    build_name,
    item::{ItemProcessor, ItemReader, ItemWriter},
};

/// Outcome of reading one chunk.
#[derive(Debug, PartialEq)]
pub enum ChunkStatus {
    /// The chunk holds `chunk_size` items and more may follow.
    Full,
    /// The reader is exhausted; the chunk may still hold trailing items.
    Finished,
}

/// Lifecycle of a step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Starting,
    Started,
    Success,
    ReadError,
    ProcessorError,
    WriteError,
    Failed,
}

impl StepStatus {
    /// Whether the step has stopped, successfully or not.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Starting | StepStatus::Started)
    }
}

/// Runtime state and counters of one step run.
#[derive(Debug, Clone)]
pub struct StepExecution {
    /// Unique identifier for this step instance
    pub id: Uuid,
    /// Human-readable name for the step
    pub name: String,
    /// Current status of the step execution
    pub status: StepStatus,
    pub start_time: Option<Instant>,
    pub end_time: Option<Instant>,
    pub duration: Option<Duration>,
    /// Number of items successfully read
    pub read_count: usize,
    /// Number of items successfully written
    pub write_count: usize,
    /// Number of errors encountered during reading
    pub read_error_count: usize,
    /// Number of items skipped because processing failed
    pub process_error_count: usize,
    /// Number of errors encountered during writing
    pub write_error_count: usize,
    /// Reason for the last failure, reported instead of propagating errors
    /// across the job boundary.
    pub error_message: Option<String>,
}

impl StepExecution {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            status: StepStatus::Starting,
            start_time: None,
            end_time: None,
            duration: None,
            read_count: 0,
            write_count: 0,
            read_error_count: 0,
            process_error_count: 0,
            write_error_count: 0,
            error_message: None,
        }
    }

    /// Items that reached the processor, skipped or not.
    pub fn processed_count(&self) -> usize {
        self.read_count
    }

    pub(crate) fn fail(&mut self, status: StepStatus, error: &BatchError) {
        self.status = status;
        self.error_message = Some(error.to_string());
    }
}

/// An independent, sequential phase of a job.
pub trait Step {
    /// Executes the step, recording counters and status into `step_execution`.
    ///
    /// # Returns
    /// - `Ok(())`: the step completed successfully
    /// - `Err(BatchError)`: the step failed; `step_execution` holds the reason
    fn execute(&self, step_execution: &mut StepExecution) -> Result<(), BatchError>;

    fn get_name(&self) -> &str;
}

/// Whether a tasklet wants to be invoked again.
#[derive(Debug, PartialEq, Eq)]
pub enum RepeatStatus {
    /// The tasklet can continue to execute.
    Continuable,
    /// The tasklet has finished executing.
    Finished,
}

/// A single-task operation that does not follow the chunk pattern.
pub trait Tasklet {
    fn execute(&self, step_execution: &StepExecution) -> Result<RepeatStatus, BatchError>;
}

pub struct TaskletStep<'a> {
    name: String,
    tasklet: &'a dyn Tasklet,
}

impl Step for TaskletStep<'_> {
    fn execute(&self, step_execution: &mut StepExecution) -> Result<(), BatchError> {
        let start_time = Instant::now();
        step_execution.start_time = Some(start_time);
        step_execution.status = StepStatus::Started;

        info!(
            "Start of step: {}, id: {}",
            step_execution.name, step_execution.id
        );

        let result = loop {
            match self.tasklet.execute(step_execution) {
                Ok(RepeatStatus::Continuable) => continue,
                Ok(RepeatStatus::Finished) => break Ok(()),
                Err(error) => break Err(error),
            }
        };

        match &result {
            Ok(()) => step_execution.status = StepStatus::Success,
            Err(error) => {
                warn!("Tasklet of step {} failed: {}", self.name, error);
                step_execution.fail(StepStatus::Failed, error);
            }
        }

        step_execution.end_time = Some(Instant::now());
        step_execution.duration = Some(start_time.elapsed());

        info!(
            "End of step: {}, id: {}",
            step_execution.name, step_execution.id
        );

        result
    }

    fn get_name(&self) -> &str {
        &self.name
    }
}

pub struct TaskletBuilder<'a> {
    name: String,
    tasklet: Option<&'a dyn Tasklet>,
}

impl<'a> TaskletBuilder<'a> {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tasklet: None,
        }
    }

    pub fn tasklet(mut self, tasklet: &'a dyn Tasklet) -> Self {
        self.tasklet = Some(tasklet);
        self
    }

    pub fn build(self) -> Result<TaskletStep<'a>, BatchError> {
        let tasklet = self
            .tasklet
            .ok_or_else(|| BatchError::Step(format!("{}: tasklet is required", self.name)))?;

        Ok(TaskletStep {
            name: self.name,
            tasklet,
        })
    }
}

/// Reads, processes and writes items in chunks.
///
/// Within one step, items are written in source order. A processor error skips the
/// item and increments `process_error_count`; the step only fails once the total
/// number of read, process and write errors exceeds `skip_limit`. No partial output
/// is ever written for a skipped item.
pub struct ChunkOrientedStep<'a, I, O> {
    name: String,
    /// Component responsible for reading items from the source
    reader: &'a dyn ItemReader<I>,
    /// Component responsible for processing items
    processor: &'a dyn ItemProcessor<I, O>,
    /// Component responsible for writing items to the destination
    writer: &'a dyn ItemWriter<O>,
    /// Number of items to process in each chunk
    chunk_size: usize,
    /// Maximum number of errors allowed before failing the step
    skip_limit: usize,
}

impl<I, O> Step for ChunkOrientedStep<'_, I, O> {
    fn execute(&self, step_execution: &mut StepExecution) -> Result<(), BatchError> {
        let start_time = Instant::now();
        step_execution.start_time = Some(start_time);
        step_execution.status = StepStatus::Started;

        info!(
            "Start of step: {}, id: {}",
            step_execution.name, step_execution.id
        );

        let result = match self.writer.open() {
            Ok(()) => self.run_chunks(step_execution),
            Err(error) => {
                step_execution.fail(StepStatus::WriteError, &error);
                Err(error)
            }
        };

        Self::manage_error(self.writer.close());

        step_execution.end_time = Some(Instant::now());
        step_execution.duration = Some(start_time.elapsed());

        info!(
            "End of step: {}, id: {}, status: {:?}",
            step_execution.name, step_execution.id, step_execution.status
        );

        result.map_err(|_| BatchError::Step(step_execution.name.clone()))
    }

    fn get_name(&self) -> &str {
        &self.name
    }
}

impl<I, O> ChunkOrientedStep<'_, I, O> {
    fn run_chunks(&self, step_execution: &mut StepExecution) -> Result<(), BatchError> {
        loop {
            let (read_items, chunk_status) = self
                .read_chunk(step_execution)
                .inspect_err(|error| step_execution.fail(StepStatus::ReadError, error))?;

            let processed_items = self
                .process_chunk(step_execution, &read_items)
                .inspect_err(|error| step_execution.fail(StepStatus::ProcessorError, error))?;

            self.write_chunk(step_execution, &processed_items)
                .inspect_err(|error| step_execution.fail(StepStatus::WriteError, error))?;

            if chunk_status == ChunkStatus::Finished {
                step_execution.status = StepStatus::Success;
                return Ok(());
            }
        }
    }

    /// Reads up to `chunk_size` items.
    ///
    /// # Returns
    /// - `Ok((items, ChunkStatus::Full))`: the chunk is full
    /// - `Ok((items, ChunkStatus::Finished))`: the reader is exhausted
    /// - `Err(BatchError)`: a read failed and the skip limit was reached
    fn read_chunk(
        &self,
        step_execution: &mut StepExecution,
    ) -> Result<(Vec<I>, ChunkStatus), BatchError> {
        debug!("Start reading chunk");

        let mut read_items = Vec::with_capacity(self.chunk_size);

        loop {
            match self.reader.read() {
                Ok(Some(item)) => {
                    read_items.push(item);
                    step_execution.read_count += 1;

                    if read_items.len() >= self.chunk_size {
                        debug!("End reading chunk: FULL");
                        return Ok((read_items, ChunkStatus::Full));
                    }
                }
                Ok(None) => {
                    debug!("End reading chunk: FINISHED");
                    return Ok((read_items, ChunkStatus::Finished));
                }
                Err(error) => {
                    warn!("Error reading item: {}", error);
                    step_execution.read_error_count += 1;

                    if self.is_skip_limit_reached(step_execution) {
                        return Err(error);
                    }
                }
            }
        }
    }

    fn process_chunk(
        &self,
        step_execution: &mut StepExecution,
        read_items: &[I],
    ) -> Result<Vec<O>, BatchError> {
        debug!("Processing chunk of {} items", read_items.len());
        let mut result = Vec::with_capacity(read_items.len());

        for item in read_items {
            match self.processor.process(item) {
                Ok(processed_item) => result.push(processed_item),
                Err(error) => {
                    warn!("Skipping item, processing failed: {}", error);
                    step_execution.process_error_count += 1;

                    if self.is_skip_limit_reached(step_execution) {
                        return Err(error);
                    }
                }
            }
        }

        Ok(result)
    }

    fn write_chunk(
        &self,
        step_execution: &mut StepExecution,
        processed_items: &[O],
    ) -> Result<(), BatchError> {
        if processed_items.is_empty() {
            debug!("No items to write, skipping write call");
            return Ok(());
        }

        debug!("Writing chunk of {} items", processed_items.len());

        match self.writer.write(processed_items).and_then(|()| self.writer.flush()) {
            Ok(()) => {
                step_execution.write_count += processed_items.len();
                Ok(())
            }
            Err(error) => {
                warn!("Error writing items: {}", error);
                step_execution.write_error_count += processed_items.len();

                if self.is_skip_limit_reached(step_execution) {
                    return Err(error);
                }
                Ok(())
            }
        }
    }

    fn is_skip_limit_reached(&self, step_execution: &StepExecution) -> bool {
        step_execution.read_error_count
            + step_execution.write_error_count
            + step_execution.process_error_count
            > self.skip_limit
    }

    /// Logs errors from operations that must not fail the step.
    fn manage_error(result: Result<(), BatchError>) {
        if let Err(error) = result {
            warn!("Non-fatal error: {}", error);
        }
    }
}

pub struct ChunkOrientedStepBuilder<'a, I, O> {
    name: String,
    reader: Option<&'a dyn ItemReader<I>>,
    processor: Option<&'a dyn ItemProcessor<I, O>>,
    writer: Option<&'a dyn ItemWriter<O>>,
    chunk_size: usize,
    skip_limit: usize,
}

impl<'a, I, O> ChunkOrientedStepBuilder<'a, I, O> {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            reader: None,
            processor: None,
            writer: None,
            chunk_size: 10,
            skip_limit: 0,
        }
    }

    pub fn reader(mut self, reader: &'a dyn ItemReader<I>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn processor(mut self, processor: &'a dyn ItemProcessor<I, O>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn writer(mut self, writer: &'a dyn ItemWriter<O>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn skip_limit(mut self, skip_limit: usize) -> Self {
        self.skip_limit = skip_limit;
        self
    }

    pub fn build(self) -> Result<ChunkOrientedStep<'a, I, O>, BatchError> {
        let missing = |component: &str| BatchError::Step(format!("{}: {} is required", self.name, component));

        Ok(ChunkOrientedStep {
            reader: self.reader.ok_or_else(|| missing("reader"))?,
            processor: self.processor.ok_or_else(|| missing("processor"))?,
            writer: self.writer.ok_or_else(|| missing("writer"))?,
            name: self.name,
            chunk_size: self.chunk_size,
            skip_limit: self.skip_limit,
        })
    }
}

/// Entry point for building either kind of step.
pub struct StepBuilder {
    name: String,
}

impl StepBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    /// Builder with a generated name.
    pub fn unnamed() -> Self {
        Self::new(&build_name())
    }

    pub fn tasklet(self, tasklet: &dyn Tasklet) -> TaskletBuilder<'_> {
        TaskletBuilder::new(&self.name).tasklet(tasklet)
    }

    pub fn chunk<'a, I, O>(self, chunk_size: usize) -> ChunkOrientedStepBuilder<'a, I, O> {
        ChunkOrientedStepBuilder::new(&self.name).chunk_size(chunk_size)
    }
}
