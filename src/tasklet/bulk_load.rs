//! # Bulk Load Tasklet
//!
//! Hands a generated data file to an external bulk loader (SQL*Loader style)
//! and interprets its exit code and log.
//!
//! The loader is invoked as
//! `<command> <args..> control=<control file> data=<data file> log=<log file>`.
//!
//! | Exit code | Status                  |
//! |-----------|-------------------------|
//! | 0         | `Success`               |
//! | 2         | `SuccessWithWarnings`   |
//! | other     | `Failed` (retried)      |
//!
//! ## Examples
//!
//! ```rust,no_run
//! use etl_batch_rs::core::step::{Step, StepBuilder, StepExecution};
//! use etl_batch_rs::partition::RetryConfiguration;
//! use etl_batch_rs::tasklet::bulk_load::BulkLoadTaskletBuilder;
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), etl_batch_rs::BatchError> {
//! let tasklet = BulkLoadTaskletBuilder::new("sqlldr")
//!     .arg("userid=/@LEDGER")
//!     .control_file("ctl/DEPOSIT.ctl")
//!     .data_file("out/DEPOSIT.dat")
//!     .log_file("out/DEPOSIT.log")
//!     .retry(RetryConfiguration::fixed(2, Duration::from_secs(30)))
//!     .build()?;
//!
//! let step = StepBuilder::new("load-deposits").tasklet(&tasklet).build()?;
//! let mut execution = StepExecution::new("load-deposits");
//! step.execute(&mut execution)?;
//! # Ok(())
//! # }
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
    sync::Mutex,
    thread,
};

use log::{debug, info, warn};

use crate::{
    core::step::{RepeatStatus, StepExecution, Tasklet},
    partition::context::RetryConfiguration,
    BatchError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkLoadStatus {
    Success,
    SuccessWithWarnings,
    Failed,
}

impl BulkLoadStatus {
    pub fn from_exit_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => BulkLoadStatus::Success,
            Some(2) => BulkLoadStatus::SuccessWithWarnings,
            _ => BulkLoadStatus::Failed,
        }
    }
}

/// Outcome of the last loader invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkLoadResult {
    pub status: BulkLoadStatus,
    pub exit_code: Option<i32>,
    pub rows_loaded: Option<u64>,
    pub rows_rejected: Option<u64>,
    pub attempts: u32,
}

/// Row counts reported by the loader log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadCounts {
    pub rows_loaded: Option<u64>,
    pub rows_rejected: Option<u64>,
}

/// Extracts counts from lines such as `  100 Rows successfully loaded.` and
/// `  3 Rows not loaded due to data errors.` Repeated lines are summed.
pub fn parse_load_log(log: &str) -> LoadCounts {
    let mut counts = LoadCounts::default();
    for line in log.lines() {
        let target = if line.contains("Rows successfully loaded") {
            &mut counts.rows_loaded
        } else if line.contains("Rows not loaded") {
            &mut counts.rows_rejected
        } else {
            continue;
        };
        if let Some(count) = line.split_whitespace().find_map(|word| word.parse::<u64>().ok()) {
            *target = Some(target.unwrap_or(0) + count);
        }
    }
    counts
}

pub struct BulkLoadTasklet {
    command: String,
    args: Vec<String>,
    control_file: PathBuf,
    data_file: PathBuf,
    log_file: Option<PathBuf>,
    retry: RetryConfiguration,
    last_result: Mutex<Option<BulkLoadResult>>,
}

impl BulkLoadTasklet {
    pub fn last_result(&self) -> Option<BulkLoadResult> {
        self.last_result.lock().ok().and_then(|r| r.clone())
    }

    fn invoke(&self, attempt: u32) -> BulkLoadResult {
        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .arg(format!("control={}", self.control_file.display()))
            .arg(format!("data={}", self.data_file.display()));
        if let Some(log_file) = &self.log_file {
            command.arg(format!("log={}", log_file.display()));
        }

        debug!("Invoking bulk loader: {:?}", command);
        let (exit_code, stdout) = match command.output() {
            Ok(output) => (
                output.status.code(),
                String::from_utf8_lossy(&output.stdout).into_owned(),
            ),
            Err(error) => {
                warn!("Bulk loader {} could not be started: {}", self.command, error);
                (None, String::new())
            }
        };

        let log = self
            .log_file
            .as_deref()
            .and_then(|path| fs::read_to_string(path).ok())
            .unwrap_or(stdout);
        let counts = parse_load_log(&log);

        BulkLoadResult {
            status: BulkLoadStatus::from_exit_code(exit_code),
            exit_code,
            rows_loaded: counts.rows_loaded,
            rows_rejected: counts.rows_rejected,
            attempts: attempt,
        }
    }

    fn store(&self, result: BulkLoadResult) {
        if let Ok(mut slot) = self.last_result.lock() {
            *slot = Some(result);
        }
    }
}

impl Tasklet for BulkLoadTasklet {
    fn execute(&self, step_execution: &StepExecution) -> Result<RepeatStatus, BatchError> {
        let max_attempts = self.retry.max_retries + 1;

        for attempt in 1..=max_attempts {
            let result = self.invoke(attempt);
            match result.status {
                BulkLoadStatus::Success | BulkLoadStatus::SuccessWithWarnings => {
                    info!(
                        "Bulk load of {} for step {}: {:?}, {} rows loaded, {} rejected",
                        self.data_file.display(),
                        step_execution.name,
                        result.status,
                        result.rows_loaded.unwrap_or(0),
                        result.rows_rejected.unwrap_or(0)
                    );
                    self.store(result);
                    return Ok(RepeatStatus::Finished);
                }
                BulkLoadStatus::Failed => {
                    let exit_code = result.exit_code;
                    self.store(result);
                    if attempt == max_attempts {
                        return Err(BatchError::ExternalExecution {
                            exit_code,
                            message: format!(
                                "bulk load of {} failed after {} attempts",
                                self.data_file.display(),
                                attempt
                            ),
                        });
                    }
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "Bulk load attempt {}/{} failed (exit code {:?}), retrying in {:?}",
                        attempt, max_attempts, exit_code, delay
                    );
                    thread::sleep(delay);
                }
            }
        }

        // Unreachable with max_attempts >= 1.
        Err(BatchError::ExternalExecution {
            exit_code: None,
            message: "bulk loader was never invoked".to_string(),
        })
    }
}

pub struct BulkLoadTaskletBuilder {
    command: String,
    args: Vec<String>,
    control_file: Option<PathBuf>,
    data_file: Option<PathBuf>,
    log_file: Option<PathBuf>,
    retry: RetryConfiguration,
}

impl BulkLoadTaskletBuilder {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            control_file: None,
            data_file: None,
            log_file: None,
            retry: RetryConfiguration::none(),
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn control_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.control_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn data_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.data_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Log file the loader writes; standard output is parsed when unset.
    pub fn log_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.log_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn retry(mut self, retry: RetryConfiguration) -> Self {
        self.retry = retry;
        self
    }

    pub fn build(self) -> Result<BulkLoadTasklet, BatchError> {
        let control_file = self
            .control_file
            .ok_or_else(|| BatchError::Tasklet("bulk load requires a control file".to_string()))?;
        let data_file = self
            .data_file
            .ok_or_else(|| BatchError::Tasklet("bulk load requires a data file".to_string()))?;

        Ok(BulkLoadTasklet {
            command: self.command,
            args: self.args,
            control_file,
            data_file,
            log_file: self.log_file,
            retry: self.retry,
            last_result: Mutex::new(None),
        })
    }
}
