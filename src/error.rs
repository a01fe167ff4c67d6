use thiserror::Error;

/// Failures raised while resolving a mapping configuration.
///
/// These are fatal for the job (or partition) that requested the configuration:
/// no output is produced from an unresolvable mapping set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// Neither a static template nor a stored configuration row exists.
    #[error("no mapping configuration for {source_system}/{job}/{transaction_type}")]
    NotFound {
        source_system: String,
        job: String,
        transaction_type: String,
    },

    /// The configuration was readable but violates a mapping invariant.
    #[error("invalid mapping configuration: {0}")]
    Invalid(String),

    /// The raw payload (JSON or YAML) could not be parsed.
    #[error("unable to parse mapping configuration: {0}")]
    Parse(String),
}

#[derive(Error, Debug)]
/// Batch error
pub enum BatchError {
    #[error("ItemWriter from: {0}")]
    ItemWriter(String),

    #[error("ItemReader from: {0}")]
    ItemReader(String),

    #[error("ItemProcessor from: {0}")]
    ItemProcessor(String),

    #[error("Step: {0}")]
    Step(String),

    #[error("Tasklet: {0}")]
    Tasklet(String),

    #[error("Partition: {0}")]
    Partition(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Transformation of field {field} failed: {message}")]
    Transformation { field: String, message: String },

    /// Optimistic-lock mismatch. The caller must re-read the record and retry.
    #[error("Concurrent modification of {key}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("Audit chain integrity violation for {key} at sequence {sequence}")]
    IntegrityViolation { key: String, sequence: u64 },

    #[error("External execution failed (exit code {exit_code:?}): {message}")]
    ExternalExecution {
        exit_code: Option<i32>,
        message: String,
    },

    #[error("Idempotency record not found: {0}")]
    RecordNotFound(String),

    #[error("Illegal state transition for {key}: {from} -> {to}")]
    IllegalTransition {
        key: String,
        from: String,
        to: String,
    },
}
