//! Splitting one job into parallel, transaction-type specific units of work.

/// Per-partition execution settings.
pub mod context;

/// Transaction-type and per-file partitioning.
pub mod partitioner;

/// Parallel execution of partitions.
pub mod step;

pub use context::{Backoff, FileConfig, IsolationLevel, PartitionContext, RetryConfiguration};
pub use partitioner::{
    Partitioner, TransactionTypeConfig, TransactionTypeConfigStore, TransactionTypePartitioner,
    TransactionTypePartitionerBuilder,
};
pub use step::{PartitionStep, PartitionStepBuilder, PartitionWorker};
