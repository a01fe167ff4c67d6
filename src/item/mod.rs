#[cfg(feature = "logger")]
/// This module provides a logger item writer for dry runs.
pub mod logger;

#[cfg(feature = "csv")]
/// This module provides a CSV item reader producing dynamic records.
pub mod csv;

/// This module provides the fixed-width and delimited output writer.
pub mod flat_file;
