//! # Tasklet Module
//!
//! Single-task operations that don't follow the chunk-oriented processing pattern.

#[cfg(feature = "bulk-load")]
#[cfg_attr(docsrs, doc(cfg(feature = "bulk-load")))]
pub mod bulk_load;
