//! Field mapping model and the machinery that applies it.
//!
//! A [`MappingSet`](field::MappingSet) is resolved once per transaction type by the
//! [`ConfigurationResolver`](resolver::ConfigurationResolver) and then drives the
//! [`RecordProcessor`](processor::RecordProcessor) for every record of that type.

/// `if` / `elseif` / `else` rules and their expression language.
pub mod condition;

/// Field mappings, mapping sets and their enumerations.
pub mod field;

/// Padding and record-level transformation.
pub mod processor;

/// Source rows.
pub mod record;

/// Configuration loading and caching.
pub mod resolver;

/// Single-field value computation.
pub mod transformer;

pub use condition::Condition;
pub use field::{DataType, FieldMapping, FileType, MappingSet, Pad, TransformationType};
pub use processor::{apply_padding, OutputRow, RecordProcessor};
pub use record::{Record, Value};
pub use resolver::{ConfigurationResolver, ConfigurationResolverBuilder, ResolveRequest};
pub use transformer::FieldTransformer;
