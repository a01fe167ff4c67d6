#![cfg_attr(docsrs, feature(doc_cfg))]
//#![warn(missing_docs)]

/*!
 # ETL Batch for Rust

 A configuration-driven batch engine that turns source extracts into legacy
 fixed-width or delimited files, one partition per transaction type.

 ## Core Concepts

- **MappingSet:** the ordered field mappings of one transaction type, resolved from a stored JSON
  configuration or a packaged YAML template and cached by the `ConfigurationResolver`.
- **FieldMapping:** how one output field is computed (`CONSTANT`, `SOURCE`, `COMPOSITE`,
  `CONDITIONAL`, `LOOKUP`), then padded or truncated to its length.
- **RecordProcessor:** an `ItemProcessor` that turns a dynamic `Record` into an ordered `OutputRow`.
- **Partitioner:** splits a job into one `PartitionContext` per active transaction type, or per input
  file when none is configured.
- **PartitionStep:** runs a worker per partition on a pool sized to the grid.
- **IdempotencyTracker:** optimistic-locking state machine (`IN_PROGRESS`, `COMPLETED`, `FAILED`)
  with a hash-chained audit trail.
- **Job / Step / ItemReader / ItemWriter:** the chunk-oriented runtime everything runs on.

 ## Features

| **Feature**   | **Description**                                               |
|---------------|---------------------------------------------------------------|
| csv           | Enables the CSV `ItemReader` producing dynamic records         |
| logger        | Enables a logger `ItemWriter`, useful for dry runs             |
| bulk-load     | Enables the external bulk loader `Tasklet`                     |
| full          | Enables all available features                                |

 The partition worker in [`pipeline`] needs `csv` and `logger`.

 ## Getting Started

```toml
[dependencies]
etl-batch-rs = { version = "<version>", features = ["full"] }
```

```rust
# use std::sync::Arc;
# use etl_batch_rs::{
#     core::{
#         job::{Job, JobBuilder},
#         step::StepBuilder,
#     },
#     item::{csv::csv_reader::CsvRecordReaderBuilder, flat_file::FlatFileItemWriterBuilder},
#     mapping::{
#         resolver::{ConfigurationResolverBuilder, ResolveRequest, TemplateSource},
#         OutputRow, Record, RecordProcessor,
#     },
#     BatchError,
# };
struct Templates;

impl TemplateSource for Templates {
    fn load(&self, _: &str, _: &str, _: &str) -> Result<Option<String>, BatchError> {
        Ok(Some(
            "
fields:
  STATUS_DESC:
    transformationType: conditional
    targetPosition: 1
    length: 10
    conditions:
      - ifExpr: STATUS = 'A'
        then: \"'ACTIVE'\"
        elseExpr: \"'INACTIVE'\"
  AMOUNT:
    transformationType: source
    sourceField: AMOUNT
    targetPosition: 2
    length: 6
    pad: left
    padChar: '0'
"
            .to_string(),
        ))
    }
}

fn main() -> Result<(), BatchError> {
    let resolver = ConfigurationResolverBuilder::new()
        .templates(Arc::new(Templates))
        .build();
    let mapping_set = resolver.resolve(&ResolveRequest::new("CORE", "LOAD_TXN", "DEPOSIT"))?;

    let reader = CsvRecordReaderBuilder::new().from_reader("AMOUNT,STATUS\n100,A\n7,X".as_bytes());
    let processor = RecordProcessor::new(Arc::clone(&mapping_set));
    let writer = FlatFileItemWriterBuilder::new()
        .layout_of(&mapping_set)
        .from_writer(Vec::new());

    let step = StepBuilder::new("deposits")
        .chunk::<Record, OutputRow>(100)
        .reader(&reader)
        .processor(&processor)
        .writer(&writer)
        .build()?;

    let job = JobBuilder::new().start(&step).build();
    job.run()?;

    assert_eq!(writer.lines_written(), 2);
    Ok(())
}
```

 ## License
 Licensed under either of

 -   Apache License, Version 2.0
     ([LICENSE-APACHE](LICENSE-APACHE) or <http://www.apache.org/licenses/LICENSE-2.0>)
 -   MIT license
     ([LICENSE-MIT](LICENSE-MIT) or <http://opensource.org/licenses/MIT>)

 at your option.
 */

/// Core module for batch operations
pub mod core;

/// Error types for batch operations
pub mod error;

#[doc(inline)]
pub use error::*;

/// Set of items readers / writers
pub mod item;

/// Field mapping model, configuration resolution and record transformation
pub mod mapping;

/// Transaction-type partitioning and parallel dispatch
pub mod partition;

/// Idempotency and audit tracking
pub mod tracker;

/// Engine-wide settings
pub mod settings;

/// Set of tasklets
pub mod tasklet;

/// Partition worker wiring reader, processor and writer together
#[cfg(all(feature = "csv", feature = "logger"))]
#[cfg_attr(docsrs, doc(cfg(all(feature = "csv", feature = "logger"))))]
pub mod pipeline;
