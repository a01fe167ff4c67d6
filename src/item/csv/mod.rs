/// CSV support for reading source extracts.
///
/// [`csv_reader::CsvRecordReader`] turns each row of a headered (or
/// explicitly named) CSV file into a dynamic [`Record`](crate::mapping::record::Record),
/// ready for a [`RecordProcessor`](crate::mapping::processor::RecordProcessor).
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use etl_batch_rs::core::item::{ItemProcessor, ItemReader};
/// use etl_batch_rs::item::csv::csv_reader::CsvRecordReaderBuilder;
/// use etl_batch_rs::mapping::{FieldMapping, FileType, MappingSet, RecordProcessor};
///
/// let set = MappingSet::new(
///     "DEPOSIT",
///     FileType::FixedWidth,
///     vec![FieldMapping::source("ACCOUNT", "ACCT", 1, 6)],
///     true,
/// )
/// .unwrap();
/// let processor = RecordProcessor::new(Arc::new(set));
///
/// let reader = CsvRecordReaderBuilder::new().from_reader("ACCT\n1001".as_bytes());
/// let row = processor.process(&reader.read().unwrap().unwrap()).unwrap();
///
/// assert_eq!(row.get("ACCOUNT"), Some("1001  "));
/// ```

/// A module providing facilities for reading CSV data records.
pub mod csv_reader;
