use csv::{Reader, ReaderBuilder, StringRecord, Terminator, Trim};
use std::{cell::RefCell, fs::File, io::Read, path::Path};

use crate::{
    core::item::{ItemReader, ItemReaderResult},
    error::BatchError,
    mapping::record::{Record, Value},
};

/// Reads delimited source files into dynamic [`Record`]s.
///
/// Column names come from the header row, or from
/// [`CsvRecordReaderBuilder::headers`] when the file has none. Cells keep the
/// header order; empty cells become [`Value::Null`] unless configured otherwise.
///
/// # Examples
///
/// ```
/// use etl_batch_rs::item::csv::csv_reader::CsvRecordReaderBuilder;
/// use etl_batch_rs::core::item::ItemReader;
///
/// let data = "\
/// ACCOUNT,AMOUNT,STATUS
/// 1001,100,A
/// 1002,,C
/// ";
///
/// let reader = CsvRecordReaderBuilder::new()
///     .has_headers(true)
///     .from_reader(data.as_bytes());
///
/// let first = reader.read().unwrap().unwrap();
/// assert_eq!(first.get("STATUS").unwrap().to_string(), "A");
///
/// let second = reader.read().unwrap().unwrap();
/// assert!(second.get("AMOUNT").unwrap().is_null());
///
/// assert!(reader.read().unwrap().is_none());
/// ```
pub struct CsvRecordReader<R> {
    /// Uses `RefCell` so rows can be consumed behind the `&self` of `ItemReader::read`.
    reader: RefCell<Reader<R>>,
    headers: RefCell<Option<Vec<String>>>,
    empty_as_null: bool,
}

impl<R: Read> CsvRecordReader<R> {
    fn headers(&self, reader: &mut Reader<R>) -> Result<Vec<String>, BatchError> {
        if let Some(headers) = self.headers.borrow().as_ref() {
            return Ok(headers.clone());
        }
        if !reader.has_headers() {
            return Err(BatchError::ItemReader(
                "column names are required when the source has no header row".to_string(),
            ));
        }
        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| BatchError::ItemReader(e.to_string()))?
            .iter()
            .map(str::to_string)
            .collect();
        *self.headers.borrow_mut() = Some(headers.clone());
        Ok(headers)
    }

    fn to_record(&self, headers: &[String], row: &StringRecord) -> Result<Record, BatchError> {
        if row.len() != headers.len() {
            return Err(BatchError::ItemReader(format!(
                "line {}: expected {} columns, found {}",
                row.position().map(|p| p.line()).unwrap_or_default(),
                headers.len(),
                row.len()
            )));
        }

        let mut record = Record::with_capacity(row.len());
        for (header, cell) in headers.iter().zip(row.iter()) {
            let value = if cell.is_empty() && self.empty_as_null {
                Value::Null
            } else {
                Value::from(cell)
            };
            record.insert(header, value);
        }
        Ok(record)
    }
}

impl<R: Read> ItemReader<Record> for CsvRecordReader<R> {
    /// Reads the next row.
    ///
    /// # Returns
    /// - `Ok(Some(record))` if a row is read
    /// - `Ok(None)` if there are no more rows
    /// - `Err(BatchError::ItemReader(error))` for malformed rows
    fn read(&self) -> ItemReaderResult<Record> {
        let mut reader = self.reader.borrow_mut();
        let headers = self.headers(&mut reader)?;

        let mut row = StringRecord::new();
        match reader.read_record(&mut row) {
            Ok(true) => self.to_record(&headers, &row).map(Some),
            Ok(false) => Ok(None),
            Err(error) => Err(BatchError::ItemReader(error.to_string())),
        }
    }
}

/// A builder for configuring CSV record reading.
///
/// # Default Configuration
///
/// - Delimiter: comma (,)
/// - Terminator: CRLF
/// - Headers: enabled
/// - Trimming: All fields trimmed
/// - Empty cells: null
pub struct CsvRecordReaderBuilder {
    delimiter: u8,
    terminator: Terminator,
    has_headers: bool,
    headers: Option<Vec<String>>,
    empty_as_null: bool,
}

impl Default for CsvRecordReaderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CsvRecordReaderBuilder {
    pub fn new() -> Self {
        Self {
            delimiter: b',',
            terminator: Terminator::CRLF,
            has_headers: true,
            headers: None,
            empty_as_null: true,
        }
    }

    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Sets the line terminator.
    ///
    /// - `Terminator::CRLF`: accepts `\r\n`, `\r` and `\n` (default)
    /// - `Terminator::Any(byte)`: custom terminator
    pub fn terminator(mut self, terminator: Terminator) -> Self {
        self.terminator = terminator;
        self
    }

    /// Whether the first row holds the column names.
    pub fn has_headers(mut self, yes: bool) -> Self {
        self.has_headers = yes;
        self
    }

    /// Column names to use instead of the header row.
    pub fn headers(mut self, headers: &[&str]) -> Self {
        self.headers = Some(headers.iter().map(|h| h.to_string()).collect());
        self
    }

    /// Keep empty cells as empty strings instead of nulls.
    pub fn empty_as_null(mut self, yes: bool) -> Self {
        self.empty_as_null = yes;
        self
    }

    fn reader_builder(&self) -> ReaderBuilder {
        let mut builder = ReaderBuilder::new();
        builder
            .trim(Trim::All)
            .delimiter(self.delimiter)
            .terminator(self.terminator)
            .has_headers(self.has_headers)
            // Column count is checked per row against the headers.
            .flexible(true);
        builder
    }

    fn build<R: Read>(self, reader: Reader<R>) -> CsvRecordReader<R> {
        CsvRecordReader {
            reader: RefCell::new(reader),
            headers: RefCell::new(self.headers),
            empty_as_null: self.empty_as_null,
        }
    }

    /// Creates a reader over any `Read` source.
    pub fn from_reader<R: Read>(self, rdr: R) -> CsvRecordReader<R> {
        let reader = self.reader_builder().from_reader(rdr);
        self.build(reader)
    }

    /// Opens `path` for reading.
    ///
    /// # Errors
    /// `BatchError::ItemReader` if the file cannot be opened.
    pub fn from_path<P: AsRef<Path>>(self, path: P) -> Result<CsvRecordReader<File>, BatchError> {
        let reader = self
            .reader_builder()
            .from_path(path.as_ref())
            .map_err(|e| BatchError::ItemReader(format!("{}: {}", path.as_ref().display(), e)))?;
        Ok(self.build(reader))
    }
}
