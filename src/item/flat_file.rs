use std::{
    cell::{Cell, RefCell},
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use log::debug;

use crate::{
    core::item::{ItemWriter, ItemWriterResult},
    mapping::{
        field::{FileType, MappingSet},
        processor::OutputRow,
    },
    BatchError,
};

/// Writes [`OutputRow`]s as lines of a fixed-width or delimited file.
///
/// Fixed-width lines are the concatenation of the (already padded) fields;
/// delimited lines join them with the configured delimiter.
pub struct FlatFileItemWriter<W: Write> {
    stream: RefCell<BufWriter<W>>,
    file_type: FileType,
    delimiter: String,
    line_separator: String,
    lines: Cell<usize>,
}

impl<W: Write> FlatFileItemWriter<W> {
    /// Lines written so far.
    pub fn lines_written(&self) -> usize {
        self.lines.get()
    }

    pub fn into_inner(self) -> Result<W, BatchError> {
        self.stream
            .into_inner()
            .into_inner()
            .map_err(|error| BatchError::ItemWriter(error.to_string()))
    }
}

impl<W: Write> ItemWriter<OutputRow> for FlatFileItemWriter<W> {
    fn write(&self, items: &[OutputRow]) -> ItemWriterResult {
        let mut stream = self.stream.borrow_mut();
        for item in items {
            let line = item.to_line(self.file_type, &self.delimiter);
            stream
                .write_all(line.as_bytes())
                .and_then(|_| stream.write_all(self.line_separator.as_bytes()))
                .map_err(|error| BatchError::ItemWriter(error.to_string()))?;
        }
        self.lines.set(self.lines.get() + items.len());
        Ok(())
    }

    fn flush(&self) -> ItemWriterResult {
        self.stream
            .borrow_mut()
            .flush()
            .map_err(|error| BatchError::ItemWriter(error.to_string()))
    }

    fn close(&self) -> ItemWriterResult {
        debug!("Closing flat file after {} lines", self.lines.get());
        self.flush()
    }
}

pub struct FlatFileItemWriterBuilder {
    file_type: FileType,
    delimiter: String,
    line_separator: String,
}

impl Default for FlatFileItemWriterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FlatFileItemWriterBuilder {
    pub fn new() -> Self {
        Self {
            file_type: FileType::FixedWidth,
            delimiter: "|".to_string(),
            line_separator: "\n".to_string(),
        }
    }

    pub fn file_type(mut self, file_type: FileType) -> Self {
        self.file_type = file_type;
        self
    }

    pub fn delimiter(mut self, delimiter: &str) -> Self {
        self.delimiter = delimiter.to_string();
        self
    }

    pub fn line_separator(mut self, line_separator: &str) -> Self {
        self.line_separator = line_separator.to_string();
        self
    }

    /// Takes the file type and delimiter of a resolved mapping set.
    pub fn layout_of(self, mapping_set: &MappingSet) -> Self {
        self.file_type(mapping_set.file_type())
            .delimiter(mapping_set.delimiter())
    }

    pub fn from_writer<W: Write>(self, wtr: W) -> FlatFileItemWriter<W> {
        FlatFileItemWriter {
            stream: RefCell::new(BufWriter::new(wtr)),
            file_type: self.file_type,
            delimiter: self.delimiter,
            line_separator: self.line_separator,
            lines: Cell::new(0),
        }
    }

    /// Creates (or truncates) the file at `path`.
    pub fn from_path<P: AsRef<Path>>(self, path: P) -> Result<FlatFileItemWriter<File>, BatchError> {
        let file = File::create(path.as_ref())
            .map_err(|e| BatchError::ItemWriter(format!("{}: {}", path.as_ref().display(), e)))?;
        Ok(self.from_writer(file))
    }
}
