use std::cell::Cell;

use log::info;

use crate::{
    core::item::{ItemWriter, ItemWriterResult},
    mapping::{field::FileType, processor::OutputRow},
};

/// Logs rendered output lines instead of writing them. Used for dry runs.
pub struct LoggerWriter {
    label: String,
    file_type: FileType,
    delimiter: String,
    lines: Cell<usize>,
}

impl LoggerWriter {
    pub fn new(label: &str, file_type: FileType, delimiter: &str) -> Self {
        Self {
            label: label.to_string(),
            file_type,
            delimiter: delimiter.to_string(),
            lines: Cell::new(0),
        }
    }

    pub fn lines_logged(&self) -> usize {
        self.lines.get()
    }
}

impl ItemWriter<OutputRow> for LoggerWriter {
    fn write(&self, items: &[OutputRow]) -> ItemWriterResult {
        for item in items {
            let line = self.lines.get() + 1;
            info!("{}#{}: {}", self.label, line, item.to_line(self.file_type, &self.delimiter));
            self.lines.set(line);
        }
        Ok(())
    }
}
