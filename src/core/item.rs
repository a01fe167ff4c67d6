use crate::error::BatchError;

/// Result of reading one item: `Ok(None)` means the source is exhausted.
pub type ItemReaderResult<I> = Result<Option<I>, BatchError>;

/// Result of processing one item.
pub type ItemProcessorResult<O> = Result<O, BatchError>;

/// Result of writing a chunk of items.
pub type ItemWriterResult = Result<(), BatchError>;

/// Retrieves input for a step, one item at a time.
pub trait ItemReader<I> {
    /// Reads the next item.
    ///
    /// # Returns
    /// - `Ok(Some(item))` when an item is available
    /// - `Ok(None)` when there is nothing left to read
    /// - `Err(BatchError)` when the item could not be read
    fn read(&self) -> ItemReaderResult<I>;
}

/// Business logic applied to each item between reading and writing.
pub trait ItemProcessor<I, O> {
    /// Transforms one item. An error marks the item as skipped; it is never
    /// handed to the writer.
    fn process(&self, item: &I) -> ItemProcessorResult<O>;
}

/// Output of a step, one chunk at a time.
pub trait ItemWriter<O> {
    /// Writes a chunk of items.
    fn write(&self, items: &[O]) -> ItemWriterResult;

    /// Flushes buffered output to the destination.
    fn flush(&self) -> ItemWriterResult {
        Ok(())
    }

    /// Called once before the first chunk.
    fn open(&self) -> ItemWriterResult {
        Ok(())
    }

    /// Called once after the last chunk, even when the step failed.
    fn close(&self) -> ItemWriterResult {
        Ok(())
    }
}
