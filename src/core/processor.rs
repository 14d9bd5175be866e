use log::{debug, error};

use crate::error::BatchError;

use super::{
    chunk::Chunk,
    execution::StepContribution,
    item::{ItemProcessor, ItemProcessorResult, ItemWriter},
    listener::Listeners,
};

/// Outcome of pushing one chunk through the processing stage and the writer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteResult {
    pub written: usize,
    pub filtered: usize,
    /// Items dropped by a skip while this chunk was processed or written.
    pub skipped: usize,
    /// The chunk was written item by item to isolate a faulty item.
    pub scanned: bool,
}

/// Transforms and writes the items of a chunk.
pub trait ChunkProcessor<I> {
    /// Processes every item of `chunk` and writes the survivors in one call.
    /// Counts are added to `contribution`; items removed by a skip are removed
    /// from `chunk`.
    fn process(
        &self,
        chunk: &mut Chunk<I>,
        contribution: &mut StepContribution,
    ) -> Result<WriteResult, BatchError>;
}

/// Output of the processing stage for a whole chunk.
pub(crate) struct Transformed<O> {
    pub outputs: Vec<O>,
    pub filtered: usize,
}

/// A processing failure and the position of the item that caused it.
pub(crate) struct ProcessFailure {
    pub index: usize,
    pub error: BatchError,
}

/// [`ChunkProcessor`] without fault tolerance: the first error fails the chunk.
pub struct SimpleChunkProcessor<'a, I, O> {
    processor: &'a dyn ItemProcessor<I, O>,
    writer: &'a dyn ItemWriter<O>,
    listeners: &'a Listeners<'a, I, O>,
}

impl<'a, I, O> SimpleChunkProcessor<'a, I, O> {
    pub fn new(
        processor: &'a dyn ItemProcessor<I, O>,
        writer: &'a dyn ItemWriter<O>,
        listeners: &'a Listeners<'a, I, O>,
    ) -> Self {
        Self {
            processor,
            writer,
            listeners,
        }
    }

    /// Processes one item. `Ok(None)` means the item is filtered.
    pub fn transform(&self, item: &I) -> ItemProcessorResult<O> {
        self.listeners.before_process(item);
        match self.processor.process(item) {
            Ok(output) => {
                self.listeners.after_process(item, output.as_ref());
                Ok(output)
            }
            Err(error) => {
                self.listeners.on_process_error(item, &error);
                Err(error)
            }
        }
    }

    /// Writes `items` in a single call and flushes the writer.
    pub fn write_items(&self, items: &[O]) -> Result<(), BatchError> {
        self.listeners.before_write(items);

        let result = self.writer.write(items).and_then(|()| self.writer.flush());
        match result {
            Ok(()) => {
                self.listeners.after_write(items);
                Ok(())
            }
            Err(error) => {
                error!("Error writing items: {}", error);
                self.listeners.on_write_error(items, &error);
                Err(error)
            }
        }
    }

    /// Runs the processing stage over the chunk, keeping item order.
    pub(crate) fn transform_chunk(
        &self,
        chunk: &Chunk<I>,
    ) -> Result<Transformed<O>, ProcessFailure> {
        debug!("Start processing chunk");

        let mut outputs = Vec::with_capacity(chunk.len());
        let mut filtered = 0;

        for (index, item) in chunk.items().iter().enumerate() {
            match self.transform(item) {
                Ok(Some(output)) => outputs.push(output),
                Ok(None) => filtered += 1,
                Err(error) => return Err(ProcessFailure { index, error }),
            }
        }

        debug!("End processing chunk");
        Ok(Transformed { outputs, filtered })
    }
}

impl<I, O> ChunkProcessor<I> for SimpleChunkProcessor<'_, I, O> {
    fn process(
        &self,
        chunk: &mut Chunk<I>,
        contribution: &mut StepContribution,
    ) -> Result<WriteResult, BatchError> {
        let Transformed { outputs, filtered } = self
            .transform_chunk(chunk)
            .map_err(|failure| failure.error)?;

        debug!("Start writing chunk");
        if outputs.is_empty() {
            debug!("No items to write, skipping write call");
        } else {
            self.write_items(&outputs)?;
        }
        debug!("End writing chunk");

        contribution.filter_count += filtered;
        contribution.write_count += outputs.len();

        Ok(WriteResult {
            written: outputs.len(),
            filtered,
            ..WriteResult::default()
        })
    }
}
