use crate::error::BatchError;

use super::execution_context::ExecutionContext;

/// Result of a read: `Ok(None)` once the input is exhausted.
pub type ItemReaderResult<I> = Result<Option<I>, BatchError>;

/// Result of processing an item: `Ok(None)` filters the item out.
pub type ItemProcessorResult<O> = Result<Option<O>, BatchError>;

pub type ItemWriterResult = Result<(), BatchError>;

/// Source of items for a chunk-oriented step, one item at a time.
///
/// Readers that support restart save their position in [`update`](Self::update)
/// and restore it in [`open`](Self::open).
pub trait ItemReader<I> {
    fn read(&self) -> ItemReaderResult<I>;

    fn open(&self, _execution_context: &ExecutionContext) -> Result<(), BatchError> {
        Ok(())
    }

    fn update(&self, _execution_context: &mut ExecutionContext) -> Result<(), BatchError> {
        Ok(())
    }

    fn close(&self) -> Result<(), BatchError> {
        Ok(())
    }
}

/// Business logic applied to every item between the reader and the writer.
///
/// Processing may be invoked again for the same item when a chunk is retried or
/// scanned, so implementations must not have side effects that cannot be repeated.
pub trait ItemProcessor<I, O> {
    fn process(&self, item: &I) -> ItemProcessorResult<O>;
}

/// Output of a chunk-oriented step. A call to [`write`](Self::write) is all or
/// nothing: on error none of the items are considered written.
pub trait ItemWriter<O> {
    fn write(&self, items: &[O]) -> ItemWriterResult;

    fn flush(&self) -> Result<(), BatchError> {
        Ok(())
    }

    fn open(&self, _execution_context: &ExecutionContext) -> Result<(), BatchError> {
        Ok(())
    }

    fn update(&self, _execution_context: &mut ExecutionContext) -> Result<(), BatchError> {
        Ok(())
    }

    fn close(&self) -> Result<(), BatchError> {
        Ok(())
    }
}

/// Identity processor used when a chunk step has no processing stage.
#[derive(Default)]
pub struct PassThroughProcessor;

impl<T: Clone> ItemProcessor<T, T> for PassThroughProcessor {
    fn process(&self, item: &T) -> ItemProcessorResult<T> {
        Ok(Some(item.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_through_returns_a_copy() {
        let processor = PassThroughProcessor;
        let item = String::from("item");
        assert_eq!(processor.process(&item).unwrap(), Some(item));
    }
}
