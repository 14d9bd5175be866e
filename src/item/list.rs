use std::cell::{Cell, RefCell};

use log::debug;

use crate::{
    BatchError,
    core::{
        execution_context::ExecutionContext,
        item::{ItemReader, ItemReaderResult, ItemWriter, ItemWriterResult},
    },
};

/// Reads items from an in-memory list.
///
/// The reader is restartable: it saves the number of items read under
/// `<name>.read.count` and skips that many items when opened again.
pub struct ListItemReader<T> {
    name: String,
    items: Vec<T>,
    index: Cell<usize>,
}

impl<T: Clone> ListItemReader<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            name: "ListItemReader".to_string(),
            items,
            index: Cell::new(0),
        }
    }

    /// Prefix of the keys saved in the execution context. Two readers sharing a
    /// step must have different names.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    fn read_count_key(&self) -> String {
        format!("{}.read.count", self.name)
    }
}

impl<T: Clone> ItemReader<T> for ListItemReader<T> {
    fn read(&self) -> ItemReaderResult<T> {
        let index = self.index.get();
        let item = self.items.get(index).cloned();
        if item.is_some() {
            self.index.set(index + 1);
        }
        Ok(item)
    }

    fn open(&self, execution_context: &ExecutionContext) -> Result<(), BatchError> {
        let read_count = execution_context.get_long_or(&self.read_count_key(), 0)?;
        let read_count = usize::try_from(read_count).map_err(|_| {
            BatchError::ExecutionContext(format!(
                "Invalid value {} for {}",
                read_count,
                self.read_count_key()
            ))
        })?;

        if read_count > 0 {
            debug!("{} resuming after {} items", self.name, read_count);
        }
        self.index.set(read_count.min(self.items.len()));
        Ok(())
    }

    fn update(&self, execution_context: &mut ExecutionContext) -> Result<(), BatchError> {
        let read_count = i64::try_from(self.index.get())
            .map_err(|_| BatchError::ExecutionContext("read count overflow".to_string()))?;
        execution_context.put_long(&self.read_count_key(), read_count);
        Ok(())
    }
}

/// Collects written items in memory.
pub struct ListItemWriter<T> {
    items: RefCell<Vec<T>>,
}

impl<T> Default for ListItemWriter<T> {
    fn default() -> Self {
        Self {
            items: RefCell::new(Vec::new()),
        }
    }
}

impl<T: Clone> ListItemWriter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_written_items(&self) -> Vec<T> {
        self.items.borrow().clone()
    }
}

impl<T: Clone> ItemWriter<T> for ListItemWriter<T> {
    fn write(&self, items: &[T]) -> ItemWriterResult {
        self.items.borrow_mut().extend_from_slice(items);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_returns_items_then_none() -> anyhow::Result<()> {
        let reader = ListItemReader::new(vec!["a", "b"]);
        assert_eq!(reader.read()?, Some("a"));
        assert_eq!(reader.read()?, Some("b"));
        assert_eq!(reader.read()?, None);
        assert_eq!(reader.read()?, None);
        Ok(())
    }

    #[test]
    fn reader_resumes_from_saved_count() -> anyhow::Result<()> {
        let first = ListItemReader::new(vec![1, 2, 3, 4]).with_name("numbers");
        first.read()?;
        first.read()?;

        let mut execution_context = ExecutionContext::new();
        first.update(&mut execution_context)?;
        assert_eq!(execution_context.get_long("numbers.read.count")?, 2);

        let second = ListItemReader::new(vec![1, 2, 3, 4]).with_name("numbers");
        second.open(&execution_context)?;
        assert_eq!(second.read()?, Some(3));
        Ok(())
    }

    #[test]
    fn writer_appends_every_call() -> anyhow::Result<()> {
        let writer = ListItemWriter::new();
        writer.write(&[1, 2])?;
        writer.write(&[3])?;
        assert_eq!(writer.get_written_items(), vec![1, 2, 3]);
        Ok(())
    }
}
