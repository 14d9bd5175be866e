#![allow(dead_code)]

pub mod mocks;

use std::{
    cell::RefCell,
    collections::HashSet,
    sync::Mutex,
};

use spring_batch_engine::{
    BatchError,
    core::{
        execution::{JobParameters, StepExecution},
        item::{ItemProcessor, ItemProcessorResult, ItemWriter, ItemWriterResult},
    },
    repository::JobRepository,
};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Saved step execution of a fresh job execution.
pub fn new_step_execution(
    repository: &dyn JobRepository,
    job_name: &str,
    step_name: &str,
) -> Result<StepExecution, BatchError> {
    let job_execution = repository.create_job_execution(job_name, &JobParameters::new())?;
    let mut step_execution = job_execution.create_step_execution(step_name)?;
    repository.add_step_execution(&mut step_execution)?;
    Ok(step_execution)
}

/// Writer refusing any chunk that holds a poisoned item. Poisoned items can be
/// cured between two runs to simulate a fixed downstream system.
pub struct FailingWriter {
    poisoned: RefCell<HashSet<i32>>,
    error: fn(String) -> BatchError,
    written: RefCell<Vec<i32>>,
    calls: RefCell<usize>,
}

impl FailingWriter {
    pub fn new(poisoned: &[i32]) -> Self {
        Self::with_error(poisoned, BatchError::ItemWriter)
    }

    pub fn with_error(poisoned: &[i32], error: fn(String) -> BatchError) -> Self {
        Self {
            poisoned: RefCell::new(poisoned.iter().copied().collect()),
            error,
            written: RefCell::new(Vec::new()),
            calls: RefCell::new(0),
        }
    }

    pub fn cure(&self) {
        self.poisoned.borrow_mut().clear();
    }

    pub fn written(&self) -> Vec<i32> {
        self.written.borrow().clone()
    }

    pub fn calls(&self) -> usize {
        *self.calls.borrow()
    }
}

impl ItemWriter<i32> for FailingWriter {
    fn write(&self, items: &[i32]) -> ItemWriterResult {
        *self.calls.borrow_mut() += 1;
        if let Some(item) = items
            .iter()
            .find(|item| self.poisoned.borrow().contains(item))
        {
            return Err((self.error)(format!("cannot write item {}", item)));
        }
        self.written.borrow_mut().extend_from_slice(items);
        Ok(())
    }
}

/// Processor rejecting some items as invalid and filtering out others.
pub struct ValidatingProcessor {
    pub invalid: Vec<i32>,
    pub filtered: Vec<i32>,
}

impl ItemProcessor<i32, i32> for ValidatingProcessor {
    fn process(&self, item: &i32) -> ItemProcessorResult<i32> {
        if self.invalid.contains(item) {
            return Err(BatchError::Validation(format!("item {} is invalid", item)));
        }
        if self.filtered.contains(item) {
            return Ok(None);
        }
        Ok(Some(*item))
    }
}

/// Thread-safe writer shared by the partitions of a partitioned step.
#[derive(Default)]
pub struct SharedWriter {
    poisoned: Mutex<HashSet<i64>>,
    written: Mutex<Vec<i64>>,
}

impl SharedWriter {
    pub fn new(poisoned: &[i64]) -> Self {
        Self {
            poisoned: Mutex::new(poisoned.iter().copied().collect()),
            written: Mutex::new(Vec::new()),
        }
    }

    pub fn cure(&self) -> Result<(), BatchError> {
        self.poisoned
            .lock()
            .map_err(|_| BatchError::ItemWriter("lock poisoned".to_string()))?
            .clear();
        Ok(())
    }

    pub fn written_sorted(&self) -> Result<Vec<i64>, BatchError> {
        let mut written = self
            .written
            .lock()
            .map_err(|_| BatchError::ItemWriter("lock poisoned".to_string()))?
            .clone();
        written.sort_unstable();
        Ok(written)
    }
}

impl ItemWriter<i64> for SharedWriter {
    fn write(&self, items: &[i64]) -> ItemWriterResult {
        let poisoned = self
            .poisoned
            .lock()
            .map_err(|_| BatchError::ItemWriter("lock poisoned".to_string()))?;
        if let Some(item) = items.iter().find(|item| poisoned.contains(item)) {
            return Err(BatchError::ItemWriter(format!("cannot write item {}", item)));
        }
        drop(poisoned);

        self.written
            .lock()
            .map_err(|_| BatchError::ItemWriter("lock poisoned".to_string()))?
            .extend_from_slice(items);
        Ok(())
    }
}
