//! Observer hooks at job, step, chunk and item granularity.
//!
//! Listeners only observe: they receive shared references and return nothing,
//! so they can never change how the engine proceeds. Every method has an empty
//! default so implementations override only the events they care about.

use crate::BatchError;

use super::{
    execution::{JobExecution, StepExecution},
    processor::WriteResult,
};

pub trait JobListener {
    fn before_job(&self, _job_execution: &JobExecution) {}

    fn after_job(&self, _job_execution: &JobExecution) {}
}

pub trait StepListener {
    fn before_step(&self, _step_execution: &StepExecution) {}

    fn after_step(&self, _step_execution: &StepExecution) {}
}

pub trait ChunkListener {
    fn before_chunk(&self, _step_execution: &StepExecution) {}

    fn after_chunk(&self, _step_execution: &StepExecution) {}

    fn on_chunk_error(&self, _step_execution: &StepExecution, _error: &BatchError) {}

    /// The chunk is about to be written again one item at a time.
    fn on_scan_start(&self, _item_count: usize) {}

    fn on_scan_end(&self, _result: &WriteResult) {}
}

pub trait ItemReadListener<I> {
    fn before_read(&self) {}

    fn after_read(&self, _item: &I) {}

    fn on_read_error(&self, _error: &BatchError) {}
}

pub trait ItemProcessListener<I, O> {
    fn before_process(&self, _item: &I) {}

    fn after_process(&self, _item: &I, _result: Option<&O>) {}

    fn on_process_error(&self, _item: &I, _error: &BatchError) {}
}

pub trait ItemWriteListener<O> {
    fn before_write(&self, _items: &[O]) {}

    fn after_write(&self, _items: &[O]) {}

    fn on_write_error(&self, _items: &[O], _error: &BatchError) {}
}

pub trait SkipListener<I, O> {
    fn on_skip_in_read(&self, _error: &BatchError) {}

    fn on_skip_in_process(&self, _item: &I, _error: &BatchError) {}

    fn on_skip_in_write(&self, _item: &O, _error: &BatchError) {}
}

pub trait RetryListener {
    /// A failed attempt is about to be retried.
    fn on_retry(&self, _attempt: usize, _error: &BatchError) {}

    fn on_retry_exhausted(&self, _attempts: usize, _error: &BatchError) {}
}

/// Registry of the listeners of one chunk-oriented step.
pub struct Listeners<'a, I, O> {
    pub(crate) step: Vec<&'a dyn StepListener>,
    pub(crate) chunk: Vec<&'a dyn ChunkListener>,
    pub(crate) read: Vec<&'a dyn ItemReadListener<I>>,
    pub(crate) process: Vec<&'a dyn ItemProcessListener<I, O>>,
    pub(crate) write: Vec<&'a dyn ItemWriteListener<O>>,
    pub(crate) skip: Vec<&'a dyn SkipListener<I, O>>,
    pub(crate) retry: Vec<&'a dyn RetryListener>,
}

impl<I, O> Default for Listeners<'_, I, O> {
    fn default() -> Self {
        Self {
            step: Vec::new(),
            chunk: Vec::new(),
            read: Vec::new(),
            process: Vec::new(),
            write: Vec::new(),
            skip: Vec::new(),
            retry: Vec::new(),
        }
    }
}

impl<I, O> Listeners<'_, I, O> {
    pub fn before_step(&self, step_execution: &StepExecution) {
        self.step.iter().for_each(|l| l.before_step(step_execution));
    }

    /// Called in reverse registration order, like a stack of interceptors.
    pub fn after_step(&self, step_execution: &StepExecution) {
        self.step
            .iter()
            .rev()
            .for_each(|l| l.after_step(step_execution));
    }

    pub fn before_chunk(&self, step_execution: &StepExecution) {
        self.chunk.iter().for_each(|l| l.before_chunk(step_execution));
    }

    pub fn after_chunk(&self, step_execution: &StepExecution) {
        self.chunk
            .iter()
            .rev()
            .for_each(|l| l.after_chunk(step_execution));
    }

    pub fn on_chunk_error(&self, step_execution: &StepExecution, error: &BatchError) {
        self.chunk
            .iter()
            .rev()
            .for_each(|l| l.on_chunk_error(step_execution, error));
    }

    pub fn on_scan_start(&self, item_count: usize) {
        self.chunk.iter().for_each(|l| l.on_scan_start(item_count));
    }

    pub fn on_scan_end(&self, result: &WriteResult) {
        self.chunk.iter().rev().for_each(|l| l.on_scan_end(result));
    }

    pub fn before_read(&self) {
        self.read.iter().for_each(|l| l.before_read());
    }

    pub fn after_read(&self, item: &I) {
        self.read.iter().rev().for_each(|l| l.after_read(item));
    }

    pub fn on_read_error(&self, error: &BatchError) {
        self.read.iter().rev().for_each(|l| l.on_read_error(error));
    }

    pub fn before_process(&self, item: &I) {
        self.process.iter().for_each(|l| l.before_process(item));
    }

    pub fn after_process(&self, item: &I, result: Option<&O>) {
        self.process
            .iter()
            .rev()
            .for_each(|l| l.after_process(item, result));
    }

    pub fn on_process_error(&self, item: &I, error: &BatchError) {
        self.process
            .iter()
            .rev()
            .for_each(|l| l.on_process_error(item, error));
    }

    pub fn before_write(&self, items: &[O]) {
        self.write.iter().for_each(|l| l.before_write(items));
    }

    pub fn after_write(&self, items: &[O]) {
        self.write.iter().rev().for_each(|l| l.after_write(items));
    }

    pub fn on_write_error(&self, items: &[O], error: &BatchError) {
        self.write
            .iter()
            .rev()
            .for_each(|l| l.on_write_error(items, error));
    }

    pub fn on_skip_in_read(&self, error: &BatchError) {
        self.skip.iter().for_each(|l| l.on_skip_in_read(error));
    }

    pub fn on_skip_in_process(&self, item: &I, error: &BatchError) {
        self.skip.iter().for_each(|l| l.on_skip_in_process(item, error));
    }

    pub fn on_skip_in_write(&self, item: &O, error: &BatchError) {
        self.skip.iter().for_each(|l| l.on_skip_in_write(item, error));
    }

    pub fn on_retry(&self, attempt: usize, error: &BatchError) {
        self.retry.iter().for_each(|l| l.on_retry(attempt, error));
    }

    pub fn on_retry_exhausted(&self, attempts: usize, error: &BatchError) {
        self.retry
            .iter()
            .for_each(|l| l.on_retry_exhausted(attempts, error));
    }
}
