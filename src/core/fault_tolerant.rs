//! Retry and skip handling around a chunk.
//!
//! A failing chunk is first retried as a whole while the retry policy allows it.
//! A skippable processing failure removes the faulty item and the chunk is tried
//! again without it. A skippable write failure that survives its retries puts
//! the chunk in scan mode: items are processed and written one at a time so the
//! faulty ones can be isolated and skipped while the others are still written.

use log::{debug, info, warn};

use crate::error::BatchError;

use super::{
    chunk::Chunk,
    execution::StepContribution,
    listener::Listeners,
    policy::{RetryPolicy, SkipDecision, SkipPolicy},
    processor::{ChunkProcessor, ProcessFailure, SimpleChunkProcessor, Transformed, WriteResult},
    transaction::TransactionManager,
};

/// What to do with a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry,
    Skip,
    Fatal,
}

/// Retry and skip tables of a fault-tolerant step.
pub struct FaultPolicy {
    retry: Box<dyn RetryPolicy>,
    skip: Box<dyn SkipPolicy>,
}

impl FaultPolicy {
    pub fn new(retry: Box<dyn RetryPolicy>, skip: Box<dyn SkipPolicy>) -> Self {
        Self { retry, skip }
    }

    /// Disposition of `error` after `attempts` failed tries of the same
    /// operation, when the step already skipped `skip_count` items.
    pub fn decide(&self, error: &BatchError, attempts: usize, skip_count: usize) -> Disposition {
        if self.retry.can_retry(error, attempts) {
            return Disposition::Retry;
        }
        match self.skip.should_skip(error, skip_count) {
            SkipDecision::Skip => Disposition::Skip,
            SkipDecision::NotSkippable | SkipDecision::LimitExceeded { .. } => Disposition::Fatal,
        }
    }

    pub fn can_retry(&self, error: &BatchError, attempts: usize) -> bool {
        self.retry.can_retry(error, attempts)
    }

    pub fn is_skippable(&self, error: &BatchError) -> bool {
        self.skip.is_skippable(error)
    }

    pub fn should_skip(&self, error: &BatchError, skip_count: usize) -> SkipDecision {
        self.skip.should_skip(error, skip_count)
    }

    /// The error was retryable but ran out of attempts.
    pub fn is_retry_exhausted(&self, error: &BatchError, attempts: usize) -> bool {
        self.retry.is_retryable(error) && attempts >= self.retry.max_attempts()
    }

    /// Sleeps for the configured back-off, if any.
    pub fn pause(&self) {
        if let Some(backoff) = self.retry.backoff() {
            std::thread::sleep(backoff);
        }
    }

    /// Wraps a failure that cannot be skipped into the error failing the step.
    pub fn escalate(&self, error: BatchError, phase: &'static str, skip_count: usize) -> BatchError {
        match self.skip.should_skip(&error, skip_count) {
            SkipDecision::LimitExceeded { limit } => BatchError::SkipLimitExceeded {
                limit,
                source: Box::new(error),
            },
            SkipDecision::NotSkippable | SkipDecision::Skip => BatchError::NonSkippable {
                phase,
                source: Box::new(error),
            },
        }
    }
}

enum ChunkFailure {
    Process(ProcessFailure),
    Write(BatchError),
}

/// [`ChunkProcessor`] applying a [`FaultPolicy`] around a [`SimpleChunkProcessor`].
///
/// The step owns the transaction of the chunk. Before every new attempt this
/// processor rolls it back and begins a fresh one; a fatal failure is returned
/// with the transaction still open so the step rolls it back.
pub struct FaultTolerantChunkProcessor<'a, I, O> {
    delegate: SimpleChunkProcessor<'a, I, O>,
    policy: &'a FaultPolicy,
    transaction_manager: &'a dyn TransactionManager,
    listeners: &'a Listeners<'a, I, O>,
}

impl<'a, I, O> FaultTolerantChunkProcessor<'a, I, O> {
    pub fn new(
        delegate: SimpleChunkProcessor<'a, I, O>,
        policy: &'a FaultPolicy,
        transaction_manager: &'a dyn TransactionManager,
        listeners: &'a Listeners<'a, I, O>,
    ) -> Self {
        Self {
            delegate,
            policy,
            transaction_manager,
            listeners,
        }
    }

    fn restart_transaction(&self, contribution: &mut StepContribution) -> Result<(), BatchError> {
        warn!("Rolling back chunk transaction");
        self.transaction_manager.rollback()?;
        contribution.rollback_count += 1;
        self.transaction_manager.begin()
    }

    fn before_retry(&self, attempts: usize, error: &BatchError) {
        warn!("Retrying chunk after attempt {}: {}", attempts, error);
        self.listeners.on_retry(attempts, error);
        self.policy.pause();
    }

    fn attempt(&self, chunk: &Chunk<I>) -> Result<Transformed<O>, ChunkFailure> {
        let transformed = self
            .delegate
            .transform_chunk(chunk)
            .map_err(ChunkFailure::Process)?;

        if transformed.outputs.is_empty() {
            debug!("No items to write, skipping write call");
            return Ok(transformed);
        }
        self.delegate
            .write_items(&transformed.outputs)
            .map_err(ChunkFailure::Write)?;
        Ok(transformed)
    }

    /// Processes then writes every item on its own, skipping the faulty ones.
    fn scan(
        &self,
        chunk: &mut Chunk<I>,
        contribution: &mut StepContribution,
    ) -> Result<WriteResult, BatchError> {
        info!("Scanning chunk of {} items", chunk.len());
        self.listeners.on_scan_start(chunk.len());

        let mut result = WriteResult {
            scanned: true,
            ..WriteResult::default()
        };
        let mut index = 0;

        while index < chunk.len() {
            let item = &chunk.items()[index];

            let output = match self.delegate.transform(item) {
                Ok(Some(output)) => output,
                Ok(None) => {
                    contribution.filter_count += 1;
                    result.filtered += 1;
                    index += 1;
                    continue;
                }
                Err(error) => {
                    let error = self.skip_in_scan(error, "process", contribution)?;
                    let item = chunk.remove(index);
                    warn!("Skipping item on process: {}", error);
                    self.listeners.on_skip_in_process(&item, &error);
                    contribution.process_skip_count += 1;
                    result.skipped += 1;
                    continue;
                }
            };

            match self.delegate.write_items(std::slice::from_ref(&output)) {
                Ok(()) => {
                    contribution.write_count += 1;
                    result.written += 1;
                    index += 1;
                }
                Err(error) => {
                    let error = self.skip_in_scan(error, "write", contribution)?;
                    warn!("Skipping item on write: {}", error);
                    self.listeners.on_skip_in_write(&output, &error);
                    chunk.remove(index);
                    contribution.write_skip_count += 1;
                    contribution.rollback_count += 1;
                    result.skipped += 1;
                }
            }
        }

        self.listeners.on_scan_end(&result);
        info!(
            "Scan finished: {} written, {} skipped",
            result.written, result.skipped
        );
        Ok(result)
    }

    /// Hands the error back when the item may be skipped, otherwise the error
    /// failing the step.
    fn skip_in_scan(
        &self,
        error: BatchError,
        phase: &'static str,
        contribution: &StepContribution,
    ) -> Result<BatchError, BatchError> {
        let skip_count = contribution.step_skip_count();
        match self.policy.should_skip(&error, skip_count) {
            SkipDecision::Skip => Ok(error),
            SkipDecision::NotSkippable | SkipDecision::LimitExceeded { .. } => {
                Err(self.policy.escalate(error, phase, skip_count))
            }
        }
    }
}

impl<I, O> ChunkProcessor<I> for FaultTolerantChunkProcessor<'_, I, O> {
    fn process(
        &self,
        chunk: &mut Chunk<I>,
        contribution: &mut StepContribution,
    ) -> Result<WriteResult, BatchError> {
        // write failures are retried per chunk, process failures per item
        let mut write_attempts = 0;
        let mut process_attempts = vec![0; chunk.len()];
        let mut skipped = 0;

        loop {
            let failure = match self.attempt(chunk) {
                Ok(transformed) => {
                    let written = transformed.outputs.len();
                    contribution.filter_count += transformed.filtered;
                    contribution.write_count += written;
                    return Ok(WriteResult {
                        written,
                        filtered: transformed.filtered,
                        skipped,
                        scanned: false,
                    });
                }
                Err(failure) => failure,
            };

            match failure {
                ChunkFailure::Process(ProcessFailure { index, error }) => {
                    let attempts = match process_attempts.get_mut(index) {
                        Some(count) => {
                            *count += 1;
                            *count
                        }
                        None => 1,
                    };
                    match self
                        .policy
                        .decide(&error, attempts, contribution.step_skip_count())
                    {
                        Disposition::Retry => {
                            self.restart_transaction(contribution)?;
                            self.before_retry(attempts, &error);
                        }
                        Disposition::Skip => {
                            self.restart_transaction(contribution)?;
                            let item = chunk.remove(index);
                            warn!("Skipping item on process: {}", error);
                            self.listeners.on_skip_in_process(&item, &error);
                            contribution.process_skip_count += 1;
                            skipped += 1;
                            if index < process_attempts.len() {
                                process_attempts.remove(index);
                            }
                        }
                        Disposition::Fatal => {
                            if self.policy.is_retry_exhausted(&error, attempts) {
                                self.listeners.on_retry_exhausted(attempts, &error);
                            }
                            return Err(self.policy.escalate(
                                error,
                                "process",
                                contribution.step_skip_count(),
                            ));
                        }
                    }
                }
                ChunkFailure::Write(error) => {
                    write_attempts += 1;
                    let attempts = write_attempts;
                    if self.policy.can_retry(&error, attempts) {
                        self.restart_transaction(contribution)?;
                        self.before_retry(attempts, &error);
                        continue;
                    }
                    if self.policy.is_retry_exhausted(&error, attempts) {
                        self.listeners.on_retry_exhausted(attempts, &error);
                    }
                    if !self.policy.is_skippable(&error) {
                        return Err(self.policy.escalate(
                            error,
                            "write",
                            contribution.step_skip_count(),
                        ));
                    }

                    self.restart_transaction(contribution)?;
                    let mut result = self.scan(chunk, contribution)?;
                    result.skipped += skipped;
                    return Ok(result);
                }
            }
        }
    }
}
