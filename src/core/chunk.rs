use log::{debug, warn};

use crate::error::BatchError;

use super::{
    execution::StepContribution,
    fault_tolerant::{Disposition, FaultPolicy},
    item::ItemReader,
    listener::Listeners,
    policy::{CompletionPolicy, CompletionState},
};

/// Items read for one commit interval.
///
/// A chunk lives for a single transaction attempt cycle: it is created by the
/// [`ChunkProvider`], kept while the chunk is retried or scanned, and dropped once
/// committed or abandoned.
#[derive(Debug)]
pub struct Chunk<I> {
    items: Vec<I>,
    end: bool,
}

impl<I> Default for Chunk<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I> Chunk<I> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            end: false,
        }
    }

    pub fn with_items(items: Vec<I>) -> Self {
        Self { items, end: false }
    }

    pub fn add(&mut self, item: I) {
        self.items.push(item);
    }

    pub fn items(&self) -> &[I] {
        &self.items
    }

    /// Removes an item for good, e.g. after it was skipped.
    pub fn remove(&mut self, index: usize) -> I {
        self.items.remove(index)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The reader reported the end of its data while this chunk was filled.
    pub fn is_end(&self) -> bool {
        self.end
    }

    pub fn set_end(&mut self) {
        self.end = true;
    }
}

/// Pulls items from upstream until the chunk is complete.
pub trait ChunkProvider<I> {
    /// Reads the next chunk. An empty chunk with [`Chunk::is_end`] set means the
    /// input is exhausted. Read counts are added to `contribution`.
    fn provide(&self, contribution: &mut StepContribution) -> Result<Chunk<I>, BatchError>;
}

/// [`ChunkProvider`] reading from an [`ItemReader`].
///
/// Without a fault policy any read error is returned as is. With one, retryable
/// read errors are attempted again in place and skippable ones are counted as
/// read skips.
pub struct SimpleChunkProvider<'a, I, O> {
    reader: &'a dyn ItemReader<I>,
    completion_policy: &'a dyn CompletionPolicy,
    fault_policy: Option<&'a FaultPolicy>,
    listeners: &'a Listeners<'a, I, O>,
}

impl<'a, I, O> SimpleChunkProvider<'a, I, O> {
    pub fn new(
        reader: &'a dyn ItemReader<I>,
        completion_policy: &'a dyn CompletionPolicy,
        fault_policy: Option<&'a FaultPolicy>,
        listeners: &'a Listeners<'a, I, O>,
    ) -> Self {
        Self {
            reader,
            completion_policy,
            fault_policy,
            listeners,
        }
    }

    fn read(&self, contribution: &mut StepContribution) -> Result<Option<I>, BatchError> {
        let mut attempts = 0;

        loop {
            self.listeners.before_read();

            let error = match self.reader.read() {
                Ok(Some(item)) => {
                    contribution.read_count += 1;
                    self.listeners.after_read(&item);
                    return Ok(Some(item));
                }
                Ok(None) => return Ok(None),
                Err(error) => error,
            };

            attempts += 1;
            self.listeners.on_read_error(&error);

            let Some(policy) = self.fault_policy else {
                return Err(error);
            };

            match policy.decide(&error, attempts, contribution.step_skip_count()) {
                Disposition::Retry => {
                    warn!("Retrying read after attempt {}: {}", attempts, error);
                    self.listeners.on_retry(attempts, &error);
                    policy.pause();
                }
                Disposition::Skip => {
                    warn!("Skipping item on read: {}", error);
                    contribution.read_skip_count += 1;
                    self.listeners.on_skip_in_read(&error);
                    attempts = 0;
                }
                Disposition::Fatal => {
                    if policy.is_retry_exhausted(&error, attempts) {
                        self.listeners.on_retry_exhausted(attempts, &error);
                    }
                    return Err(policy.escalate(
                        error,
                        "read",
                        contribution.step_skip_count(),
                    ));
                }
            }
        }
    }
}

impl<I, O> ChunkProvider<I> for SimpleChunkProvider<'_, I, O> {
    fn provide(&self, contribution: &mut StepContribution) -> Result<Chunk<I>, BatchError> {
        debug!("Start reading chunk");

        let mut chunk = Chunk::new();
        let mut state = CompletionState::start();

        // a chunk always holds at least one item unless the input is exhausted
        while state.item_count == 0 || !self.completion_policy.is_complete(&state) {
            match self.read(contribution)? {
                Some(item) => {
                    chunk.add(item);
                    state.item_count += 1;
                }
                None => {
                    chunk.set_end();
                    break;
                }
            }
        }

        debug!(
            "End reading chunk: {} items{}",
            chunk.len(),
            if chunk.is_end() { ", FINISHED" } else { "" }
        );
        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::{
        ErrorKind,
        core::policy::{
            Classifier, LimitCheckingSkipPolicy, NeverRetryPolicy, SimpleCompletionPolicy,
            SimpleRetryPolicy,
        },
        item::list::ListItemReader,
    };

    /// Fails on the given read attempts (1-based), otherwise yields the attempt number.
    struct FlakyReader {
        attempts: Cell<u32>,
        failing: Vec<u32>,
        total: u32,
    }

    impl ItemReader<u32> for FlakyReader {
        fn read(&self) -> Result<Option<u32>, BatchError> {
            let attempt = self.attempts.get() + 1;
            self.attempts.set(attempt);
            if self.failing.contains(&attempt) {
                return Err(BatchError::Transient(format!("attempt {}", attempt)));
            }
            if attempt > self.total {
                return Ok(None);
            }
            Ok(Some(attempt))
        }
    }

    #[test]
    fn full_chunk_then_partial_chunk_then_end() -> anyhow::Result<()> {
        let reader = ListItemReader::new(vec![1, 2, 3, 4, 5]);
        let policy = SimpleCompletionPolicy::new(3);
        let listeners: Listeners<'_, i32, i32> = Listeners::default();
        let provider = SimpleChunkProvider::new(&reader, &policy, None, &listeners);

        let mut contribution = StepContribution::default();
        let first = provider.provide(&mut contribution)?;
        assert_eq!(first.items(), &[1, 2, 3]);
        assert!(!first.is_end());

        let second = provider.provide(&mut contribution)?;
        assert_eq!(second.items(), &[4, 5]);
        assert!(second.is_end());
        assert_eq!(contribution.read_count, 5);
        Ok(())
    }

    #[test]
    fn empty_chunk_signals_exhausted_input() -> anyhow::Result<()> {
        let reader: ListItemReader<i32> = ListItemReader::new(vec![]);
        let policy = SimpleCompletionPolicy::new(3);
        let listeners: Listeners<'_, i32, i32> = Listeners::default();
        let provider = SimpleChunkProvider::new(&reader, &policy, None, &listeners);

        let chunk = provider.provide(&mut StepContribution::default())?;
        assert!(chunk.is_empty());
        assert!(chunk.is_end());
        Ok(())
    }

    #[test]
    fn policy_complete_before_any_read_still_reads_one_item() -> anyhow::Result<()> {
        let reader = ListItemReader::new(vec![1, 2]);
        let policy = SimpleCompletionPolicy::new(0);
        let listeners: Listeners<'_, i32, i32> = Listeners::default();
        let provider = SimpleChunkProvider::new(&reader, &policy, None, &listeners);

        let mut contribution = StepContribution::default();
        assert_eq!(provider.provide(&mut contribution)?.items(), &[1]);
        assert_eq!(provider.provide(&mut contribution)?.items(), &[2]);

        let last = provider.provide(&mut contribution)?;
        assert!(last.is_empty());
        assert!(last.is_end());
        Ok(())
    }

    #[test]
    fn read_error_without_fault_policy_is_propagated() {
        let reader = FlakyReader {
            attempts: Cell::new(0),
            failing: vec![2],
            total: 5,
        };
        let policy = SimpleCompletionPolicy::new(3);
        let listeners: Listeners<'_, u32, u32> = Listeners::default();
        let provider = SimpleChunkProvider::new(&reader, &policy, None, &listeners);

        let result = provider.provide(&mut StepContribution::default());
        assert!(matches!(result, Err(BatchError::Transient(_))));
    }

    #[test]
    fn fault_policy_retries_then_skips_read_errors() -> anyhow::Result<()> {
        let reader = FlakyReader {
            attempts: Cell::new(0),
            // attempt 2 fails and is retried, 4 and 5 fail: 4 retried, 5 skipped
            failing: vec![2, 4, 5],
            total: 6,
        };
        let fault_policy = FaultPolicy::new(
            Box::new(SimpleRetryPolicy::new(2, Classifier::of(&[ErrorKind::Transient]))),
            Box::new(LimitCheckingSkipPolicy::new(
                1,
                Classifier::of(&[ErrorKind::Transient]),
            )),
        );
        let policy = SimpleCompletionPolicy::new(10);
        let listeners: Listeners<'_, u32, u32> = Listeners::default();
        let provider = SimpleChunkProvider::new(&reader, &policy, Some(&fault_policy), &listeners);

        let mut contribution = StepContribution::default();
        let chunk = provider.provide(&mut contribution)?;
        assert_eq!(chunk.items(), &[1, 3, 6]);
        assert_eq!(contribution.read_count, 3);
        assert_eq!(contribution.read_skip_count, 1);
        Ok(())
    }

    #[test]
    fn read_skip_beyond_limit_is_fatal() {
        let reader = FlakyReader {
            attempts: Cell::new(0),
            failing: vec![1, 2],
            total: 3,
        };
        let fault_policy = FaultPolicy::new(
            Box::new(NeverRetryPolicy),
            Box::new(LimitCheckingSkipPolicy::new(
                1,
                Classifier::of(&[ErrorKind::Transient]),
            )),
        );
        let policy = SimpleCompletionPolicy::new(10);
        let listeners: Listeners<'_, u32, u32> = Listeners::default();
        let provider = SimpleChunkProvider::new(&reader, &policy, Some(&fault_policy), &listeners);

        let mut contribution = StepContribution::default();
        let result = provider.provide(&mut contribution);
        assert!(matches!(
            result,
            Err(BatchError::SkipLimitExceeded { limit: 1, .. })
        ));
        assert_eq!(contribution.read_skip_count, 1);
    }
}
