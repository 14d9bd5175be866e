//! Pluggable decisions taken while a step runs: when a chunk is full, whether a
//! failed operation may be retried and whether a faulty item may be skipped.
//!
//! Policies are consulted, never mutated, during execution. Each one exposes a
//! small set of required operations; the derived decisions (`can_retry`,
//! `should_skip`) are provided methods so every implementation applies its
//! ceiling the same way.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use crate::{BatchError, ErrorKind};

/// Table mapping an [`ErrorKind`] to a value, with a fallback for unlisted kinds.
#[derive(Debug, Clone)]
pub struct Classifier<T> {
    table: HashMap<ErrorKind, T>,
    default: T,
}

impl<T: Copy> Classifier<T> {
    pub fn new(default: T) -> Self {
        Self {
            table: HashMap::new(),
            default,
        }
    }

    pub fn with(mut self, kind: ErrorKind, value: T) -> Self {
        self.table.insert(kind, value);
        self
    }

    pub fn insert(&mut self, kind: ErrorKind, value: T) {
        self.table.insert(kind, value);
    }

    pub fn classify(&self, error: &BatchError) -> T {
        self.table
            .get(&error.kind())
            .copied()
            .unwrap_or(self.default)
    }
}

impl Classifier<bool> {
    /// Classifier answering `true` for the given kinds only.
    pub fn of(kinds: &[ErrorKind]) -> Self {
        kinds
            .iter()
            .fold(Classifier::new(false), |classifier, kind| {
                classifier.with(*kind, true)
            })
    }
}

pub trait RetryPolicy {
    fn is_retryable(&self, error: &BatchError) -> bool;

    /// Attempts allowed for one operation, the first one included.
    fn max_attempts(&self) -> usize;

    /// Pause before the next attempt.
    fn backoff(&self) -> Option<Duration> {
        None
    }

    /// Whether another attempt may follow `attempts` failed ones.
    fn can_retry(&self, error: &BatchError, attempts: usize) -> bool {
        self.is_retryable(error) && attempts < self.max_attempts()
    }
}

#[derive(Default)]
pub struct NeverRetryPolicy;

impl RetryPolicy for NeverRetryPolicy {
    fn is_retryable(&self, _error: &BatchError) -> bool {
        false
    }

    fn max_attempts(&self) -> usize {
        1
    }
}

pub struct SimpleRetryPolicy {
    retryable: Classifier<bool>,
    max_attempts: usize,
    backoff: Option<Duration>,
}

impl SimpleRetryPolicy {
    pub fn new(max_attempts: usize, retryable: Classifier<bool>) -> Self {
        Self {
            retryable,
            max_attempts,
            backoff: None,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = Some(backoff);
        self
    }
}

impl RetryPolicy for SimpleRetryPolicy {
    fn is_retryable(&self, error: &BatchError) -> bool {
        self.retryable.classify(error)
    }

    fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    fn backoff(&self) -> Option<Duration> {
        self.backoff
    }
}

/// Outcome of consulting a [`SkipPolicy`] for one failed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipDecision {
    Skip,
    NotSkippable,
    /// The error is skippable but the step already skipped `limit` items.
    LimitExceeded { limit: usize },
}

pub trait SkipPolicy {
    fn is_skippable(&self, error: &BatchError) -> bool;

    /// Maximum number of skips over the whole step.
    fn skip_limit(&self) -> usize;

    /// Decides whether an item failing with `error` may be skipped when the step
    /// has already skipped `skip_count` items. A skippable error past the limit
    /// is reported as [`SkipDecision::LimitExceeded`] and must be treated as fatal.
    fn should_skip(&self, error: &BatchError, skip_count: usize) -> SkipDecision {
        if !self.is_skippable(error) {
            SkipDecision::NotSkippable
        } else if skip_count < self.skip_limit() {
            SkipDecision::Skip
        } else {
            SkipDecision::LimitExceeded {
                limit: self.skip_limit(),
            }
        }
    }
}

#[derive(Default)]
pub struct NeverSkipPolicy;

impl SkipPolicy for NeverSkipPolicy {
    fn is_skippable(&self, _error: &BatchError) -> bool {
        false
    }

    fn skip_limit(&self) -> usize {
        0
    }
}

#[derive(Default)]
pub struct AlwaysSkipPolicy;

impl SkipPolicy for AlwaysSkipPolicy {
    fn is_skippable(&self, _error: &BatchError) -> bool {
        true
    }

    fn skip_limit(&self) -> usize {
        usize::MAX
    }
}

pub struct LimitCheckingSkipPolicy {
    skippable: Classifier<bool>,
    skip_limit: usize,
}

impl LimitCheckingSkipPolicy {
    pub fn new(skip_limit: usize, skippable: Classifier<bool>) -> Self {
        Self {
            skippable,
            skip_limit,
        }
    }
}

impl SkipPolicy for LimitCheckingSkipPolicy {
    fn is_skippable(&self, error: &BatchError) -> bool {
        self.skippable.classify(error)
    }

    fn skip_limit(&self) -> usize {
        self.skip_limit
    }
}

/// Progress of the chunk being filled, handed to a [`CompletionPolicy`].
#[derive(Debug, Clone, Copy)]
pub struct CompletionState {
    pub item_count: usize,
    pub started: Instant,
}

impl CompletionState {
    pub fn start() -> Self {
        Self {
            item_count: 0,
            started: Instant::now(),
        }
    }
}

/// Decides when the chunk being read is complete.
pub trait CompletionPolicy {
    fn is_complete(&self, state: &CompletionState) -> bool;
}

/// Complete after a fixed number of items: the commit interval.
pub struct SimpleCompletionPolicy {
    chunk_size: usize,
}

impl SimpleCompletionPolicy {
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }
}

impl CompletionPolicy for SimpleCompletionPolicy {
    fn is_complete(&self, state: &CompletionState) -> bool {
        state.item_count >= self.chunk_size
    }
}

/// Complete once the chunk has been reading for longer than a timeout.
pub struct TimeoutCompletionPolicy {
    timeout: Duration,
}

impl TimeoutCompletionPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl CompletionPolicy for TimeoutCompletionPolicy {
    fn is_complete(&self, state: &CompletionState) -> bool {
        state.item_count > 0 && state.started.elapsed() >= self.timeout
    }
}

/// Complete as soon as any of its policies is.
pub struct CompositeCompletionPolicy<'a> {
    policies: Vec<&'a dyn CompletionPolicy>,
}

impl<'a> CompositeCompletionPolicy<'a> {
    pub fn new(policies: Vec<&'a dyn CompletionPolicy>) -> Self {
        Self { policies }
    }
}

impl CompletionPolicy for CompositeCompletionPolicy<'_> {
    fn is_complete(&self, state: &CompletionState) -> bool {
        self.policies.iter().any(|policy| policy.is_complete(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifier_falls_back_to_default() {
        let classifier = Classifier::of(&[ErrorKind::Transient, ErrorKind::Write]);
        assert!(classifier.classify(&BatchError::Transient("deadlock".into())));
        assert!(classifier.classify(&BatchError::ItemWriter("io".into())));
        assert!(!classifier.classify(&BatchError::ItemReader("eof".into())));
    }

    #[test]
    fn retry_stops_at_max_attempts() {
        let policy = SimpleRetryPolicy::new(3, Classifier::of(&[ErrorKind::Transient]));
        let transient = BatchError::Transient("timeout".into());

        assert!(policy.can_retry(&transient, 1));
        assert!(policy.can_retry(&transient, 2));
        assert!(!policy.can_retry(&transient, 3));
        assert!(!policy.can_retry(&BatchError::Validation("bad".into()), 1));
        assert!(!NeverRetryPolicy.can_retry(&transient, 0));
    }

    #[test]
    fn skip_limit_plus_one_becomes_fatal() {
        let policy = LimitCheckingSkipPolicy::new(2, Classifier::of(&[ErrorKind::Validation]));
        let invalid = BatchError::Validation("bad".into());

        assert_eq!(policy.should_skip(&invalid, 0), SkipDecision::Skip);
        assert_eq!(policy.should_skip(&invalid, 1), SkipDecision::Skip);
        assert_eq!(
            policy.should_skip(&invalid, 2),
            SkipDecision::LimitExceeded { limit: 2 }
        );
        assert_eq!(
            policy.should_skip(&BatchError::ItemWriter("io".into()), 0),
            SkipDecision::NotSkippable
        );
    }

    #[test]
    fn zero_skip_limit_rejects_first_skippable_error() {
        let policy = LimitCheckingSkipPolicy::new(0, Classifier::of(&[ErrorKind::Validation]));
        assert_eq!(
            policy.should_skip(&BatchError::Validation("bad".into()), 0),
            SkipDecision::LimitExceeded { limit: 0 }
        );
        assert_eq!(
            AlwaysSkipPolicy.should_skip(&BatchError::Step("any".into()), 1_000),
            SkipDecision::Skip
        );
        assert_eq!(
            NeverSkipPolicy.should_skip(&BatchError::Step("any".into()), 0),
            SkipDecision::NotSkippable
        );
    }

    #[test]
    fn composite_completes_when_any_member_does() {
        let by_count = SimpleCompletionPolicy::new(3);
        let by_time = TimeoutCompletionPolicy::new(Duration::from_secs(3600));
        let composite = CompositeCompletionPolicy::new(vec![&by_count, &by_time]);

        let mut state = CompletionState::start();
        assert!(!composite.is_complete(&state));
        state.item_count = 3;
        assert!(composite.is_complete(&state));

        let expired = TimeoutCompletionPolicy::new(Duration::ZERO);
        let mut state = CompletionState::start();
        assert!(!expired.is_complete(&state));
        state.item_count = 1;
        assert!(expired.is_complete(&state));
    }
}
