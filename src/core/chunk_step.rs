use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::{BatchError, ErrorKind, repository::JobRepository};

use super::{
    chunk::{ChunkProvider, SimpleChunkProvider},
    execution::{StepContribution, StepExecution},
    fault_tolerant::{FaultPolicy, FaultTolerantChunkProcessor},
    item::{ItemProcessor, ItemReader, ItemWriter},
    listener::{
        ChunkListener, ItemProcessListener, ItemReadListener, ItemWriteListener, Listeners,
        RetryListener, SkipListener, StepListener,
    },
    policy::{
        Classifier, CompletionPolicy, LimitCheckingSkipPolicy, NeverRetryPolicy, NeverSkipPolicy,
        RetryPolicy, SimpleCompletionPolicy, SimpleRetryPolicy, SkipPolicy,
    },
    processor::{ChunkProcessor, SimpleChunkProcessor},
    step::{DEFAULT_COMMIT_RETRY_LIMIT, StepOutcome, StepRunner, StopSignal, persist_step_execution},
    transaction::{ResourcelessTransactionManager, TransactionManager},
};

/// Tuning of a chunk-oriented step that can be loaded from a configuration file.
///
/// Missing fields take their default value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepSettings {
    pub chunk_size: usize,
    pub skip_limit: usize,
    /// Tries of a failing chunk, the first one included.
    pub retry_limit: usize,
    /// Attempts to save the step execution after a version conflict.
    pub commit_retry_limit: usize,
    pub start_limit: u32,
    pub allow_start_if_complete: bool,
}

impl Default for StepSettings {
    fn default() -> Self {
        Self {
            chunk_size: 10,
            skip_limit: 0,
            retry_limit: 3,
            commit_retry_limit: DEFAULT_COMMIT_RETRY_LIMIT,
            start_limit: u32::MAX,
            allow_start_if_complete: false,
        }
    }
}

/// Retry and skip configuration collected by the builder.
#[derive(Default)]
struct FaultSettings {
    enabled: bool,
    retryable: Vec<ErrorKind>,
    skippable: Vec<ErrorKind>,
    retry_policy: Option<Box<dyn RetryPolicy>>,
    skip_policy: Option<Box<dyn SkipPolicy>>,
    backoff: Option<Duration>,
}

impl FaultSettings {
    fn into_policy(self, settings: &StepSettings) -> Option<FaultPolicy> {
        let FaultSettings {
            enabled,
            retryable,
            skippable,
            retry_policy,
            skip_policy,
            backoff,
        } = self;

        let enabled = enabled
            || !retryable.is_empty()
            || !skippable.is_empty()
            || retry_policy.is_some()
            || skip_policy.is_some();
        if !enabled {
            return None;
        }

        let retry: Box<dyn RetryPolicy> = match retry_policy {
            Some(policy) => policy,
            None if retryable.is_empty() => Box::new(NeverRetryPolicy),
            None => {
                let policy =
                    SimpleRetryPolicy::new(settings.retry_limit, Classifier::of(&retryable));
                match backoff {
                    Some(backoff) => Box::new(policy.with_backoff(backoff)),
                    None => Box::new(policy),
                }
            }
        };
        let skip: Box<dyn SkipPolicy> = match skip_policy {
            Some(policy) => policy,
            None if skippable.is_empty() => Box::new(NeverSkipPolicy),
            None => Box::new(LimitCheckingSkipPolicy::new(
                settings.skip_limit,
                Classifier::of(&skippable),
            )),
        };

        Some(FaultPolicy::new(retry, skip))
    }
}

/// Step reading, processing and writing items in transactional chunks.
///
/// Each chunk runs in its own transaction. Once the chunk is written the reader
/// and writer save their position in the execution context, the step execution
/// is persisted and the transaction commits. A stop request is honoured between
/// two chunks only.
pub struct ChunkOrientedStep<'a, I, O> {
    name: String,
    reader: &'a dyn ItemReader<I>,
    processor: &'a dyn ItemProcessor<I, O>,
    writer: &'a dyn ItemWriter<O>,
    repository: &'a dyn JobRepository,
    transaction_manager: &'a dyn TransactionManager,
    completion_policy: Option<&'a dyn CompletionPolicy>,
    chunk_completion: SimpleCompletionPolicy,
    fault_policy: Option<FaultPolicy>,
    listeners: Listeners<'a, I, O>,
    stop_signal: Option<StopSignal>,
    settings: StepSettings,
}

impl<I, O> ChunkOrientedStep<'_, I, O> {
    fn completion_policy(&self) -> &dyn CompletionPolicy {
        match self.completion_policy {
            Some(policy) => policy,
            None => &self.chunk_completion,
        }
    }

    fn is_interrupted(&self, step_execution: &StepExecution) -> bool {
        step_execution.terminate_only
            || self
                .stop_signal
                .as_ref()
                .is_some_and(StopSignal::is_stop_requested)
    }

    fn open(&self, step_execution: &StepExecution) -> Result<(), BatchError> {
        self.reader.open(&step_execution.execution_context)?;
        self.writer.open(&step_execution.execution_context)
    }

    fn close(&self) {
        Self::manage_error(self.reader.close());
        Self::manage_error(self.writer.close());
    }

    fn manage_error(result: Result<(), BatchError>) {
        if let Err(error) = result {
            warn!("Non-fatal error while closing stream: {}", error);
        }
    }

    fn process_chunks(&self, step_execution: &mut StepExecution) -> Result<StepOutcome, BatchError> {
        let provider = SimpleChunkProvider::new(
            self.reader,
            self.completion_policy(),
            self.fault_policy.as_ref(),
            &self.listeners,
        );
        let simple = SimpleChunkProcessor::new(self.processor, self.writer, &self.listeners);

        match &self.fault_policy {
            Some(policy) => {
                let processor = FaultTolerantChunkProcessor::new(
                    simple,
                    policy,
                    self.transaction_manager,
                    &self.listeners,
                );
                self.run_chunks(step_execution, &provider, &processor)
            }
            None => self.run_chunks(step_execution, &provider, &simple),
        }
    }

    fn run_chunks(
        &self,
        step_execution: &mut StepExecution,
        provider: &impl ChunkProvider<I>,
        processor: &impl ChunkProcessor<I>,
    ) -> Result<StepOutcome, BatchError> {
        loop {
            if self.is_interrupted(step_execution) {
                info!(
                    "Step [{}] interrupted after {} commits",
                    self.name, step_execution.commit_count
                );
                return Ok(StepOutcome::Stopped);
            }

            self.transaction_manager.begin()?;
            let checkpoint = step_execution.clone();
            let mut contribution = step_execution.create_contribution();

            match self.execute_chunk(provider, processor, step_execution, &mut contribution) {
                Ok(true) => {}
                Ok(false) => return Ok(StepOutcome::Completed),
                Err(error) => {
                    self.rollback(step_execution, checkpoint, &mut contribution, &error);
                    return Err(error);
                }
            }
        }
    }

    /// Runs one chunk inside the current transaction. Returns whether more
    /// input may follow.
    fn execute_chunk(
        &self,
        provider: &impl ChunkProvider<I>,
        processor: &impl ChunkProcessor<I>,
        step_execution: &mut StepExecution,
        contribution: &mut StepContribution,
    ) -> Result<bool, BatchError> {
        let mut chunk = provider.provide(contribution)?;
        let has_items = !chunk.is_empty();

        if has_items {
            self.listeners.before_chunk(step_execution);
            let result = processor.process(&mut chunk, contribution)?;
            debug!(
                "Chunk written: {} items, {} filtered, {} skipped",
                result.written, result.filtered, result.skipped
            );
        }

        step_execution.apply(contribution);
        if has_items || contribution.skip_count() > 0 {
            step_execution.commit_count += 1;
        }
        self.reader.update(&mut step_execution.execution_context)?;
        self.writer.update(&mut step_execution.execution_context)?;

        persist_step_execution(
            self.repository,
            step_execution,
            self.settings.commit_retry_limit,
        )?;
        self.transaction_manager.commit()?;

        if has_items {
            self.listeners.after_chunk(step_execution);
        }
        Ok(!chunk.is_end())
    }

    /// Discards the work of the failed chunk and keeps only its rollbacks.
    fn rollback(
        &self,
        step_execution: &mut StepExecution,
        checkpoint: StepExecution,
        contribution: &mut StepContribution,
        error: &BatchError,
    ) {
        error!(
            "Rolling back chunk transaction of step [{}]: {}",
            self.name, error
        );
        if let Err(rollback_error) = self.transaction_manager.rollback() {
            error!("Unable to roll back chunk transaction: {}", rollback_error);
        }

        let version = step_execution.version;
        let terminate_only = step_execution.terminate_only;
        *step_execution = checkpoint;
        step_execution.version = version;
        step_execution.terminate_only = terminate_only;

        contribution.rollback_count += 1;
        step_execution.apply_rollbacks(contribution);
        self.listeners.on_chunk_error(step_execution, error);
    }
}

impl<I, O> super::step::Step for ChunkOrientedStep<'_, I, O> {
    fn name(&self) -> &str {
        &self.name
    }

    fn start_limit(&self) -> u32 {
        self.settings.start_limit
    }

    fn allow_start_if_complete(&self) -> bool {
        self.settings.allow_start_if_complete
    }

    fn execute(&self, step_execution: &mut StepExecution) -> Result<(), BatchError> {
        let runner = StepRunner {
            name: &self.name,
            repository: self.repository,
            listeners: &self.listeners.step,
            commit_retry_limit: self.settings.commit_retry_limit,
        };

        runner.run(step_execution, |step_execution| {
            self.open(step_execution)?;
            let outcome = self.process_chunks(step_execution);
            self.close();
            outcome
        })
    }
}

/// Builder of a [`ChunkOrientedStep`], obtained from
/// [`StepBuilder::chunk`](super::step::StepBuilder::chunk).
///
/// The processor changes the output type of the step, so it has to be set
/// before the writer and the listeners typed on the output.
pub struct ChunkStepBuilder<'a, I, O> {
    name: String,
    reader: Option<&'a dyn ItemReader<I>>,
    processor: &'a dyn ItemProcessor<I, O>,
    writer: Option<&'a dyn ItemWriter<O>>,
    repository: Option<&'a dyn JobRepository>,
    transaction_manager: &'a dyn TransactionManager,
    completion_policy: Option<&'a dyn CompletionPolicy>,
    faults: FaultSettings,
    listeners: Listeners<'a, I, O>,
    stop_signal: Option<StopSignal>,
    settings: StepSettings,
    misconfiguration: Option<String>,
}

impl<'a, I> ChunkStepBuilder<'a, I, I> {
    pub(crate) fn new(
        name: &str,
        chunk_size: usize,
        processor: &'a dyn ItemProcessor<I, I>,
    ) -> Self {
        Self {
            name: name.to_string(),
            reader: None,
            processor,
            writer: None,
            repository: None,
            transaction_manager: &ResourcelessTransactionManager,
            completion_policy: None,
            faults: FaultSettings::default(),
            listeners: Listeners::default(),
            stop_signal: None,
            settings: StepSettings {
                chunk_size,
                ..StepSettings::default()
            },
            misconfiguration: None,
        }
    }

    pub fn processor<O>(
        self,
        processor: &'a impl ItemProcessor<I, O>,
    ) -> ChunkStepBuilder<'a, I, O> {
        let typed_too_early = self.writer.is_some()
            || !self.listeners.process.is_empty()
            || !self.listeners.write.is_empty()
            || !self.listeners.skip.is_empty();
        let misconfiguration = self.misconfiguration.or_else(|| {
            typed_too_early.then(|| {
                format!(
                    "Step [{}]: the processor must be set before the writer and output listeners",
                    self.name
                )
            })
        });

        ChunkStepBuilder {
            name: self.name,
            reader: self.reader,
            processor,
            writer: None,
            repository: self.repository,
            transaction_manager: self.transaction_manager,
            completion_policy: self.completion_policy,
            faults: self.faults,
            listeners: Listeners {
                step: self.listeners.step,
                chunk: self.listeners.chunk,
                read: self.listeners.read,
                process: Vec::new(),
                write: Vec::new(),
                skip: Vec::new(),
                retry: self.listeners.retry,
            },
            stop_signal: self.stop_signal,
            settings: self.settings,
            misconfiguration,
        }
    }
}

impl<'a, I, O> ChunkStepBuilder<'a, I, O> {
    pub fn reader(mut self, reader: &'a impl ItemReader<I>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn writer(mut self, writer: &'a impl ItemWriter<O>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn repository(mut self, repository: &'a dyn JobRepository) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn transaction_manager(mut self, transaction_manager: &'a dyn TransactionManager) -> Self {
        self.transaction_manager = transaction_manager;
        self
    }

    /// Replaces the commit interval with a custom completion policy.
    pub fn completion_policy(mut self, completion_policy: &'a dyn CompletionPolicy) -> Self {
        self.completion_policy = Some(completion_policy);
        self
    }

    /// Applies every value of `settings`, the chunk size included.
    pub fn settings(mut self, settings: &StepSettings) -> Self {
        self.settings = settings.clone();
        self
    }

    /// Enables retry and skip handling even without any classified error.
    pub fn fault_tolerant(mut self) -> Self {
        self.faults.enabled = true;
        self
    }

    pub fn retry_limit(mut self, retry_limit: usize) -> Self {
        self.settings.retry_limit = retry_limit;
        self
    }

    /// Marks an error kind as retryable.
    pub fn retry(mut self, kind: ErrorKind) -> Self {
        self.faults.retryable.push(kind);
        self
    }

    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.faults.backoff = Some(backoff);
        self
    }

    pub fn skip_limit(mut self, skip_limit: usize) -> Self {
        self.settings.skip_limit = skip_limit;
        self
    }

    /// Marks an error kind as skippable.
    pub fn skip(mut self, kind: ErrorKind) -> Self {
        self.faults.skippable.push(kind);
        self
    }

    pub fn retry_policy(mut self, retry_policy: Box<dyn RetryPolicy>) -> Self {
        self.faults.retry_policy = Some(retry_policy);
        self
    }

    pub fn skip_policy(mut self, skip_policy: Box<dyn SkipPolicy>) -> Self {
        self.faults.skip_policy = Some(skip_policy);
        self
    }

    pub fn commit_retry_limit(mut self, commit_retry_limit: usize) -> Self {
        self.settings.commit_retry_limit = commit_retry_limit;
        self
    }

    pub fn start_limit(mut self, start_limit: u32) -> Self {
        self.settings.start_limit = start_limit;
        self
    }

    pub fn allow_start_if_complete(mut self, allow: bool) -> Self {
        self.settings.allow_start_if_complete = allow;
        self
    }

    pub fn stop_signal(mut self, stop_signal: StopSignal) -> Self {
        self.stop_signal = Some(stop_signal);
        self
    }

    pub fn step_listener(mut self, listener: &'a dyn StepListener) -> Self {
        self.listeners.step.push(listener);
        self
    }

    pub fn chunk_listener(mut self, listener: &'a dyn ChunkListener) -> Self {
        self.listeners.chunk.push(listener);
        self
    }

    pub fn read_listener(mut self, listener: &'a dyn ItemReadListener<I>) -> Self {
        self.listeners.read.push(listener);
        self
    }

    pub fn process_listener(mut self, listener: &'a dyn ItemProcessListener<I, O>) -> Self {
        self.listeners.process.push(listener);
        self
    }

    pub fn write_listener(mut self, listener: &'a dyn ItemWriteListener<O>) -> Self {
        self.listeners.write.push(listener);
        self
    }

    pub fn skip_listener(mut self, listener: &'a dyn SkipListener<I, O>) -> Self {
        self.listeners.skip.push(listener);
        self
    }

    pub fn retry_listener(mut self, listener: &'a dyn RetryListener) -> Self {
        self.listeners.retry.push(listener);
        self
    }

    pub fn build(self) -> Result<ChunkOrientedStep<'a, I, O>, BatchError> {
        if let Some(misconfiguration) = self.misconfiguration {
            return Err(BatchError::Configuration(misconfiguration));
        }
        let missing =
            |what: &str| BatchError::Configuration(format!("Step [{}] requires {}", self.name, what));

        let reader = self.reader.ok_or_else(|| missing("a reader"))?;
        let writer = self.writer.ok_or_else(|| missing("a writer"))?;
        let repository = self.repository.ok_or_else(|| missing("a job repository"))?;
        if self.settings.chunk_size == 0 && self.completion_policy.is_none() {
            return Err(missing("a chunk size greater than 0"));
        }
        if self.settings.commit_retry_limit == 0 {
            return Err(missing("a commit retry limit greater than 0"));
        }

        let fault_policy = self.faults.into_policy(&self.settings);
        Ok(ChunkOrientedStep {
            chunk_completion: SimpleCompletionPolicy::new(self.settings.chunk_size),
            name: self.name,
            reader,
            processor: self.processor,
            writer,
            repository,
            transaction_manager: self.transaction_manager,
            completion_policy: self.completion_policy,
            fault_policy,
            listeners: self.listeners,
            stop_signal: self.stop_signal,
            settings: self.settings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::{
            execution::{BatchStatus, JobParameters},
            item::ItemProcessorResult,
            step::{Step, StepBuilder},
        },
        item::list::{ListItemReader, ListItemWriter},
        repository::InMemoryJobRepository,
    };

    struct Doubler;

    impl ItemProcessor<i32, i64> for Doubler {
        fn process(&self, item: &i32) -> ItemProcessorResult<i64> {
            Ok(Some(i64::from(*item) * 2))
        }
    }

    fn new_step_execution(
        repository: &dyn JobRepository,
        name: &str,
    ) -> Result<StepExecution, BatchError> {
        let job_execution = repository.create_job_execution("job", &JobParameters::new())?;
        let mut step_execution = job_execution.create_step_execution(name)?;
        repository.add_step_execution(&mut step_execution)?;
        Ok(step_execution)
    }

    #[test]
    fn missing_collaborators_fail_at_build_time() {
        let repository = InMemoryJobRepository::new();
        let reader = ListItemReader::new(vec![1, 2]);
        let writer = ListItemWriter::<i32>::new();

        let no_writer = StepBuilder::new("step")
            .chunk::<i32>(2)
            .reader(&reader)
            .repository(&repository)
            .build();
        assert!(matches!(no_writer, Err(BatchError::Configuration(_))));

        let no_repository = StepBuilder::new("step")
            .chunk::<i32>(2)
            .reader(&reader)
            .writer(&writer)
            .build();
        assert!(matches!(no_repository, Err(BatchError::Configuration(_))));

        let zero_chunk = StepBuilder::new("step")
            .chunk::<i32>(0)
            .reader(&reader)
            .writer(&writer)
            .repository(&repository)
            .build();
        assert!(matches!(zero_chunk, Err(BatchError::Configuration(_))));
    }

    #[test]
    fn processor_set_after_writer_is_rejected() {
        let repository = InMemoryJobRepository::new();
        let reader = ListItemReader::new(vec![1, 2]);
        let writer = ListItemWriter::<i32>::new();
        let doubled = ListItemWriter::<i64>::new();

        let result = StepBuilder::new("step")
            .chunk::<i32>(2)
            .reader(&reader)
            .writer(&writer)
            .processor(&Doubler)
            .writer(&doubled)
            .repository(&repository)
            .build();
        assert!(matches!(result, Err(BatchError::Configuration(_))));
    }

    #[test]
    fn chunks_commit_and_counts_add_up() -> anyhow::Result<()> {
        let repository = InMemoryJobRepository::new();
        let reader = ListItemReader::new(vec![1, 2, 3, 4, 5]);
        let writer = ListItemWriter::<i64>::new();

        let step = StepBuilder::new("double")
            .chunk::<i32>(2)
            .reader(&reader)
            .processor(&Doubler)
            .writer(&writer)
            .repository(&repository)
            .build()?;

        let mut step_execution = new_step_execution(&repository, "double")?;
        step.execute(&mut step_execution)?;

        assert_eq!(step_execution.status, BatchStatus::Completed);
        assert_eq!(step_execution.read_count, 5);
        assert_eq!(step_execution.write_count, 5);
        assert_eq!(step_execution.commit_count, 3);
        assert_eq!(step_execution.rollback_count, 0);
        assert_eq!(writer.get_written_items(), vec![2, 4, 6, 8, 10]);

        let stored = repository
            .get_step_execution(step_execution.require_id()?)?
            .ok_or_else(|| anyhow::anyhow!("step execution not found"))?;
        assert_eq!(stored.status, BatchStatus::Completed);
        assert_eq!(stored.write_count, 5);
        assert_eq!(stored.execution_context.get_long("ListItemReader.read.count")?, 5);
        Ok(())
    }

    #[test]
    fn custom_completion_policy_complete_at_start_still_makes_progress() -> anyhow::Result<()> {
        let repository = InMemoryJobRepository::new();
        let reader = ListItemReader::new(vec![1, 2, 3]);
        let writer = ListItemWriter::<i32>::new();
        let always_complete = SimpleCompletionPolicy::new(0);

        let step = StepBuilder::new("one-by-one")
            .chunk::<i32>(0)
            .reader(&reader)
            .writer(&writer)
            .completion_policy(&always_complete)
            .repository(&repository)
            .build()?;

        let mut step_execution = new_step_execution(&repository, "one-by-one")?;
        step.execute(&mut step_execution)?;

        assert_eq!(step_execution.status, BatchStatus::Completed);
        assert_eq!(step_execution.commit_count, 3);
        assert_eq!(writer.get_written_items(), vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn settings_are_read_from_json_with_defaults() -> anyhow::Result<()> {
        let settings: StepSettings =
            serde_json::from_str(r#"{ "chunk_size": 50, "skip_limit": 5 }"#)?;
        assert_eq!(settings.chunk_size, 50);
        assert_eq!(settings.skip_limit, 5);
        assert_eq!(settings.retry_limit, 3);
        assert_eq!(settings.commit_retry_limit, DEFAULT_COMMIT_RETRY_LIMIT);
        assert!(!settings.allow_start_if_complete);

        let repository = InMemoryJobRepository::new();
        let reader = ListItemReader::new(vec![1]);
        let writer = ListItemWriter::<i32>::new();
        let step = StepBuilder::new("configured")
            .chunk::<i32>(1)
            .reader(&reader)
            .writer(&writer)
            .repository(&repository)
            .settings(&StepSettings {
                start_limit: 2,
                ..settings
            })
            .build()?;
        assert_eq!(step.start_limit(), 2);
        assert_eq!(step.settings.chunk_size, 50);
        Ok(())
    }

    #[test]
    fn stop_signal_before_first_chunk_stops_without_reading() -> anyhow::Result<()> {
        let repository = InMemoryJobRepository::new();
        let reader = ListItemReader::new(vec![1, 2, 3]);
        let writer = ListItemWriter::<i32>::new();
        let signal = StopSignal::new();
        signal.request_stop();

        let step = StepBuilder::new("stopped")
            .chunk::<i32>(2)
            .reader(&reader)
            .writer(&writer)
            .repository(&repository)
            .stop_signal(signal)
            .build()?;

        let mut step_execution = new_step_execution(&repository, "stopped")?;
        step.execute(&mut step_execution)?;

        assert_eq!(step_execution.status, BatchStatus::Stopped);
        assert_eq!(step_execution.read_count, 0);
        assert!(writer.get_written_items().is_empty());
        Ok(())
    }
}
