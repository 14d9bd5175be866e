use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use chrono::Utc;
use log::{error, info, warn};

use crate::{BatchError, repository::JobRepository};

use super::{
    chunk_step::ChunkStepBuilder,
    execution::{BatchStatus, ExitStatus, StepExecution},
    item::PassThroughProcessor,
    listener::StepListener,
    partition::{PartitionStepBuilder, Partitioner},
    tasklet::{Tasklet, TaskletStepBuilder},
};

/// Attempts to save a step execution when the repository reports a conflict.
pub const DEFAULT_COMMIT_RETRY_LIMIT: usize = 3;

/// An independent phase of a job.
pub trait Step {
    fn name(&self) -> &str;

    /// How many times the step may be started for the same job instance.
    fn start_limit(&self) -> u32 {
        u32::MAX
    }

    /// Whether a step that already completed is run again when its job restarts.
    fn allow_start_if_complete(&self) -> bool {
        false
    }

    /// Runs the step against a saved `step_execution`, updating its status,
    /// counters and context. Returns the failure cause when the step ends FAILED.
    fn execute(&self, step_execution: &mut StepExecution) -> Result<(), BatchError>;
}

/// Cooperative stop request shared with a running step.
///
/// The step checks it between chunks, so the chunk in flight always commits
/// before the step ends STOPPED.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Entry point of the step builders.
///
/// ```
/// use spring_batch_engine::core::step::StepBuilder;
/// use spring_batch_engine::item::list::{ListItemReader, ListItemWriter};
/// use spring_batch_engine::repository::InMemoryJobRepository;
///
/// let repository = InMemoryJobRepository::new();
/// let reader = ListItemReader::new(vec![1, 2, 3]);
/// let writer = ListItemWriter::<i32>::new();
///
/// let step = StepBuilder::new("copy")
///     .chunk::<i32>(2)
///     .reader(&reader)
///     .writer(&writer)
///     .repository(&repository)
///     .build();
/// assert!(step.is_ok());
/// ```
pub struct StepBuilder {
    name: String,
}

impl StepBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    /// Chunk-oriented step committing every `chunk_size` items. Items go to the
    /// writer unchanged until a processor is configured.
    pub fn chunk<'a, I: Clone + 'a>(self, chunk_size: usize) -> ChunkStepBuilder<'a, I, I> {
        ChunkStepBuilder::new(&self.name, chunk_size, &PassThroughProcessor)
    }

    pub fn tasklet(self, tasklet: &dyn Tasklet) -> TaskletStepBuilder<'_> {
        TaskletStepBuilder::new(&self.name, tasklet)
    }

    pub fn partitioner(self, partitioner: &dyn Partitioner) -> PartitionStepBuilder<'_> {
        PartitionStepBuilder::new(&self.name, partitioner)
    }
}

/// How the body of a step ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepOutcome {
    Completed,
    Stopped,
}

/// Lifecycle shared by every step implementation: status transitions, step
/// listeners, timing and persistence of the step execution.
pub(crate) struct StepRunner<'a> {
    pub name: &'a str,
    pub repository: &'a dyn JobRepository,
    pub listeners: &'a [&'a dyn StepListener],
    pub commit_retry_limit: usize,
}

impl StepRunner<'_> {
    pub fn run(
        &self,
        step_execution: &mut StepExecution,
        body: impl FnOnce(&mut StepExecution) -> Result<StepOutcome, BatchError>,
    ) -> Result<(), BatchError> {
        step_execution.require_id()?;
        info!("Executing step: [{}]", self.name);
        let started = Instant::now();

        step_execution.start_time = Some(Utc::now());
        step_execution.transition_to(BatchStatus::Started)?;
        self.persist(step_execution)?;

        self.listeners
            .iter()
            .for_each(|listener| listener.before_step(step_execution));

        let failure = match body(step_execution) {
            Ok(StepOutcome::Completed) => {
                step_execution.transition_to(BatchStatus::Completed)?;
                step_execution.exit_status = ExitStatus::completed();
                None
            }
            Ok(StepOutcome::Stopped) => {
                step_execution.transition_to(BatchStatus::Stopping)?;
                step_execution.transition_to(BatchStatus::Stopped)?;
                let reason = BatchError::Interrupted(format!(
                    "step [{}] stopped after {} commits",
                    self.name, step_execution.commit_count
                ));
                info!("{}", reason);
                step_execution.exit_status =
                    ExitStatus::stopped().and_description(&reason.to_string());
                None
            }
            Err(error) => {
                error!(
                    "Encountered an error executing step [{}]: {}",
                    self.name, error
                );
                step_execution.transition_to(BatchStatus::Failed)?;
                step_execution.exit_status =
                    ExitStatus::failed().and_description(&error.to_string());
                step_execution.add_failure_exception(&error);
                Some(error)
            }
        };
        step_execution.end_time = Some(Utc::now());

        self.listeners
            .iter()
            .rev()
            .for_each(|listener| listener.after_step(step_execution));

        if let Err(error) = self.persist(step_execution) {
            error!(
                "Unable to save step execution of [{}]: {}",
                self.name, error
            );
            return Err(error);
        }

        info!(
            "Step: [{}] executed in {:?} with status {}",
            self.name,
            started.elapsed(),
            step_execution.status
        );

        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub fn persist(&self, step_execution: &mut StepExecution) -> Result<(), BatchError> {
        persist_step_execution(self.repository, step_execution, self.commit_retry_limit)
    }
}

/// Saves the context then the step execution, retrying an optimistic-lock
/// conflict up to `retry_limit` attempts with the version read back from the
/// repository.
pub(crate) fn persist_step_execution(
    repository: &dyn JobRepository,
    step_execution: &mut StepExecution,
    retry_limit: usize,
) -> Result<(), BatchError> {
    let mut attempts = 0;

    loop {
        attempts += 1;
        let result = repository
            .update_execution_context(step_execution)
            .and_then(|()| repository.update_step_execution(step_execution));

        match result {
            Ok(()) => {
                step_execution.execution_context.clear_dirty_flag();
                return Ok(());
            }
            Err(error) if error.is_transient() && attempts < retry_limit => {
                warn!(
                    "Retrying update of step execution [{}] after attempt {}: {}",
                    step_execution.step_name, attempts, error
                );
                if let Some(stored) = repository.get_step_execution(step_execution.require_id()?)? {
                    step_execution.version = stored.version;
                }
            }
            Err(error) => return Err(error),
        }
    }
}
