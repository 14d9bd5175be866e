use log::{debug, error, info};

use crate::{BatchError, repository::JobRepository};

use super::{
    execution::{StepContribution, StepExecution},
    execution_context::ExecutionContext,
    listener::StepListener,
    step::{
        DEFAULT_COMMIT_RETRY_LIMIT, Step, StepOutcome, StepRunner, StopSignal,
        persist_step_execution,
    },
    transaction::{ResourcelessTransactionManager, TransactionManager},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatStatus {
    /// The tasklet has more work and must be called again.
    Continuable,
    /// The tasklet has finished executing.
    Finished,
}

/// A single unit of work run by a [`TaskletStep`].
///
/// Every call runs in its own transaction. Counts go to `contribution` and
/// restart data to `execution_context`; both are discarded if the call fails.
pub trait Tasklet {
    fn execute(
        &self,
        contribution: &mut StepContribution,
        execution_context: &mut ExecutionContext,
    ) -> Result<RepeatStatus, BatchError>;
}

/// Step calling a [`Tasklet`] until it reports [`RepeatStatus::Finished`].
pub struct TaskletStep<'a> {
    name: String,
    tasklet: &'a dyn Tasklet,
    repository: &'a dyn JobRepository,
    transaction_manager: &'a dyn TransactionManager,
    listeners: Vec<&'a dyn StepListener>,
    stop_signal: Option<StopSignal>,
    start_limit: u32,
    allow_start_if_complete: bool,
    commit_retry_limit: usize,
}

impl TaskletStep<'_> {
    fn repeat(&self, step_execution: &mut StepExecution) -> Result<StepOutcome, BatchError> {
        loop {
            let stop_requested = self
                .stop_signal
                .as_ref()
                .is_some_and(StopSignal::is_stop_requested);
            if step_execution.terminate_only || stop_requested {
                info!("Step [{}] interrupted", self.name);
                return Ok(StepOutcome::Stopped);
            }

            self.transaction_manager.begin()?;
            let mut contribution = step_execution.create_contribution();
            let mut execution_context = step_execution.execution_context.clone();

            let status = match self.call(step_execution, &mut contribution, &mut execution_context) {
                Ok(status) => status,
                Err(error) => {
                    error!("Rolling back tasklet transaction: {}", error);
                    if let Err(rollback_error) = self.transaction_manager.rollback() {
                        error!("Unable to roll back tasklet transaction: {}", rollback_error);
                    }
                    contribution.rollback_count += 1;
                    step_execution.apply_rollbacks(&contribution);
                    return Err(error);
                }
            };

            debug!("Tasklet of step [{}] returned {:?}", self.name, status);
            if status == RepeatStatus::Finished {
                return Ok(StepOutcome::Completed);
            }
        }
    }

    fn call(
        &self,
        step_execution: &mut StepExecution,
        contribution: &mut StepContribution,
        execution_context: &mut ExecutionContext,
    ) -> Result<RepeatStatus, BatchError> {
        let status = self.tasklet.execute(contribution, execution_context)?;

        let checkpoint = step_execution.clone();
        step_execution.execution_context = execution_context.clone();
        step_execution.apply(contribution);
        step_execution.commit_count += 1;

        let saved = persist_step_execution(self.repository, step_execution, self.commit_retry_limit)
            .and_then(|()| self.transaction_manager.commit());
        if let Err(error) = saved {
            let version = step_execution.version;
            *step_execution = checkpoint;
            step_execution.version = version;
            return Err(error);
        }
        Ok(status)
    }
}

impl Step for TaskletStep<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    fn start_limit(&self) -> u32 {
        self.start_limit
    }

    fn allow_start_if_complete(&self) -> bool {
        self.allow_start_if_complete
    }

    fn execute(&self, step_execution: &mut StepExecution) -> Result<(), BatchError> {
        let runner = StepRunner {
            name: &self.name,
            repository: self.repository,
            listeners: &self.listeners,
            commit_retry_limit: self.commit_retry_limit,
        };
        runner.run(step_execution, |step_execution| self.repeat(step_execution))
    }
}

pub struct TaskletStepBuilder<'a> {
    name: String,
    tasklet: &'a dyn Tasklet,
    repository: Option<&'a dyn JobRepository>,
    transaction_manager: &'a dyn TransactionManager,
    listeners: Vec<&'a dyn StepListener>,
    stop_signal: Option<StopSignal>,
    start_limit: u32,
    allow_start_if_complete: bool,
    commit_retry_limit: usize,
}

impl<'a> TaskletStepBuilder<'a> {
    pub(crate) fn new(name: &str, tasklet: &'a dyn Tasklet) -> Self {
        Self {
            name: name.to_string(),
            tasklet,
            repository: None,
            transaction_manager: &ResourcelessTransactionManager,
            listeners: Vec::new(),
            stop_signal: None,
            start_limit: u32::MAX,
            allow_start_if_complete: false,
            commit_retry_limit: DEFAULT_COMMIT_RETRY_LIMIT,
        }
    }

    pub fn repository(mut self, repository: &'a dyn JobRepository) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn transaction_manager(mut self, transaction_manager: &'a dyn TransactionManager) -> Self {
        self.transaction_manager = transaction_manager;
        self
    }

    pub fn listener(mut self, listener: &'a dyn StepListener) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn stop_signal(mut self, stop_signal: StopSignal) -> Self {
        self.stop_signal = Some(stop_signal);
        self
    }

    pub fn start_limit(mut self, start_limit: u32) -> Self {
        self.start_limit = start_limit;
        self
    }

    pub fn allow_start_if_complete(mut self, allow: bool) -> Self {
        self.allow_start_if_complete = allow;
        self
    }

    pub fn commit_retry_limit(mut self, commit_retry_limit: usize) -> Self {
        self.commit_retry_limit = commit_retry_limit;
        self
    }

    pub fn build(self) -> Result<TaskletStep<'a>, BatchError> {
        let repository = self.repository.ok_or_else(|| {
            BatchError::Configuration(format!("Step [{}] requires a job repository", self.name))
        })?;
        if self.commit_retry_limit == 0 {
            return Err(BatchError::Configuration(format!(
                "Step [{}] requires a commit retry limit greater than 0",
                self.name
            )));
        }

        Ok(TaskletStep {
            name: self.name,
            tasklet: self.tasklet,
            repository,
            transaction_manager: self.transaction_manager,
            listeners: self.listeners,
            stop_signal: self.stop_signal,
            start_limit: self.start_limit,
            allow_start_if_complete: self.allow_start_if_complete,
            commit_retry_limit: self.commit_retry_limit,
        })
    }
}
