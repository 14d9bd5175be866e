//! Persistence contract for job metadata.
//!
//! The engine only talks to a [`JobRepository`]: it creates execution records,
//! updates them at every chunk commit and reads them back to restart a job. The
//! repository is the one resource shared between threads, so implementations must
//! allow concurrent updates of distinct records and reject a stale update of the
//! same record with [`BatchError::OptimisticLockingFailure`].

use crate::{
    BatchError,
    core::execution::{ExecutionId, JobExecution, JobInstance, JobParameters, StepExecution},
};

pub mod in_memory;

pub use in_memory::InMemoryJobRepository;

pub trait JobRepository: Send + Sync {
    fn is_job_instance_exists(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<bool, BatchError>;

    fn get_job_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobInstance>, BatchError>;

    /// Creates a new execution of the job instance identified by `job_name` and
    /// the identifying `parameters`, creating the instance when needed.
    ///
    /// Fails with [`BatchError::JobExecutionAlreadyRunning`] if an execution of the
    /// instance is still running and with [`BatchError::JobInstanceAlreadyComplete`]
    /// if one already completed or was abandoned. On restart the execution context
    /// of the previous execution is carried over.
    fn create_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<JobExecution, BatchError>;

    /// Saves status, times and exit status. Bumps `version` on success.
    fn update_job_execution(&self, job_execution: &mut JobExecution) -> Result<(), BatchError>;

    /// Refreshes `version` from the stored record and picks up a stop requested
    /// by another party.
    fn synchronize_status(&self, job_execution: &mut JobExecution) -> Result<(), BatchError>;

    /// Saves a new step execution and assigns its identity. The execution must
    /// not have an identity yet.
    fn add_step_execution(&self, step_execution: &mut StepExecution) -> Result<(), BatchError>;

    /// Saves counters, status and times. Bumps `version` on success and sets
    /// `terminate_only` when the owning job execution is stopping.
    fn update_step_execution(&self, step_execution: &mut StepExecution) -> Result<(), BatchError>;

    fn update_execution_context(&self, step_execution: &StepExecution) -> Result<(), BatchError>;

    fn update_job_execution_context(&self, job_execution: &JobExecution)
    -> Result<(), BatchError>;

    /// The job execution with its step executions and contexts.
    fn get_job_execution(&self, id: ExecutionId) -> Result<Option<JobExecution>, BatchError>;

    fn get_step_execution(&self, id: ExecutionId) -> Result<Option<StepExecution>, BatchError>;

    fn get_last_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobExecution>, BatchError>;

    /// Latest execution of `step_name` across every execution of the instance.
    fn get_last_step_execution(
        &self,
        job_instance: &JobInstance,
        step_name: &str,
    ) -> Result<Option<StepExecution>, BatchError>;

    /// Number of times `step_name` was started for the instance.
    fn get_step_execution_count(
        &self,
        job_instance: &JobInstance,
        step_name: &str,
    ) -> Result<usize, BatchError>;

    /// Executions of the instance, newest first.
    fn find_job_executions(
        &self,
        job_instance: &JobInstance,
    ) -> Result<Vec<JobExecution>, BatchError>;

    fn find_running_job_executions(&self, job_name: &str)
    -> Result<Vec<JobExecution>, BatchError>;
}
