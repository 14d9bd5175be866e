//! Control of running and finished job executions: stop, abandon, restart and
//! detection of executions that stopped making progress.

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};

use crate::{BatchError, repository::JobRepository};

use super::{
    execution::{BatchStatus, ExecutionId, JobExecution},
    job::{Job, SimpleJobLauncher},
};

pub struct JobOperator<'a> {
    repository: &'a dyn JobRepository,
}

impl<'a> JobOperator<'a> {
    pub fn new(repository: &'a dyn JobRepository) -> Self {
        Self { repository }
    }

    fn load(&self, execution_id: ExecutionId) -> Result<JobExecution, BatchError> {
        self.repository
            .get_job_execution(execution_id)?
            .ok_or(BatchError::NoSuchExecution {
                entity: "JobExecution",
                id: execution_id,
            })
    }

    /// Requests a running execution to stop.
    ///
    /// The execution is marked STOPPING. Its steps see the request the next time
    /// they save their progress and end STOPPED once the chunk in flight commits.
    pub fn stop(&self, execution_id: ExecutionId) -> Result<(), BatchError> {
        let mut job_execution = self.load(execution_id)?;
        if !job_execution.is_running() {
            return Err(BatchError::Job(format!(
                "JobExecution {} is not running (status {})",
                execution_id, job_execution.status
            )));
        }
        if job_execution.is_stopping() {
            return Ok(());
        }

        job_execution.transition_to(BatchStatus::Stopping)?;
        self.repository.update_job_execution(&mut job_execution)?;
        info!(
            "Stop requested for job [{}], execution {}",
            job_execution.job_name(),
            execution_id
        );
        Ok(())
    }

    /// Marks an execution that will never finish normally as ABANDONED, together
    /// with its step executions still marked as running. An abandoned job
    /// instance cannot be restarted.
    ///
    /// Executions still STARTING or STARTED must be stopped first.
    pub fn abandon(&self, execution_id: ExecutionId) -> Result<JobExecution, BatchError> {
        let mut job_execution = self.load(execution_id)?;
        if matches!(
            job_execution.status,
            BatchStatus::Starting | BatchStatus::Started
        ) {
            return Err(BatchError::JobExecutionAlreadyRunning(format!(
                "JobExecution {} is running and must be stopped before being abandoned",
                execution_id
            )));
        }

        let now = Utc::now();
        for step_execution in job_execution
            .step_executions
            .iter_mut()
            .filter(|step| step.status.is_running())
        {
            step_execution.transition_to(BatchStatus::Abandoned)?;
            step_execution.end_time.get_or_insert(now);
            self.repository.update_step_execution(step_execution)?;
        }

        job_execution.transition_to(BatchStatus::Abandoned)?;
        job_execution.end_time.get_or_insert(now);
        self.repository.update_job_execution(&mut job_execution)?;
        warn!(
            "Job [{}] execution {} abandoned",
            job_execution.job_name(),
            execution_id
        );
        Ok(job_execution)
    }

    /// Runs `job` again with the parameters of a FAILED or STOPPED execution.
    /// Completed steps are skipped and the others resume from their saved
    /// context.
    pub fn restart(
        &self,
        job: &dyn Job,
        execution_id: ExecutionId,
    ) -> Result<JobExecution, BatchError> {
        let job_execution = self.load(execution_id)?;
        if job_execution.job_name() != job.name() {
            return Err(BatchError::Job(format!(
                "JobExecution {} belongs to job [{}], not [{}]",
                execution_id,
                job_execution.job_name(),
                job.name()
            )));
        }
        if !matches!(
            job_execution.status,
            BatchStatus::Failed | BatchStatus::Stopped
        ) {
            return Err(BatchError::Job(format!(
                "JobExecution {} cannot be restarted from status {}",
                execution_id, job_execution.status
            )));
        }

        info!(
            "Restarting job [{}] from execution {}",
            job.name(),
            execution_id
        );
        SimpleJobLauncher::new(self.repository).run(job, &job_execution.job_parameters)
    }

    /// Running executions of `job_name` with no progress saved for at least
    /// `max_idle`, by the job or any of its steps. These are candidates for
    /// [`abandon`](Self::abandon) after a crash.
    pub fn find_stale_executions(
        &self,
        job_name: &str,
        max_idle: Duration,
    ) -> Result<Vec<JobExecution>, BatchError> {
        let threshold = Utc::now() - max_idle;
        let running = self.repository.find_running_job_executions(job_name)?;

        Ok(running
            .into_iter()
            .filter(|execution| last_activity(execution).is_none_or(|last| last <= threshold))
            .collect())
    }
}

fn last_activity(job_execution: &JobExecution) -> Option<DateTime<Utc>> {
    job_execution
        .step_executions
        .iter()
        .filter_map(|step| step.last_updated)
        .chain(job_execution.last_updated)
        .max()
}
