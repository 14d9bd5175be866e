use std::time::Instant;

use chrono::Utc;
use log::{info, warn};

use crate::{BatchError, repository::JobRepository};

use super::{
    build_name,
    execution::{BatchStatus, ExitStatus, JobExecution, JobParameters},
    listener::JobListener,
    step::Step,
};

/// Type alias for job execution results.
type JobResult<T> = Result<T, BatchError>;

/// Represents a job that can be executed.
///
/// A job is a container for a sequence of steps executed in order against a
/// saved [`JobExecution`]. Launching, restarting and stopping go through
/// [`SimpleJobLauncher`] and [`JobOperator`](super::operator::JobOperator).
pub trait Job {
    fn name(&self) -> &str;

    /// Whether a new execution may be created for an instance that already ran.
    fn is_restartable(&self) -> bool {
        true
    }

    /// Runs the steps against `job_execution`, updating its status.
    ///
    /// # Returns
    /// - `Ok(())` when the execution ends COMPLETED, STOPPED or ABANDONED
    /// - `Err(BatchError)` with the failure cause when it ends FAILED
    fn execute(&self, job_execution: &mut JobExecution) -> JobResult<()>;
}

/// How the steps of a job ended when none of them failed.
enum JobOutcome {
    Completed,
    Stopped,
    Abandoned,
}

/// Job running its steps one after the other.
///
/// On restart, steps completed by a previous execution of the same job instance
/// are skipped, unless they allow starting again, and the other steps resume
/// from the execution context of their last execution.
pub struct SimpleJob<'a> {
    name: String,
    steps: Vec<&'a dyn Step>,
    listeners: Vec<&'a dyn JobListener>,
    repository: &'a dyn JobRepository,
    restartable: bool,
}

impl SimpleJob<'_> {
    /// Launches the job with `parameters`, creating a new execution or restarting
    /// the last one of the matching job instance.
    pub fn run(&self, parameters: &JobParameters) -> JobResult<JobExecution> {
        SimpleJobLauncher::new(self.repository).run(self, parameters)
    }

    fn run_steps(&self, job_execution: &mut JobExecution) -> JobResult<JobOutcome> {
        for step in &self.steps {
            self.repository.synchronize_status(job_execution)?;
            match job_execution.status {
                BatchStatus::Stopping => {
                    info!("Job [{}] stopped before step [{}]", self.name, step.name());
                    return Ok(JobOutcome::Stopped);
                }
                BatchStatus::Abandoned => {
                    warn!("Job [{}] abandoned before step [{}]", self.name, step.name());
                    return Ok(JobOutcome::Abandoned);
                }
                _ => {}
            }

            let Some(status) = self.handle_step(*step, job_execution)? else {
                continue;
            };
            if status == BatchStatus::Stopped {
                return Ok(JobOutcome::Stopped);
            }
        }
        Ok(JobOutcome::Completed)
    }

    /// Runs one step. Returns `None` when the step is skipped because it already
    /// completed for this job instance.
    fn handle_step(
        &self,
        step: &dyn Step,
        job_execution: &mut JobExecution,
    ) -> JobResult<Option<BatchStatus>> {
        let instance = &job_execution.job_instance;
        let last = self
            .repository
            .get_last_step_execution(instance, step.name())?;

        let execution_context = match last {
            Some(last) if last.status == BatchStatus::Completed => {
                if !step.allow_start_if_complete() {
                    info!(
                        "Step already complete or not restartable, so no action to execute: [{}]",
                        step.name()
                    );
                    return Ok(None);
                }
                None
            }
            Some(last) if last.status == BatchStatus::Abandoned => {
                return Err(BatchError::Job(format!(
                    "Cannot restart step [{}] from ABANDONED status",
                    step.name()
                )));
            }
            Some(last) => Some(last.execution_context),
            None => None,
        };

        let count = self
            .repository
            .get_step_execution_count(instance, step.name())?;
        if count >= usize::try_from(step.start_limit()).unwrap_or(usize::MAX) {
            return Err(BatchError::StartLimitExceeded {
                step: step.name().to_string(),
                limit: step.start_limit(),
            });
        }

        let mut step_execution = job_execution.create_step_execution(step.name())?;
        if let Some(execution_context) = execution_context {
            step_execution.execution_context = execution_context;
        }
        self.repository.add_step_execution(&mut step_execution)?;

        let result = step.execute(&mut step_execution);
        let status = step_execution.status;
        job_execution.step_executions.push(step_execution);

        match result {
            Ok(()) => Ok(Some(status)),
            Err(error) => {
                warn!("Step [{}] of job [{}] failed: {}", step.name(), self.name, error);
                Err(error)
            }
        }
    }

    fn finish(&self, job_execution: &mut JobExecution, outcome: JobResult<JobOutcome>) -> JobResult<()> {
        self.repository.synchronize_status(job_execution)?;
        let outcome = match outcome {
            Err(error) if job_execution.status == BatchStatus::Abandoned => {
                warn!("Abandoned job [{}] ended with failure: {}", self.name, error);
                Ok(JobOutcome::Abandoned)
            }
            _ if job_execution.status == BatchStatus::Abandoned => Ok(JobOutcome::Abandoned),
            outcome => outcome,
        };

        let failure = match outcome {
            Ok(JobOutcome::Completed) => {
                job_execution.transition_to(BatchStatus::Completed)?;
                job_execution.exit_status = ExitStatus::completed();
                None
            }
            Ok(JobOutcome::Stopped) => {
                if job_execution.status == BatchStatus::Started {
                    job_execution.transition_to(BatchStatus::Stopping)?;
                }
                job_execution.transition_to(BatchStatus::Stopped)?;
                job_execution.exit_status = ExitStatus::stopped();
                None
            }
            Ok(JobOutcome::Abandoned) => None,
            Err(error) => {
                job_execution.transition_to(BatchStatus::Failed)?;
                job_execution.exit_status = ExitStatus::failed().and_description(&error.to_string());
                job_execution.add_failure_exception(&error);
                Some(error)
            }
        };
        job_execution.end_time = Some(Utc::now());

        self.listeners
            .iter()
            .rev()
            .for_each(|listener| listener.after_job(job_execution));

        self.repository.synchronize_status(job_execution)?;
        self.repository.update_job_execution_context(job_execution)?;
        self.repository.update_job_execution(job_execution)?;

        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Job for SimpleJob<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_restartable(&self) -> bool {
        self.restartable
    }

    fn execute(&self, job_execution: &mut JobExecution) -> JobResult<()> {
        let id = job_execution.require_id()?;
        let started = Instant::now();
        info!("Start of job: {}, id: {}", self.name, id);

        self.repository.synchronize_status(job_execution)?;
        if job_execution.status == BatchStatus::Starting {
            job_execution.start_time = Some(Utc::now());
            job_execution.transition_to(BatchStatus::Started)?;
            self.repository.update_job_execution(job_execution)?;
        }

        self.listeners
            .iter()
            .for_each(|listener| listener.before_job(job_execution));

        let outcome = match job_execution.status {
            BatchStatus::Started => self.run_steps(job_execution),
            BatchStatus::Abandoned => Ok(JobOutcome::Abandoned),
            _ => Ok(JobOutcome::Stopped),
        };
        let result = self.finish(job_execution, outcome);

        info!(
            "End of job: {}, id: {}, status: {}, duration: {:?}",
            self.name,
            id,
            job_execution.status,
            started.elapsed()
        );
        result
    }
}

/// Builder for creating a [`SimpleJob`].
///
/// ```
/// use spring_batch_engine::core::job::JobBuilder;
/// use spring_batch_engine::core::step::StepBuilder;
/// use spring_batch_engine::item::list::{ListItemReader, ListItemWriter};
/// use spring_batch_engine::repository::InMemoryJobRepository;
/// use spring_batch_engine::core::execution::{BatchStatus, JobParameters};
///
/// let repository = InMemoryJobRepository::new();
/// let reader = ListItemReader::new(vec![1, 2, 3]);
/// let writer = ListItemWriter::<i32>::new();
/// let step = StepBuilder::new("copy")
///     .chunk::<i32>(2)
///     .reader(&reader)
///     .writer(&writer)
///     .repository(&repository)
///     .build()
///     .unwrap();
///
/// let job = JobBuilder::new()
///     .name("import".to_string())
///     .start(&step)
///     .repository(&repository)
///     .build()
///     .unwrap();
///
/// let execution = job.run(&JobParameters::new()).unwrap();
/// assert_eq!(execution.status, BatchStatus::Completed);
/// assert_eq!(writer.get_written_items(), vec![1, 2, 3]);
/// ```
#[derive(Default)]
pub struct JobBuilder<'a> {
    /// Optional name for the job (generated randomly if not specified)
    name: Option<String>,
    /// Steps to be executed, in order
    steps: Vec<&'a dyn Step>,
    listeners: Vec<&'a dyn JobListener>,
    repository: Option<&'a dyn JobRepository>,
    restartable: Option<bool>,
}

impl<'a> JobBuilder<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: String) -> JobBuilder<'a> {
        self.name = Some(name);
        self
    }

    /// Sets the first step of the job. Same as `next()`, reads better for the
    /// initial step.
    pub fn start(mut self, step: &'a dyn Step) -> JobBuilder<'a> {
        self.steps.push(step);
        self
    }

    /// Adds a step to the job. Steps are executed in the order they are added.
    pub fn next(mut self, step: &'a dyn Step) -> JobBuilder<'a> {
        self.steps.push(step);
        self
    }

    pub fn listener(mut self, listener: &'a dyn JobListener) -> JobBuilder<'a> {
        self.listeners.push(listener);
        self
    }

    pub fn repository(mut self, repository: &'a dyn JobRepository) -> JobBuilder<'a> {
        self.repository = Some(repository);
        self
    }

    /// A job that is not restartable refuses to run twice for the same job
    /// instance. Jobs are restartable by default.
    pub fn restartable(mut self, restartable: bool) -> JobBuilder<'a> {
        self.restartable = Some(restartable);
        self
    }

    pub fn build(self) -> JobResult<SimpleJob<'a>> {
        let name = self.name.unwrap_or_else(build_name);
        if self.steps.is_empty() {
            return Err(BatchError::Configuration(format!(
                "Job [{}] requires at least one step",
                name
            )));
        }
        let repository = self.repository.ok_or_else(|| {
            BatchError::Configuration(format!("Job [{}] requires a job repository", name))
        })?;

        Ok(SimpleJob {
            name,
            steps: self.steps,
            listeners: self.listeners,
            repository,
            restartable: self.restartable.unwrap_or(true),
        })
    }
}

/// Creates job executions and runs them on the calling thread.
pub struct SimpleJobLauncher<'a> {
    repository: &'a dyn JobRepository,
}

impl<'a> SimpleJobLauncher<'a> {
    pub fn new(repository: &'a dyn JobRepository) -> Self {
        Self { repository }
    }

    /// Runs `job` with `parameters` and returns its execution.
    ///
    /// A job that fails still yields `Ok` with a FAILED execution; `Err` means no
    /// execution could be started: the instance is running or complete, or the
    /// job is not restartable.
    pub fn run(&self, job: &dyn Job, parameters: &JobParameters) -> JobResult<JobExecution> {
        let last = self
            .repository
            .get_last_job_execution(job.name(), parameters)?;
        if let Some(last) = last {
            if !job.is_restartable() {
                return Err(BatchError::Job(format!(
                    "JobInstance already exists and is not restartable: {}",
                    last.job_instance.job_key
                )));
            }
            if last
                .step_executions
                .iter()
                .any(|step| step.status == BatchStatus::Unknown)
            {
                return Err(BatchError::Job(format!(
                    "Cannot restart job [{}]: a step execution is in an UNKNOWN state",
                    job.name()
                )));
            }
        }

        let mut job_execution = self.repository.create_job_execution(job.name(), parameters)?;
        info!(
            "Job: [{}] launched with the following parameters: [{}]",
            job.name(),
            parameters.to_identifying_key()
        );

        if let Err(error) = job.execute(&mut job_execution) {
            warn!("Job: [{}] ended with failure: {}", job.name(), error);
        }

        info!(
            "Job: [{}] completed with the following parameters: [{}] and the following status: [{}]",
            job.name(),
            parameters.to_identifying_key(),
            job_execution.status
        );
        Ok(job_execution)
    }
}
