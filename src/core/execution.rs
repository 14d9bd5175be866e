use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::BatchError;

use super::execution_context::ExecutionContext;

/// Identity assigned by the job repository when an execution is created.
pub type ExecutionId = Uuid;

/// Status of a job or step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchStatus {
    /// Status of a batch job prior to its execution.
    Starting,
    /// Status of a batch job that is running.
    Started,
    /// Status of batch job waiting for a step to complete before stopping the batch job.
    Stopping,
    /// Status of a batch job that has been stopped by request.
    Stopped,
    /// The batch job has successfully completed its execution.
    Completed,
    /// Status of a batch job that has failed during its execution.
    Failed,
    /// Status of a batch job that did not stop properly and can not be restarted.
    Abandoned,
    /// Status of a batch job that is in an uncertain state.
    Unknown,
}

impl BatchStatus {
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            BatchStatus::Starting | BatchStatus::Started | BatchStatus::Stopping
        )
    }

    pub fn is_unsuccessful(&self) -> bool {
        matches!(
            self,
            BatchStatus::Failed | BatchStatus::Abandoned | BatchStatus::Unknown
        )
    }

    /// No further execution may happen once a status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed
                | BatchStatus::Failed
                | BatchStatus::Stopped
                | BatchStatus::Abandoned
        )
    }

    /// Forward-only transition table. Terminal executions may only be abandoned.
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        use BatchStatus::*;

        if *self == next {
            return true;
        }
        match self {
            Starting => matches!(next, Started | Stopping | Stopped | Failed | Abandoned),
            Started => matches!(
                next,
                Stopping | Stopped | Completed | Failed | Abandoned | Unknown
            ),
            Stopping => matches!(next, Stopped | Completed | Failed | Abandoned),
            Stopped | Failed | Unknown => next == Abandoned,
            Completed | Abandoned => false,
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatchStatus::Starting => "STARTING",
            BatchStatus::Started => "STARTED",
            BatchStatus::Stopping => "STOPPING",
            BatchStatus::Stopped => "STOPPED",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Abandoned => "ABANDONED",
            BatchStatus::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Exit code and description reported once an execution ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub exit_code: String,
    pub exit_description: String,
}

impl ExitStatus {
    pub const EXECUTING: &'static str = "EXECUTING";
    pub const COMPLETED: &'static str = "COMPLETED";
    pub const NOOP: &'static str = "NOOP";
    pub const FAILED: &'static str = "FAILED";
    pub const STOPPED: &'static str = "STOPPED";
    pub const UNKNOWN: &'static str = "UNKNOWN";

    pub fn new(exit_code: &str) -> Self {
        Self {
            exit_code: exit_code.to_string(),
            exit_description: String::new(),
        }
    }

    pub fn executing() -> Self {
        Self::new(Self::EXECUTING)
    }

    pub fn completed() -> Self {
        Self::new(Self::COMPLETED)
    }

    pub fn noop() -> Self {
        Self::new(Self::NOOP)
    }

    pub fn failed() -> Self {
        Self::new(Self::FAILED)
    }

    pub fn stopped() -> Self {
        Self::new(Self::STOPPED)
    }

    pub fn unknown() -> Self {
        Self::new(Self::UNKNOWN)
    }

    pub fn and_description(mut self, description: &str) -> Self {
        if self.exit_description.is_empty() {
            self.exit_description = description.to_string();
        } else if !description.is_empty() {
            self.exit_description = format!("{}; {}", self.exit_description, description);
        }
        self
    }

    pub fn is_running(&self) -> bool {
        self.exit_code == Self::EXECUTING || self.exit_code == Self::UNKNOWN
    }
}

impl From<BatchStatus> for ExitStatus {
    fn from(status: BatchStatus) -> Self {
        match status {
            BatchStatus::Completed => ExitStatus::completed(),
            BatchStatus::Stopped | BatchStatus::Stopping => ExitStatus::stopped(),
            BatchStatus::Failed | BatchStatus::Abandoned => ExitStatus::failed(),
            BatchStatus::Starting | BatchStatus::Started => ExitStatus::executing(),
            BatchStatus::Unknown => ExitStatus::unknown(),
        }
    }
}

/// A single job parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterValue {
    String(String),
    Long(i64),
    Double(f64),
    Date(DateTime<Utc>),
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::String(value) => write!(f, "{}", value),
            ParameterValue::Long(value) => write!(f, "{}", value),
            ParameterValue::Double(value) => write!(f, "{}", value),
            ParameterValue::Date(value) => write!(f, "{}", value.to_rfc3339()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParameter {
    pub value: ParameterValue,
    /// Identifying parameters take part in the job instance identity.
    pub identifying: bool,
}

/// Runtime parameters of a job launch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobParameters {
    parameters: BTreeMap<String, JobParameter>,
}

impl JobParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&ParameterValue> {
        self.parameters.get(key).map(|parameter| &parameter.value)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(ParameterValue::String(value)) => Some(value),
            _ => None,
        }
    }

    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(ParameterValue::Long(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Canonical text of the identifying parameters, used as the job key.
    pub fn to_identifying_key(&self) -> String {
        self.parameters
            .iter()
            .filter(|(_, parameter)| parameter.identifying)
            .map(|(key, parameter)| format!("{}={}", key, parameter.value))
            .collect::<Vec<_>>()
            .join(";")
    }
}

#[derive(Default)]
pub struct JobParametersBuilder {
    parameters: BTreeMap<String, JobParameter>,
}

impl JobParametersBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(mut self, key: &str, value: ParameterValue, identifying: bool) -> Self {
        self.parameters
            .insert(key.to_string(), JobParameter { value, identifying });
        self
    }

    pub fn add_string(self, key: &str, value: &str) -> Self {
        self.add(key, ParameterValue::String(value.to_string()), true)
    }

    pub fn add_long(self, key: &str, value: i64) -> Self {
        self.add(key, ParameterValue::Long(value), true)
    }

    pub fn add_double(self, key: &str, value: f64) -> Self {
        self.add(key, ParameterValue::Double(value), true)
    }

    pub fn add_date(self, key: &str, value: DateTime<Utc>) -> Self {
        self.add(key, ParameterValue::Date(value), true)
    }

    /// Adds a parameter that does not take part in the job instance identity.
    pub fn add_non_identifying(self, key: &str, value: ParameterValue) -> Self {
        self.add(key, value, false)
    }

    pub fn build(self) -> JobParameters {
        JobParameters {
            parameters: self.parameters,
        }
    }
}

/// Logical run of a job: a job name plus its identifying parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: Uuid,
    pub job_name: String,
    pub job_key: String,
}

/// One attempt to run a [`JobInstance`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: Option<ExecutionId>,
    pub job_instance: JobInstance,
    pub job_parameters: JobParameters,
    pub status: BatchStatus,
    pub exit_status: ExitStatus,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub execution_context: ExecutionContext,
    /// Snapshot of the step executions run by this job execution.
    pub step_executions: Vec<StepExecution>,
    pub failure_exceptions: Vec<String>,
    pub version: u32,
}

impl JobExecution {
    pub fn new(job_instance: JobInstance, job_parameters: JobParameters) -> Self {
        Self {
            id: None,
            job_instance,
            job_parameters,
            status: BatchStatus::Starting,
            exit_status: ExitStatus::unknown(),
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
            last_updated: None,
            execution_context: ExecutionContext::new(),
            step_executions: Vec::new(),
            failure_exceptions: Vec::new(),
            version: 0,
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_instance.job_name
    }

    /// Identity of a saved execution.
    pub fn require_id(&self) -> Result<ExecutionId, BatchError> {
        self.id.ok_or_else(|| {
            BatchError::Repository("JobExecution must be saved (have an id assigned)".to_string())
        })
    }

    pub fn transition_to(&mut self, status: BatchStatus) -> Result<(), BatchError> {
        if !self.status.can_transition_to(status) {
            return Err(BatchError::IllegalStateTransition {
                entity: "JobExecution",
                id: self.id.map(|id| id.to_string()).unwrap_or_default(),
                from: self.status.to_string(),
                to: status.to_string(),
            });
        }
        self.status = status;
        Ok(())
    }

    /// Creates the next step execution of this job execution, not yet saved.
    pub fn create_step_execution(&self, step_name: &str) -> Result<StepExecution, BatchError> {
        Ok(StepExecution::new(step_name, self.require_id()?))
    }

    pub fn add_failure_exception(&mut self, error: &BatchError) {
        self.failure_exceptions.push(error.to_string());
    }

    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }

    pub fn is_stopping(&self) -> bool {
        self.status == BatchStatus::Stopping
    }
}

/// Execution of one step within a [`JobExecution`].
///
/// Counters only ever grow while the step runs; they are applied from a
/// [`StepContribution`] each time a chunk commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Option<ExecutionId>,
    /// Back reference to the owning job execution.
    pub job_execution_id: ExecutionId,
    pub step_name: String,
    pub status: BatchStatus,
    pub exit_status: ExitStatus,
    pub read_count: usize,
    pub write_count: usize,
    pub filter_count: usize,
    pub read_skip_count: usize,
    pub process_skip_count: usize,
    pub write_skip_count: usize,
    pub commit_count: usize,
    pub rollback_count: usize,
    pub execution_context: ExecutionContext,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Used to detect executions that stopped reporting progress.
    pub last_updated: Option<DateTime<Utc>>,
    pub failure_exceptions: Vec<String>,
    /// Set when a stop was requested from outside the step.
    pub terminate_only: bool,
    pub version: u32,
}

impl StepExecution {
    pub fn new(step_name: &str, job_execution_id: ExecutionId) -> Self {
        Self {
            id: None,
            job_execution_id,
            step_name: step_name.to_string(),
            status: BatchStatus::Starting,
            exit_status: ExitStatus::executing(),
            read_count: 0,
            write_count: 0,
            filter_count: 0,
            read_skip_count: 0,
            process_skip_count: 0,
            write_skip_count: 0,
            commit_count: 0,
            rollback_count: 0,
            execution_context: ExecutionContext::new(),
            start_time: None,
            end_time: None,
            last_updated: None,
            failure_exceptions: Vec::new(),
            terminate_only: false,
            version: 0,
        }
    }

    pub fn require_id(&self) -> Result<ExecutionId, BatchError> {
        self.id.ok_or_else(|| {
            BatchError::Repository(format!(
                "StepExecution {} must be saved (have an id assigned)",
                self.step_name
            ))
        })
    }

    pub fn skip_count(&self) -> usize {
        self.read_skip_count + self.process_skip_count + self.write_skip_count
    }

    pub fn transition_to(&mut self, status: BatchStatus) -> Result<(), BatchError> {
        if !self.status.can_transition_to(status) {
            return Err(BatchError::IllegalStateTransition {
                entity: "StepExecution",
                id: self.step_name.clone(),
                from: self.status.to_string(),
                to: status.to_string(),
            });
        }
        self.status = status;
        Ok(())
    }

    /// Adds the counts of a committed chunk.
    pub fn apply(&mut self, contribution: &StepContribution) {
        self.read_count += contribution.read_count;
        self.write_count += contribution.write_count;
        self.filter_count += contribution.filter_count;
        self.read_skip_count += contribution.read_skip_count;
        self.process_skip_count += contribution.process_skip_count;
        self.write_skip_count += contribution.write_skip_count;
        self.rollback_count += contribution.rollback_count;
    }

    /// Keeps only the rollbacks of a chunk that did not commit.
    pub fn apply_rollbacks(&mut self, contribution: &StepContribution) {
        self.rollback_count += contribution.rollback_count;
    }

    pub fn add_failure_exception(&mut self, error: &BatchError) {
        self.failure_exceptions.push(error.to_string());
    }

    pub fn set_terminate_only(&mut self) {
        self.terminate_only = true;
    }

    /// Start a fresh contribution for the next chunk.
    pub fn create_contribution(&self) -> StepContribution {
        StepContribution::new(self.skip_count())
    }
}

/// Count deltas of one chunk, applied to the step execution on commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepContribution {
    pub read_count: usize,
    pub write_count: usize,
    pub filter_count: usize,
    pub read_skip_count: usize,
    pub process_skip_count: usize,
    pub write_skip_count: usize,
    pub rollback_count: usize,
    committed_skip_count: usize,
}

impl StepContribution {
    pub fn new(committed_skip_count: usize) -> Self {
        Self {
            committed_skip_count,
            ..Self::default()
        }
    }

    pub fn skip_count(&self) -> usize {
        self.read_skip_count + self.process_skip_count + self.write_skip_count
    }

    /// Skips of the whole step so far, including this uncommitted chunk.
    pub fn step_skip_count(&self) -> usize {
        self.committed_skip_count + self.skip_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_moves_forward_only() {
        assert!(BatchStatus::Starting.can_transition_to(BatchStatus::Started));
        assert!(BatchStatus::Started.can_transition_to(BatchStatus::Stopping));
        assert!(BatchStatus::Stopping.can_transition_to(BatchStatus::Stopped));
        assert!(BatchStatus::Started.can_transition_to(BatchStatus::Completed));

        assert!(!BatchStatus::Completed.can_transition_to(BatchStatus::Started));
        assert!(!BatchStatus::Failed.can_transition_to(BatchStatus::Started));
        assert!(!BatchStatus::Stopped.can_transition_to(BatchStatus::Completed));
        assert!(BatchStatus::Failed.can_transition_to(BatchStatus::Abandoned));
        assert!(!BatchStatus::Abandoned.can_transition_to(BatchStatus::Failed));
    }

    #[test]
    fn terminal_step_execution_rejects_restart() {
        let mut execution = StepExecution::new("step", Uuid::new_v4());
        execution.transition_to(BatchStatus::Started).unwrap();
        execution.transition_to(BatchStatus::Completed).unwrap();

        let result = execution.transition_to(BatchStatus::Started);
        assert!(matches!(
            result,
            Err(BatchError::IllegalStateTransition { .. })
        ));
        assert_eq!(execution.status, BatchStatus::Completed);
    }

    #[test]
    fn rolled_back_contribution_only_counts_rollbacks() {
        let mut execution = StepExecution::new("step", Uuid::new_v4());
        let mut contribution = execution.create_contribution();
        contribution.read_count = 3;
        contribution.write_count = 2;
        contribution.process_skip_count = 1;
        contribution.rollback_count = 2;

        execution.apply_rollbacks(&contribution);
        assert_eq!(execution.read_count, 0);
        assert_eq!(execution.rollback_count, 2);

        execution.apply(&contribution);
        assert_eq!(execution.read_count, 3);
        assert_eq!(execution.write_count, 2);
        assert_eq!(execution.skip_count(), 1);
        assert_eq!(execution.rollback_count, 4);

        let next = execution.create_contribution();
        assert_eq!(next.step_skip_count(), 1);
    }

    #[test]
    fn identifying_key_ignores_non_identifying_parameters() {
        let parameters = JobParametersBuilder::new()
            .add_string("file", "input.csv")
            .add_long("run", 2)
            .add_non_identifying("debug", ParameterValue::String("true".into()))
            .build();

        assert_eq!(parameters.to_identifying_key(), "file=input.csv;run=2");
        assert_eq!(parameters.get_string("file"), Some("input.csv"));
        assert_eq!(parameters.get_long("run"), Some(2));
        assert_eq!(parameters.get_long("file"), None);
    }

    #[test]
    fn exit_status_descriptions_accumulate() {
        let status = ExitStatus::failed()
            .and_description("writer failed")
            .and_description("skip limit exceeded");
        assert_eq!(status.exit_code, ExitStatus::FAILED);
        assert_eq!(
            status.exit_description,
            "writer failed; skip limit exceeded"
        );
        assert_eq!(ExitStatus::from(BatchStatus::Stopped), ExitStatus::stopped());
    }
}
