use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
/// Batch error
pub enum BatchError {
    #[error("ItemWriter from: {0}")]
    ItemWriter(String),

    #[error("ItemReader from: {0}")]
    ItemReader(String),

    #[error("ItemProcessor from: {0}")]
    ItemProcessor(String),

    /// A failure expected to go away when the same operation is attempted again
    /// (deadlock, dropped connection, ...).
    #[error("Transient failure: {0}")]
    Transient(String),

    /// The item itself is invalid; retrying it will not help.
    #[error("Invalid item: {0}")]
    Validation(String),

    #[error("Skip limit of {limit} exceeded: {source}")]
    SkipLimitExceeded {
        limit: usize,
        #[source]
        source: Box<BatchError>,
    },

    #[error("Skip policy rejected skipping item in {phase}: {source}")]
    NonSkippable {
        phase: &'static str,
        #[source]
        source: Box<BatchError>,
    },

    #[error("Step error: {0}")]
    Step(String),

    #[error("Job error: {0}")]
    Job(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution context error: {0}")]
    ExecutionContext(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("{entity} {id} was updated by another execution (expected version {expected}, found {found})")]
    OptimisticLockingFailure {
        entity: &'static str,
        id: Uuid,
        expected: u32,
        found: u32,
    },

    #[error("No {entity} found with id {id}")]
    NoSuchExecution { entity: &'static str, id: Uuid },

    #[error("Illegal status transition for {entity} {id}: {from} -> {to}")]
    IllegalStateTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("A job execution for this job is already running: {0}")]
    JobExecutionAlreadyRunning(String),

    #[error("A job instance already exists and is complete for: {0}")]
    JobInstanceAlreadyComplete(String),

    #[error("Maximum start limit exceeded for step: {step} (limit {limit})")]
    StartLimitExceeded { step: String, limit: u32 },

    #[error("Execution interrupted: {0}")]
    Interrupted(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Field-less discriminant of a [`BatchError`].
///
/// Retry and skip tables are keyed by this value, the same way exception classes
/// are used to decide what is retryable or skippable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    Read,
    Process,
    Write,
    Transient,
    Validation,
    SkipLimitExceeded,
    NonSkippable,
    Step,
    Job,
    Configuration,
    ExecutionContext,
    Repository,
    OptimisticLocking,
    NoSuchExecution,
    IllegalStateTransition,
    Transaction,
    JobExecutionAlreadyRunning,
    JobInstanceAlreadyComplete,
    StartLimitExceeded,
    Interrupted,
    Serialization,
}

impl BatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BatchError::ItemReader(_) => ErrorKind::Read,
            BatchError::ItemProcessor(_) => ErrorKind::Process,
            BatchError::ItemWriter(_) => ErrorKind::Write,
            BatchError::Transient(_) => ErrorKind::Transient,
            BatchError::Validation(_) => ErrorKind::Validation,
            BatchError::SkipLimitExceeded { .. } => ErrorKind::SkipLimitExceeded,
            BatchError::NonSkippable { .. } => ErrorKind::NonSkippable,
            BatchError::Step(_) => ErrorKind::Step,
            BatchError::Job(_) => ErrorKind::Job,
            BatchError::Configuration(_) => ErrorKind::Configuration,
            BatchError::ExecutionContext(_) => ErrorKind::ExecutionContext,
            BatchError::Repository(_) => ErrorKind::Repository,
            BatchError::OptimisticLockingFailure { .. } => ErrorKind::OptimisticLocking,
            BatchError::NoSuchExecution { .. } => ErrorKind::NoSuchExecution,
            BatchError::IllegalStateTransition { .. } => ErrorKind::IllegalStateTransition,
            BatchError::Transaction(_) => ErrorKind::Transaction,
            BatchError::JobExecutionAlreadyRunning(_) => ErrorKind::JobExecutionAlreadyRunning,
            BatchError::JobInstanceAlreadyComplete(_) => ErrorKind::JobInstanceAlreadyComplete,
            BatchError::StartLimitExceeded { .. } => ErrorKind::StartLimitExceeded,
            BatchError::Interrupted(_) => ErrorKind::Interrupted,
            BatchError::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Infrastructure errors the persistence boundary is allowed to retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, BatchError::OptimisticLockingFailure { .. })
    }
}
