//! Local partitioning: one step split into partitions running side by side.
//!
//! A [`Partitioner`] describes each partition with its own execution context.
//! Every partition then runs as a separate [`StepExecution`] named
//! `<step>:<partition>` on its own thread, so partitions never share state and
//! a failing partition cannot affect what its siblings commit. The manager step
//! waits for all of them and aggregates their counts and statuses.

use std::{collections::BTreeMap, thread};

use chrono::Utc;
use log::{error, info, warn};

use crate::{BatchError, repository::JobRepository};

use super::{
    execution::{BatchStatus, ExitStatus, StepExecution},
    execution_context::ExecutionContext,
    listener::StepListener,
    step::{DEFAULT_COMMIT_RETRY_LIMIT, Step, StepOutcome, StepRunner},
};

pub trait Partitioner {
    /// Execution contexts of the partitions, keyed by partition name. Must
    /// return the same names for the same `grid_size` so a restart finds the
    /// partitions it has to resume.
    fn partition(&self, grid_size: usize)
    -> Result<BTreeMap<String, ExecutionContext>, BatchError>;
}

/// Splits the inclusive range `min..=max` into contiguous ranges, stored as
/// `min` and `max` in each partition context.
pub struct RangePartitioner {
    min: i64,
    max: i64,
}

impl RangePartitioner {
    pub fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }
}

impl Partitioner for RangePartitioner {
    fn partition(
        &self,
        grid_size: usize,
    ) -> Result<BTreeMap<String, ExecutionContext>, BatchError> {
        if grid_size == 0 {
            return Err(BatchError::Configuration(
                "Grid size must be greater than 0".to_string(),
            ));
        }

        let mut partitions = BTreeMap::new();
        if self.min > self.max {
            return Ok(partitions);
        }

        let size = self
            .max
            .checked_sub(self.min)
            .and_then(|span| span.checked_add(1))
            .ok_or_else(|| {
                BatchError::Configuration(format!(
                    "Range {}..={} is too large to partition",
                    self.min, self.max
                ))
            })?;
        let grid = i64::try_from(grid_size).unwrap_or(i64::MAX);
        let target = size / grid + i64::from(size % grid != 0);

        let mut start = self.min;
        let mut number = 0;
        loop {
            let end = start.saturating_add(target - 1).min(self.max);
            let mut context = ExecutionContext::new();
            context.put_long("min", start);
            context.put_long("max", end);
            partitions.insert(format!("partition{}", number), context);

            if end == self.max {
                break;
            }
            start = end + 1;
            number += 1;
        }
        Ok(partitions)
    }
}

/// Runs one partition against its saved step execution, typically by building
/// and executing a step named after it.
pub type PartitionWorker<'a> =
    dyn Fn(&mut StepExecution) -> Result<(), BatchError> + Sync + 'a;

pub struct PartitionStep<'a> {
    name: String,
    partitioner: &'a dyn Partitioner,
    worker: &'a PartitionWorker<'a>,
    grid_size: usize,
    repository: &'a dyn JobRepository,
    listeners: Vec<&'a dyn StepListener>,
    start_limit: u32,
    allow_start_if_complete: bool,
    commit_retry_limit: usize,
}

impl PartitionStep<'_> {
    /// Step executions of the partitions still to run. Partitions completed by a
    /// previous execution of the job instance are left out; the others resume
    /// from their last context.
    fn prepare(&self, manager: &StepExecution) -> Result<Vec<StepExecution>, BatchError> {
        let job_execution = self
            .repository
            .get_job_execution(manager.job_execution_id)?
            .ok_or(BatchError::NoSuchExecution {
                entity: "JobExecution",
                id: manager.job_execution_id,
            })?;

        let mut executions = Vec::new();
        for (partition, context) in self.partitioner.partition(self.grid_size)? {
            let step_name = format!("{}:{}", self.name, partition);
            let last = self
                .repository
                .get_last_step_execution(&job_execution.job_instance, &step_name)?;

            let context = match last {
                Some(last) if last.status == BatchStatus::Completed => {
                    info!("Partition [{}] already complete, skipping it", step_name);
                    continue;
                }
                Some(last) => last.execution_context,
                None => context,
            };

            let mut execution = StepExecution::new(&step_name, manager.job_execution_id);
            execution.execution_context = context;
            self.repository.add_step_execution(&mut execution)?;
            executions.push(execution);
        }
        Ok(executions)
    }

    fn run_partitions(
        &self,
        executions: Vec<StepExecution>,
    ) -> Vec<(String, Result<StepExecution, BatchError>)> {
        let worker = self.worker;

        thread::scope(|scope| {
            let handles: Vec<_> = executions
                .into_iter()
                .map(|mut execution| {
                    let name = execution.step_name.clone();
                    let handle = scope.spawn(move || {
                        let result = worker(&mut execution);
                        (execution, result)
                    });
                    (name, handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(name, handle)| match handle.join() {
                    Ok((execution, Ok(()))) => (name, Ok(execution)),
                    Ok((execution, Err(error))) => {
                        warn!("Partition [{}] failed: {}", name, error);
                        (name, Ok(execution))
                    }
                    Err(_) => {
                        let error = BatchError::Step(format!("Partition [{}] panicked", name));
                        (name, Err(error))
                    }
                })
                .collect()
        })
    }

    /// Marks a partition whose worker failed before its step could record it.
    fn fail_unfinished(&self, execution: &mut StepExecution) -> Result<(), BatchError> {
        if !execution.status.is_running() {
            return Ok(());
        }
        let error = BatchError::Step(format!(
            "Partition [{}] ended without completing",
            execution.step_name
        ));
        execution.transition_to(BatchStatus::Failed)?;
        execution.exit_status = ExitStatus::failed().and_description(&error.to_string());
        execution.add_failure_exception(&error);
        execution.end_time = Some(Utc::now());
        self.repository.update_step_execution(execution)
    }

    fn handle(&self, manager: &mut StepExecution) -> Result<StepOutcome, BatchError> {
        let executions = self.prepare(manager)?;
        let total = executions.len();
        info!("Step [{}] running {} partitions", self.name, total);

        let mut failed = 0;
        let mut stopped = 0;
        for (name, result) in self.run_partitions(executions) {
            let mut execution = match result {
                Ok(execution) => execution,
                Err(error) => {
                    error!("{}", error);
                    manager.add_failure_exception(&error);
                    failed += 1;
                    continue;
                }
            };
            if let Err(error) = self.fail_unfinished(&mut execution) {
                error!("Unable to record failure of partition [{}]: {}", name, error);
            }

            aggregate(manager, &execution);
            match execution.status {
                BatchStatus::Completed => {}
                BatchStatus::Stopped | BatchStatus::Stopping => stopped += 1,
                _ => {
                    failed += 1;
                    execution
                        .failure_exceptions
                        .iter()
                        .for_each(|failure| manager.failure_exceptions.push(failure.clone()));
                }
            }
        }

        if failed > 0 {
            return Err(BatchError::Step(format!(
                "{} of {} partitions of step [{}] failed",
                failed, total, self.name
            )));
        }
        if stopped > 0 {
            return Ok(StepOutcome::Stopped);
        }
        Ok(StepOutcome::Completed)
    }
}

fn aggregate(manager: &mut StepExecution, partition: &StepExecution) {
    manager.read_count += partition.read_count;
    manager.write_count += partition.write_count;
    manager.filter_count += partition.filter_count;
    manager.read_skip_count += partition.read_skip_count;
    manager.process_skip_count += partition.process_skip_count;
    manager.write_skip_count += partition.write_skip_count;
    manager.commit_count += partition.commit_count;
    manager.rollback_count += partition.rollback_count;
}

impl Step for PartitionStep<'_> {
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
        runner.run(step_execution, |manager| self.handle(manager))
    }
}

pub struct PartitionStepBuilder<'a> {
    name: String,
    partitioner: &'a dyn Partitioner,
    worker: Option<&'a PartitionWorker<'a>>,
    grid_size: usize,
    repository: Option<&'a dyn JobRepository>,
    listeners: Vec<&'a dyn StepListener>,
    start_limit: u32,
    allow_start_if_complete: bool,
    commit_retry_limit: usize,
}

impl<'a> PartitionStepBuilder<'a> {
    pub(crate) fn new(name: &str, partitioner: &'a dyn Partitioner) -> Self {
        Self {
            name: name.to_string(),
            partitioner,
            worker: None,
            grid_size: 1,
            repository: None,
            listeners: Vec::new(),
            start_limit: u32::MAX,
            allow_start_if_complete: false,
            commit_retry_limit: DEFAULT_COMMIT_RETRY_LIMIT,
        }
    }

    pub fn worker(mut self, worker: &'a PartitionWorker<'a>) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Number of partitions requested from the partitioner.
    pub fn grid_size(mut self, grid_size: usize) -> Self {
        self.grid_size = grid_size;
        self
    }

    pub fn repository(mut self, repository: &'a dyn JobRepository) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn listener(mut self, listener: &'a dyn StepListener) -> Self {
        self.listeners.push(listener);
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

    pub fn build(self) -> Result<PartitionStep<'a>, BatchError> {
        let missing =
            |what: &str| BatchError::Configuration(format!("Step [{}] requires {}", self.name, what));

        let worker = self.worker.ok_or_else(|| missing("a partition worker"))?;
        let repository = self.repository.ok_or_else(|| missing("a job repository"))?;
        if self.grid_size == 0 {
            return Err(missing("a grid size greater than 0"));
        }
        if self.commit_retry_limit == 0 {
            return Err(missing("a commit retry limit greater than 0"));
        }

        Ok(PartitionStep {
            name: self.name,
            partitioner: self.partitioner,
            worker,
            grid_size: self.grid_size,
            repository,
            listeners: self.listeners,
            start_limit: self.start_limit,
            allow_start_if_complete: self.allow_start_if_complete,
            commit_retry_limit: self.commit_retry_limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        core::{
            execution::JobParameters,
            item::{ItemWriter, ItemWriterResult},
            step::StepBuilder,
        },
        item::list::ListItemReader,
        repository::InMemoryJobRepository,
    };

    /// Thread-safe writer failing on one poisoned item.
    struct SharedWriter {
        poisoned: Option<i64>,
        written: Mutex<Vec<i64>>,
    }

    impl ItemWriter<i64> for SharedWriter {
        fn write(&self, items: &[i64]) -> ItemWriterResult {
            if items.iter().any(|item| Some(*item) == self.poisoned) {
                return Err(BatchError::ItemWriter("poisoned item".to_string()));
            }
            self.written
                .lock()
                .map_err(|_| BatchError::ItemWriter("lock poisoned".to_string()))?
                .extend_from_slice(items);
            Ok(())
        }
    }

    #[test]
    fn range_is_split_evenly() -> anyhow::Result<()> {
        let partitions = RangePartitioner::new(1, 10).partition(3)?;
        let ranges: Vec<(i64, i64)> = partitions
            .values()
            .map(|context| Ok((context.get_long("min")?, context.get_long("max")?)))
            .collect::<Result<_, BatchError>>()?;
        assert_eq!(ranges, vec![(1, 4), (5, 8), (9, 10)]);

        assert!(RangePartitioner::new(5, 1).partition(3)?.is_empty());
        assert!(RangePartitioner::new(1, 2).partition(0).is_err());
        Ok(())
    }

    #[test]
    fn ranges_at_the_bounds_of_i64_are_split_without_overflow() -> anyhow::Result<()> {
        let ranges = |partitions: BTreeMap<String, ExecutionContext>| {
            partitions
                .values()
                .map(|context| Ok((context.get_long("min")?, context.get_long("max")?)))
                .collect::<Result<Vec<(i64, i64)>, BatchError>>()
        };

        let top = RangePartitioner::new(i64::MAX - 5, i64::MAX).partition(2)?;
        assert_eq!(
            ranges(top)?,
            vec![(i64::MAX - 5, i64::MAX - 3), (i64::MAX - 2, i64::MAX)]
        );

        let bottom = RangePartitioner::new(i64::MIN, i64::MIN + 1).partition(usize::MAX)?;
        assert_eq!(
            ranges(bottom)?,
            vec![(i64::MIN, i64::MIN), (i64::MIN + 1, i64::MIN + 1)]
        );

        let whole = RangePartitioner::new(i64::MIN, i64::MAX).partition(4);
        assert!(matches!(whole, Err(BatchError::Configuration(_))));
        Ok(())
    }

    fn run(
        repository: &InMemoryJobRepository,
        writer: &SharedWriter,
    ) -> anyhow::Result<(StepExecution, Result<(), BatchError>)> {
        let partitioner = RangePartitioner::new(1, 9);
        let worker = |step_execution: &mut StepExecution| -> Result<(), BatchError> {
            let min = step_execution.execution_context.get_long("min")?;
            let max = step_execution.execution_context.get_long("max")?;
            let reader = ListItemReader::new((min..=max).collect::<Vec<i64>>());
            let step = StepBuilder::new(&step_execution.step_name)
                .chunk::<i64>(2)
                .reader(&reader)
                .writer(writer)
                .repository(repository)
                .build()?;
            step.execute(step_execution)
        };
        let step = StepBuilder::new("load")
            .partitioner(&partitioner)
            .worker(&worker)
            .grid_size(3)
            .repository(repository)
            .build()?;

        let job_execution = repository.create_job_execution("job", &JobParameters::new())?;
        let mut manager = job_execution.create_step_execution("load")?;
        repository.add_step_execution(&mut manager)?;
        let result = step.execute(&mut manager);
        Ok((manager, result))
    }

    #[test]
    fn manager_aggregates_partition_counts() -> anyhow::Result<()> {
        let repository = InMemoryJobRepository::new();
        let writer = SharedWriter {
            poisoned: None,
            written: Mutex::new(Vec::new()),
        };

        let (manager, result) = run(&repository, &writer)?;
        result?;

        assert_eq!(manager.status, BatchStatus::Completed);
        assert_eq!(manager.read_count, 9);
        assert_eq!(manager.write_count, 9);

        let mut written = writer
            .written
            .lock()
            .map_err(|_| anyhow::anyhow!("lock poisoned"))?
            .clone();
        written.sort_unstable();
        assert_eq!(written, (1..=9).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn failing_partition_leaves_siblings_committed() -> anyhow::Result<()> {
        let repository = InMemoryJobRepository::new();
        let writer = SharedWriter {
            poisoned: Some(5),
            written: Mutex::new(Vec::new()),
        };

        let (manager, result) = run(&repository, &writer)?;
        assert!(matches!(result, Err(BatchError::Step(_))));
        assert_eq!(manager.status, BatchStatus::Failed);

        let job_execution = repository
            .get_job_execution(manager.job_execution_id)?
            .ok_or_else(|| anyhow::anyhow!("job execution not found"))?;
        let status_of = |name: &str| {
            job_execution
                .step_executions
                .iter()
                .find(|step| step.step_name == name)
                .map(|step| (step.status, step.write_count))
        };
        assert_eq!(status_of("load:partition0"), Some((BatchStatus::Completed, 3)));
        assert_eq!(status_of("load:partition1"), Some((BatchStatus::Failed, 0)));
        assert_eq!(status_of("load:partition2"), Some((BatchStatus::Completed, 3)));
        Ok(())
    }
}
