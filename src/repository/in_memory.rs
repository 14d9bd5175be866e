use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use chrono::Utc;
use log::debug;
use uuid::Uuid;

use crate::{
    BatchError,
    core::{
        execution::{
            BatchStatus, ExecutionId, JobExecution, JobInstance, JobParameters, StepExecution,
        },
        execution_context::ExecutionContext,
    },
};

use super::JobRepository;

#[derive(Default)]
struct Store {
    instances: Vec<JobInstance>,
    /// Job executions in creation order, stored without step executions.
    job_executions: Vec<JobExecution>,
    /// Step executions in creation order.
    step_executions: Vec<StepExecution>,
    /// Serialized execution contexts of job and step executions.
    contexts: HashMap<ExecutionId, String>,
}

impl Store {
    fn find_instance(&self, job_name: &str, job_key: &str) -> Option<&JobInstance> {
        self.instances
            .iter()
            .find(|instance| instance.job_name == job_name && instance.job_key == job_key)
    }

    fn job_execution_mut(&mut self, id: ExecutionId) -> Result<&mut JobExecution, BatchError> {
        self.job_executions
            .iter_mut()
            .find(|execution| execution.id == Some(id))
            .ok_or(BatchError::NoSuchExecution {
                entity: "JobExecution",
                id,
            })
    }

    fn step_execution_mut(&mut self, id: ExecutionId) -> Result<&mut StepExecution, BatchError> {
        self.step_executions
            .iter_mut()
            .find(|execution| execution.id == Some(id))
            .ok_or(BatchError::NoSuchExecution {
                entity: "StepExecution",
                id,
            })
    }

    fn job_status(&self, id: ExecutionId) -> Option<BatchStatus> {
        self.job_executions
            .iter()
            .find(|execution| execution.id == Some(id))
            .map(|execution| execution.status)
    }

    fn context(&self, id: ExecutionId) -> Result<ExecutionContext, BatchError> {
        match self.contexts.get(&id) {
            Some(json) => ExecutionContext::from_json(json),
            None => Ok(ExecutionContext::new()),
        }
    }

    fn load_step_execution(&self, stored: &StepExecution) -> Result<StepExecution, BatchError> {
        let mut execution = stored.clone();
        if let Some(id) = stored.id {
            execution.execution_context = self.context(id)?;
        }
        Ok(execution)
    }

    fn load_job_execution(&self, stored: &JobExecution) -> Result<JobExecution, BatchError> {
        let mut execution = stored.clone();
        if let Some(id) = stored.id {
            execution.execution_context = self.context(id)?;
            execution.step_executions = self
                .step_executions
                .iter()
                .filter(|step| step.job_execution_id == id)
                .map(|step| self.load_step_execution(step))
                .collect::<Result<_, _>>()?;
        }
        Ok(execution)
    }

    /// Executions of the instance in creation order.
    fn executions_of<'s>(
        &'s self,
        instance: &'s JobInstance,
    ) -> impl DoubleEndedIterator<Item = &'s JobExecution> + 's {
        self.job_executions
            .iter()
            .filter(move |execution| execution.job_instance.id == instance.id)
    }
}

/// [`JobRepository`] keeping every record in memory.
///
/// Records live in an arena guarded by one mutex and are handed out as copies,
/// so callers never share mutable state. Execution contexts are stored as JSON
/// to behave like a persistent store.
#[derive(Default)]
pub struct InMemoryJobRepository {
    store: Mutex<Store>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Store>, BatchError> {
        self.store
            .lock()
            .map_err(|_| BatchError::Repository("job repository lock poisoned".to_string()))
    }
}

fn check_version(
    entity: &'static str,
    id: ExecutionId,
    stored: u32,
    given: u32,
) -> Result<(), BatchError> {
    if stored != given {
        return Err(BatchError::OptimisticLockingFailure {
            entity,
            id,
            expected: given,
            found: stored,
        });
    }
    Ok(())
}

fn check_transition(
    entity: &'static str,
    id: ExecutionId,
    from: BatchStatus,
    to: BatchStatus,
) -> Result<(), BatchError> {
    if !from.can_transition_to(to) {
        return Err(BatchError::IllegalStateTransition {
            entity,
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    Ok(())
}

impl JobRepository for InMemoryJobRepository {
    fn is_job_instance_exists(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<bool, BatchError> {
        Ok(self.get_job_instance(job_name, parameters)?.is_some())
    }

    fn get_job_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobInstance>, BatchError> {
        let store = self.lock()?;
        Ok(store
            .find_instance(job_name, &parameters.to_identifying_key())
            .cloned())
    }

    fn create_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<JobExecution, BatchError> {
        let job_key = parameters.to_identifying_key();
        let mut store = self.lock()?;

        let (instance, execution_context) = match store.find_instance(job_name, &job_key) {
            Some(instance) => {
                let instance = instance.clone();
                for execution in store.executions_of(&instance) {
                    if execution.status.is_running() {
                        return Err(BatchError::JobExecutionAlreadyRunning(format!(
                            "A job execution for this job is already running: {}",
                            instance.job_name
                        )));
                    }
                    if matches!(
                        execution.status,
                        BatchStatus::Completed | BatchStatus::Abandoned
                    ) {
                        return Err(BatchError::JobInstanceAlreadyComplete(format!(
                            "A job instance already exists and is complete for identifying parameters={{{}}}",
                            job_key
                        )));
                    }
                }
                let last_id = store.executions_of(&instance).next_back().and_then(|e| e.id);
                let context = match last_id {
                    Some(id) => store.context(id)?,
                    None => ExecutionContext::new(),
                };
                (instance, context)
            }
            None => {
                let instance = JobInstance {
                    id: Uuid::new_v4(),
                    job_name: job_name.to_string(),
                    job_key,
                };
                store.instances.push(instance.clone());
                (instance, ExecutionContext::new())
            }
        };

        let mut execution = JobExecution::new(instance, parameters.clone());
        let id = Uuid::new_v4();
        execution.id = Some(id);
        execution.last_updated = Some(Utc::now());

        store.contexts.insert(id, execution_context.to_json()?);
        store.job_executions.push(execution.clone());
        execution.execution_context = execution_context;

        debug!("Created job execution {} of job {}", id, job_name);
        Ok(execution)
    }

    fn update_job_execution(&self, job_execution: &mut JobExecution) -> Result<(), BatchError> {
        let id = job_execution.require_id()?;
        let mut store = self.lock()?;
        let stored = store.job_execution_mut(id)?;

        check_version("JobExecution", id, stored.version, job_execution.version)?;
        check_transition("JobExecution", id, stored.status, job_execution.status)?;

        job_execution.version += 1;
        job_execution.last_updated = Some(Utc::now());

        let mut record = job_execution.clone();
        record.step_executions.clear();
        *stored = record;
        Ok(())
    }

    fn synchronize_status(&self, job_execution: &mut JobExecution) -> Result<(), BatchError> {
        let id = job_execution.require_id()?;
        let mut store = self.lock()?;
        let stored = store.job_execution_mut(id)?;

        job_execution.version = stored.version;
        if stored.status != job_execution.status
            && matches!(stored.status, BatchStatus::Stopping | BatchStatus::Abandoned)
            && job_execution.status.can_transition_to(stored.status)
        {
            debug!(
                "Job execution {} synchronized to status {}",
                id, stored.status
            );
            job_execution.status = stored.status;
        }
        Ok(())
    }

    fn add_step_execution(&self, step_execution: &mut StepExecution) -> Result<(), BatchError> {
        if step_execution.id.is_some() {
            return Err(BatchError::Repository(format!(
                "StepExecution {} already has an id; only new executions can be added",
                step_execution.step_name
            )));
        }
        let mut store = self.lock()?;
        store.job_execution_mut(step_execution.job_execution_id)?;

        let id = Uuid::new_v4();
        step_execution.id = Some(id);
        step_execution.version = 0;
        step_execution.last_updated = Some(Utc::now());

        store
            .contexts
            .insert(id, step_execution.execution_context.to_json()?);
        store.step_executions.push(step_execution.clone());
        Ok(())
    }

    fn update_step_execution(&self, step_execution: &mut StepExecution) -> Result<(), BatchError> {
        let id = step_execution.require_id()?;
        let mut store = self.lock()?;

        let job_stopping =
            store.job_status(step_execution.job_execution_id) == Some(BatchStatus::Stopping);
        let stored = store.step_execution_mut(id)?;

        check_version("StepExecution", id, stored.version, step_execution.version)?;
        check_transition("StepExecution", id, stored.status, step_execution.status)?;

        step_execution.version += 1;
        step_execution.last_updated = Some(Utc::now());
        if job_stopping && step_execution.status.is_running() {
            step_execution.set_terminate_only();
        }
        *stored = step_execution.clone();
        Ok(())
    }

    fn update_execution_context(&self, step_execution: &StepExecution) -> Result<(), BatchError> {
        let id = step_execution.require_id()?;
        let json = step_execution.execution_context.to_json()?;
        let mut store = self.lock()?;
        store.step_execution_mut(id)?;
        store.contexts.insert(id, json);
        Ok(())
    }

    fn update_job_execution_context(
        &self,
        job_execution: &JobExecution,
    ) -> Result<(), BatchError> {
        let id = job_execution.require_id()?;
        let json = job_execution.execution_context.to_json()?;
        let mut store = self.lock()?;
        store.job_execution_mut(id)?;
        store.contexts.insert(id, json);
        Ok(())
    }

    fn get_job_execution(&self, id: ExecutionId) -> Result<Option<JobExecution>, BatchError> {
        let store = self.lock()?;
        store
            .job_executions
            .iter()
            .find(|execution| execution.id == Some(id))
            .map(|execution| store.load_job_execution(execution))
            .transpose()
    }

    fn get_step_execution(&self, id: ExecutionId) -> Result<Option<StepExecution>, BatchError> {
        let store = self.lock()?;
        store
            .step_executions
            .iter()
            .find(|execution| execution.id == Some(id))
            .map(|execution| store.load_step_execution(execution))
            .transpose()
    }

    fn get_last_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobExecution>, BatchError> {
        let store = self.lock()?;
        let Some(instance) = store.find_instance(job_name, &parameters.to_identifying_key())
        else {
            return Ok(None);
        };
        store
            .executions_of(instance)
            .next_back()
            .map(|execution| store.load_job_execution(execution))
            .transpose()
    }

    fn get_last_step_execution(
        &self,
        job_instance: &JobInstance,
        step_name: &str,
    ) -> Result<Option<StepExecution>, BatchError> {
        let store = self.lock()?;
        let job_execution_ids: Vec<ExecutionId> = store
            .executions_of(job_instance)
            .filter_map(|execution| execution.id)
            .collect();

        store
            .step_executions
            .iter()
            .rev()
            .find(|step| {
                step.step_name == step_name && job_execution_ids.contains(&step.job_execution_id)
            })
            .map(|step| store.load_step_execution(step))
            .transpose()
    }

    fn get_step_execution_count(
        &self,
        job_instance: &JobInstance,
        step_name: &str,
    ) -> Result<usize, BatchError> {
        let store = self.lock()?;
        let job_execution_ids: Vec<ExecutionId> = store
            .executions_of(job_instance)
            .filter_map(|execution| execution.id)
            .collect();

        Ok(store
            .step_executions
            .iter()
            .filter(|step| {
                step.step_name == step_name && job_execution_ids.contains(&step.job_execution_id)
            })
            .count())
    }

    fn find_job_executions(
        &self,
        job_instance: &JobInstance,
    ) -> Result<Vec<JobExecution>, BatchError> {
        let store = self.lock()?;
        store
            .executions_of(job_instance)
            .rev()
            .map(|execution| store.load_job_execution(execution))
            .collect()
    }

    fn find_running_job_executions(
        &self,
        job_name: &str,
    ) -> Result<Vec<JobExecution>, BatchError> {
        let store = self.lock()?;
        store
            .job_executions
            .iter()
            .filter(|execution| execution.job_name() == job_name && execution.is_running())
            .map(|execution| store.load_job_execution(execution))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;
    use crate::core::execution::JobParametersBuilder;

    fn parameters(run: i64) -> JobParameters {
        JobParametersBuilder::new().add_long("run", run).build()
    }

    fn started_step(
        repository: &InMemoryJobRepository,
        job_execution: &JobExecution,
        name: &str,
    ) -> Result<StepExecution, BatchError> {
        let mut step = job_execution.create_step_execution(name)?;
        repository.add_step_execution(&mut step)?;
        step.transition_to(BatchStatus::Started)?;
        repository.update_step_execution(&mut step)?;
        Ok(step)
    }

    #[test]
    fn create_assigns_identity_and_rejects_saved_step() -> anyhow::Result<()> {
        let repository = InMemoryJobRepository::new();
        let job_execution = repository.create_job_execution("job", &parameters(1))?;
        assert!(job_execution.id.is_some());
        assert!(repository.is_job_instance_exists("job", &parameters(1))?);
        assert!(!repository.is_job_instance_exists("job", &parameters(2))?);

        let mut step = job_execution.create_step_execution("step")?;
        repository.add_step_execution(&mut step)?;
        assert!(step.id.is_some());

        let again = repository.add_step_execution(&mut step);
        assert!(matches!(again, Err(BatchError::Repository(_))));
        Ok(())
    }

    #[test]
    fn update_requires_identity() -> anyhow::Result<()> {
        let repository = InMemoryJobRepository::new();
        let mut step = StepExecution::new("step", Uuid::new_v4());
        let result = repository.update_step_execution(&mut step);
        assert!(matches!(result, Err(BatchError::Repository(_))));

        step.id = Some(Uuid::new_v4());
        let result = repository.update_step_execution(&mut step);
        assert!(matches!(result, Err(BatchError::NoSuchExecution { .. })));
        Ok(())
    }

    #[test]
    fn stale_update_is_rejected() -> anyhow::Result<()> {
        let repository = InMemoryJobRepository::new();
        let job_execution = repository.create_job_execution("job", &parameters(1))?;
        let mut step = started_step(&repository, &job_execution, "step")?;
        let mut stale = step.clone();

        step.read_count = 10;
        repository.update_step_execution(&mut step)?;

        stale.read_count = 3;
        let result = repository.update_step_execution(&mut stale);
        assert!(matches!(
            result,
            Err(BatchError::OptimisticLockingFailure {
                expected: 1,
                found: 2,
                ..
            })
        ));

        let stored = repository
            .get_step_execution(step.require_id()?)?
            .ok_or_else(|| anyhow::anyhow!("step execution not found"))?;
        assert_eq!(stored.read_count, 10);
        Ok(())
    }

    #[test]
    fn completed_step_cannot_go_back() -> anyhow::Result<()> {
        let repository = InMemoryJobRepository::new();
        let job_execution = repository.create_job_execution("job", &parameters(1))?;
        let mut step = started_step(&repository, &job_execution, "step")?;
        step.transition_to(BatchStatus::Completed)?;
        repository.update_step_execution(&mut step)?;

        step.status = BatchStatus::Started;
        let result = repository.update_step_execution(&mut step);
        assert!(matches!(
            result,
            Err(BatchError::IllegalStateTransition { .. })
        ));
        Ok(())
    }

    #[test]
    fn restart_rules_follow_last_execution_status() -> anyhow::Result<()> {
        let repository = InMemoryJobRepository::new();
        let mut first = repository.create_job_execution("job", &parameters(1))?;

        let running = repository.create_job_execution("job", &parameters(1));
        assert!(matches!(
            running,
            Err(BatchError::JobExecutionAlreadyRunning(_))
        ));

        first.transition_to(BatchStatus::Started)?;
        first.execution_context.put_long("offset", 42);
        repository.update_job_execution_context(&first)?;
        first.transition_to(BatchStatus::Failed)?;
        repository.update_job_execution(&mut first)?;

        let mut second = repository.create_job_execution("job", &parameters(1))?;
        assert_eq!(second.job_instance, first.job_instance);
        assert_eq!(second.execution_context.get_long("offset")?, 42);

        second.transition_to(BatchStatus::Started)?;
        repository.update_job_execution(&mut second)?;
        second.transition_to(BatchStatus::Completed)?;
        repository.update_job_execution(&mut second)?;

        let third = repository.create_job_execution("job", &parameters(1));
        assert!(matches!(
            third,
            Err(BatchError::JobInstanceAlreadyComplete(_))
        ));

        let executions = repository.find_job_executions(&first.job_instance)?;
        assert_eq!(executions.len(), 2);
        assert_eq!(executions[0].id, second.id);
        Ok(())
    }

    #[test]
    fn last_step_execution_spans_job_executions() -> anyhow::Result<()> {
        let repository = InMemoryJobRepository::new();
        let mut first = repository.create_job_execution("job", &parameters(1))?;
        let mut step = started_step(&repository, &first, "step")?;
        step.execution_context.put_long("read.count", 4);
        repository.update_execution_context(&step)?;
        step.transition_to(BatchStatus::Failed)?;
        repository.update_step_execution(&mut step)?;
        first.transition_to(BatchStatus::Started)?;
        first.transition_to(BatchStatus::Failed)?;
        repository.update_job_execution(&mut first)?;

        let second = repository.create_job_execution("job", &parameters(1))?;
        let last = repository
            .get_last_step_execution(&second.job_instance, "step")?
            .ok_or_else(|| anyhow::anyhow!("no last step execution"))?;
        assert_eq!(last.id, step.id);
        assert_eq!(last.execution_context.get_long("read.count")?, 4);
        assert_eq!(
            repository.get_step_execution_count(&second.job_instance, "step")?,
            1
        );

        let loaded = repository
            .get_job_execution(first.require_id()?)?
            .ok_or_else(|| anyhow::anyhow!("no job execution"))?;
        assert_eq!(loaded.step_executions.len(), 1);
        Ok(())
    }

    #[test]
    fn stopping_job_flags_its_steps() -> anyhow::Result<()> {
        let repository = InMemoryJobRepository::new();
        let mut job_execution = repository.create_job_execution("job", &parameters(1))?;
        job_execution.transition_to(BatchStatus::Started)?;
        repository.update_job_execution(&mut job_execution)?;
        let mut step = started_step(&repository, &job_execution, "step")?;

        let mut operator_view = repository
            .get_job_execution(job_execution.require_id()?)?
            .ok_or_else(|| anyhow::anyhow!("no job execution"))?;
        operator_view.transition_to(BatchStatus::Stopping)?;
        repository.update_job_execution(&mut operator_view)?;

        repository.update_step_execution(&mut step)?;
        assert!(step.terminate_only);

        repository.synchronize_status(&mut job_execution)?;
        assert_eq!(job_execution.status, BatchStatus::Stopping);
        assert_eq!(job_execution.version, operator_view.version);
        assert_eq!(repository.find_running_job_executions("job")?.len(), 1);
        Ok(())
    }

    #[test]
    fn concurrent_updates_of_distinct_steps() -> anyhow::Result<()> {
        let repository = Arc::new(InMemoryJobRepository::new());
        let job_execution = repository.create_job_execution("job", &parameters(1))?;

        let handles: Vec<_> = (0..4)
            .map(|partition| {
                let repository = Arc::clone(&repository);
                let job_execution = job_execution.clone();
                thread::spawn(move || -> Result<StepExecution, BatchError> {
                    let name = format!("step:partition{}", partition);
                    let mut step = started_step(&repository, &job_execution, &name)?;
                    for _ in 0..50 {
                        step.write_count += 1;
                        repository.update_step_execution(&mut step)?;
                    }
                    Ok(step)
                })
            })
            .collect();

        for handle in handles {
            let step = handle
                .join()
                .map_err(|_| anyhow::anyhow!("worker panicked"))??;
            let stored = repository
                .get_step_execution(step.require_id()?)?
                .ok_or_else(|| anyhow::anyhow!("step execution not found"))?;
            assert_eq!(stored.write_count, 50);
            assert_eq!(stored.version, 51);
        }
        Ok(())
    }
}
