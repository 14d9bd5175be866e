//! Mock versions of the listener traits.
use mockall::mock;

use spring_batch_engine::{
    BatchError,
    core::{
        execution::{JobExecution, StepExecution},
        listener::{JobListener, SkipListener, StepListener},
    },
};

mock! {
    pub JobListener {}
    impl JobListener for JobListener {
        fn before_job(&self, job_execution: &JobExecution);
        fn after_job(&self, job_execution: &JobExecution);
    }
}

mock! {
    pub StepListener {}
    impl StepListener for StepListener {
        fn before_step(&self, step_execution: &StepExecution);
        fn after_step(&self, step_execution: &StepExecution);
    }
}

mock! {
    pub SkipListener {}
    impl SkipListener<i32, i32> for SkipListener {
        fn on_skip_in_read(&self, error: &BatchError);
        fn on_skip_in_process(&self, item: &i32, error: &BatchError);
        fn on_skip_in_write(&self, item: &i32, error: &BatchError);
    }
}
