use rand::distr::{Alphanumeric, SampleString};

pub mod chunk;

pub mod chunk_step;

pub mod execution;

pub mod execution_context;

pub mod fault_tolerant;

pub mod item;

pub mod job;

pub mod listener;

pub mod operator;

pub mod partition;

pub mod policy;

pub mod processor;

pub mod step;

pub mod tasklet;

pub mod transaction;

/// Generates a random name consisting of alphanumeric characters.
fn build_name() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), 8)
}
