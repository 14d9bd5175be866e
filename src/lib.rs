#![cfg_attr(docsrs, feature(doc_cfg))]

/*!
 # Spring Batch engine

 A chunk-oriented batch engine: items are read one at a time, processed, and
 written in chunks, each chunk committed as one transaction together with the
 step's progress. A step that fails can be restarted from its last committed
 chunk, and item-level failures can be retried or skipped within configured
 limits.

 ## Core Concepts

- **Job:** the whole batch process, an ordered list of `Step`s. Each launch
  with the same identifying parameters targets the same `JobInstance`; every
  attempt is a `JobExecution`.
- **Step:** an independent phase of a job. Chunk-oriented steps read, process
  and write items; tasklet steps run a single repeatable unit of work;
  partitioned steps split their input and run the partitions on separate
  threads.
- **ItemReader / ItemProcessor / ItemWriter:** the item contracts. A processor
  returning `None` filters the item out.
- **ExecutionContext:** the key/value state saved at every commit and handed
  back to readers and writers on restart.
- **JobRepository:** stores executions and contexts. `InMemoryJobRepository`
  keeps them in memory and detects concurrent updates of the same record.

 ## Fault tolerance

A fault-tolerant chunk step retries a failing chunk while the retry policy
allows it. Once retries are exhausted, a skippable processing error drops the
offending item, and a skippable write error makes the step write the chunk one
item at a time to find the faulty item. Skips stop being tolerated once the skip
limit is reached, and the step then fails.

 ## Features

| **Feature**   | **Description**                                               |
|---------------|---------------------------------------------------------------|
| logger        | Enables a logger `ItemWriter`, useful for debugging purposes  |
| full          | Enables all available features                                |

 ## Getting Started

```rust
# use spring_batch_engine::{
#     core::{
#         execution::{BatchStatus, JobParametersBuilder},
#         item::{ItemProcessor, ItemProcessorResult},
#         job::JobBuilder,
#         step::StepBuilder,
#     },
#     error::{BatchError, ErrorKind},
#     item::list::{ListItemReader, ListItemWriter},
#     repository::InMemoryJobRepository,
# };
#[derive(Default)]
struct UpperCaseProcessor {}

impl ItemProcessor<String, String> for UpperCaseProcessor {
    fn process(&self, item: &String) -> ItemProcessorResult<String> {
        if item.is_empty() {
            return Err(BatchError::Validation("empty name".to_string()));
        }
        Ok(Some(item.to_uppercase()))
    }
}

fn main() -> Result<(), BatchError> {
    let repository = InMemoryJobRepository::new();

    let names = ["porsche", "", "peugeot", "mazda"];
    let reader = ListItemReader::new(names.iter().map(|name| name.to_string()).collect());
    let processor = UpperCaseProcessor::default();
    let writer = ListItemWriter::<String>::new();

    let step = StepBuilder::new("upper-case")
        .chunk::<String>(2) // set commit interval
        .reader(&reader)
        .processor(&processor)
        .writer(&writer)
        .skip(ErrorKind::Validation)
        .skip_limit(1) // tolerate one invalid item
        .repository(&repository)
        .build()?;

    let job = JobBuilder::new()
        .name("cars".to_string())
        .start(&step)
        .repository(&repository)
        .build()?;

    let parameters = JobParametersBuilder::new().add_string("source", "inline").build();
    let execution = job.run(&parameters)?;

    assert_eq!(execution.status, BatchStatus::Completed);
    assert_eq!(writer.get_written_items(), vec!["PORSCHE", "PEUGEOT", "MAZDA"]);
    assert_eq!(execution.step_executions[0].process_skip_count, 1);

    Ok(())
}
```

 ## License
 Licensed under either of

 -   Apache License, Version 2.0
     ([LICENSE-APACHE](LICENSE-APACHE) or <http://www.apache.org/licenses/LICENSE-2.0>)
 -   MIT license
     ([LICENSE-MIT](LICENSE-MIT) or <http://opensource.org/licenses/MIT>)

 at your option.
 */

/// Core module for batch operations
pub mod core;

/// Error types for batch operations
pub mod error;

#[doc(inline)]
pub use error::*;

/// Item readers and writers
pub mod item;

/// Storage of job and step executions
pub mod repository;
