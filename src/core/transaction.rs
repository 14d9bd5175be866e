use log::debug;

use crate::BatchError;

/// Transaction boundary around each chunk.
///
/// The step begins a transaction before reading a chunk and commits it once the
/// items are written and the execution context is persisted. On failure it rolls
/// back, and the fault-tolerant processor begins a new one before retrying or
/// scanning the chunk.
pub trait TransactionManager {
    fn begin(&self) -> Result<(), BatchError>;

    fn commit(&self) -> Result<(), BatchError>;

    fn rollback(&self) -> Result<(), BatchError>;
}

/// Transaction manager for resources that are not transactional.
#[derive(Default)]
pub struct ResourcelessTransactionManager;

impl TransactionManager for ResourcelessTransactionManager {
    fn begin(&self) -> Result<(), BatchError> {
        debug!("Begin resourceless transaction");
        Ok(())
    }

    fn commit(&self) -> Result<(), BatchError> {
        debug!("Commit resourceless transaction");
        Ok(())
    }

    fn rollback(&self) -> Result<(), BatchError> {
        debug!("Rollback resourceless transaction");
        Ok(())
    }
}
