//! Execution persistence: the record store and the backends it writes to.

mod atomic_writer;
pub mod backend;
mod database;
pub mod executions;

pub use atomic_writer::AtomicFileWriter;
pub use backend::{FileBackend, KeyValueBackend, MemoryBackend};
pub use database::SqliteBackend;
pub use executions::{
    ExecutionFile, ExecutionFilter, ExecutionRecord, ExecutionStats, ExecutionStatus,
    ExecutionStore, ExecutionUpdate, NewExecution, STORAGE_KEY,
};
