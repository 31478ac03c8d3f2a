//! Run record persistence for the saga executor.
//!
//! A run record is the full durable state of one saga execution: where it
//! is, what every step did, the serialized context, and an audit journal.
//! Stores treat the context as an opaque JSON blob.

pub mod error;
pub mod journal;
pub mod memory;
pub mod postgres;
pub mod record;
pub mod state;
pub mod store;

pub use common::{ErrorKind, RunId};
pub use error::{Result, RunStoreError};
pub use journal::{AttemptFailedData, CompensationData, JournalEntry, RunEvent, StepData};
pub use memory::InMemoryRunStore;
pub use postgres::PostgresRunStore;
pub use record::{RunRecord, StepFailure, StepRecord};
pub use state::{RunStatus, StepStatus};
pub use store::RunStore;
