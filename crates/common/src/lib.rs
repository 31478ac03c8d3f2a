//! Shared types used by the run store and the saga executor.

mod error_kind;
mod types;

pub use error_kind::ErrorKind;
pub use types::{ParseRunIdError, RunId};
