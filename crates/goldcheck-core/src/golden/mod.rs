//! Golden data: test cases, their file format, and batch construction.
//!
//! - [`GoldenCase`] - One prompt with its token ids and reference logits
//! - [`GoldenCaseLoader`] - Lazy reader for JSON-lines golden files
//! - [`GoldenCaseWriter`] - Writer for producing golden files
//! - [`BatchInputBuilder`] - Expands a case into the batch the model expects

mod batch;
mod case;

pub use batch::{BatchInputBuilder, BatchedInput, ACTIVE_SEQUENCE_SEGMENT};
pub use case::{GoldenCase, GoldenCaseLoader, GoldenCaseWriter, GoldenCases};
