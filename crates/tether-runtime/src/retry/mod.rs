//! Retry execution.
//!
//! Per invocation an operation moves through
//! `ATTEMPTING → SUCCESS | FATAL | EXHAUSTED`, looping through `RETRY_WAIT`
//! between attempts. A cancelled wait abandons the call without reaching
//! either `SUCCESS` or `EXHAUSTED`.

pub mod catalog;
pub mod engine;
pub mod error;
pub mod wrapper;
