//! # tether-runtime
//!
//! Async execution of calls into external dependencies under per-service-class
//! retry policies.
//!
//! - [`PolicyCatalog`]: immutable `service_class → RetryPolicy` map, built once
//! - [`RetryPolicyEngine`]: bounded retries with exponential backoff and jitter
//! - [`RetryWrapper`]: a reusable wrapper bound to one policy
//! - [`RetryError`]: what callers of `execute` get back on failure

#![deny(unsafe_code)]

pub mod retry;

pub use retry::catalog::{CatalogError, PolicyCatalog, PolicySpec};
pub use retry::engine::RetryPolicyEngine;
pub use retry::error::{RetryError, UnknownServiceClass};
pub use retry::wrapper::RetryWrapper;
