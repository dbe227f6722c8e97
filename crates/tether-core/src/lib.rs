//! # tether-core
//!
//! Foundation types shared by every Tether crate:
//!
//! - **Branded IDs**: [`ConnectionId`], [`SessionId`] as newtypes for type safety
//! - **Error kinds**: [`ErrorKind`] plus the [`Classify`] trait that retry
//!   policies match against
//! - **Retry policies**: [`RetryPolicy`] with construction-time validation and
//!   the backoff math (the async execution lives in `tether-runtime`)
//! - **Logging**: [`logging::init_subscriber`] for the `tracing` subscriber

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod retry;

pub use errors::{Classify, DependencyError, ErrorKind};
pub use ids::{ConnectionId, SessionId};
pub use retry::{PolicyError, RetryPolicy};
