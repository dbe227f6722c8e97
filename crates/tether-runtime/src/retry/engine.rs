//! Policy-driven retry execution.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tether_core::{Classify, RetryPolicy};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::catalog::PolicyCatalog;
use super::error::{RetryError, UnknownServiceClass};
use super::wrapper::{RetryWrapper, run_with_policy};

type WrapperKey = (String, Option<String>);

/// Executes operations under the catalog policy of their service class.
///
/// The catalog is shared and never mutated; the only mutable state is the
/// wrapper cache, which is a convenience and never affects retry semantics.
pub struct RetryPolicyEngine {
    catalog: Arc<PolicyCatalog>,
    wrappers: Mutex<HashMap<WrapperKey, Arc<RetryWrapper>>>,
}

impl RetryPolicyEngine {
    /// Engine over `catalog`.
    pub fn new(catalog: Arc<PolicyCatalog>) -> Self {
        Self {
            catalog,
            wrappers: Mutex::new(HashMap::new()),
        }
    }

    /// The policy catalog.
    pub fn catalog(&self) -> &Arc<PolicyCatalog> {
        &self.catalog
    }

    /// Run `op` under the policy for `service_class`.
    ///
    /// Returns [`RetryError::UnknownServiceClass`] without invoking `op` when
    /// no policy is registered.
    pub async fn execute<T, E, F, Fut>(
        &self,
        service_class: &str,
        op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let policy = Arc::clone(self.catalog.lookup(service_class)?);
        run_with_policy(service_class, &policy, None, op)
            .instrument(tracing::debug_span!("execute", service_class))
            .await
    }

    /// Like [`execute`](Self::execute), but gives up with
    /// [`RetryError::Cancelled`] once `cancel` fires.
    pub async fn execute_cancellable<T, E, F, Fut>(
        &self,
        service_class: &str,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let policy = Arc::clone(self.catalog.lookup(service_class)?);
        run_with_policy(service_class, &policy, Some(cancel), op)
            .instrument(tracing::debug_span!("execute", service_class))
            .await
    }

    /// Reusable wrapper for an ad-hoc policy. Not registered in the catalog
    /// and not cached.
    pub fn create_custom_decorator(
        &self,
        label: impl Into<String>,
        policy: RetryPolicy,
    ) -> RetryWrapper {
        RetryWrapper::new(label, Arc::new(policy))
    }

    /// Cached wrapper for `(service_class, correlation_id)`.
    pub fn wrapper(
        &self,
        service_class: &str,
        correlation_id: Option<&str>,
    ) -> Result<Arc<RetryWrapper>, UnknownServiceClass> {
        let key = (service_class.to_string(), correlation_id.map(str::to_string));
        let mut wrappers = self.wrappers.lock();
        if let Some(existing) = wrappers.get(&key) {
            return Ok(Arc::clone(existing));
        }

        let policy = Arc::clone(self.catalog.lookup(service_class)?);
        let mut wrapper = RetryWrapper::new(service_class, policy);
        if let Some(id) = correlation_id {
            wrapper = wrapper.with_correlation_id(id);
        }
        let wrapper = Arc::new(wrapper);
        let _ = wrappers.insert(key, Arc::clone(&wrapper));
        Ok(wrapper)
    }

    /// Number of cached wrappers.
    pub fn cached_count(&self) -> usize {
        self.wrappers.lock().len()
    }

    /// Service classes with a registered policy, sorted.
    pub fn known_service_classes(&self) -> Vec<String> {
        self.catalog.service_classes()
    }

    /// Drop every cached wrapper.
    pub fn clear_cache(&self) {
        self.wrappers.lock().clear();
    }
}
