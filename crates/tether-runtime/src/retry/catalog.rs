//! Immutable mapping from service class to retry policy.
//!
//! Built once at start-up from the built-in [`DEFAULT_POLICIES`], optionally
//! overridden by settings, and shared read-only behind an `Arc` afterwards.
//! Looking up a class that is not in the catalog is a configuration error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tether_core::{ErrorKind, PolicyError, RetryPolicy};
use tether_settings::{PolicyOverride, RetrySettings};
use thiserror::Error;
use tracing::debug;

use super::error::UnknownServiceClass;

/// Calls to LLM providers.
pub const LLM: &str = "llm";
/// Calls to the application database.
pub const DATABASE: &str = "database";
/// Calls to MCP servers.
pub const MCP: &str = "mcp";
/// Calls to the secret store.
pub const SECRET: &str = "secret";

/// Unvalidated policy parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct PolicySpec {
    /// Attempts including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// Growth factor between delays.
    pub multiplier: f64,
    /// Randomize delays.
    pub jitter: bool,
    /// Kinds to retry.
    pub retryable: Vec<ErrorKind>,
}

impl PolicySpec {
    /// Validate into a [`RetryPolicy`].
    pub fn build(&self) -> Result<RetryPolicy, PolicyError> {
        RetryPolicy::new(
            self.max_attempts,
            self.base_delay,
            self.max_delay,
            self.multiplier,
            self.jitter,
            self.retryable.iter().copied(),
        )
    }

    /// Overlay the fields present in `o`.
    #[must_use]
    pub fn overridden(mut self, o: &PolicyOverride) -> Self {
        if let Some(v) = o.max_attempts {
            self.max_attempts = v;
        }
        if let Some(v) = o.base_delay_ms {
            self.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = o.max_delay_ms {
            self.max_delay = Duration::from_millis(v);
        }
        if let Some(v) = o.multiplier {
            self.multiplier = v;
        }
        if let Some(v) = o.jitter {
            self.jitter = v;
        }
        if let Some(ref v) = o.retryable_errors {
            self.retryable.clone_from(v);
        }
        self
    }

    /// Starting point for service classes that only exist in settings.
    pub fn template() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
            retryable: transient_kinds(),
        }
    }
}

fn transient_kinds() -> Vec<ErrorKind> {
    ErrorKind::ALL.into_iter().filter(|k| k.is_transient()).collect()
}

/// Built-in policies, one per known service class.
pub fn default_policies() -> Vec<(&'static str, PolicySpec)> {
    vec![
        (
            LLM,
            PolicySpec {
                max_attempts: 3,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
                jitter: true,
                retryable: transient_kinds(),
            },
        ),
        (
            DATABASE,
            PolicySpec {
                max_attempts: 3,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(5),
                multiplier: 2.0,
                jitter: true,
                retryable: vec![
                    ErrorKind::Network,
                    ErrorKind::Timeout,
                    ErrorKind::Unavailable,
                    ErrorKind::Conflict,
                ],
            },
        ),
        (
            MCP,
            PolicySpec {
                max_attempts: 3,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(10),
                multiplier: 2.0,
                jitter: true,
                retryable: vec![ErrorKind::Network, ErrorKind::Timeout, ErrorKind::Unavailable],
            },
        ),
        (
            SECRET,
            PolicySpec {
                max_attempts: 3,
                base_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(5),
                multiplier: 2.0,
                jitter: true,
                retryable: vec![
                    ErrorKind::Network,
                    ErrorKind::Timeout,
                    ErrorKind::RateLimited,
                    ErrorKind::Unavailable,
                ],
            },
        ),
    ]
}

/// Built-in names (for `known_service_classes` and tests).
pub const DEFAULT_POLICIES: [&str; 4] = [LLM, DATABASE, MCP, SECRET];

/// A policy in settings failed validation.
#[derive(Debug, Error)]
#[error("invalid retry policy for service class '{service_class}': {source}")]
pub struct CatalogError {
    /// The offending class.
    pub service_class: String,
    /// Why it is invalid.
    #[source]
    pub source: PolicyError,
}

/// `service_class → RetryPolicy`, immutable after construction.
#[derive(Clone, Debug)]
pub struct PolicyCatalog {
    policies: HashMap<String, Arc<RetryPolicy>>,
}

impl PolicyCatalog {
    /// Catalog with only the built-in policies.
    pub fn defaults() -> Result<Self, CatalogError> {
        Self::from_settings(&RetrySettings::default())
    }

    /// Built-in policies with settings overrides applied.
    ///
    /// Overrides for built-in classes overlay the built-in values; overrides
    /// for new classes overlay [`PolicySpec::template`].
    pub fn from_settings(settings: &RetrySettings) -> Result<Self, CatalogError> {
        let mut specs: HashMap<String, PolicySpec> = default_policies()
            .into_iter()
            .map(|(name, spec)| (name.to_string(), spec))
            .collect();

        for (class, o) in &settings.policies {
            let base = specs.remove(class).unwrap_or_else(PolicySpec::template);
            debug!(service_class = %class, "applying retry policy override");
            let _ = specs.insert(class.clone(), base.overridden(o));
        }

        Self::from_specs(specs)
    }

    /// Build from explicit specs, validating each.
    pub fn from_specs(
        specs: impl IntoIterator<Item = (String, PolicySpec)>,
    ) -> Result<Self, CatalogError> {
        let mut policies = HashMap::new();
        for (class, spec) in specs {
            let policy = spec.build().map_err(|source| CatalogError {
                service_class: class.clone(),
                source,
            })?;
            let _ = policies.insert(class, Arc::new(policy));
        }
        Ok(Self { policies })
    }

    /// Build from already-validated policies.
    pub fn from_policies(policies: impl IntoIterator<Item = (String, RetryPolicy)>) -> Self {
        Self {
            policies: policies
                .into_iter()
                .map(|(class, p)| (class, Arc::new(p)))
                .collect(),
        }
    }

    /// Policy for `service_class`, if registered.
    pub fn get(&self, service_class: &str) -> Option<&Arc<RetryPolicy>> {
        self.policies.get(service_class)
    }

    /// Policy for `service_class`, or [`UnknownServiceClass`].
    pub fn lookup(&self, service_class: &str) -> Result<&Arc<RetryPolicy>, UnknownServiceClass> {
        self.get(service_class)
            .ok_or_else(|| UnknownServiceClass(service_class.to_string()))
    }

    /// Registered service classes, sorted.
    pub fn service_classes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.policies.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered policies.
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Whether no policies are registered.
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
