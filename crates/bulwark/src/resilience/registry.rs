//! Named policy instances
//!
//! A [`PolicyRegistry`] maps service names to one kind of policy. The
//! [`ResilienceRegistry`] bundles one registry per kind together with the
//! settings used to create missing instances on first lookup.
//!
//! Instances live until removed. Replacing or removing an instance does not
//! affect callers that already hold a clone of it.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, OnceLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use super::bulkhead::Bulkhead;
use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfigBuilder};
use super::clock::{Clock, SystemClock};
use super::decorators::{Policies, ResilientSpec};
use super::error::{ConfigError, ConfigResult};
use super::rate_limiter::RateLimiter;
use super::retry::{Retry, RetryConfigBuilder};
use super::thread_pool_bulkhead::ThreadPoolBulkhead;
use crate::config::ResilienceSettings;

//==============================================================================
// Typed Registry
//==============================================================================

/// Concurrent name → policy map for one policy kind
pub struct PolicyRegistry<P> {
    kind: &'static str,
    entries: DashMap<String, P>,
}

impl<P: Clone> PolicyRegistry<P> {
    pub fn new(kind: &'static str) -> Self {
        Self { kind, entries: DashMap::new() }
    }

    /// Human-readable policy kind, e.g. `"circuit breaker"`
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Add a new instance
    ///
    /// # Errors
    /// Returns [`ConfigError::AlreadyRegistered`] if the name is taken.
    pub fn register(&self, name: impl Into<String>, policy: P) -> ConfigResult<P> {
        match self.entries.entry(name.into()) {
            Entry::Occupied(entry) => {
                Err(ConfigError::AlreadyRegistered { kind: self.kind, name: entry.key().clone() })
            }
            Entry::Vacant(entry) => {
                debug!(kind = self.kind, name = %entry.key(), "Registered policy");
                Ok(entry.insert(policy).value().clone())
            }
        }
    }

    /// Insert or swap an instance, returning the previous one
    pub fn replace(&self, name: impl Into<String>, policy: P) -> Option<P> {
        let name = name.into();
        debug!(kind = self.kind, name = %name, "Replaced policy");
        self.entries.insert(name, policy)
    }

    pub fn get(&self, name: &str) -> Option<P> {
        self.entries.get(name).map(|entry| entry.value().clone())
    }

    /// Like [`get`](Self::get) but missing names are an error
    pub fn require(&self, name: &str) -> ConfigResult<P> {
        self.get(name)
            .ok_or_else(|| ConfigError::UnknownInstance { kind: self.kind, name: name.to_string() })
    }

    /// Return the instance under `name`, creating it with `create` if absent
    ///
    /// Concurrent callers for the same name observe a single instance.
    pub fn get_or_try_insert_with<F>(&self, name: &str, create: F) -> ConfigResult<P>
    where
        F: FnOnce() -> ConfigResult<P>,
    {
        if let Some(existing) = self.get(name) {
            return Ok(existing);
        }
        match self.entries.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let policy = create()?;
                debug!(kind = self.kind, name, "Created policy on first lookup");
                Ok(entry.insert(policy).value().clone())
            }
        }
    }

    pub fn remove(&self, name: &str) -> Option<P> {
        self.entries.remove(name).map(|(_, policy)| policy)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let names: BTreeSet<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.into_iter().collect()
    }

    /// Every registered instance with its name, sorted by name
    pub fn all(&self) -> Vec<(String, P)> {
        let mut all: Vec<(String, P)> =
            self.entries.iter().map(|e| (e.key().clone(), e.value().clone())).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl<P> fmt::Debug for PolicyRegistry<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyRegistry")
            .field("kind", &self.kind)
            .field("len", &self.entries.len())
            .finish()
    }
}

//==============================================================================
// Resilience Registry
//==============================================================================

type BreakerCustomizer =
    Arc<dyn Fn(&str, CircuitBreakerConfigBuilder) -> CircuitBreakerConfigBuilder + Send + Sync>;
type RetryCustomizer = Arc<dyn Fn(&str, RetryConfigBuilder) -> RetryConfigBuilder + Send + Sync>;

/// All named policies of a process
///
/// # Examples
///
/// ```rust
/// use bulwark::config::ResilienceSettings;
/// use bulwark::resilience::{ResilienceRegistry, ResilientSpec};
///
/// let registry = ResilienceRegistry::from_settings(ResilienceSettings::default())?;
/// let policies = registry.policies_for(&ResilientSpec::new("payment-service"))?;
///
/// assert!(policies.circuit_breaker.is_some());
/// assert!(policies.bulkhead.is_none());
/// # Ok::<(), bulwark::resilience::ConfigError>(())
/// ```
pub struct ResilienceRegistry {
    settings: ResilienceSettings,
    clock: Arc<dyn Clock>,
    breaker_customizer: Option<BreakerCustomizer>,
    retry_customizer: Option<RetryCustomizer>,
    circuit_breakers: PolicyRegistry<CircuitBreaker>,
    retries: PolicyRegistry<Retry>,
    rate_limiters: PolicyRegistry<RateLimiter>,
    bulkheads: PolicyRegistry<Bulkhead>,
    thread_pool_bulkheads: PolicyRegistry<ThreadPoolBulkhead>,
}

impl fmt::Debug for ResilienceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceRegistry")
            .field("circuit_breakers", &self.circuit_breakers)
            .field("retries", &self.retries)
            .field("rate_limiters", &self.rate_limiters)
            .field("bulkheads", &self.bulkheads)
            .field("thread_pool_bulkheads", &self.thread_pool_bulkheads)
            .finish_non_exhaustive()
    }
}

impl Default for ResilienceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ResilienceRegistry {
    /// Empty registry creating instances from default settings
    pub fn new() -> Self {
        Self::assemble(ResilienceSettings::default(), Arc::new(SystemClock), None, None)
    }

    pub fn builder() -> ResilienceRegistryBuilder {
        ResilienceRegistryBuilder::default()
    }

    /// Validate `settings` and create every policy section they name
    ///
    /// # Errors
    /// Returns the first configuration error; no registry is produced.
    pub fn from_settings(settings: ResilienceSettings) -> ConfigResult<Self> {
        Self::builder().settings(settings).build()
    }

    fn assemble(
        settings: ResilienceSettings,
        clock: Arc<dyn Clock>,
        breaker_customizer: Option<BreakerCustomizer>,
        retry_customizer: Option<RetryCustomizer>,
    ) -> Self {
        Self {
            settings,
            clock,
            breaker_customizer,
            retry_customizer,
            circuit_breakers: PolicyRegistry::new("circuit breaker"),
            retries: PolicyRegistry::new("retry"),
            rate_limiters: PolicyRegistry::new("rate limiter"),
            bulkheads: PolicyRegistry::new("bulkhead"),
            thread_pool_bulkheads: PolicyRegistry::new("thread-pool bulkhead"),
        }
    }

    fn create_configured(&self) -> ConfigResult<()> {
        for (service, overrides) in &self.settings.services {
            if overrides.circuit_breaker.is_some() {
                self.circuit_breaker(service)?;
            }
            if overrides.retry.is_some() {
                self.retry(service)?;
            }
            if overrides.rate_limiter.is_some() {
                self.rate_limiter(service)?;
            }
            if overrides.bulkhead.is_some() {
                self.bulkhead(service)?;
            }
            if overrides.thread_pool_bulkhead.is_some() {
                self.thread_pool_bulkhead(service)?;
            }
        }
        Ok(())
    }

    pub fn settings(&self) -> &ResilienceSettings {
        &self.settings
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn circuit_breakers(&self) -> &PolicyRegistry<CircuitBreaker> {
        &self.circuit_breakers
    }

    pub fn retries(&self) -> &PolicyRegistry<Retry> {
        &self.retries
    }

    pub fn rate_limiters(&self) -> &PolicyRegistry<RateLimiter> {
        &self.rate_limiters
    }

    pub fn bulkheads(&self) -> &PolicyRegistry<Bulkhead> {
        &self.bulkheads
    }

    pub fn thread_pool_bulkheads(&self) -> &PolicyRegistry<ThreadPoolBulkhead> {
        &self.thread_pool_bulkheads
    }

    // ---- Get-or-create lookups ----

    pub fn circuit_breaker(&self, name: &str) -> ConfigResult<CircuitBreaker> {
        self.circuit_breakers.get_or_try_insert_with(name, || {
            let mut builder = self.settings.circuit_breaker(name)?.to_builder();
            if let Some(customize) = &self.breaker_customizer {
                builder = customize(name, builder);
            }
            CircuitBreaker::with_clock(name, builder.build()?, Arc::clone(&self.clock))
        })
    }

    pub fn retry(&self, name: &str) -> ConfigResult<Retry> {
        self.retries.get_or_try_insert_with(name, || {
            let mut builder = self.settings.retry(name)?.to_builder();
            if let Some(customize) = &self.retry_customizer {
                builder = customize(name, builder);
            }
            Retry::with_clock(name, builder.build()?, Arc::clone(&self.clock))
        })
    }

    pub fn rate_limiter(&self, name: &str) -> ConfigResult<RateLimiter> {
        self.rate_limiters.get_or_try_insert_with(name, || {
            let config = self.settings.rate_limiter(name)?.to_config()?;
            RateLimiter::with_clock(name, config, Arc::clone(&self.clock))
        })
    }

    pub fn bulkhead(&self, name: &str) -> ConfigResult<Bulkhead> {
        self.bulkheads.get_or_try_insert_with(name, || {
            let config = self.settings.bulkhead(name)?.to_config()?;
            Bulkhead::with_clock(name, config, Arc::clone(&self.clock))
        })
    }

    pub fn thread_pool_bulkhead(&self, name: &str) -> ConfigResult<ThreadPoolBulkhead> {
        self.thread_pool_bulkheads.get_or_try_insert_with(name, || {
            let config = self.settings.thread_pool_bulkhead(name)?.to_config()?;
            ThreadPoolBulkhead::with_clock(name, config, Arc::clone(&self.clock))
        })
    }

    /// Resolve the policies a [`ResilientSpec`] enables
    pub fn policies_for(&self, spec: &ResilientSpec) -> ConfigResult<Policies> {
        let name = spec.name.as_str();
        Ok(Policies {
            bulkhead: spec.enable_bulkhead.then(|| self.bulkhead(name)).transpose()?,
            rate_limiter: spec.enable_rate_limiter.then(|| self.rate_limiter(name)).transpose()?,
            circuit_breaker: spec
                .enable_circuit_breaker
                .then(|| self.circuit_breaker(name))
                .transpose()?,
            retry: spec.enable_retry.then(|| self.retry(name)).transpose()?,
        })
    }

    /// Drop every policy registered under `name`
    pub fn remove_service(&self, name: &str) {
        self.circuit_breakers.remove(name);
        self.retries.remove(name);
        self.rate_limiters.remove(name);
        self.bulkheads.remove(name);
        if let Some(pool) = self.thread_pool_bulkheads.remove(name) {
            pool.shutdown();
        }
    }

    /// Drop every instance; thread pools are shut down
    pub fn clear(&self) {
        for (_, pool) in self.thread_pool_bulkheads.all() {
            pool.shutdown();
        }
        self.circuit_breakers.clear();
        self.retries.clear();
        self.rate_limiters.clear();
        self.bulkheads.clear();
        self.thread_pool_bulkheads.clear();
        info!("Resilience registry cleared");
    }
}

/// Builder for [`ResilienceRegistry`]
#[derive(Default)]
pub struct ResilienceRegistryBuilder {
    settings: ResilienceSettings,
    clock: Option<Arc<dyn Clock>>,
    breaker_customizer: Option<BreakerCustomizer>,
    retry_customizer: Option<RetryCustomizer>,
}

impl fmt::Debug for ResilienceRegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceRegistryBuilder")
            .field("settings", &self.settings)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl ResilienceRegistryBuilder {
    pub fn settings(mut self, settings: ResilienceSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Adjust every circuit breaker config before it is built, e.g. to attach
    /// failure classifiers
    pub fn customize_circuit_breakers<F>(mut self, customize: F) -> Self
    where
        F: Fn(&str, CircuitBreakerConfigBuilder) -> CircuitBreakerConfigBuilder
            + Send
            + Sync
            + 'static,
    {
        self.breaker_customizer = Some(Arc::new(customize));
        self
    }

    /// Adjust every retry config before it is built
    pub fn customize_retries<F>(mut self, customize: F) -> Self
    where
        F: Fn(&str, RetryConfigBuilder) -> RetryConfigBuilder + Send + Sync + 'static,
    {
        self.retry_customizer = Some(Arc::new(customize));
        self
    }

    /// Validate the settings and create every configured instance
    pub fn build(self) -> ConfigResult<ResilienceRegistry> {
        self.settings.validate()?;
        let registry = ResilienceRegistry::assemble(
            self.settings,
            self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            self.breaker_customizer,
            self.retry_customizer,
        );
        registry.create_configured()?;
        info!(
            services = registry.settings.services.len(),
            circuit_breakers = registry.circuit_breakers.len(),
            "Resilience registry initialized"
        );
        Ok(registry)
    }
}

//==============================================================================
// Process-wide Registry
//==============================================================================

static GLOBAL_REGISTRY: OnceLock<ResilienceRegistry> = OnceLock::new();

/// Install the process-wide registry
///
/// # Errors
/// Fails if a registry was already installed or [`global`] was called first.
pub fn init_global(registry: ResilienceRegistry) -> ConfigResult<&'static ResilienceRegistry> {
    GLOBAL_REGISTRY
        .set(registry)
        .map_err(|_| ConfigError::invalid("global resilience registry already initialized"))?;
    GLOBAL_REGISTRY
        .get()
        .ok_or_else(|| ConfigError::invalid("global resilience registry unavailable"))
}

/// The process-wide registry, created with default settings on first use
pub fn global() -> &'static ResilienceRegistry {
    GLOBAL_REGISTRY.get_or_init(ResilienceRegistry::new)
}
