//! Service registry with health tracking and client-side load balancing.
//!
//! Holds the set of known instances per logical service and selects one
//! per call using a configurable strategy. Selection is fail-closed: when
//! no eligible instance exists the registry returns `None` rather than
//! erroring, and the caller decides how to surface that.

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Load balancing strategy, selected per call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Round-robin selection with a per-service cursor.
    #[default]
    RoundRobin,
    /// Uniform random selection.
    Random,
    /// Random selection proportional to instance weight.
    Weighted,
    /// Pick the instance with the fewest open connections.
    LeastConnections,
}

/// Specification for registering a service instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Logical service name.
    pub name: String,
    /// Service version.
    #[serde(default = "default_version")]
    pub version: String,
    /// Host name or address.
    pub host: String,
    /// Port number.
    pub port: u16,
    /// Protocol scheme (informational, e.g. "http" or "grpc").
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Relative weight for weighted balancing.
    #[serde(default = "default_instance_weight")]
    pub weight: u32,
    /// Optional URL polled by an external health checker.
    pub health_check_url: Option<String>,
    /// Free-form tags for discovery filtering.
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_instance_weight() -> u32 {
    1
}

impl ServiceSpec {
    /// Creates a spec with the given name, host, and port.
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            host: host.into(),
            port,
            protocol: default_protocol(),
            weight: default_instance_weight(),
            health_check_url: None,
            tags: Vec::new(),
        }
    }

    /// Sets the service version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Sets the protocol scheme.
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    /// Sets the balancing weight.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Sets the health check URL.
    pub fn with_health_check_url(mut self, url: impl Into<String>) -> Self {
        self.health_check_url = Some(url.into());
        self
    }

    /// Adds a discovery tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// A registered service instance.
///
/// The health flag and open-connection counter are atomics so selection,
/// health flips, and connection release never take an exclusive registry
/// lock. Shared via `Arc`; identity fields are immutable after
/// registration.
#[derive(Debug)]
pub struct ServiceInstance {
    /// Registry-assigned id, unique within the owning service.
    pub id: String,
    /// Logical service name.
    pub service: String,
    /// Service version.
    pub version: String,
    /// Host name or address.
    pub host: String,
    /// Port number.
    pub port: u16,
    /// Protocol scheme.
    pub protocol: String,
    /// Relative weight for weighted balancing.
    pub weight: u32,
    /// Optional URL polled by an external health checker.
    pub health_check_url: Option<String>,
    /// Free-form tags.
    pub tags: Vec<String>,
    /// Registration time, milliseconds since the Unix epoch.
    pub registered_at_ms: u64,
    healthy: AtomicBool,
    open_connections: AtomicUsize,
}

impl ServiceInstance {
    fn from_spec(id: String, spec: ServiceSpec) -> Self {
        let registered_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            id,
            service: spec.name,
            version: spec.version,
            host: spec.host,
            port: spec.port,
            protocol: spec.protocol,
            weight: spec.weight,
            health_check_url: spec.health_check_url,
            tags: spec.tags,
            registered_at_ms,
            healthy: AtomicBool::new(true),
            open_connections: AtomicUsize::new(0),
        }
    }

    /// Returns whether the instance is currently marked healthy.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Returns the number of open connections held against this instance.
    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::Relaxed)
    }

    /// Returns the instance address as `protocol://host:port`.
    pub fn address(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }
}

/// Filters applied during discovery. All set fields are ANDed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryFilter {
    /// Only return instances marked healthy.
    pub healthy_only: bool,
    /// Only return instances of this version.
    pub version: Option<String>,
    /// Only return instances carrying all of these tags.
    pub tags: Vec<String>,
}

impl Default for DiscoveryFilter {
    fn default() -> Self {
        Self {
            healthy_only: true,
            version: None,
            tags: Vec::new(),
        }
    }
}

impl DiscoveryFilter {
    /// Creates the default filter (healthy instances only).
    pub fn new() -> Self {
        Self::default()
    }

    /// Includes unhealthy instances in results.
    pub fn include_unhealthy(mut self) -> Self {
        self.healthy_only = false;
        self
    }

    /// Restricts results to one version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Requires a tag to be present.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    fn matches(&self, instance: &ServiceInstance) -> bool {
        if self.healthy_only && !instance.is_healthy() {
            return false;
        }

        if let Some(version) = &self.version {
            if &instance.version != version {
                return false;
            }
        }

        self.tags.iter().all(|t| instance.tags.contains(t))
    }
}

/// Selection counts broken down by strategy.
#[derive(Debug, Clone, Serialize)]
pub struct StrategySelections {
    pub round_robin: u64,
    pub random: u64,
    pub weighted: u64,
    pub least_connections: u64,
}

/// Statistics about registry activity.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub registrations: u64,
    pub deregistrations: u64,
    pub selections: u64,
    pub failed_selections: u64,
    pub by_strategy: StrategySelections,
    pub services: usize,
    pub instances: usize,
    pub healthy_instances: usize,
}

/// In-memory service registry.
pub struct ServiceRegistry {
    services: DashMap<String, Vec<Arc<ServiceInstance>>>,
    by_id: DashMap<String, Arc<ServiceInstance>>,
    cursors: DashMap<String, AtomicUsize>,
    id_seq: AtomicU64,
    registrations: AtomicU64,
    deregistrations: AtomicU64,
    selections: AtomicU64,
    failed_selections: AtomicU64,
    round_robin_selections: AtomicU64,
    random_selections: AtomicU64,
    weighted_selections: AtomicU64,
    least_connections_selections: AtomicU64,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
            by_id: DashMap::new(),
            cursors: DashMap::new(),
            id_seq: AtomicU64::new(0),
            registrations: AtomicU64::new(0),
            deregistrations: AtomicU64::new(0),
            selections: AtomicU64::new(0),
            failed_selections: AtomicU64::new(0),
            round_robin_selections: AtomicU64::new(0),
            random_selections: AtomicU64::new(0),
            weighted_selections: AtomicU64::new(0),
            least_connections_selections: AtomicU64::new(0),
        }
    }

    /// Registers a new instance and returns it.
    ///
    /// Always succeeds; the registry assigns a fresh id and every
    /// instance starts healthy.
    pub fn register(&self, spec: ServiceSpec) -> Arc<ServiceInstance> {
        let seq = self.id_seq.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}-{}-{:04x}", spec.name, seq, rand::thread_rng().gen::<u16>());
        let instance = Arc::new(ServiceInstance::from_spec(id, spec));

        self.services
            .entry(instance.service.clone())
            .or_default()
            .push(Arc::clone(&instance));
        self.by_id.insert(instance.id.clone(), Arc::clone(&instance));
        self.registrations.fetch_add(1, Ordering::Relaxed);

        debug!(
            service = %instance.service,
            instance = %instance.id,
            version = %instance.version,
            address = %instance.address(),
            "instance registered"
        );

        instance
    }

    /// Removes an instance. Returns `false` if it was not registered.
    pub fn deregister(&self, service: &str, instance_id: &str) -> bool {
        let removed = match self.services.get_mut(service) {
            Some(mut instances) => {
                let before = instances.len();
                instances.retain(|i| i.id != instance_id);
                before != instances.len()
            }
            None => false,
        };

        if removed {
            self.by_id.remove(instance_id);
            self.deregistrations.fetch_add(1, Ordering::Relaxed);
            debug!(service = %service, instance = %instance_id, "instance deregistered");
        }

        removed
    }

    /// Returns all instances of a service matching the filter.
    pub fn discover(&self, service: &str, filter: &DiscoveryFilter) -> Vec<Arc<ServiceInstance>> {
        self.services
            .get(service)
            .map(|instances| {
                instances
                    .iter()
                    .filter(|i| filter.matches(i))
                    .map(Arc::clone)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Selects one instance using the given strategy.
    ///
    /// Returns `None` when no instance matches the filter. On success the
    /// instance's open-connection counter is incremented; the caller must
    /// pair every selection with [`release_connection`], even on failure,
    /// or least-connections balancing will skew.
    ///
    /// [`release_connection`]: ServiceRegistry::release_connection
    pub fn get_instance(
        &self,
        service: &str,
        strategy: LoadBalancingStrategy,
        filter: &DiscoveryFilter,
    ) -> Option<Arc<ServiceInstance>> {
        let eligible = self.discover(service, filter);

        if eligible.is_empty() {
            self.failed_selections.fetch_add(1, Ordering::Relaxed);
            debug!(service = %service, "no eligible instance");
            return None;
        }

        let instance = match strategy {
            LoadBalancingStrategy::RoundRobin => {
                self.round_robin_selections.fetch_add(1, Ordering::Relaxed);
                self.pick_round_robin(service, &eligible)
            }
            LoadBalancingStrategy::Random => {
                self.random_selections.fetch_add(1, Ordering::Relaxed);
                self.pick_random(&eligible)
            }
            LoadBalancingStrategy::Weighted => {
                self.weighted_selections.fetch_add(1, Ordering::Relaxed);
                self.pick_weighted(&eligible)
            }
            LoadBalancingStrategy::LeastConnections => {
                self.least_connections_selections
                    .fetch_add(1, Ordering::Relaxed);
                self.pick_least_connections(&eligible)
            }
        };

        instance.open_connections.fetch_add(1, Ordering::Relaxed);
        self.selections.fetch_add(1, Ordering::Relaxed);

        debug!(
            service = %service,
            instance = %instance.id,
            strategy = ?strategy,
            open_connections = instance.open_connections(),
            "instance selected"
        );

        Some(instance)
    }

    fn pick_round_robin(
        &self,
        service: &str,
        eligible: &[Arc<ServiceInstance>],
    ) -> Arc<ServiceInstance> {
        let cursor = self
            .cursors
            .entry(service.to_string())
            .or_insert_with(|| AtomicUsize::new(0));
        let idx = cursor.fetch_add(1, Ordering::Relaxed) % eligible.len();
        Arc::clone(&eligible[idx])
    }

    fn pick_random(&self, eligible: &[Arc<ServiceInstance>]) -> Arc<ServiceInstance> {
        let idx = rand::thread_rng().gen_range(0..eligible.len());
        Arc::clone(&eligible[idx])
    }

    fn pick_weighted(&self, eligible: &[Arc<ServiceInstance>]) -> Arc<ServiceInstance> {
        let total: u64 = eligible.iter().map(|i| u64::from(i.weight)).sum();
        if total == 0 {
            return self.pick_random(eligible);
        }

        let mut draw = rand::thread_rng().gen_range(0..total);
        for instance in eligible {
            let weight = u64::from(instance.weight);
            if draw < weight {
                return Arc::clone(instance);
            }
            draw -= weight;
        }

        // Unreachable when weights sum correctly; keep the last as a guard.
        Arc::clone(eligible.last().expect("eligible list is non-empty"))
    }

    fn pick_least_connections(&self, eligible: &[Arc<ServiceInstance>]) -> Arc<ServiceInstance> {
        let instance = eligible
            .iter()
            .min_by_key(|i| i.open_connections())
            .expect("eligible list is non-empty");
        Arc::clone(instance)
    }

    /// Updates an instance's health flag. Returns `false` if unknown.
    pub fn set_health(&self, service: &str, instance_id: &str, healthy: bool) -> bool {
        let found = self
            .services
            .get(service)
            .and_then(|instances| instances.iter().find(|i| i.id == instance_id).map(Arc::clone));

        match found {
            Some(instance) => {
                let was = instance.healthy.swap(healthy, Ordering::Relaxed);
                if was != healthy {
                    if healthy {
                        debug!(service = %service, instance = %instance_id, "instance marked healthy");
                    } else {
                        warn!(service = %service, instance = %instance_id, "instance marked unhealthy");
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Releases one open connection held against an instance.
    ///
    /// Saturates at zero; releasing an unknown id is a no-op.
    pub fn release_connection(&self, instance_id: &str) {
        if let Some(instance) = self.by_id.get(instance_id) {
            let _ = instance
                .open_connections
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1));
        }
    }

    /// Returns the names of all registered services.
    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }

    /// Returns registry statistics.
    pub fn stats(&self) -> RegistryStats {
        let mut instances = 0;
        let mut healthy_instances = 0;
        for entry in self.services.iter() {
            instances += entry.value().len();
            healthy_instances += entry.value().iter().filter(|i| i.is_healthy()).count();
        }

        RegistryStats {
            registrations: self.registrations.load(Ordering::Relaxed),
            deregistrations: self.deregistrations.load(Ordering::Relaxed),
            selections: self.selections.load(Ordering::Relaxed),
            failed_selections: self.failed_selections.load(Ordering::Relaxed),
            by_strategy: StrategySelections {
                round_robin: self.round_robin_selections.load(Ordering::Relaxed),
                random: self.random_selections.load(Ordering::Relaxed),
                weighted: self.weighted_selections.load(Ordering::Relaxed),
                least_connections: self.least_connections_selections.load(Ordering::Relaxed),
            },
            services: self.services.len(),
            instances,
            healthy_instances,
        }
    }

    /// Resets activity counters. Registered instances are untouched.
    pub fn reset_stats(&self) {
        self.registrations.store(0, Ordering::Relaxed);
        self.deregistrations.store(0, Ordering::Relaxed);
        self.selections.store(0, Ordering::Relaxed);
        self.failed_selections.store(0, Ordering::Relaxed);
        self.round_robin_selections.store(0, Ordering::Relaxed);
        self.random_selections.store(0, Ordering::Relaxed);
        self.weighted_selections.store(0, Ordering::Relaxed);
        self.least_connections_selections.store(0, Ordering::Relaxed);
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
