//! Mesh orchestrator: routing, discovery, auth, and retries per call.
//!
//! [`ServiceMesh::call`] is the single hot-path entry point. Per call it
//! sequences version routing, instance discovery, request signing and
//! ACL checks, retry-wrapped execution, and connection release, while
//! recording timing and outcome statistics for the observability layer.

use crate::auth::ServiceAuthenticator;
use crate::breaker::{BreakerStats, CircuitBreakerSet};
use crate::config::{ConfigError, MeshConfig};
use crate::error::MeshError;
use crate::metrics::Metrics;
use crate::registry::{
    DiscoveryFilter, LoadBalancingStrategy, RegistryStats, ServiceInstance, ServiceRegistry,
};
use crate::retry::{RetryConfig, RetryEngine, RetryError, RetryStats};
use crate::traffic::{RoutingContext, TrafficRouter, TrafficStats};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Error returned by [`ServiceMesh::call`].
#[derive(Debug)]
pub enum CallError<E> {
    /// The control plane refused or failed the call before completion.
    Mesh(MeshError),
    /// The operation failed under the retry engine.
    Retry(RetryError<E>),
    /// The operation failed in a direct, single-attempt execution
    /// (mesh disabled or retries disabled for this call).
    Operation(E),
}

impl<E> From<MeshError> for CallError<E> {
    fn from(e: MeshError) -> Self {
        CallError::Mesh(e)
    }
}

impl<E: std::fmt::Display> std::fmt::Display for CallError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Mesh(e) => write!(f, "{}", e),
            CallError::Retry(e) => write!(f, "{}", e),
            CallError::Operation(e) => write!(f, "operation failed: {}", e),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for CallError<E> {}

/// Per-call options for [`ServiceMesh::call`].
#[derive(Debug, Clone)]
pub struct ServiceCallOptions {
    /// Logical service being called.
    pub target_service: String,
    /// Version to use when the router makes no decision.
    pub target_version: Option<String>,
    /// Load balancing strategy for instance selection.
    pub load_balancing: LoadBalancingStrategy,
    /// Attributes for rule-based routing.
    pub routing_context: Option<RoutingContext>,
    /// Whether the retry engine wraps this call.
    pub retry_enabled: bool,
    /// Named retry policy; defaults to the target service name.
    pub retry_policy: Option<String>,
    /// Per-call retry config override.
    pub retry_override: Option<RetryConfig>,
    /// Whether signing/ACL checks apply to this call.
    pub auth_enabled: bool,
    /// Permission required on the ACL entry, if any.
    pub permission: Option<String>,
}

impl ServiceCallOptions {
    /// Creates options targeting a service, with retries and auth on.
    pub fn new(target_service: impl Into<String>) -> Self {
        Self {
            target_service: target_service.into(),
            target_version: None,
            load_balancing: LoadBalancingStrategy::default(),
            routing_context: None,
            retry_enabled: true,
            retry_policy: None,
            retry_override: None,
            auth_enabled: true,
            permission: None,
        }
    }

    /// Pins a fallback version used when routing makes no decision.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.target_version = Some(version.into());
        self
    }

    /// Sets the load balancing strategy.
    pub fn with_load_balancing(mut self, strategy: LoadBalancingStrategy) -> Self {
        self.load_balancing = strategy;
        self
    }

    /// Attaches a routing context.
    pub fn with_routing_context(mut self, ctx: RoutingContext) -> Self {
        self.routing_context = Some(ctx);
        self
    }

    /// Enables or disables retries for this call.
    pub fn with_retries(mut self, enabled: bool) -> Self {
        self.retry_enabled = enabled;
        self
    }

    /// Uses a named retry policy instead of the target service name.
    pub fn with_retry_policy(mut self, name: impl Into<String>) -> Self {
        self.retry_policy = Some(name.into());
        self
    }

    /// Overrides the retry configuration for this call.
    pub fn with_retry_override(mut self, config: RetryConfig) -> Self {
        self.retry_override = Some(config);
        self
    }

    /// Enables or disables auth for this call.
    pub fn with_auth(mut self, enabled: bool) -> Self {
        self.auth_enabled = enabled;
        self
    }

    /// Requires a named permission on the ACL entry.
    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permission = Some(permission.into());
        self
    }
}

/// Aggregated statistics across the mesh and its components.
#[derive(Debug, Clone, Serialize)]
pub struct MeshStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub mesh_rejections: u64,
    pub avg_latency_ms: f64,
    pub registry: RegistryStats,
    pub retry: RetryStats,
    pub traffic: TrafficStats,
    pub auth: crate::auth::AuthStats,
    pub breaker: BreakerStats,
}

/// Health summary for the external observability layer.
#[derive(Debug, Clone, Serialize)]
pub struct MeshHealth {
    pub healthy: bool,
    pub enabled: bool,
    pub initialized: bool,
    pub services: usize,
    pub instances: usize,
    pub healthy_instances: usize,
    pub open_breakers: usize,
    pub certificates: usize,
}

#[derive(Debug, Default)]
struct LatencyTracker {
    avg_ms: f64,
    samples: u64,
}

impl LatencyTracker {
    fn record(&mut self, sample_ms: f64) {
        self.samples += 1;
        self.avg_ms += (sample_ms - self.avg_ms) / self.samples as f64;
    }
}

/// Handles for the mesh's periodic background tasks.
///
/// Dropping without [`shutdown`] leaves the tasks running until the
/// runtime shuts down.
///
/// [`shutdown`]: BackgroundTasks::shutdown
pub struct BackgroundTasks {
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Signals both tasks to stop and waits for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// The service-mesh control plane.
///
/// Components are plain constructed values injected at build time, so
/// tests can run any number of independent meshes side by side.
pub struct ServiceMesh {
    config: RwLock<MeshConfig>,
    registry: Arc<ServiceRegistry>,
    retries: Arc<RetryEngine>,
    router: Arc<TrafficRouter>,
    auth: Arc<ServiceAuthenticator>,
    breakers: Arc<CircuitBreakerSet>,
    initialized: AtomicBool,
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    mesh_rejections: AtomicU64,
    latency: Mutex<LatencyTracker>,
}

impl ServiceMesh {
    /// Builds a mesh with fresh components from the given configuration.
    pub fn new(config: MeshConfig) -> Self {
        let auth = Arc::new(ServiceAuthenticator::new(config.certificate_validity));
        Self::with_components(
            config,
            Arc::new(ServiceRegistry::new()),
            Arc::new(RetryEngine::with_defaults()),
            Arc::new(TrafficRouter::new()),
            auth,
            Arc::new(CircuitBreakerSet::with_defaults()),
        )
    }

    /// Builds a mesh around pre-constructed components.
    pub fn with_components(
        config: MeshConfig,
        registry: Arc<ServiceRegistry>,
        retries: Arc<RetryEngine>,
        router: Arc<TrafficRouter>,
        auth: Arc<ServiceAuthenticator>,
        breakers: Arc<CircuitBreakerSet>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            registry,
            retries,
            router,
            auth,
            breakers,
            initialized: AtomicBool::new(false),
            calls: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            mesh_rejections: AtomicU64::new(0),
            latency: Mutex::new(LatencyTracker::default()),
        }
    }

    /// Seeds default retry policies. Idempotent; later calls are no-ops.
    pub fn initialize(&self) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return;
        }

        self.retries
            .register_policy("default", RetryConfig::default());
        self.retries.register_policy(
            "critical",
            RetryConfig::new()
                .with_max_attempts(5)
                .with_base_delay(std::time::Duration::from_millis(200))
                .with_budget_percent(30.0),
        );
        self.retries.register_policy(
            "fast",
            RetryConfig::new()
                .with_max_attempts(2)
                .with_base_delay(std::time::Duration::from_millis(50))
                .with_timeout(std::time::Duration::from_secs(5)),
        );

        info!(policies = self.retries.policy_count(), "mesh initialized");
    }

    /// Returns the service registry.
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Returns the retry engine.
    pub fn retries(&self) -> &Arc<RetryEngine> {
        &self.retries
    }

    /// Returns the traffic router.
    pub fn router(&self) -> &Arc<TrafficRouter> {
        &self.router
    }

    /// Returns the authenticator.
    pub fn auth(&self) -> &Arc<ServiceAuthenticator> {
        &self.auth
    }

    /// Returns the circuit breaker set.
    pub fn breakers(&self) -> &Arc<CircuitBreakerSet> {
        &self.breakers
    }

    /// Returns a copy of the current configuration.
    pub fn get_config(&self) -> MeshConfig {
        self.config.read().clone()
    }

    /// Replaces the configuration after validating it.
    pub fn update_config(&self, config: MeshConfig) -> Result<(), ConfigError> {
        config.validate()?;
        info!(enabled = config.enabled, "mesh configuration updated");
        *self.config.write() = config;
        Ok(())
    }

    /// Invokes an operation through the mesh.
    ///
    /// Sequences routing, discovery, authentication, retry-wrapped
    /// execution, and connection release, then records timing and
    /// outcome. With the mesh disabled the operation runs directly.
    pub async fn call<F, Fut, T, E>(
        &self,
        source_service_id: &str,
        options: ServiceCallOptions,
        mut f: F,
    ) -> Result<T, CallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let config = self.config.read().clone();

        if !config.enabled {
            return f().await.map_err(CallError::Operation);
        }

        self.calls.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let target = options.target_service.clone();

        if config.circuit_breaker_enabled && !self.breakers.allow(&target) {
            return Err(self.reject(&target, MeshError::CircuitOpen { service: target.clone() }));
        }

        // Routing decides the version; the caller's pinned version is the
        // fallback when the router abstains.
        let mut version = options.target_version.clone();
        if config.routing_enabled {
            if let Some(routed) = self.router.route(&target, options.routing_context.as_ref()) {
                version = Some(routed);
            }
        }

        let instance = if config.discovery_enabled {
            let mut filter = DiscoveryFilter::new();
            if !config.health_checks_enabled {
                filter = filter.include_unhealthy();
            }
            if let Some(v) = &version {
                filter = filter.with_version(v.clone());
            }

            match self
                .registry
                .get_instance(&target, options.load_balancing, &filter)
            {
                Some(instance) => Some(instance),
                None => {
                    return Err(self.reject(
                        &target,
                        MeshError::NoHealthyInstance {
                            service: target.clone(),
                            version: version.unwrap_or_else(|| "any".to_string()),
                        },
                    ));
                }
            }
        } else {
            None
        };

        if config.auth_enabled && options.auth_enabled {
            if let Err(e) = self.authenticate(source_service_id, &target, options.permission.as_deref())
            {
                self.release(&instance);
                return Err(self.reject(&target, e));
            }
        }

        let operation = options
            .retry_policy
            .clone()
            .unwrap_or_else(|| target.clone());

        let result = if config.retries_enabled && options.retry_enabled {
            self.retries
                .execute(&operation, f, options.retry_override.as_ref())
                .await
                .map_err(CallError::Retry)
        } else {
            f().await.map_err(CallError::Operation)
        };

        self.release(&instance);

        let elapsed = start.elapsed();
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;

        match &result {
            Ok(_) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                if config.circuit_breaker_enabled {
                    self.breakers.record_success(&target);
                }
                self.latency.lock().record(elapsed_ms);
                if config.observability_enabled {
                    Metrics::record_call(&target, "success", elapsed.as_secs_f64());
                }
                debug!(
                    source = %source_service_id,
                    target = %target,
                    duration_ms = elapsed_ms,
                    "call completed"
                );
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                if config.circuit_breaker_enabled {
                    self.breakers.record_failure(&target);
                }
                self.latency.lock().record(elapsed_ms);
                if config.observability_enabled {
                    Metrics::record_call(&target, "error", elapsed.as_secs_f64());
                }
                warn!(
                    source = %source_service_id,
                    target = %target,
                    duration_ms = elapsed_ms,
                    error = %e,
                    "call failed"
                );
            }
        }

        result
    }

    fn authenticate(
        &self,
        source_service_id: &str,
        target: &str,
        permission: Option<&str>,
    ) -> Result<(), MeshError> {
        // The signed envelope binds the caller to this target.
        let payload = format!("{}:{}", source_service_id, target);

        let signature = self
            .auth
            .sign_request(source_service_id, payload.as_bytes())
            .ok_or_else(|| MeshError::AuthenticationFailed {
                service: source_service_id.to_string(),
                reason: "signing failed: no certificate or certificate expired".to_string(),
            })?;

        if !self
            .auth
            .verify_request(source_service_id, payload.as_bytes(), &signature)
        {
            return Err(MeshError::AuthenticationFailed {
                service: source_service_id.to_string(),
                reason: "signature verification failed".to_string(),
            });
        }

        if !self.auth.check_acl(source_service_id, target, permission) {
            return Err(MeshError::AccessDenied {
                caller: source_service_id.to_string(),
                target: target.to_string(),
            });
        }

        Ok(())
    }

    fn release(&self, instance: &Option<Arc<ServiceInstance>>) {
        if let Some(instance) = instance {
            self.registry.release_connection(&instance.id);
        }
    }

    fn reject<E>(&self, target: &str, error: MeshError) -> CallError<E> {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.mesh_rejections.fetch_add(1, Ordering::Relaxed);

        let config = self.config.read();
        if config.observability_enabled {
            Metrics::record_call(target, "rejected", 0.0);
        }

        warn!(target = %target, error = %error, "call rejected");
        CallError::Mesh(error)
    }

    /// Spawns the canary auto-increment and certificate rotation tasks.
    ///
    /// Both run on fixed intervals from the current configuration and
    /// stop when [`BackgroundTasks::shutdown`] is awaited.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> BackgroundTasks {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut handles = Vec::new();

        let config = self.get_config();

        {
            let mesh = Arc::clone(self);
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.canary_interval;
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let advanced = mesh.router.advance_canaries(Instant::now());
                            if advanced > 0 {
                                debug!(advanced, "canary auto-increment tick");
                            }
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }));
        }

        {
            let mesh = Arc::clone(self);
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.rotation_scan_interval;
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let threshold = mesh.get_config().rotation_threshold;
                            let flagged = mesh.auth.scan_rotations(threshold);
                            if flagged > 0 {
                                debug!(flagged, "certificate rotation scan tick");
                            }
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }));
        }

        BackgroundTasks {
            shutdown_tx,
            handles,
        }
    }

    /// Returns aggregated statistics across all components.
    pub fn get_stats(&self) -> MeshStats {
        let latency = self.latency.lock();
        MeshStats {
            calls: self.calls.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            mesh_rejections: self.mesh_rejections.load(Ordering::Relaxed),
            avg_latency_ms: latency.avg_ms,
            registry: self.registry.stats(),
            retry: self.retries.stats(),
            traffic: self.router.stats(),
            auth: self.auth.stats(),
            breaker: self.breakers.stats(),
        }
    }

    /// Returns a health summary across all components.
    pub fn get_health(&self) -> MeshHealth {
        let registry = self.registry.stats();
        let breaker = self.breakers.stats();
        let auth = self.auth.stats();
        let enabled = self.config.read().enabled;

        MeshHealth {
            healthy: enabled
                && breaker.open_breakers == 0
                && (registry.instances == 0 || registry.healthy_instances > 0),
            enabled,
            initialized: self.initialized.load(Ordering::SeqCst),
            services: registry.services,
            instances: registry.instances,
            healthy_instances: registry.healthy_instances,
            open_breakers: breaker.open_breakers,
            certificates: auth.certificates,
        }
    }

    /// Resets statistics on the mesh and every component.
    ///
    /// Operational data (instances, policies, routes, certificates,
    /// ACLs) is untouched.
    pub fn reset_all_stats(&self) {
        self.calls.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.mesh_rejections.store(0, Ordering::Relaxed);
        *self.latency.lock() = LatencyTracker::default();

        self.registry.reset_stats();
        self.retries.reset_stats();
        self.router.reset_stats();
        self.auth.reset_stats();
        self.breakers.reset_stats();
    }
}
