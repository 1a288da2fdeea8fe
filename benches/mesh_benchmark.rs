//! Benchmarks for the mesh control plane.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use meshplane::auth::ServiceAuthenticator;
use meshplane::breaker::CircuitBreakerSet;
use meshplane::registry::{DiscoveryFilter, LoadBalancingStrategy, ServiceRegistry, ServiceSpec};
use meshplane::retry::RetryConfig;
use meshplane::traffic::{CanaryConfig, RouteDestination, RoutingRule, TrafficRoute, TrafficRouter};
use std::time::Duration;

fn bench_registry_selection(c: &mut Criterion) {
    let registry = ServiceRegistry::new();
    for port in 8080..8090 {
        registry.register(ServiceSpec::new("users", "127.0.0.1", port).with_weight(port as u32));
    }
    let filter = DiscoveryFilter::new();

    let mut group = c.benchmark_group("registry_selection");
    group.throughput(Throughput::Elements(1));

    for (name, strategy) in [
        ("round_robin", LoadBalancingStrategy::RoundRobin),
        ("random", LoadBalancingStrategy::Random),
        ("weighted", LoadBalancingStrategy::Weighted),
        ("least_connections", LoadBalancingStrategy::LeastConnections),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| {
                let instance = registry
                    .get_instance("users", strategy, &filter)
                    .expect("instance available");
                registry.release_connection(&instance.id);
                black_box(instance)
            });
        });
    }

    group.finish();
}

fn bench_traffic_routing(c: &mut Criterion) {
    let router = TrafficRouter::new();
    router.create_canary(CanaryConfig {
        service: "payments".to_string(),
        stable_version: "1.0.0".to_string(),
        canary_version: "1.1.0".to_string(),
        initial_percent: 30.0,
        auto_increment: None,
    });
    router.create_route(
        TrafficRoute::new("orders-split", "orders").with_rule(
            RoutingRule::new("split")
                .with_destination(RouteDestination::new("1.0.0", 70))
                .with_destination(RouteDestination::new("2.0.0", 30)),
        ),
    );

    c.bench_function("route_canary", |b| {
        b.iter(|| black_box(router.route("payments", None)));
    });

    c.bench_function("route_rules", |b| {
        b.iter(|| black_box(router.route("orders", None)));
    });
}

fn bench_retry_delay(c: &mut Criterion) {
    let config = RetryConfig::new()
        .with_base_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_jitter(true)
        .with_jitter_factor(0.2);

    c.bench_function("retry_delay_with_jitter", |b| {
        b.iter(|| {
            for attempt in 1..=5 {
                black_box(config.delay_for_attempt(attempt));
            }
        });
    });
}

fn bench_auth(c: &mut Criterion) {
    let auth = ServiceAuthenticator::with_defaults();
    auth.issue_certificate("checkout", "checkout");
    let signature = auth
        .sign_request("checkout", b"checkout:payments")
        .expect("certificate present");

    c.bench_function("sign_request", |b| {
        b.iter(|| black_box(auth.sign_request("checkout", b"checkout:payments")));
    });

    c.bench_function("verify_request", |b| {
        b.iter(|| black_box(auth.verify_request("checkout", b"checkout:payments", &signature)));
    });

    c.bench_function("check_acl_default_allow", |b| {
        b.iter(|| black_box(auth.check_acl("checkout", "payments", None)));
    });
}

fn bench_circuit_breaker(c: &mut Criterion) {
    let breakers = CircuitBreakerSet::with_defaults();

    c.bench_function("breaker_allow", |b| {
        b.iter(|| black_box(breakers.allow("payments")));
    });

    c.bench_function("breaker_record_success", |b| {
        b.iter(|| breakers.record_success("payments"));
    });
}

criterion_group!(
    benches,
    bench_registry_selection,
    bench_traffic_routing,
    bench_retry_delay,
    bench_auth,
    bench_circuit_breaker
);
criterion_main!(benches);
