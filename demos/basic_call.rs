//! Basic mesh call example demonstrating minimal setup.
//!
//! Run with:
//! ```bash
//! cargo run --example basic_call
//! ```

use meshplane::auth::AclEntry;
use meshplane::config::MeshConfig;
use meshplane::mesh::{ServiceCallOptions, ServiceMesh};
use meshplane::registry::{LoadBalancingStrategy, ServiceSpec};
use meshplane::retry::RetryConfig;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting basic mesh call example");

    let mesh = ServiceMesh::new(MeshConfig::default());
    mesh.initialize();

    // Register two payment-service instances.
    mesh.registry()
        .register(ServiceSpec::new("payment-service", "10.0.0.1", 8080));
    mesh.registry()
        .register(ServiceSpec::new("payment-service", "10.0.0.2", 8080).with_weight(3));

    // A retry policy for payment calls: flaky failures get one retry.
    mesh.retries().register_policy(
        "payment-service",
        RetryConfig::new()
            .with_max_attempts(2)
            .with_base_delay(Duration::from_millis(200)),
    );

    // Identity and access control for the checkout caller.
    mesh.auth().issue_certificate("checkout", "checkout");
    mesh.auth()
        .add_acl(AclEntry::allow("checkout", "payment-service").with_permission("charge"));

    // Simulate a payment backend that times out once, then succeeds.
    let attempts = AtomicU32::new(0);
    let result = mesh
        .call(
            "checkout",
            ServiceCallOptions::new("payment-service")
                .with_load_balancing(LoadBalancingStrategy::Weighted)
                .with_permission("charge"),
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err("ETIMEDOUT".to_string())
                    } else {
                        Ok("receipt-0042")
                    }
                }
            },
        )
        .await;

    match result {
        Ok(receipt) => info!(receipt = %receipt, "payment completed"),
        Err(e) => info!(error = %e, "payment failed"),
    }

    let stats = mesh.get_stats();
    info!(
        calls = stats.calls,
        successes = stats.successes,
        retries = stats.retry.retries,
        avg_latency_ms = stats.avg_latency_ms,
        "mesh stats"
    );
}
