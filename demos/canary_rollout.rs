//! Canary rollout example with automatic traffic increments.
//!
//! Run with:
//! ```bash
//! cargo run --example canary_rollout
//! ```

use meshplane::config::MeshConfig;
use meshplane::mesh::{ServiceCallOptions, ServiceMesh};
use meshplane::registry::ServiceSpec;
use meshplane::traffic::{AutoIncrement, CanaryConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting canary rollout example");

    // Tick the canary scheduler every second for demo purposes.
    let mesh = Arc::new(ServiceMesh::new(MeshConfig {
        canary_interval: Duration::from_secs(1),
        ..Default::default()
    }));
    mesh.initialize();

    mesh.registry()
        .register(ServiceSpec::new("user-service", "10.0.0.1", 8080).with_version("1.0.0"));
    mesh.registry()
        .register(ServiceSpec::new("user-service", "10.0.0.2", 8080).with_version("2.0.0"));

    // Start at 10% and grow by 20 points per tick up to 90%.
    mesh.router().create_canary(CanaryConfig {
        service: "user-service".to_string(),
        stable_version: "1.0.0".to_string(),
        canary_version: "2.0.0".to_string(),
        initial_percent: 10.0,
        auto_increment: Some(AutoIncrement {
            step: 20.0,
            interval_ms: 1_000,
            max_percent: 90.0,
        }),
    });

    let tasks = mesh.spawn_background_tasks();

    for round in 1..=4 {
        for _ in 0..500 {
            let _ = mesh
                .call(
                    "frontend",
                    ServiceCallOptions::new("user-service").with_auth(false),
                    || async { Ok::<_, String>(()) },
                )
                .await;
        }

        let status = mesh.router().canary_status("user-service").unwrap();
        let traffic = mesh.get_stats().traffic;
        info!(
            round,
            percent = status.traffic_percent,
            canary_picks = traffic.canary_picks,
            stable_picks = traffic.stable_picks,
            "rollout progress"
        );

        tokio::time::sleep(Duration::from_millis(1_100)).await;
    }

    // The rollout looks good: shift everything over.
    mesh.router().promote_canary("user-service");
    let status = mesh.router().canary_status("user-service").unwrap();
    info!(
        percent = status.traffic_percent,
        enabled = status.enabled,
        "canary promoted"
    );

    tasks.shutdown().await;
    info!("Shutdown complete");
}
