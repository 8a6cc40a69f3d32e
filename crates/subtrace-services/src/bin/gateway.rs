//! Gateway service — entry point.
//!
//! Reads configuration from environment variables, wires the tracing
//! pipeline (subtrace assignment first, then batched export), and serves
//! the axum router.
//!
//! # Environment variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `GATEWAY_PORT` | `8001` | TCP port to listen on. |
//! | `DATAPLANE_URL` | `http://localhost:8002` | Base URL of the dataplane service. |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | *(none)* | OTLP/HTTP endpoint; console export when unset. |

use std::sync::Arc;

use subtrace_services::config::GatewayConfig;
use subtrace_services::gateway::{self, GatewayState};
use subtrace_services::metrics::ServiceMetrics;
use subtrace_services::middleware::TracingState;
use subtrace_services::telemetry;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialise structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("subtrace_services=info".parse().unwrap()),
        )
        .init();

    let config = GatewayConfig::from_env();

    let provider = telemetry::init_tracing_pipeline(
        gateway::SERVICE_NAME,
        env!("CARGO_PKG_VERSION"),
        config.otlp_endpoint.as_deref(),
    )
    .await;
    let tracer = provider.default_tracer().await;

    let state = GatewayState {
        tracer: tracer.clone(),
        metrics: Arc::new(ServiceMetrics::new(gateway::SERVICE_NAME)),
        propagator: provider.propagator(),
        http: reqwest::Client::new(),
        dataplane_url: config.dataplane_url.clone(),
    };
    let app = gateway::build_router(
        state,
        TracingState::new(tracer, provider.propagator()),
    );

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .expect("failed to bind gateway port");
    info!(
        port = config.port,
        dataplane_url = %config.dataplane_url,
        "gateway listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("gateway server failed");

    // Flush buffered spans and clear the subtrace table on the way out.
    if let Err(err) = provider.shutdown().await {
        tracing::warn!("tracing shutdown incomplete: {}", err);
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
