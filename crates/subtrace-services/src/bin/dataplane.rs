//! Dataplane service — entry point.
//!
//! Reads configuration from environment variables, wires the tracing
//! pipeline (subtrace assignment first, then batched export), and serves
//! the axum router.
//!
//! # Environment variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `DATAPLANE_PORT` | `8002` | TCP port to listen on. |
//! | `PAYMENT_FAILURE_RATE` | `0.3` | Probability that payment validation fails. |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | *(none)* | OTLP/HTTP endpoint; console export when unset. |

use std::sync::Arc;

use subtrace_services::config::DataplaneConfig;
use subtrace_services::dataplane::{self, DataplaneState};
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

    let config = DataplaneConfig::from_env();

    let provider = telemetry::init_tracing_pipeline(
        dataplane::SERVICE_NAME,
        env!("CARGO_PKG_VERSION"),
        config.otlp_endpoint.as_deref(),
    )
    .await;
    let tracer = provider.default_tracer().await;

    let state = DataplaneState {
        tracer: tracer.clone(),
        metrics: Arc::new(ServiceMetrics::new(dataplane::SERVICE_NAME)),
        payment_failure_rate: config.payment_failure_rate,
    };
    let app = dataplane::build_router(
        state,
        TracingState::new(tracer, provider.propagator()),
    );

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .expect("failed to bind dataplane port");
    info!(
        port = config.port,
        payment_failure_rate = config.payment_failure_rate,
        "dataplane listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("dataplane server failed");

    // Flush buffered spans and clear the subtrace table on the way out.
    if let Err(err) = provider.shutdown().await {
        tracing::warn!("tracing shutdown incomplete: {}", err);
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
