//! Gateway service — the public entry point of the demo pair.
//!
//! Validates incoming requests, calls the dataplane over HTTP with the
//! trace context injected, and post-processes the result. Each hop runs its
//! own tracing pipeline, so the two services end up with two different
//! subtrace ids under one distributed trace id.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Liveness check — always `200 OK`. |
//! | `GET`  | `/api/process/{customer_id}` | Validate, call the dataplane, post-process. |
//! | `GET`  | `/metrics` | Prometheus text exposition. |

use crate::dataplane::DataplaneResponse;
use crate::error::{ServiceError, ServiceResult};
use crate::metrics::ServiceMetrics;
use crate::middleware::{RequestContext, TracingState, trace_http_request};
use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    http::header,
    response::IntoResponse,
    routing::get,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use subtrace_tracing::{Span, SpanKind, TracePropagator, Tracer};
use tracing::{info, warn};

/// Service name stamped on spans and reported by the health endpoint.
pub const SERVICE_NAME: &str = "gateway";

/// Body of `GET /api/process/{customer_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessResponse {
    pub service: String,
    pub customer_id: String,
    pub result: DataplaneResponse,
    pub processing_time_ms: f64,
}

/// Shared state injected into every gateway handler.
#[derive(Clone)]
pub struct GatewayState {
    pub tracer: Arc<Tracer>,
    pub metrics: Arc<ServiceMetrics>,
    pub propagator: Arc<dyn TracePropagator>,
    pub http: reqwest::Client,
    pub dataplane_url: String,
}

/// Build the gateway router with the server-span middleware attached.
pub fn build_router(state: GatewayState, tracing: TracingState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/api/process/{customer_id}", get(process_customer))
        .route("/metrics", get(render_metrics))
        .layer(axum::middleware::from_fn_with_state(
            tracing,
            trace_http_request,
        ))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "service": SERVICE_NAME,
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn render_metrics(State(state): State<GatewayState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// Validate the customer id, call the dataplane, inspect the payment
/// outcome.
async fn process_customer(
    State(state): State<GatewayState>,
    Extension(RequestContext(parent)): Extension<RequestContext>,
    Path(customer_id): Path<String>,
) -> ServiceResult<Json<ProcessResponse>> {
    let started = Instant::now();

    let span = state
        .tracer
        .span_builder("process-customer-request")
        .with_parent(parent)
        .with_attribute("customer.id", customer_id.as_str())
        .with_attribute("request.type", "customer_processing")
        .start();

    let result = handle_process(&state, &span, &customer_id).await;

    let elapsed = started.elapsed().as_secs_f64();
    let status_label = if result.is_ok() { "success" } else { "error" };
    state
        .metrics
        .requests_total
        .inc(&[("endpoint", "/api/process"), ("status", status_label)]);
    state
        .metrics
        .processing_seconds
        .observe(&[("endpoint", "/api/process")], elapsed);

    span.set_attribute("processing.total_time_ms", elapsed * 1000.0);
    match &result {
        Ok(_) => {
            span.set_attribute("processing.success", true);
            span.set_ok();
        }
        Err(err) => span.set_error(err.to_string()),
    }
    state.tracer.end_span(&span).await;

    result.map(|dataplane| {
        Json(ProcessResponse {
            service: SERVICE_NAME.to_string(),
            customer_id,
            result: dataplane,
            processing_time_ms: elapsed * 1000.0,
        })
    })
}

/// The request body of the handler, with the request span held by the
/// caller so every early return still ends it exactly once.
async fn handle_process(
    state: &GatewayState,
    span: &Span,
    customer_id: &str,
) -> ServiceResult<DataplaneResponse> {
    validate_request(state, span, customer_id).await?;
    let result = call_dataplane(state, span, customer_id).await?;
    post_process(state, span, &result).await;
    Ok(result)
}

async fn validate_request(
    state: &GatewayState,
    parent: &Span,
    customer_id: &str,
) -> ServiceResult<()> {
    let span = state
        .tracer
        .start_child_span("validate-request", &parent.span_context());
    span.set_attribute("validation.type", "customer_id");

    let delay_ms = rand::thread_rng().gen_range(10..=50);
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;

    if !customer_id.starts_with("user") {
        span.set_attribute("validation.result", "invalid_format");
        state.tracer.end_span(&span).await;
        return Err(ServiceError::InvalidCustomerId(customer_id.to_string()));
    }

    span.set_attribute("validation.result", "valid");
    state.tracer.end_span(&span).await;
    Ok(())
}

async fn call_dataplane(
    state: &GatewayState,
    parent: &Span,
    customer_id: &str,
) -> ServiceResult<DataplaneResponse> {
    let url = format!(
        "{}/api/data/{}",
        state.dataplane_url.trim_end_matches('/'),
        customer_id
    );

    let span = state
        .tracer
        .span_builder("call-dataplane")
        .with_kind(SpanKind::Client)
        .with_parent(parent.span_context())
        .with_attribute("downstream.service", crate::dataplane::SERVICE_NAME)
        .with_attribute("downstream.url", url.as_str())
        .start();

    // Hand the trace context to the next hop; the dataplane's own pipeline
    // assigns its own subtrace id under the same trace id.
    let mut carrier = HashMap::new();
    state.propagator.inject(&span.span_context(), &mut carrier);

    info!(url = %url, "calling dataplane");

    let mut request = state.http.get(&url).timeout(Duration::from_secs(10));
    for (key, value) in carrier {
        request = request.header(key, value);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(err) => {
            span.set_error(err.to_string());
            state.tracer.end_span(&span).await;
            return Err(ServiceError::Upstream(err.to_string()));
        }
    };

    let status = response.status();
    span.set_attribute("downstream.status_code", status.as_u16() as i64);

    if status == reqwest::StatusCode::NOT_FOUND {
        state.tracer.end_span(&span).await;
        return Err(ServiceError::CustomerNotFound(customer_id.to_string()));
    }
    if !status.is_success() {
        span.set_error(format!("dataplane returned {status}"));
        state.tracer.end_span(&span).await;
        return Err(ServiceError::Upstream(format!(
            "dataplane returned {status}"
        )));
    }

    let payload = match response.json::<DataplaneResponse>().await {
        Ok(payload) => payload,
        Err(err) => {
            span.set_error(err.to_string());
            state.tracer.end_span(&span).await;
            return Err(ServiceError::Upstream(format!(
                "malformed dataplane response: {err}"
            )));
        }
    };

    state.tracer.end_span(&span).await;
    Ok(payload)
}

async fn post_process(state: &GatewayState, parent: &Span, result: &DataplaneResponse) {
    let span = state
        .tracer
        .start_child_span("post-process-response", &parent.span_context());

    let delay_ms = rand::thread_rng().gen_range(10..=30);
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;

    let payment_status = result.payment.status.as_str();
    span.set_attribute("payment.status", payment_status);

    if payment_status == "failed" {
        let reason = result.payment.reason.as_deref().unwrap_or("unknown");
        span.set_attribute("payment.failure_detected", true);
        span.set_attribute("payment.failure_reason", reason);
        warn!(
            customer_id = %result.customer_id,
            reason,
            "payment failure detected in dataplane response"
        );
    }

    state.tracer.end_span(&span).await;
}
