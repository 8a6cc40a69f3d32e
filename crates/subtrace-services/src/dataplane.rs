//! Dataplane service — data processing behind the gateway.
//!
//! Demonstrates the span shapes a trace-analysis backend aggregates per
//! subtrace:
//! - a payment failure raised and recorded on a deep child span,
//! - a variable number of simulated database calls (N+1 pattern),
//! - business data (loyalty status) captured on a nested span.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Liveness check — always `200 OK`. |
//! | `GET`  | `/api/data/{customer_id}` | Fetch customer data, run the payment chain. |
//! | `GET`  | `/metrics` | Prometheus text exposition. |

use crate::error::{PaymentFailedError, ServiceError, ServiceResult};
use crate::metrics::ServiceMetrics;
use crate::middleware::{RequestContext, TracingState, trace_http_request};
use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    http::header,
    response::IntoResponse,
    routing::get,
};
use lazy_static::lazy_static;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use subtrace_tracing::{SpanContext, Tracer};
use tracing::{info, warn};

/// Service name stamped on spans and reported by the health endpoint.
pub const SERVICE_NAME: &str = "dataplane";

// ─────────────────────────────────────────────────────────────────────────────
// Mock persistence
// ─────────────────────────────────────────────────────────────────────────────

/// A customer row from the mock customer table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerProfile {
    pub name: String,
    pub email: String,
    pub age: u32,
    pub loyalty_status: String,
    pub payment_method: String,
    pub credit_limit: u64,
}

#[derive(Debug, Clone, Copy)]
struct OrderRecord {
    customer_id: &'static str,
    amount: f64,
    status: &'static str,
}

fn customer(
    name: &str,
    email: &str,
    age: u32,
    loyalty_status: &str,
    payment_method: &str,
    credit_limit: u64,
) -> CustomerProfile {
    CustomerProfile {
        name: name.to_string(),
        email: email.to_string(),
        age,
        loyalty_status: loyalty_status.to_string(),
        payment_method: payment_method.to_string(),
        credit_limit,
    }
}

lazy_static! {
    static ref MOCK_CUSTOMERS: HashMap<&'static str, CustomerProfile> = HashMap::from([
        (
            "user123",
            customer("John Doe", "john@example.com", 30, "gold", "credit_card", 5000),
        ),
        (
            "user456",
            customer("Jane Smith", "jane@example.com", 25, "platinum", "debit_card", 10000),
        ),
        (
            "user789",
            customer("Bob Johnson", "bob@example.com", 35, "silver", "paypal", 2000),
        ),
    ]);
    static ref MOCK_ORDERS: HashMap<&'static str, OrderRecord> = HashMap::from([
        ("order001", OrderRecord { customer_id: "user123", amount: 150.0, status: "pending" }),
        ("order002", OrderRecord { customer_id: "user456", amount: 250.0, status: "completed" }),
        ("order003", OrderRecord { customer_id: "user789", amount: 50.0, status: "pending" }),
    ]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Response payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of the payment chain. A failed validation is data, not an HTTP
/// error — the request still completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentOutcome {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

impl PaymentOutcome {
    fn no_payment() -> Self {
        Self {
            status: "no_payment".to_string(),
            payment_id: None,
            transaction_id: None,
            reason: None,
            fallback: None,
        }
    }
}

/// Body of `GET /api/data/{customer_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataplaneResponse {
    pub service: String,
    pub customer_id: String,
    pub customer: CustomerProfile,
    pub payment: PaymentOutcome,
    pub db_queries: u32,
    pub processing_time_ms: f64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared state and router
// ─────────────────────────────────────────────────────────────────────────────

/// Shared state injected into every dataplane handler.
#[derive(Clone)]
pub struct DataplaneState {
    pub tracer: Arc<Tracer>,
    pub metrics: Arc<ServiceMetrics>,
    /// Probability in `[0.0, 1.0]` that payment validation fails.
    pub payment_failure_rate: f64,
}

/// Build the dataplane router with the server-span middleware attached.
pub fn build_router(state: DataplaneState, tracing: TracingState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/api/data/{customer_id}", get(get_data))
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

async fn render_metrics(State(state): State<DataplaneState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// Main endpoint: multiple DB queries, loyalty capture, payment chain.
async fn get_data(
    State(state): State<DataplaneState>,
    Extension(RequestContext(parent)): Extension<RequestContext>,
    Path(customer_id): Path<String>,
) -> ServiceResult<Json<DataplaneResponse>> {
    let started = Instant::now();

    let span = state
        .tracer
        .span_builder("dataplane-process-request")
        .with_parent(parent)
        .with_attribute("request.data_id", customer_id.as_str())
        .with_attribute("request.type", "full_processing")
        .start();

    let Some((profile, db_queries)) =
        fetch_customer_data(&state, &span.span_context(), &customer_id).await
    else {
        span.set_error(format!("customer {customer_id} not found"));
        state.tracer.end_span(&span).await;
        state
            .metrics
            .requests_total
            .inc(&[("endpoint", "/api/data"), ("status", "not_found")]);
        return Err(ServiceError::CustomerNotFound(customer_id));
    };

    // One pending order per seeded customer; a customer without one skips
    // the payment chain.
    let order = MOCK_ORDERS
        .iter()
        .find(|(_, record)| record.customer_id == customer_id)
        .map(|(order_id, record)| (*order_id, *record));

    let payment = match order {
        Some((order_id, record)) => {
            process_payment(&state, &span.span_context(), &customer_id, record.amount, order_id)
                .await
        }
        None => PaymentOutcome::no_payment(),
    };

    let elapsed = started.elapsed().as_secs_f64();
    state
        .metrics
        .requests_total
        .inc(&[("endpoint", "/api/data"), ("status", "success")]);
    state
        .metrics
        .processing_seconds
        .observe(&[("endpoint", "/api/data")], elapsed);

    span.set_attribute("processing.total_time_ms", elapsed * 1000.0);
    span.set_attribute("db.total_queries", db_queries as i64);
    span.set_ok();
    state.tracer.end_span(&span).await;

    Ok(Json(DataplaneResponse {
        service: SERVICE_NAME.to_string(),
        customer_id,
        customer: profile,
        payment,
        db_queries,
        processing_time_ms: elapsed * 1000.0,
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Database simulation (N+1 pattern)
// ─────────────────────────────────────────────────────────────────────────────

/// Run one simulated database query under its own span with standard `db.*`
/// semantic attributes.
async fn simulate_db_query(
    state: &DataplaneState,
    parent: &SpanContext,
    query_name: &str,
    table: &str,
    operation: &str,
) {
    let span = state
        .tracer
        .start_child_span(format!("db-{query_name}"), parent);
    span.set_attribute("db.system", "postgresql");
    span.set_attribute("db.operation", operation);
    span.set_attribute("db.name", "app_database");
    span.set_attribute("db.sql.table", table);
    span.set_attribute("db.query.name", query_name);

    let delay_ms = rand::thread_rng().gen_range(10..=50);
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;

    span.set_attribute("db.query.duration_ms", delay_ms as i64);
    state
        .metrics
        .db_calls_total
        .inc(&[("table", table), ("operation", operation)]);
    state.tracer.end_span(&span).await;
}

/// Fetch customer data with several queries; the query count varies by
/// request, which is what makes per-subtrace aggregation interesting.
/// Returns the profile and the number of queries issued.
async fn fetch_customer_data(
    state: &DataplaneState,
    parent: &SpanContext,
    customer_id: &str,
) -> Option<(CustomerProfile, u32)> {
    let span = state.tracer.start_child_span("fetch-customer-data", parent);
    span.set_attribute("customer.id", customer_id);

    simulate_db_query(state, &span.span_context(), "get_customer_basic", "customers", "SELECT")
        .await;

    let Some(profile) = MOCK_CUSTOMERS.get(customer_id).cloned() else {
        span.set_attribute("customer.found", false);
        state.tracer.end_span(&span).await;
        return None;
    };

    simulate_db_query(
        state,
        &span.span_context(),
        "get_customer_preferences",
        "customer_preferences",
        "SELECT",
    )
    .await;

    // Loyalty status lands on this child span so a backend aggregating by
    // subtrace can surface it without walking the whole trace.
    let loyalty = state
        .tracer
        .start_child_span("get-loyalty-info", &span.span_context());
    simulate_db_query(
        state,
        &loyalty.span_context(),
        "get_loyalty_details",
        "loyalty_program",
        "SELECT",
    )
    .await;
    loyalty.set_attribute("customer.loyalty_status", profile.loyalty_status.as_str());
    loyalty.set_attribute("customer.loyalty_tier", profile.loyalty_status.as_str());
    info!(
        customer_id,
        loyalty_status = %profile.loyalty_status,
        "captured loyalty status"
    );
    state.tracer.end_span(&loyalty).await;

    // A random tail of follow-up queries (the N in N+1).
    const QUERY_POOL: &[(&str, &str)] = &[
        ("get_recent_orders", "orders"),
        ("get_payment_history", "payments"),
        ("get_shipping_addresses", "addresses"),
        ("get_wishlist", "wishlists"),
        ("get_reviews", "reviews"),
    ];
    let extra = rand::thread_rng().gen_range(2..=5u32);
    for i in 0..extra {
        let (query_name, table) =
            QUERY_POOL[rand::thread_rng().gen_range(0..QUERY_POOL.len())];
        simulate_db_query(
            state,
            &span.span_context(),
            &format!("{query_name}_{i}"),
            table,
            "SELECT",
        )
        .await;
    }

    let total = 3 + extra;
    span.set_attribute("db.total_queries", total as i64);
    state.tracer.end_span(&span).await;

    Some((profile, total))
}

// ─────────────────────────────────────────────────────────────────────────────
// Payment chain (exception on a deep child span)
// ─────────────────────────────────────────────────────────────────────────────

/// Top of the payment chain.
async fn process_payment(
    state: &DataplaneState,
    parent: &SpanContext,
    customer_id: &str,
    amount: f64,
    order_id: &str,
) -> PaymentOutcome {
    let span = state.tracer.start_child_span("process-payment", parent);
    span.set_attribute("payment.customer_id", customer_id);
    span.set_attribute("payment.amount", amount);
    span.set_attribute("payment.order_id", order_id);

    let outcome =
        call_payment_gateway(state, &span.span_context(), customer_id, amount, order_id).await;

    span.set_attribute("payment.result", outcome.status.as_str());
    state
        .metrics
        .payments_total
        .inc(&[("status", outcome.status.as_str())]);
    state.tracer.end_span(&span).await;
    outcome
}

async fn call_payment_gateway(
    state: &DataplaneState,
    parent: &SpanContext,
    customer_id: &str,
    amount: f64,
    order_id: &str,
) -> PaymentOutcome {
    let span = state
        .tracer
        .start_child_span("call-payment-gateway", parent);
    span.set_attribute("gateway.name", "stripe");
    span.set_attribute("gateway.timeout_ms", 5000i64);

    let delay_ms = rand::thread_rng().gen_range(50..=150);
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;

    let outcome =
        validate_payment_with_provider(state, &span.span_context(), customer_id, amount, order_id)
            .await;
    state.tracer.end_span(&span).await;
    outcome
}

/// Deepest span of the chain — where validation actually fails. The failure
/// is recorded as a span exception and turned into a graceful outcome.
async fn validate_payment_with_provider(
    state: &DataplaneState,
    parent: &SpanContext,
    customer_id: &str,
    amount: f64,
    order_id: &str,
) -> PaymentOutcome {
    let span = state
        .tracer
        .start_child_span("validate-payment-provider", parent);
    span.set_attribute("provider.name", "payment_validator");
    span.set_attribute("validation.customer_id", customer_id);
    span.set_attribute("validation.amount", amount);

    let delay_ms = rand::thread_rng().gen_range(20..=80);
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;

    if rand::random::<f64>() < state.payment_failure_rate {
        const REASONS: &[&str] = &[
            "insufficient_funds",
            "card_declined",
            "fraud_suspected",
            "expired_card",
        ];
        let reason = REASONS[rand::thread_rng().gen_range(0..REASONS.len())];
        let error = PaymentFailedError {
            order_id: order_id.to_string(),
            payment_id: format!("pay_{order_id}"),
            reason: reason.to_string(),
        };

        span.record_exception(&error);
        span.set_attribute("payment.failed", true);
        span.set_attribute("payment.failure_reason", reason);
        warn!(order_id, reason, "payment validation failed");
        state.tracer.end_span(&span).await;

        return PaymentOutcome {
            status: "failed".to_string(),
            payment_id: Some(error.payment_id),
            transaction_id: None,
            reason: Some(error.reason),
            fallback: Some("queued_for_retry".to_string()),
        };
    }

    span.set_attribute("payment.validated", true);
    state.tracer.end_span(&span).await;

    PaymentOutcome {
        status: "success".to_string(),
        payment_id: Some(format!(
            "pay_{}_{}",
            order_id,
            chrono::Utc::now().timestamp()
        )),
        transaction_id: Some(format!(
            "txn_{}",
            rand::thread_rng().gen_range(100_000..=999_999)
        )),
        reason: None,
        fallback: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use subtrace_tracing::{SubtraceIdProcessor, TracerConfig, TracerProvider};
    use tower::util::ServiceExt;

    async fn test_router(payment_failure_rate: f64) -> (Arc<ServiceMetrics>, Router) {
        let provider = TracerProvider::new(TracerConfig::new(SERVICE_NAME))
            .with_span_processor(Arc::new(SubtraceIdProcessor::new()));
        let tracer = provider.default_tracer().await;
        let metrics = Arc::new(ServiceMetrics::new(SERVICE_NAME));

        let state = DataplaneState {
            tracer: tracer.clone(),
            metrics: metrics.clone(),
            payment_failure_rate,
        };
        let tracing = TracingState::new(tracer, provider.propagator());
        (metrics, build_router(state, tracing))
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_the_service_name() {
        let (_, router) = test_router(0.0).await;
        let (status, body) = get_json(router, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], SERVICE_NAME);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn unknown_customer_is_a_404() {
        let (metrics, router) = test_router(0.0).await;
        let (status, body) = get_json(router, "/api/data/user000").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "CUSTOMER_NOT_FOUND");
        assert_eq!(
            metrics
                .requests_total
                .get(&[("endpoint", "/api/data"), ("status", "not_found")]),
            1
        );
    }

    #[tokio::test]
    async fn successful_payment_carries_a_transaction_id() {
        let (metrics, router) = test_router(0.0).await;
        let (status, body) = get_json(router, "/api/data/user123").await;
        assert_eq!(status, StatusCode::OK);

        let response: DataplaneResponse = serde_json::from_value(body).unwrap();
        assert_eq!(response.customer.loyalty_status, "gold");
        assert_eq!(response.payment.status, "success");
        assert!(response.payment.transaction_id.is_some());
        assert!(response.payment.fallback.is_none());
        // 3 fixed queries plus 2..=5 extra ones.
        assert!((5..=8).contains(&response.db_queries));

        assert_eq!(metrics.payments_total.get(&[("status", "success")]), 1);
        assert!(
            metrics
                .db_calls_total
                .get(&[("table", "customers"), ("operation", "SELECT")])
                >= 1
        );
    }

    #[tokio::test]
    async fn failed_payment_degrades_gracefully() {
        let (metrics, router) = test_router(1.0).await;
        let (status, body) = get_json(router, "/api/data/user456").await;
        // A payment failure is an outcome, not an HTTP error.
        assert_eq!(status, StatusCode::OK);

        let response: DataplaneResponse = serde_json::from_value(body).unwrap();
        assert_eq!(response.payment.status, "failed");
        assert_eq!(response.payment.fallback.as_deref(), Some("queued_for_retry"));
        assert!(response.payment.reason.is_some());
        assert!(response.payment.transaction_id.is_none());

        assert_eq!(metrics.payments_total.get(&[("status", "failed")]), 1);
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_prometheus_text() {
        let (_, router) = test_router(0.0).await;

        // Drive one request so the counters have series to render.
        let warmed = router.clone();
        let _ = get_json(warmed, "/api/data/user789").await;

        let response = router
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("# TYPE dataplane_requests_total counter"));
        assert!(text.contains(r#"dataplane_requests_total{endpoint="/api/data",status="success"} 1"#));
    }
}
