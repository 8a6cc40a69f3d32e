//! Server-span middleware.
//!
//! Opens one `SpanKind::Server` span per incoming request, parented on the
//! remote context extracted from the `traceparent` header when present. The
//! span's context is exposed to handlers through request extensions so the
//! spans they open become children of the request span.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use subtrace_tracing::{SpanContext, SpanKind, TracePropagator, Tracer};

/// The request span's context, available to handlers via
/// `Extension<RequestContext>`.
#[derive(Clone)]
pub struct RequestContext(pub SpanContext);

/// State for [`trace_http_request`]; attach with
/// `axum::middleware::from_fn_with_state`.
#[derive(Clone)]
pub struct TracingState {
    pub tracer: Arc<Tracer>,
    pub propagator: Arc<dyn TracePropagator>,
}

impl TracingState {
    pub fn new(tracer: Arc<Tracer>, propagator: Arc<dyn TracePropagator>) -> Self {
        Self { tracer, propagator }
    }
}

/// Wrap one HTTP request in a server span.
pub async fn trace_http_request(
    State(state): State<TracingState>,
    mut request: Request,
    next: Next,
) -> Response {
    let mut carrier = HashMap::new();
    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            carrier.insert(name.as_str().to_string(), value.to_string());
        }
    }
    let remote = state.propagator.extract(&carrier);

    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let mut builder = state
        .tracer
        .span_builder(format!("{method} {path}"))
        .with_kind(SpanKind::Server)
        .with_attribute("http.method", method.as_str())
        .with_attribute("http.target", path.as_str());
    if let Some(parent) = remote {
        builder = builder.with_parent(parent);
    }
    let span = builder.start();

    request
        .extensions_mut()
        .insert(RequestContext(span.span_context()));

    let response = next.run(request).await;

    let status = response.status();
    span.set_attribute("http.status_code", status.as_u16() as i64);
    if status.is_server_error() {
        span.set_error(format!("HTTP {status}"));
    } else {
        span.set_ok();
    }
    state.tracer.end_span(&span).await;

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Extension, Router, body::Body, http::StatusCode, routing::get};
    use subtrace_tracing::{
        SubtraceIdProcessor, TraceId, TracerConfig, TracerProvider, W3CTraceContextPropagator,
    };
    use tower::util::ServiceExt;

    async fn traced_router() -> (Arc<SubtraceIdProcessor>, Router) {
        let processor = Arc::new(SubtraceIdProcessor::new());
        let provider = TracerProvider::new(TracerConfig::new("middleware-test"))
            .with_span_processor(processor.clone());
        let tracer = provider.default_tracer().await;

        let state = TracingState::new(tracer, provider.propagator());
        let router = Router::new()
            .route(
                "/probe",
                get(|Extension(ctx): Extension<RequestContext>| async move {
                    // Handlers see the request span's trace id.
                    ctx.0.trace_id.to_hex()
                }),
            )
            .layer(axum::middleware::from_fn_with_state(
                state,
                trace_http_request,
            ));
        (processor, router)
    }

    #[tokio::test]
    async fn request_span_continues_the_remote_trace() {
        let (_processor, router) = traced_router().await;

        let trace_id = TraceId::from_u128(0xabcd);
        let traceparent = format!("00-{}-00000000000000ff-01", trace_id.to_hex());

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/probe")
                    .header(W3CTraceContextPropagator::TRACEPARENT, traceparent)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], trace_id.to_hex().as_bytes());
    }

    #[tokio::test]
    async fn request_without_traceparent_roots_a_new_trace() {
        let (processor, router) = traced_router().await;

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/probe")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        // The server span was this process's first observation of the trace.
        assert_eq!(processor.tracked_traces(), 1);
    }
}
