//! Tracing-pipeline wiring for the demo services.
//!
//! Both services build the same pipeline: the subtrace assignment processor
//! first, then a batching processor over the configured exporter. The order
//! matters — subtrace attributes must be on the span before the export side
//! ever sees it.

use std::sync::Arc;

use subtrace_tracing::{
    BatchSpanProcessor, ConsoleExporter, ExporterConfig, OtlpConfig, OtlpExporter,
    SubtraceIdProcessor, TracerConfig, TracerProvider, TracingExporter,
    set_global_tracer_provider,
};
use tracing::info;

/// Spans exported per batch.
const EXPORT_BATCH_SIZE: usize = 64;
/// Ended spans buffered before new ones are dropped.
const EXPORT_QUEUE_SIZE: usize = 2048;

/// Build the span pipeline for one service and install it globally.
///
/// Returns the provider handle; callers hold on to it for graceful shutdown
/// (which flushes buffered spans and clears the subtrace table).
pub async fn init_tracing_pipeline(
    service_name: &str,
    service_version: &str,
    otlp_endpoint: Option<&str>,
) -> Arc<TracerProvider> {
    let exporter_config = ExporterConfig::new(service_name).with_batch_size(EXPORT_BATCH_SIZE);

    let exporter: Arc<dyn TracingExporter> = match otlp_endpoint {
        Some(endpoint) => {
            info!(endpoint, "exporting spans over OTLP/HTTP");
            Arc::new(OtlpExporter::new(
                exporter_config,
                OtlpConfig::new(endpoint),
            ))
        }
        None => {
            info!("no OTLP endpoint configured, exporting spans to the console");
            Arc::new(ConsoleExporter::new(exporter_config).with_summary_only())
        }
    };

    let provider = Arc::new(
        TracerProvider::new(
            TracerConfig::new(service_name).with_version(service_version),
        )
        // Subtrace assignment must observe every span before the exporting
        // processor does.
        .with_span_processor(Arc::new(SubtraceIdProcessor::new()))
        .with_span_processor(Arc::new(BatchSpanProcessor::new(
            exporter,
            EXPORT_BATCH_SIZE,
            EXPORT_QUEUE_SIZE,
        ))),
    );

    set_global_tracer_provider(provider.clone()).await;
    provider
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pipeline_annotates_spans_before_handing_them_out() {
        let provider = init_tracing_pipeline("test-service", "0.0.0", None).await;
        let tracer = provider.default_tracer().await;

        let span = tracer.start_span("boot-check");
        assert!(span.attribute(subtrace_tracing::SUBTRACE_ID_KEY).is_some());

        tracer.end_span(&span).await;
        provider.shutdown().await.unwrap();
    }
}
