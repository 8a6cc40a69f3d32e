//! Subtrace Tracing - span pipeline with per-service subtrace assignment
//!
//! 分布式追踪流水线，核心是 subtrace 分配：本进程为它参与的每个分布式
//! trace 计算一个确定性的 subtrace id，盖在该 trace 的每个 span 上，并把
//! 首个观察到的 span 标记为 subtrace 根。
//! A distributed-tracing span pipeline whose core is subtrace assignment:
//! the process computes a deterministic subtrace id for every distributed
//! trace it participates in, stamps it on each of that trace's spans, and
//! marks the first span observed as the subtrace root.
//!
//! 提供:
//! Provides:
//! - Trace/Span 标识符与 W3C 上下文类型
//! - Trace/span identifiers and W3C context types
//! - 有序的 span 处理器流水线（启动时同步、结束时异步）
//! - An ordered span-processor pipeline (sync at start, async at end)
//! - Subtrace 分配处理器
//! - The subtrace assignment processor
//! - Console / OTLP 导出器与 `traceparent` 传播
//! - Console / OTLP exporters and `traceparent` propagation
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use subtrace_tracing::{
//!     BatchSpanProcessor, ConsoleExporter, ExporterConfig, SubtraceIdProcessor, TracerConfig,
//!     TracerProvider,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let exporter = Arc::new(ConsoleExporter::new(ExporterConfig::new("checkout")));
//!
//! // Subtrace assignment must run before the exporting processor.
//! let provider = Arc::new(
//!     TracerProvider::new(TracerConfig::new("checkout"))
//!         .with_span_processor(Arc::new(SubtraceIdProcessor::new()))
//!         .with_span_processor(Arc::new(BatchSpanProcessor::new(exporter, 64, 2048))),
//! );
//!
//! let tracer = provider.default_tracer().await;
//! let span = tracer.start_span("handle-request");
//! // ... do work ...
//! tracer.end_span(&span).await;
//! # }
//! ```

mod context;
mod error;
mod exporter;
mod propagator;
mod span;
mod subtrace;
mod tracer;

pub use context::{SpanContext, SpanId, TraceFlags, TraceId, TraceState};
pub use error::{TraceError, TraceResult};
pub use exporter::{
    ConsoleExporter, ExporterConfig, OtlpConfig, OtlpExporter, TracingExporter,
};
pub use propagator::{HeaderCarrier, TracePropagator, W3CTraceContextPropagator};
pub use span::{Span, SpanAttribute, SpanData, SpanEvent, SpanKind, SpanStatus};
pub use subtrace::{
    SUBTRACE_ID_KEY, SUBTRACE_IS_ROOT_SPAN_KEY, SubtraceConfig, SubtraceId, SubtraceIdProcessor,
};
pub use tracer::{
    BatchSpanProcessor, GlobalTracer, SamplingStrategy, SimpleSpanProcessor, SpanBuilder,
    SpanProcessor, Tracer, TracerConfig, TracerProvider, get_tracer, global_tracer,
    set_global_tracer_provider,
};
