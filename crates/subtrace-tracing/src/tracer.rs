//! Tracer 和 TracerProvider
//! Tracer and TracerProvider
//!
//! Span 流水线：tracer 创建 span，按注册顺序内联地通知每个处理器，结束时
//! 把快照交给处理器（通常由它导出）。
//! The span pipeline: the tracer creates spans, notifies every processor
//! inline in registration order, and hands the snapshot to the processors
//! at end time (typically for export).

use crate::context::{SpanContext, SpanId, TraceFlags, TraceId};
use crate::error::TraceResult;
use crate::exporter::TracingExporter;
use crate::propagator::{TracePropagator, W3CTraceContextPropagator};
use crate::span::{Span, SpanAttribute, SpanData, SpanKind};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// 采样策略
/// Sampling strategy
///
/// 这里只是一个直通的决策钩子；真正的采样策略不在本系统范围内。
/// A pass-through decision hook only; real sampling policy is out of scope
/// for this system.
#[derive(Debug, Clone, Default)]
pub enum SamplingStrategy {
    /// 始终采样
    /// Always sample
    #[default]
    AlwaysOn,
    /// 从不采样
    /// Never sample
    AlwaysOff,
    /// 按 trace id 哈希的概率采样（同一 trace 的决策一致）
    /// Probabilistic by trace-id hash (consistent per trace)
    Probabilistic(f64),
    /// 父级决定；无父级时回退到 root 策略
    /// Parent decides; falls back to the root strategy without a parent
    ParentBased { root: Box<SamplingStrategy> },
}

impl SamplingStrategy {
    /// 判断是否应该采样
    /// Determine whether to sample
    pub fn should_sample(&self, parent_context: Option<&SpanContext>, trace_id: &TraceId) -> bool {
        match self {
            SamplingStrategy::AlwaysOn => true,
            SamplingStrategy::AlwaysOff => false,
            SamplingStrategy::Probabilistic(probability) => {
                let hash = trace_id
                    .as_bytes()
                    .iter()
                    .fold(0u64, |acc, &b| acc.wrapping_mul(31).wrapping_add(b as u64));
                (hash as f64 / u64::MAX as f64) < *probability
            }
            SamplingStrategy::ParentBased { root } => match parent_context {
                Some(parent) => parent.is_sampled(),
                None => root.should_sample(None, trace_id),
            },
        }
    }
}

/// Tracer 配置
/// Tracer configuration
#[derive(Debug, Clone)]
pub struct TracerConfig {
    /// 服务名称
    /// Service name
    pub service_name: String,
    /// 服务版本
    /// Service version
    pub service_version: Option<String>,
    /// 环境
    /// Environment
    pub environment: Option<String>,
    /// 采样策略
    /// Sampling strategy
    pub sampling_strategy: SamplingStrategy,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown-service".to_string(),
            service_version: None,
            environment: None,
            sampling_strategy: SamplingStrategy::AlwaysOn,
        }
    }
}

impl TracerConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = Some(version.into());
        self
    }

    pub fn with_environment(mut self, env: impl Into<String>) -> Self {
        self.environment = Some(env.into());
        self
    }

    pub fn with_sampling_strategy(mut self, strategy: SamplingStrategy) -> Self {
        self.sampling_strategy = strategy;
        self
    }
}

/// Span 处理器 trait
/// Span processor trait
///
/// `on_start` 是同步的，由 tracer 在打开 span 的线程/任务上内联调用，
/// 发生在 span 交还给应用代码之前、调用方设置任何属性之前。实现绝不能
/// 在这里阻塞 I/O 或挂起。
/// `on_start` is synchronous and invoked inline by the tracer on the
/// thread/task opening the span, before the span is handed back to
/// application code and before any caller-set attributes. Implementations
/// must never block on I/O or suspend here.
#[async_trait::async_trait]
pub trait SpanProcessor: Send + Sync {
    /// Span 开始时内联调用
    /// Called inline when a span starts
    fn on_start(&self, span: &Span, parent_context: Option<&SpanContext>);
    /// Span 结束时调用
    /// Called when a span ends
    async fn on_end(&self, span: SpanData);
    /// 关闭处理器
    /// Shut the processor down
    async fn shutdown(&self) -> TraceResult<()>;
    /// 强制刷新
    /// Force flush
    async fn force_flush(&self) -> TraceResult<()>;
}

/// 简单 Span 处理器 - 逐个直接导出
/// Simple span processor - exports each span directly
pub struct SimpleSpanProcessor {
    exporter: Arc<dyn TracingExporter>,
}

impl SimpleSpanProcessor {
    pub fn new(exporter: Arc<dyn TracingExporter>) -> Self {
        Self { exporter }
    }
}

#[async_trait::async_trait]
impl SpanProcessor for SimpleSpanProcessor {
    fn on_start(&self, _span: &Span, _parent_context: Option<&SpanContext>) {}

    async fn on_end(&self, span: SpanData) {
        if let Err(e) = self.exporter.export(vec![span]).await {
            tracing::error!("Failed to export span: {}", e);
        }
    }

    async fn shutdown(&self) -> TraceResult<()> {
        self.exporter.shutdown().await
    }

    async fn force_flush(&self) -> TraceResult<()> {
        self.exporter.force_flush().await
    }
}

/// 批处理 Span 处理器
/// Batch span processor
///
/// 攒够一个批次再导出；队列满时丢弃新 span。
/// Buffers spans until a batch is full; drops new spans on a full queue.
pub struct BatchSpanProcessor {
    exporter: Arc<dyn TracingExporter>,
    buffer: Arc<RwLock<Vec<SpanData>>>,
    batch_size: usize,
    max_queue_size: usize,
}

impl BatchSpanProcessor {
    pub fn new(exporter: Arc<dyn TracingExporter>, batch_size: usize, max_queue_size: usize) -> Self {
        Self {
            exporter,
            buffer: Arc::new(RwLock::new(Vec::new())),
            batch_size,
            max_queue_size,
        }
    }

    async fn maybe_export(&self) -> TraceResult<()> {
        let to_export: Option<Vec<SpanData>> = {
            let mut buffer = self.buffer.write().await;
            if buffer.len() >= self.batch_size {
                Some(buffer.drain(..).collect())
            } else {
                None
            }
        };

        if let Some(spans) = to_export {
            self.exporter.export(spans).await?;
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl SpanProcessor for BatchSpanProcessor {
    fn on_start(&self, _span: &Span, _parent_context: Option<&SpanContext>) {}

    async fn on_end(&self, span: SpanData) {
        {
            let mut buffer = self.buffer.write().await;
            if buffer.len() < self.max_queue_size {
                buffer.push(span);
            }
        }

        if let Err(e) = self.maybe_export().await {
            tracing::error!("Failed to export spans: {}", e);
        }
    }

    async fn shutdown(&self) -> TraceResult<()> {
        self.force_flush().await?;
        self.exporter.shutdown().await
    }

    async fn force_flush(&self) -> TraceResult<()> {
        let to_export: Vec<SpanData> = {
            let mut buffer = self.buffer.write().await;
            buffer.drain(..).collect()
        };

        if !to_export.is_empty() {
            self.exporter.export(to_export).await?;
        }

        self.exporter.force_flush().await
    }
}

/// Tracer - 追踪器
/// Tracer - creates spans and drives the processor pipeline
pub struct Tracer {
    config: TracerConfig,
    processors: Vec<Arc<dyn SpanProcessor>>,
}

impl Tracer {
    pub fn new(config: TracerConfig, processors: Vec<Arc<dyn SpanProcessor>>) -> Self {
        Self { config, processors }
    }

    /// 创建新的根 Span
    /// Create a new root span
    pub fn start_span(&self, name: impl Into<String>) -> Span {
        self.start_span_with_kind(name, SpanKind::Internal, None)
    }

    /// 创建带类型的 Span
    /// Create a span with a specific kind
    pub fn start_span_with_kind(
        &self,
        name: impl Into<String>,
        kind: SpanKind,
        parent: Option<&SpanContext>,
    ) -> Span {
        let name = name.into();
        let trace_id = parent.map(|p| p.trace_id).unwrap_or_else(TraceId::new);

        let should_sample = self
            .config
            .sampling_strategy
            .should_sample(parent, &trace_id);

        let trace_flags = if should_sample {
            TraceFlags::SAMPLED
        } else {
            TraceFlags::NONE
        };

        let span_context = SpanContext::new(trace_id, SpanId::new(), trace_flags, false);

        if !should_sample {
            return Span::non_recording(span_context);
        }

        let span = Span::new(
            name,
            span_context,
            parent.cloned(),
            kind,
            &self.config.service_name,
        );

        // 在 span 交还给调用方之前，按注册顺序内联通知所有处理器。
        // Notify every processor inline, in registration order, before the
        // span is handed back to the caller.
        for processor in &self.processors {
            processor.on_start(&span, parent);
        }

        span
    }

    /// 创建子 Span
    /// Create a child span
    pub fn start_child_span(&self, name: impl Into<String>, parent: &SpanContext) -> Span {
        self.start_span_with_kind(name, SpanKind::Internal, Some(parent))
    }

    /// 使用 SpanBuilder 创建 Span
    /// Create a span through a SpanBuilder
    pub fn span_builder(&self, name: impl Into<String>) -> SpanBuilder<'_> {
        SpanBuilder::new(self, name)
    }

    /// 结束 Span 并通知处理器
    /// End the span and notify the processors
    pub async fn end_span(&self, span: &Span) {
        span.end();
        if span.is_recording() {
            let data = span.get_data();
            for processor in &self.processors {
                processor.on_end(data.clone()).await;
            }
        }
    }

    /// 获取服务名称
    /// Get the service name
    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }
}

/// Span 构建器 - 绑定到 tracer，保证处理器流水线被正确驱动
/// Span builder - bound to a tracer so the processor pipeline always runs
pub struct SpanBuilder<'a> {
    tracer: &'a Tracer,
    name: String,
    kind: SpanKind,
    parent_context: Option<SpanContext>,
    attributes: HashMap<String, SpanAttribute>,
}

impl<'a> SpanBuilder<'a> {
    fn new(tracer: &'a Tracer, name: impl Into<String>) -> Self {
        Self {
            tracer,
            name: name.into(),
            kind: SpanKind::Internal,
            parent_context: None,
            attributes: HashMap::new(),
        }
    }

    /// 设置 Span 类型
    /// Set the span kind
    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = kind;
        self
    }

    /// 设置父上下文
    /// Set the parent context
    pub fn with_parent(mut self, parent: SpanContext) -> Self {
        self.parent_context = Some(parent);
        self
    }

    /// 添加属性
    /// Add an attribute
    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<SpanAttribute>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// 构建并启动 Span
    /// Build and start the span
    ///
    /// 处理器在构建器属性应用之前观察到 span（构建器属性属于"调用方
    /// 设置的属性"）。
    /// Processors observe the span before builder attributes are applied
    /// (builder attributes count as caller-set attributes).
    pub fn start(self) -> Span {
        let span =
            self.tracer
                .start_span_with_kind(self.name, self.kind, self.parent_context.as_ref());
        span.set_attributes(self.attributes);
        span
    }
}

/// Tracer Provider - 持有有序的处理器列表并管理多个 Tracer
/// Tracer Provider - owns the ordered processor list and manages tracers
pub struct TracerProvider {
    config: TracerConfig,
    processors: Vec<Arc<dyn SpanProcessor>>,
    tracers: Arc<RwLock<HashMap<String, Arc<Tracer>>>>,
    propagator: Arc<dyn TracePropagator>,
}

impl TracerProvider {
    pub fn new(config: TracerConfig) -> Self {
        Self {
            config,
            processors: Vec::new(),
            tracers: Arc::new(RwLock::new(HashMap::new())),
            propagator: Arc::new(W3CTraceContextPropagator::new()),
        }
    }

    /// 追加一个处理器。注册顺序就是 `on_start`/`on_end` 的调用顺序：
    /// 注解类处理器（如 subtrace 分配）必须先于导出类处理器注册。
    /// Append a processor. Registration order is invocation order for
    /// `on_start`/`on_end`: annotating processors (like subtrace
    /// assignment) must be registered before exporting ones.
    pub fn with_span_processor(mut self, processor: Arc<dyn SpanProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn with_propagator(mut self, propagator: Arc<dyn TracePropagator>) -> Self {
        self.propagator = propagator;
        self
    }

    /// 获取或创建 Tracer
    /// Get or create a tracer
    pub async fn tracer(&self, name: &str) -> Arc<Tracer> {
        {
            let tracers = self.tracers.read().await;
            if let Some(tracer) = tracers.get(name) {
                return tracer.clone();
            }
        }

        let tracer = Arc::new(Tracer::new(
            TracerConfig {
                service_name: name.to_string(),
                ..self.config.clone()
            },
            self.processors.clone(),
        ));

        {
            let mut tracers = self.tracers.write().await;
            tracers.insert(name.to_string(), tracer.clone());
        }

        tracer
    }

    /// 获取默认 Tracer
    /// Get the default tracer
    pub async fn default_tracer(&self) -> Arc<Tracer> {
        self.tracer(&self.config.service_name).await
    }

    /// 获取传播器
    /// Get the propagator
    pub fn propagator(&self) -> Arc<dyn TracePropagator> {
        self.propagator.clone()
    }

    /// 关闭所有处理器（返回遇到的第一个错误）
    /// Shut every processor down (returns the first error encountered)
    pub async fn shutdown(&self) -> TraceResult<()> {
        let mut first_err = Ok(());
        for processor in &self.processors {
            if let Err(e) = processor.shutdown().await {
                if first_err.is_ok() {
                    first_err = Err(e);
                }
            }
        }
        first_err
    }

    /// 刷新所有处理器
    /// Flush every processor
    pub async fn force_flush(&self) -> TraceResult<()> {
        let mut first_err = Ok(());
        for processor in &self.processors {
            if let Err(e) = processor.force_flush().await {
                if first_err.is_ok() {
                    first_err = Err(e);
                }
            }
        }
        first_err
    }
}

/// 全局 Tracer
/// Global tracer
pub struct GlobalTracer {
    provider: Arc<RwLock<Option<Arc<TracerProvider>>>>,
}

impl GlobalTracer {
    /// 创建新的全局 Tracer 实例
    /// Create a new GlobalTracer instance
    pub fn new() -> Self {
        Self {
            provider: Arc::new(RwLock::new(None)),
        }
    }

    /// 设置全局 TracerProvider
    /// Set the global TracerProvider
    pub async fn set_provider(&self, provider: Arc<TracerProvider>) {
        let mut guard = self.provider.write().await;
        *guard = Some(provider);
    }

    /// 获取全局 TracerProvider
    /// Get the global TracerProvider
    pub async fn provider(&self) -> Option<Arc<TracerProvider>> {
        let guard = self.provider.read().await;
        guard.clone()
    }

    /// 获取默认 Tracer
    /// Get the default tracer
    pub async fn tracer(&self) -> Option<Arc<Tracer>> {
        let provider = self.provider().await?;
        Some(provider.default_tracer().await)
    }

    /// 获取指定名称的 Tracer
    /// Get a tracer with the given name
    pub async fn tracer_with_name(&self, name: &str) -> Option<Arc<Tracer>> {
        let provider = self.provider().await?;
        Some(provider.tracer(name).await)
    }
}

impl Default for GlobalTracer {
    fn default() -> Self {
        Self::new()
    }
}

// 全局静态实例
// Global static instance
lazy_static::lazy_static! {
    static ref GLOBAL_TRACER: GlobalTracer = GlobalTracer::new();
}

/// 获取全局 Tracer
/// Get the global tracer
pub fn global_tracer() -> &'static GlobalTracer {
    &GLOBAL_TRACER
}

/// 设置全局 TracerProvider
/// Set the global TracerProvider
pub async fn set_global_tracer_provider(provider: Arc<TracerProvider>) {
    GLOBAL_TRACER.set_provider(provider).await;
}

/// 获取全局默认 Tracer
/// Get the global default tracer
pub async fn get_tracer() -> Option<Arc<Tracer>> {
    GLOBAL_TRACER.tracer().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::{ConsoleExporter, ExporterConfig};
    use crate::subtrace::{SUBTRACE_ID_KEY, SUBTRACE_IS_ROOT_SPAN_KEY, SubtraceIdProcessor};
    use parking_lot::Mutex;

    /// 捕获 on_end 快照，供断言用
    /// Captures on_end snapshots for assertions
    struct CaptureProcessor {
        ended: Mutex<Vec<SpanData>>,
    }

    impl CaptureProcessor {
        fn new() -> Self {
            Self {
                ended: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl SpanProcessor for CaptureProcessor {
        fn on_start(&self, _span: &Span, _parent_context: Option<&SpanContext>) {}

        async fn on_end(&self, span: SpanData) {
            self.ended.lock().push(span);
        }

        async fn shutdown(&self) -> TraceResult<()> {
            Ok(())
        }

        async fn force_flush(&self) -> TraceResult<()> {
            Ok(())
        }
    }

    fn console_processor() -> Arc<dyn SpanProcessor> {
        let exporter = Arc::new(
            ConsoleExporter::new(ExporterConfig::new("test-service")).with_summary_only(),
        );
        Arc::new(SimpleSpanProcessor::new(exporter))
    }

    #[tokio::test]
    async fn test_tracer_creation() {
        let tracer = Tracer::new(TracerConfig::new("test-service"), vec![console_processor()]);

        let span = tracer.start_span("test-operation");
        assert!(span.is_recording());

        tracer.end_span(&span).await;
        assert!(span.is_ended());
    }

    #[tokio::test]
    async fn test_tracer_provider_caches_tracers() {
        let provider = TracerProvider::new(TracerConfig::new("test-service"))
            .with_span_processor(console_processor());

        let tracer1 = provider.tracer("service-a").await;
        let tracer2 = provider.tracer("service-a").await;

        assert_eq!(tracer1.service_name(), tracer2.service_name());
    }

    #[tokio::test]
    async fn test_subtrace_attributes_reach_export_side() {
        // 注册顺序：先 subtrace 分配，再捕获（代表导出处理器）。
        // Registration order: subtrace assignment first, then capture
        // (standing in for an exporting processor).
        let capture = Arc::new(CaptureProcessor::new());
        let provider = TracerProvider::new(TracerConfig::new("test-service"))
            .with_span_processor(Arc::new(SubtraceIdProcessor::new()))
            .with_span_processor(capture.clone());

        let tracer = provider.default_tracer().await;
        let root = tracer.start_span("request");
        let child = tracer.start_child_span("db-call", &root.span_context());

        tracer.end_span(&child).await;
        tracer.end_span(&root).await;

        let ended = capture.ended.lock();
        assert_eq!(ended.len(), 2);

        // 两个快照都带着同一个 subtrace.id；只有根带 root 标记。
        // Both snapshots carry the same subtrace.id; only the root carries
        // the root marker.
        let child_data = &ended[0];
        let root_data = &ended[1];
        assert_eq!(
            child_data.attributes.get(SUBTRACE_ID_KEY),
            root_data.attributes.get(SUBTRACE_ID_KEY)
        );
        assert!(root_data.attributes.contains_key(SUBTRACE_IS_ROOT_SPAN_KEY));
        assert!(!child_data.attributes.contains_key(SUBTRACE_IS_ROOT_SPAN_KEY));
    }

    #[tokio::test]
    async fn test_unsampled_spans_bypass_processors() {
        let subtrace = Arc::new(SubtraceIdProcessor::new());
        let provider = TracerProvider::new(
            TracerConfig::new("test-service")
                .with_sampling_strategy(SamplingStrategy::AlwaysOff),
        )
        .with_span_processor(subtrace.clone());

        let tracer = provider.default_tracer().await;
        let span = tracer.start_span("dropped");
        assert!(!span.is_recording());
        assert_eq!(subtrace.tracked_traces(), 0);
    }

    #[tokio::test]
    async fn test_span_builder_applies_attributes_after_processors() {
        let provider = TracerProvider::new(TracerConfig::new("test-service"))
            .with_span_processor(Arc::new(SubtraceIdProcessor::new()));
        let tracer = provider.default_tracer().await;

        let span = tracer
            .span_builder("handler")
            .with_kind(SpanKind::Server)
            .with_attribute("http.method", "GET")
            .start();

        let data = span.get_data();
        assert_eq!(data.kind, SpanKind::Server);
        assert!(data.attributes.contains_key("http.method"));
        assert!(data.attributes.contains_key(SUBTRACE_ID_KEY));
    }

    #[test]
    fn test_sampling_always_on_off() {
        assert!(SamplingStrategy::AlwaysOn.should_sample(None, &TraceId::new()));
        assert!(!SamplingStrategy::AlwaysOff.should_sample(None, &TraceId::new()));
    }

    #[test]
    fn test_sampling_probabilistic_is_consistent_per_trace() {
        let strategy = SamplingStrategy::Probabilistic(0.5);
        let trace_id = TraceId::new();
        let first = strategy.should_sample(None, &trace_id);
        for _ in 0..10 {
            assert_eq!(strategy.should_sample(None, &trace_id), first);
        }
    }

    #[test]
    fn test_sampling_parent_based_follows_parent() {
        let strategy = SamplingStrategy::ParentBased {
            root: Box::new(SamplingStrategy::AlwaysOff),
        };

        let sampled_parent =
            SpanContext::new(TraceId::new(), SpanId::new(), TraceFlags::SAMPLED, true);
        assert!(strategy.should_sample(Some(&sampled_parent), &TraceId::new()));

        let unsampled_parent =
            SpanContext::new(TraceId::new(), SpanId::new(), TraceFlags::NONE, true);
        assert!(!strategy.should_sample(Some(&unsampled_parent), &TraceId::new()));

        assert!(!strategy.should_sample(None, &TraceId::new()));
    }
}
