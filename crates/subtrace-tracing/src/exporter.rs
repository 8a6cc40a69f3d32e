//! Tracing 导出器
//! Tracing exporters
//!
//! 支持 Console 和 OTLP/HTTP (JSON) 两种导出目标。subtrace 属性在到达
//! 这里之前就已经在 span 上了，导出器按普通属性透传。
//! Supports Console and OTLP/HTTP (JSON) destinations. The subtrace
//! attributes are already on the span by the time it gets here; exporters
//! pass them through like any other attribute.

use crate::error::{TraceError, TraceResult};
use crate::span::{SpanAttribute, SpanData, SpanKind, SpanStatus};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// 导出器配置
/// Exporter configuration
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    /// 服务名称
    /// Service name
    pub service_name: String,
    /// 批量大小
    /// Batch size
    pub batch_size: usize,
    /// 最大队列大小
    /// Maximum queue size
    pub max_queue_size: usize,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown-service".to_string(),
            batch_size: 512,
            max_queue_size: 2048,
        }
    }
}

impl ExporterConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_queue_size(mut self, max_size: usize) -> Self {
        self.max_queue_size = max_size;
        self
    }
}

/// 追踪导出器 trait
/// Tracing exporter trait
#[async_trait]
pub trait TracingExporter: Send + Sync {
    /// 导出 spans
    /// Export spans
    async fn export(&self, spans: Vec<SpanData>) -> TraceResult<()>;

    /// 关闭导出器
    /// Shut the exporter down
    async fn shutdown(&self) -> TraceResult<()>;

    /// 强制刷新
    /// Force flush
    async fn force_flush(&self) -> TraceResult<()>;
}

/// Console 导出器 - 输出到日志
/// Console exporter - writes to the log
pub struct ConsoleExporter {
    config: ExporterConfig,
    /// 是否使用 JSON 格式
    /// Whether to emit JSON lines
    json_format: bool,
    /// 是否只输出摘要
    /// Whether to emit the one-line summary only
    summary_only: bool,
}

impl ConsoleExporter {
    pub fn new(config: ExporterConfig) -> Self {
        Self {
            config,
            json_format: false,
            summary_only: false,
        }
    }

    pub fn with_json_format(mut self) -> Self {
        self.json_format = true;
        self
    }

    pub fn with_summary_only(mut self) -> Self {
        self.summary_only = true;
        self
    }

    fn format_span(&self, span: &SpanData) -> String {
        if self.json_format {
            serde_json::to_string(span).unwrap_or_else(|_| format!("{:?}", span))
        } else {
            let duration = span
                .end_time
                .map(|end| (end - span.start_time).num_milliseconds())
                .unwrap_or(0);
            let subtrace = span
                .attributes
                .get(crate::subtrace::SUBTRACE_ID_KEY)
                .and_then(|a| a.as_str())
                .unwrap_or("-");
            if self.summary_only {
                format!(
                    "[{}] {} | trace={} span={} subtrace={} | {}ms | {:?}",
                    span.kind,
                    span.name,
                    span.span_context.trace_id,
                    span.span_context.span_id,
                    subtrace,
                    duration,
                    span.status
                )
            } else {
                let parent = span
                    .parent_span_context
                    .as_ref()
                    .map(|p| p.span_id.to_hex())
                    .unwrap_or_else(|| "none".to_string());
                format!(
                    r#"
┌─ Span ─────────────────────────────────────────────────────
│ Name:      {}
│ Service:   {}
│ Kind:      {}
│ TraceId:   {}
│ SpanId:    {}
│ ParentId:  {}
│ Subtrace:  {}
│ Duration:  {}ms
│ Status:    {:?}
│ Attributes: {:?}
│ Events:    {} events
└────────────────────────────────────────────────────────────"#,
                    span.name,
                    span.service_name,
                    span.kind,
                    span.span_context.trace_id,
                    span.span_context.span_id,
                    parent,
                    subtrace,
                    duration,
                    span.status,
                    span.attributes,
                    span.events.len()
                )
            }
        }
    }
}

#[async_trait]
impl TracingExporter for ConsoleExporter {
    async fn export(&self, spans: Vec<SpanData>) -> TraceResult<()> {
        for span in spans {
            info!("{}", self.format_span(&span));
        }
        Ok(())
    }

    async fn shutdown(&self) -> TraceResult<()> {
        info!("Console exporter shutdown");
        Ok(())
    }

    async fn force_flush(&self) -> TraceResult<()> {
        Ok(())
    }
}

/// OTLP 导出器配置
/// OTLP exporter configuration
#[derive(Debug, Clone)]
pub struct OtlpConfig {
    /// Endpoint
    pub endpoint: String,
    /// Headers
    pub headers: std::collections::HashMap<String, String>,
    /// 超时（毫秒）
    /// Timeout (milliseconds)
    pub timeout_ms: u64,
}

impl Default for OtlpConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:4318".to_string(),
            headers: std::collections::HashMap::new(),
            timeout_ms: 10_000,
        }
    }
}

impl OtlpConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }
}

/// 将属性值映射为 OTLP AnyValue JSON。布尔属性必须保持布尔类型：
/// 下游用属性是否存在（而非真假值）区分 subtrace 根。
/// Maps an attribute to OTLP AnyValue JSON. Boolean attributes must stay
/// booleans: downstream tells subtrace roots apart by attribute presence,
/// not truthiness.
fn attribute_value(value: &SpanAttribute) -> serde_json::Value {
    match value {
        SpanAttribute::String(s) => serde_json::json!({ "stringValue": s }),
        SpanAttribute::Int(i) => serde_json::json!({ "intValue": i.to_string() }),
        SpanAttribute::Float(f) => serde_json::json!({ "doubleValue": f }),
        SpanAttribute::Bool(b) => serde_json::json!({ "boolValue": b }),
        SpanAttribute::StringArray(values) => serde_json::json!({
            "arrayValue": { "values": values.iter().map(|v| serde_json::json!({ "stringValue": v })).collect::<Vec<_>>() }
        }),
        SpanAttribute::IntArray(values) => serde_json::json!({
            "arrayValue": { "values": values.iter().map(|v| serde_json::json!({ "intValue": v.to_string() })).collect::<Vec<_>>() }
        }),
    }
}

/// OTLP 导出器 - OTLP/HTTP JSON
/// OTLP exporter - OTLP/HTTP JSON
pub struct OtlpExporter {
    config: ExporterConfig,
    otlp_config: OtlpConfig,
    client: Client,
    buffer: Arc<RwLock<Vec<SpanData>>>,
}

impl OtlpExporter {
    pub fn new(config: ExporterConfig, otlp_config: OtlpConfig) -> Self {
        Self {
            config,
            otlp_config,
            client: Client::new(),
            buffer: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// 将 SpanData 转换为 OTLP span JSON
    /// Convert SpanData to OTLP span JSON
    fn to_otlp_span(&self, span: &SpanData) -> serde_json::Value {
        let status_code = match &span.status {
            SpanStatus::Unset => 0,
            SpanStatus::Ok => 1,
            SpanStatus::Error { .. } => 2,
        };

        serde_json::json!({
            "traceId": span.span_context.trace_id.to_hex(),
            "spanId": span.span_context.span_id.to_hex(),
            "parentSpanId": span.parent_span_context.as_ref().map(|p| p.span_id.to_hex()),
            "name": span.name,
            "kind": match span.kind {
                SpanKind::Internal => 1,
                SpanKind::Server => 2,
                SpanKind::Client => 3,
                SpanKind::Producer => 4,
                SpanKind::Consumer => 5,
            },
            "startTimeUnixNano": span.start_time.timestamp_nanos_opt().unwrap_or(0),
            "endTimeUnixNano": span.end_time.map(|t| t.timestamp_nanos_opt().unwrap_or(0)),
            "attributes": span.attributes.iter().map(|(k, v)| {
                serde_json::json!({ "key": k, "value": attribute_value(v) })
            }).collect::<Vec<_>>(),
            "events": span.events.iter().map(|e| {
                serde_json::json!({
                    "timeUnixNano": e.timestamp.timestamp_nanos_opt().unwrap_or(0),
                    "name": e.name,
                    "attributes": e.attributes.iter().map(|(k, v)| {
                        serde_json::json!({ "key": k, "value": attribute_value(v) })
                    }).collect::<Vec<_>>()
                })
            }).collect::<Vec<_>>(),
            "status": {
                "code": status_code,
                "message": match &span.status {
                    SpanStatus::Error { message } => message.clone(),
                    _ => String::new(),
                }
            }
        })
    }

    async fn send_to_otlp(&self, spans: &[SpanData]) -> TraceResult<()> {
        let resource_spans = serde_json::json!({
            "resourceSpans": [{
                "resource": {
                    "attributes": [{
                        "key": "service.name",
                        "value": { "stringValue": self.config.service_name }
                    }]
                },
                "scopeSpans": [{
                    "scope": {
                        "name": "subtrace-tracing",
                        "version": env!("CARGO_PKG_VERSION")
                    },
                    "spans": spans.iter().map(|s| self.to_otlp_span(s)).collect::<Vec<_>>()
                }]
            }]
        });

        let url = format!(
            "{}/v1/traces",
            self.otlp_config.endpoint.trim_end_matches('/')
        );

        debug!("Sending {} spans to OTLP endpoint at {}", spans.len(), url);

        let mut request = self.client.post(&url).json(&resource_spans);
        for (key, value) in &self.otlp_config.headers {
            request = request.header(key, value);
        }
        let request = request.timeout(std::time::Duration::from_millis(
            self.otlp_config.timeout_ms,
        ));

        let response = request
            .send()
            .await
            .map_err(|e| TraceError::Export(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TraceError::ExportStatus(response.status().as_u16()));
        }

        debug!("Successfully sent {} spans to OTLP endpoint", spans.len());

        Ok(())
    }
}

#[async_trait]
impl TracingExporter for OtlpExporter {
    async fn export(&self, spans: Vec<SpanData>) -> TraceResult<()> {
        if spans.is_empty() {
            return Ok(());
        }

        {
            let mut buffer = self.buffer.write().await;
            buffer.extend(spans);

            if buffer.len() >= self.config.batch_size {
                let to_export: Vec<_> = buffer.drain(..).collect();
                drop(buffer);
                return self.send_to_otlp(&to_export).await;
            }
        }

        Ok(())
    }

    async fn shutdown(&self) -> TraceResult<()> {
        self.force_flush().await?;
        info!("OTLP exporter shutdown");
        Ok(())
    }

    async fn force_flush(&self) -> TraceResult<()> {
        let to_export: Vec<_> = {
            let mut buffer = self.buffer.write().await;
            buffer.drain(..).collect()
        };

        if !to_export.is_empty() {
            self.send_to_otlp(&to_export).await?;
        }

        Ok(())
    }
}
