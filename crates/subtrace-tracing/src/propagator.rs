//! Trace Context 传播器
//! Trace context propagator
//!
//! 实现 W3C Trace Context 的 `traceparent`/`tracestate` 注入与提取。两跳
//! 服务靠它共享同一个分布式 trace id；subtrace 处理器只读上下文，传播
//! 完全由这里负责。
//! Implements W3C Trace Context `traceparent`/`tracestate` injection and
//! extraction. The two service hops share one distributed trace id through
//! this; the subtrace processor only reads context, propagation lives here.

use crate::context::{SpanContext, SpanId, TraceFlags, TraceId, TraceState};
use std::collections::HashMap;

/// Header 载体 - 用于传播追踪上下文
/// Header carrier - used for propagating trace context
pub trait HeaderCarrier {
    /// 获取 header 值
    /// Get a header value
    fn get(&self, key: &str) -> Option<&str>;
    /// 设置 header 值
    /// Set a header value
    fn set(&mut self, key: &str, value: String);
}

/// HashMap 实现 HeaderCarrier
/// HashMap implementation of HeaderCarrier
impl HeaderCarrier for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<&str> {
        self.get(key).map(|s| s.as_str())
    }

    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_string(), value);
    }
}

/// Trace 传播器 trait
/// Trace propagator trait
pub trait TracePropagator: Send + Sync {
    /// 从载体中提取 SpanContext
    /// Extract a SpanContext from the carrier
    fn extract(&self, carrier: &dyn HeaderCarrier) -> Option<SpanContext>;

    /// 将 SpanContext 注入到载体中
    /// Inject a SpanContext into the carrier
    fn inject(&self, span_context: &SpanContext, carrier: &mut dyn HeaderCarrier);

    /// 获取传播器使用的 header 名称
    /// Header names the propagator uses
    fn fields(&self) -> &[&str];
}

/// W3C Trace Context 传播器
/// W3C Trace Context propagator
///
/// - traceparent: version-trace_id-span_id-flags
/// - tracestate: 供应商特定数据
/// - tracestate: vendor-specific data
pub struct W3CTraceContextPropagator;

impl W3CTraceContextPropagator {
    /// traceparent header 名称
    /// traceparent header name
    pub const TRACEPARENT: &'static str = "traceparent";
    /// tracestate header 名称
    /// tracestate header name
    pub const TRACESTATE: &'static str = "tracestate";
    /// 版本号
    /// Version number
    pub const VERSION: &'static str = "00";

    pub fn new() -> Self {
        Self
    }

    /// 解析 traceparent header
    /// Parse a traceparent header
    fn parse_traceparent(value: &str) -> Option<(TraceId, SpanId, TraceFlags)> {
        let parts: Vec<&str> = value.split('-').collect();
        if parts.len() != 4 {
            return None;
        }

        // 更高版本也只解析已知字段。
        // Higher versions still only parse the known fields.
        let trace_id = TraceId::from_hex(parts[1]).ok()?;
        let span_id = SpanId::from_hex(parts[2]).ok()?;
        let flags = u8::from_str_radix(parts[3], 16).ok()?;

        Some((trace_id, span_id, TraceFlags::new(flags)))
    }

    /// 格式化 traceparent header
    /// Format a traceparent header
    fn format_traceparent(trace_id: &TraceId, span_id: &SpanId, flags: &TraceFlags) -> String {
        format!(
            "{}-{}-{}-{:02x}",
            Self::VERSION,
            trace_id.to_hex(),
            span_id.to_hex(),
            flags.as_u8()
        )
    }
}

impl Default for W3CTraceContextPropagator {
    fn default() -> Self {
        Self::new()
    }
}

impl TracePropagator for W3CTraceContextPropagator {
    fn extract(&self, carrier: &dyn HeaderCarrier) -> Option<SpanContext> {
        let traceparent = carrier.get(Self::TRACEPARENT)?;
        let (trace_id, span_id, trace_flags) = Self::parse_traceparent(traceparent)?;

        if !trace_id.is_valid() || !span_id.is_valid() {
            return None;
        }

        let trace_state = carrier
            .get(Self::TRACESTATE)
            .map(TraceState::from_header)
            .unwrap_or_default();

        Some(SpanContext::new(trace_id, span_id, trace_flags, true).with_trace_state(trace_state))
    }

    fn inject(&self, span_context: &SpanContext, carrier: &mut dyn HeaderCarrier) {
        if !span_context.is_valid() {
            return;
        }

        let traceparent = Self::format_traceparent(
            &span_context.trace_id,
            &span_context.span_id,
            &span_context.trace_flags,
        );
        carrier.set(Self::TRACEPARENT, traceparent);

        if !span_context.trace_state.is_empty() {
            carrier.set(Self::TRACESTATE, span_context.trace_state.to_header());
        }
    }

    fn fields(&self) -> &[&str] {
        &[Self::TRACEPARENT, Self::TRACESTATE]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_w3c_propagator_inject_extract() {
        let propagator = W3CTraceContextPropagator::new();

        let span_context = SpanContext::new(
            TraceId::from_hex("0af7651916cd43dd8448eb211c80319c").unwrap(),
            SpanId::from_hex("b7ad6b7169203331").unwrap(),
            TraceFlags::SAMPLED,
            false,
        );

        let mut carrier = HashMap::new();
        propagator.inject(&span_context, &mut carrier);

        assert_eq!(
            carrier.get(W3CTraceContextPropagator::TRACEPARENT).map(|s| s.as_str()),
            Some("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01")
        );

        let extracted = propagator.extract(&carrier).unwrap();
        assert_eq!(extracted.trace_id, span_context.trace_id);
        assert_eq!(extracted.span_id, span_context.span_id);
        assert!(extracted.is_sampled());
        assert!(extracted.is_remote);
    }

    #[test]
    fn test_w3c_extract_rejects_malformed_headers() {
        let propagator = W3CTraceContextPropagator::new();

        for bad in [
            "",
            "00-abc-def-01",
            "00-00000000000000000000000000000000-0000000000000000-01",
            "not-a-traceparent",
        ] {
            let mut carrier = HashMap::new();
            carrier.insert(
                W3CTraceContextPropagator::TRACEPARENT.to_string(),
                bad.to_string(),
            );
            assert!(propagator.extract(&carrier).is_none(), "accepted: {bad}");
        }
    }

    #[test]
    fn test_w3c_tracestate_roundtrip() {
        let propagator = W3CTraceContextPropagator::new();

        let mut state = TraceState::new();
        state.insert("vendor", "value");
        let span_context = SpanContext::new(
            TraceId::new(),
            SpanId::new(),
            TraceFlags::SAMPLED,
            false,
        )
        .with_trace_state(state);

        let mut carrier = HashMap::new();
        propagator.inject(&span_context, &mut carrier);

        let extracted = propagator.extract(&carrier).unwrap();
        assert_eq!(extracted.trace_state.get("vendor"), Some("value"));
    }

    #[test]
    fn test_w3c_inject_skips_invalid_context() {
        let propagator = W3CTraceContextPropagator::new();
        let mut carrier = HashMap::new();
        propagator.inject(&SpanContext::invalid(), &mut carrier);
        assert!(carrier.is_empty());
    }
}
