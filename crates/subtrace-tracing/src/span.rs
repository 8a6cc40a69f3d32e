//! Span 定义和管理
//!
//! 追踪的基本单元。Span 的内部状态由同步锁保护：span 启动阶段的处理器在
//! 调用方线程上内联运行，绝不允许挂起，因此属性读写必须是同步操作。
//! The span's interior state sits behind a synchronous lock: span-start
//! processors run inline on the calling thread and must never suspend, so
//! attribute access has to be a plain blocking operation (short, in-memory).

use crate::context::{SpanContext, SpanId, TraceId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Span 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SpanKind {
    /// 内部操作
    #[default]
    Internal,
    /// 服务器端（处理请求）
    Server,
    /// 客户端（发起请求）
    Client,
    /// 消息生产者
    Producer,
    /// 消息消费者
    Consumer,
}

impl std::fmt::Display for SpanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpanKind::Internal => write!(f, "INTERNAL"),
            SpanKind::Server => write!(f, "SERVER"),
            SpanKind::Client => write!(f, "CLIENT"),
            SpanKind::Producer => write!(f, "PRODUCER"),
            SpanKind::Consumer => write!(f, "CONSUMER"),
        }
    }
}

/// Span 状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum SpanStatus {
    /// 未设置
    #[default]
    Unset,
    /// 成功
    Ok,
    /// 错误
    Error { message: String },
}

/// Span 属性值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SpanAttribute {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    StringArray(Vec<String>),
    IntArray(Vec<i64>),
}

impl SpanAttribute {
    /// 字符串值（其他类型返回 None）
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SpanAttribute::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// 布尔值（其他类型返回 None）
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SpanAttribute::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for SpanAttribute {
    fn from(v: &str) -> Self {
        SpanAttribute::String(v.to_string())
    }
}

impl From<String> for SpanAttribute {
    fn from(v: String) -> Self {
        SpanAttribute::String(v)
    }
}

impl From<i64> for SpanAttribute {
    fn from(v: i64) -> Self {
        SpanAttribute::Int(v)
    }
}

impl From<i32> for SpanAttribute {
    fn from(v: i32) -> Self {
        SpanAttribute::Int(v as i64)
    }
}

impl From<u64> for SpanAttribute {
    fn from(v: u64) -> Self {
        SpanAttribute::Int(v as i64)
    }
}

impl From<f64> for SpanAttribute {
    fn from(v: f64) -> Self {
        SpanAttribute::Float(v)
    }
}

impl From<bool> for SpanAttribute {
    fn from(v: bool) -> Self {
        SpanAttribute::Bool(v)
    }
}

impl From<Vec<String>> for SpanAttribute {
    fn from(v: Vec<String>) -> Self {
        SpanAttribute::StringArray(v)
    }
}

/// Span 事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanEvent {
    /// 事件名称
    pub name: String,
    /// 事件时间
    pub timestamp: DateTime<Utc>,
    /// 事件属性
    pub attributes: HashMap<String, SpanAttribute>,
}

impl SpanEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timestamp: Utc::now(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<SpanAttribute>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Span 数据 - 导出时的不可变快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanData {
    /// Span 上下文
    pub span_context: SpanContext,
    /// 父 Span 上下文
    pub parent_span_context: Option<SpanContext>,
    /// Span 名称
    pub name: String,
    /// Span 类型
    pub kind: SpanKind,
    /// 开始时间
    pub start_time: DateTime<Utc>,
    /// 结束时间
    pub end_time: Option<DateTime<Utc>>,
    /// 状态
    pub status: SpanStatus,
    /// 属性
    pub attributes: HashMap<String, SpanAttribute>,
    /// 事件
    pub events: Vec<SpanEvent>,
    /// 服务名称
    pub service_name: String,
}

/// Span 内部状态
struct SpanInner {
    data: SpanData,
    is_recording: bool,
    is_ended: bool,
}

/// Span - 追踪的基本单元
///
/// 克隆是浅拷贝，多个句柄共享同一内部状态。
/// Cloning is shallow; every handle shares the same interior state.
pub struct Span {
    inner: Arc<RwLock<SpanInner>>,
}

impl Span {
    /// 创建新的 Span
    pub(crate) fn new(
        name: impl Into<String>,
        span_context: SpanContext,
        parent_span_context: Option<SpanContext>,
        kind: SpanKind,
        service_name: impl Into<String>,
    ) -> Self {
        let inner = SpanInner {
            data: SpanData {
                span_context,
                parent_span_context,
                name: name.into(),
                kind,
                start_time: Utc::now(),
                end_time: None,
                status: SpanStatus::Unset,
                attributes: HashMap::new(),
                events: Vec::new(),
                service_name: service_name.into(),
            },
            is_recording: true,
            is_ended: false,
        };
        Self {
            inner: Arc::new(RwLock::new(inner)),
        }
    }

    /// 创建非记录的 Span（用于未采样的情况）
    pub fn non_recording(span_context: SpanContext) -> Self {
        let inner = SpanInner {
            data: SpanData {
                span_context,
                parent_span_context: None,
                name: String::new(),
                kind: SpanKind::Internal,
                start_time: Utc::now(),
                end_time: None,
                status: SpanStatus::Unset,
                attributes: HashMap::new(),
                events: Vec::new(),
                service_name: String::new(),
            },
            is_recording: false,
            is_ended: false,
        };
        Self {
            inner: Arc::new(RwLock::new(inner)),
        }
    }

    /// 获取 SpanContext
    pub fn span_context(&self) -> SpanContext {
        self.inner.read().data.span_context.clone()
    }

    /// 获取 Trace ID
    pub fn trace_id(&self) -> TraceId {
        self.inner.read().data.span_context.trace_id
    }

    /// 获取 Span ID
    pub fn span_id(&self) -> SpanId {
        self.inner.read().data.span_context.span_id
    }

    /// 是否正在记录
    pub fn is_recording(&self) -> bool {
        self.inner.read().is_recording
    }

    /// 是否已结束
    pub fn is_ended(&self) -> bool {
        self.inner.read().is_ended
    }

    /// 设置属性（已结束或非记录的 Span 上静默忽略）
    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<SpanAttribute>) {
        let mut inner = self.inner.write();
        if inner.is_recording && !inner.is_ended {
            inner.data.attributes.insert(key.into(), value.into());
        }
    }

    /// 批量设置属性
    pub fn set_attributes(&self, attributes: impl IntoIterator<Item = (String, SpanAttribute)>) {
        let mut inner = self.inner.write();
        if inner.is_recording && !inner.is_ended {
            for (key, value) in attributes {
                inner.data.attributes.insert(key, value);
            }
        }
    }

    /// 读取单个属性的当前值
    pub fn attribute(&self, key: &str) -> Option<SpanAttribute> {
        self.inner.read().data.attributes.get(key).cloned()
    }

    /// 添加事件
    pub fn add_event(&self, event: SpanEvent) {
        let mut inner = self.inner.write();
        if inner.is_recording && !inner.is_ended {
            inner.data.events.push(event);
        }
    }

    /// 添加简单事件
    pub fn add_event_with_name(&self, name: impl Into<String>) {
        self.add_event(SpanEvent::new(name));
    }

    /// 设置状态
    pub fn set_status(&self, status: SpanStatus) {
        let mut inner = self.inner.write();
        if inner.is_recording && !inner.is_ended {
            inner.data.status = status;
        }
    }

    /// 设置为成功状态
    pub fn set_ok(&self) {
        self.set_status(SpanStatus::Ok);
    }

    /// 设置为错误状态
    pub fn set_error(&self, message: impl Into<String>) {
        self.set_status(SpanStatus::Error {
            message: message.into(),
        });
    }

    /// 记录异常：作为 `exception` 事件记录并置为错误状态
    pub fn record_exception(&self, error: &dyn std::error::Error) {
        let event = SpanEvent::new("exception")
            .with_attribute("exception.type", std::any::type_name_of_val(error))
            .with_attribute("exception.message", error.to_string());
        self.add_event(event);
        self.set_error(error.to_string());
    }

    /// 更新名称
    pub fn update_name(&self, name: impl Into<String>) {
        let mut inner = self.inner.write();
        if inner.is_recording && !inner.is_ended {
            inner.data.name = name.into();
        }
    }

    /// 结束 Span（重复调用无效果）
    pub fn end(&self) {
        let mut inner = self.inner.write();
        if !inner.is_ended {
            inner.is_ended = true;
            inner.data.end_time = Some(Utc::now());
        }
    }

    /// 结束 Span 并指定时间
    pub fn end_with_timestamp(&self, timestamp: DateTime<Utc>) {
        let mut inner = self.inner.write();
        if !inner.is_ended {
            inner.is_ended = true;
            inner.data.end_time = Some(timestamp);
        }
    }

    /// 获取 Span 数据快照（用于导出）
    pub fn get_data(&self) -> SpanData {
        self.inner.read().data.clone()
    }

    /// 获取持续时间（毫秒）
    pub fn duration_ms(&self) -> Option<i64> {
        let inner = self.inner.read();
        inner
            .data
            .end_time
            .map(|end| (end - inner.data.start_time).num_milliseconds())
    }
}

impl Clone for Span {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::context::TraceFlags;
    use super::*;

    fn recording_span() -> Span {
        let span_context =
            SpanContext::new(TraceId::new(), SpanId::new(), TraceFlags::SAMPLED, false);
        Span::new("test-span", span_context, None, SpanKind::Internal, "test-service")
    }

    #[test]
    fn test_span_creation() {
        let span = recording_span();
        assert!(span.is_recording());
        assert!(!span.is_ended());
        assert_eq!(span.trace_id(), span.span_context().trace_id);
    }

    #[test]
    fn test_span_attributes() {
        let span = recording_span();

        span.set_attribute("key1", "value1");
        span.set_attribute("key2", 42i64);
        span.set_attribute("key3", true);

        assert_eq!(span.attribute("key1"), Some(SpanAttribute::from("value1")));
        assert_eq!(span.attribute("key3").and_then(|a| a.as_bool()), Some(true));
        assert_eq!(span.get_data().attributes.len(), 3);
    }

    #[test]
    fn test_attributes_ignored_after_end() {
        let span = recording_span();
        span.end();
        span.set_attribute("late", "value");
        assert!(span.attribute("late").is_none());
    }

    #[test]
    fn test_non_recording_span_ignores_writes() {
        let ctx = SpanContext::new(TraceId::new(), SpanId::new(), TraceFlags::NONE, false);
        let span = Span::non_recording(ctx);
        span.set_attribute("key", "value");
        assert!(!span.is_recording());
        assert!(span.get_data().attributes.is_empty());
    }

    #[test]
    fn test_span_events() {
        let span = recording_span();
        span.add_event_with_name("event1");
        span.add_event(SpanEvent::new("event2").with_attribute("attr", "value"));
        assert_eq!(span.get_data().events.len(), 2);
    }

    #[test]
    fn test_record_exception_sets_error_status() {
        let span = recording_span();
        let err = std::io::Error::other("boom");
        span.record_exception(&err);

        let data = span.get_data();
        assert_eq!(data.events.len(), 1);
        assert_eq!(data.events[0].name, "exception");
        assert!(matches!(data.status, SpanStatus::Error { .. }));
    }

    #[test]
    fn test_span_end_is_idempotent() {
        let span = recording_span();
        span.end();
        let first_end = span.get_data().end_time;
        span.end();
        assert_eq!(span.get_data().end_time, first_end);
        assert!(span.duration_ms().is_some());
    }
}
