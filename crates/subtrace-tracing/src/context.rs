//! 追踪标识符与 Span 上下文
//! Trace identifiers and span context
//!
//! 分布式追踪使用的 128 位 TraceId 和 64 位 SpanId，遵循 W3C Trace Context
//! 的编码规则（小写十六进制，零填充）。
//! 128-bit TraceId and 64-bit SpanId as used in distributed tracing,
//! following the W3C Trace Context encoding rules (lowercase hex,
//! zero-padded).

use crate::error::{TraceError, TraceResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 分布式追踪 ID - 16 字节（128 位）
/// Distributed trace ID - 16 bytes (128 bits)
///
/// 同一个端到端请求的所有 span 共享一个 TraceId，无论由哪个服务产生。
/// Every span belonging to one end-to-end request shares a TraceId,
/// regardless of which service produced it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceId([u8; 16]);

impl TraceId {
    /// 创建新的随机 Trace ID
    /// Create a new random Trace ID
    pub fn new() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill(&mut bytes);
        Self(bytes)
    }

    /// 从字节数组创建
    /// Create from a byte array
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// 从 u128 创建（主要用于测试中的可读常量）
    /// Create from a u128 (mostly for readable constants in tests)
    pub fn from_u128(value: u128) -> Self {
        Self(value.to_be_bytes())
    }

    /// 从 32 个十六进制字符解析
    /// Parse from 32 hexadecimal characters
    pub fn from_hex(hex_str: &str) -> TraceResult<Self> {
        if hex_str.len() != 32 {
            return Err(TraceError::InvalidId {
                what: "trace id",
                expected: 32,
            });
        }
        let bytes = hex::decode(hex_str)?;
        let mut arr = [0u8; 16];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// 渲染为 32 个小写十六进制字符（零填充）
    /// Render as 32 lowercase hex characters (zero-padded)
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// 获取字节
    /// Get the bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// 是否有效（非全零）
    /// Whether it is valid (not all zeros)
    pub fn is_valid(&self) -> bool {
        self.0.iter().any(|&b| b != 0)
    }

    /// 无效的 Trace ID
    /// Invalid Trace ID
    pub const INVALID: TraceId = TraceId([0u8; 16]);
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({})", self.to_hex())
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for TraceId {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Span ID - 8 字节（64 位）
/// Span ID - 8 bytes (64 bits)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanId([u8; 8]);

impl SpanId {
    /// 创建新的随机 Span ID
    /// Create a new random Span ID
    pub fn new() -> Self {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill(&mut bytes);
        Self(bytes)
    }

    /// 从字节数组创建
    /// Create from a byte array
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// 从 u64 创建（主要用于测试中的可读常量）
    /// Create from a u64 (mostly for readable constants in tests)
    pub fn from_u64(value: u64) -> Self {
        Self(value.to_be_bytes())
    }

    /// 从 16 个十六进制字符解析
    /// Parse from 16 hexadecimal characters
    pub fn from_hex(hex_str: &str) -> TraceResult<Self> {
        if hex_str.len() != 16 {
            return Err(TraceError::InvalidId {
                what: "span id",
                expected: 16,
            });
        }
        let bytes = hex::decode(hex_str)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// 渲染为 16 个小写十六进制字符（零填充）
    /// Render as 16 lowercase hex characters (zero-padded)
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// 获取字节
    /// Get the bytes
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// 是否有效（非全零）
    /// Whether it is valid (not all zeros)
    pub fn is_valid(&self) -> bool {
        self.0.iter().any(|&b| b != 0)
    }

    /// 无效的 Span ID
    /// Invalid Span ID
    pub const INVALID: SpanId = SpanId([0u8; 8]);
}

impl Default for SpanId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpanId({})", self.to_hex())
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for SpanId {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Trace Flags - 采样标志位
/// Trace Flags - sampling flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceFlags(u8);

impl TraceFlags {
    /// 已采样标志
    /// Sampled flag
    pub const SAMPLED: TraceFlags = TraceFlags(0x01);
    /// 无标志
    /// No flags
    pub const NONE: TraceFlags = TraceFlags(0x00);

    /// 从原始字节创建
    /// Create from the raw byte
    pub fn new(flags: u8) -> Self {
        Self(flags)
    }

    /// 是否已采样
    /// Whether it is sampled
    pub fn is_sampled(&self) -> bool {
        self.0 & 0x01 != 0
    }

    /// 设置采样位
    /// Set the sampled bit
    pub fn with_sampled(mut self, sampled: bool) -> Self {
        if sampled {
            self.0 |= 0x01;
        } else {
            self.0 &= !0x01;
        }
        self
    }

    /// 获取原始值
    /// Get the raw value
    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

impl Default for TraceFlags {
    fn default() -> Self {
        Self::SAMPLED
    }
}

impl fmt::Display for TraceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}", self.0)
    }
}

/// Trace State - 供应商特定的键值对
/// Trace State - vendor-specific key/value entries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceState {
    entries: Vec<(String, String)>,
}

impl TraceState {
    /// 创建空的 TraceState
    /// Create an empty TraceState
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// 添加条目（同名条目被替换）
    /// Add an entry (an existing entry with the same key is replaced)
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.entries.retain(|(k, _)| k != &key);
        self.entries.push((key, value.into()));
    }

    /// 获取条目
    /// Get an entry
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// 是否为空
    /// Whether it is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 转换为 `tracestate` header 格式
    /// Convert to `tracestate` header format
    pub fn to_header(&self) -> String {
        self.entries
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// 从 `tracestate` header 解析
    /// Parse from a `tracestate` header
    pub fn from_header(header: &str) -> Self {
        let entries = header
            .split(',')
            .filter_map(|part| {
                let mut iter = part.splitn(2, '=');
                let key = iter.next()?.trim().to_string();
                let value = iter.next()?.trim().to_string();
                if key.is_empty() { None } else { Some((key, value)) }
            })
            .collect();
        Self { entries }
    }
}

/// Span Context - Span 的不可变标识信息
/// Span Context - immutable identity of a span
///
/// 跨进程传播的就是这个结构；subtrace 处理器只读取它，绝不修改。
/// This is what propagates across processes; the subtrace processor only
/// reads it and never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanContext {
    /// Trace ID
    pub trace_id: TraceId,
    /// Span ID
    pub span_id: SpanId,
    /// 采样标志
    /// Sampling flags
    pub trace_flags: TraceFlags,
    /// 供应商数据
    /// Vendor data
    pub trace_state: TraceState,
    /// 是否来自远程服务
    /// Whether it was propagated from a remote service
    pub is_remote: bool,
}

impl SpanContext {
    /// 创建新的 SpanContext
    /// Create a new SpanContext
    pub fn new(trace_id: TraceId, span_id: SpanId, trace_flags: TraceFlags, is_remote: bool) -> Self {
        Self {
            trace_id,
            span_id,
            trace_flags,
            trace_state: TraceState::new(),
            is_remote,
        }
    }

    /// 创建无效的 SpanContext
    /// Create an invalid SpanContext
    pub fn invalid() -> Self {
        Self {
            trace_id: TraceId::INVALID,
            span_id: SpanId::INVALID,
            trace_flags: TraceFlags::NONE,
            trace_state: TraceState::new(),
            is_remote: false,
        }
    }

    /// 是否有效
    /// Whether it is valid
    pub fn is_valid(&self) -> bool {
        self.trace_id.is_valid() && self.span_id.is_valid()
    }

    /// 是否已采样
    /// Whether it is sampled
    pub fn is_sampled(&self) -> bool {
        self.trace_flags.is_sampled()
    }

    /// 设置 TraceState
    /// Set the TraceState
    pub fn with_trace_state(mut self, trace_state: TraceState) -> Self {
        self.trace_state = trace_state;
        self
    }
}

impl Default for SpanContext {
    fn default() -> Self {
        Self::invalid()
    }
}
