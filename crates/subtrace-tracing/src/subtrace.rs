//! Subtrace 分配处理器
//! Subtrace assignment processor
//!
//! 为本进程观察到的每个分布式 trace 计算一个确定性的 subtrace ID，并把它
//! 作为属性盖在该 trace 的每个 span 上；每个 trace 在本进程内恰好有一个
//! "根" span 被额外标记。传播的 trace 上下文本身绝不被修改。
//! Computes a deterministic subtrace ID for every distributed trace this
//! process observes and stamps it as an attribute on each of the trace's
//! spans; exactly one "root" span per trace gets an extra marker. The
//! propagated trace context itself is never mutated.

use crate::context::{SpanContext, SpanId, TraceId};
use crate::error::{TraceError, TraceResult};
use crate::span::{Span, SpanData};
use crate::tracer::SpanProcessor;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::fmt;

/// 属性键：subtrace ID（16 个小写十六进制字符）
/// Attribute key: the subtrace ID (16 lowercase hex characters)
pub const SUBTRACE_ID_KEY: &str = "subtrace.id";

/// 属性键：subtrace 根 span 标记
/// Attribute key: the subtrace root-span marker
///
/// 只在根 span 上写入 `true`；非根 span 上该属性不存在。"不存在"而非
/// `false` 是非根的信号，下游查询层依赖这一不对称性。
/// Written as `true` on the root span only; absent on every other span.
/// Absence, not `false`, is the non-root signal; downstream query layers
/// rely on this asymmetry.
pub const SUBTRACE_IS_ROOT_SPAN_KEY: &str = "subtrace.is_root_span";

/// Subtrace ID - 8 字节（64 位），渲染为 16 个小写十六进制字符
/// Subtrace ID - 8 bytes (64 bits), rendered as 16 lowercase hex characters
///
/// 标识一个分布式 trace 中由本进程产生的那部分 span。
/// Identifies the subset of a distributed trace produced by this process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SubtraceId([u8; 8]);

impl SubtraceId {
    /// 从 (trace id, 首个 span id) 确定性地派生
    /// Deterministically derive from (trace id, first span id)
    ///
    /// 算法（必须逐位可复现）：
    /// The algorithm (must reproduce bit-for-bit):
    /// 1. trace id → 32 个小写十六进制字符，零填充
    /// 2. span id → 16 个小写十六进制字符，零填充
    /// 3. 拼接成 48 字符 ASCII 字符串
    /// 4. 对其 UTF-8 字节计算 SHA-256
    /// 5. 取摘要前 8 字节
    pub fn derive(trace_id: &TraceId, root_span_id: &SpanId) -> Self {
        let combined = format!("{}{}", trace_id.to_hex(), root_span_id.to_hex());
        let digest = Sha256::digest(combined.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        Self(bytes)
    }

    /// 从 16 个十六进制字符解析
    /// Parse from 16 hexadecimal characters
    pub fn from_hex(hex_str: &str) -> TraceResult<Self> {
        if hex_str.len() != 16 {
            return Err(TraceError::InvalidId {
                what: "subtrace id",
                expected: 16,
            });
        }
        let bytes = hex::decode(hex_str)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// 渲染为 16 个小写十六进制字符
    /// Render as 16 lowercase hex characters
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// 获取字节
    /// Get the bytes
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Debug for SubtraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubtraceId({})", self.to_hex())
    }
}

impl fmt::Display for SubtraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// 每个 trace id 缓存的记录：(subtrace id, 根 span id)。创建后不可变，
/// 只归处理器的内部表所有；外部只能通过 span 属性观察到它。
/// The record cached per trace id: (subtrace id, root span id). Immutable
/// once created and owned exclusively by the processor's table; the outside
/// world only observes it through span attributes.
struct SubtraceRecord {
    subtrace_id: SubtraceId,
    root_span_id: SpanId,
}

/// Subtrace 处理器配置
/// Subtrace processor configuration
#[derive(Debug, Clone)]
pub struct SubtraceConfig {
    /// 内部表可容纳的最大 trace 数。达到上限后，未见过的 trace 的 span
    /// 不再获得 subtrace 属性（fail-open），已跟踪的 trace 不受影响。
    /// Maximum number of traces the internal table holds. Once reached,
    /// spans of unseen traces go unannotated (fail open); already-tracked
    /// traces are unaffected.
    pub max_traces: usize,
}

impl Default for SubtraceConfig {
    fn default() -> Self {
        Self { max_traces: 65_536 }
    }
}

impl SubtraceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_traces(mut self, max_traces: usize) -> Self {
        self.max_traces = max_traces;
        self
    }
}

/// Subtrace 分配处理器
/// Subtrace assignment processor
///
/// 必须注册在任何导出处理器之前，这样 span 到达导出侧时属性已经就位。
/// Must be registered before any exporting processor so the attributes are
/// in place by the time a span reaches the export side.
///
/// 显式构造、显式持有；没有隐式单例。`shutdown` 清空整张表。
/// Explicitly constructed and explicitly owned; no implicit singleton.
/// `shutdown` clears the whole table.
pub struct SubtraceIdProcessor {
    config: SubtraceConfig,
    table: DashMap<TraceId, SubtraceRecord>,
}

impl SubtraceIdProcessor {
    /// 使用默认配置创建
    /// Create with the default configuration
    pub fn new() -> Self {
        Self::with_config(SubtraceConfig::default())
    }

    /// 使用指定配置创建
    /// Create with the given configuration
    pub fn with_config(config: SubtraceConfig) -> Self {
        Self {
            config,
            table: DashMap::new(),
        }
    }

    /// 当前跟踪的 trace 数量
    /// Number of traces currently tracked
    pub fn tracked_traces(&self) -> usize {
        self.table.len()
    }

    /// 指定 trace 在本进程内的根 span id（若已跟踪）
    /// The root span id recorded for a trace in this process, if tracked
    pub(crate) fn root_span_id(&self, trace_id: &TraceId) -> Option<SpanId> {
        self.table.get(trace_id).map(|record| record.root_span_id)
    }

    /// 为一个正在启动的 span 计算并盖上 subtrace 属性。
    /// Compute and stamp the subtrace attributes for a starting span.
    ///
    /// 整个"查表或建表"必须是单个原子操作：`entry().or_insert_with` 的
    /// 闭包在分片写锁内执行，rootness 由插入记录的同一个临界区决定。
    /// 任何地方都不允许跨两个锁作用域的先读后写。
    /// The create-or-fetch must be one atomic operation: the
    /// `entry().or_insert_with` closure runs under the shard write lock, so
    /// rootness is decided by the same critical section that inserts the
    /// record. No read-then-write across two lock scopes anywhere.
    fn annotate(&self, span: &Span) -> TraceResult<()> {
        let ctx = span.span_context();
        let (trace_id, span_id) = (ctx.trace_id, ctx.span_id);

        // 无效上下文（全零 id）不参与 subtrace 分组。
        // Invalid contexts (all-zero ids) take no part in subtrace grouping.
        if !trace_id.is_valid() || !span_id.is_valid() {
            return Ok(());
        }

        // 容量上限检查。并发的首次观察之间该检查是尽力而为的，短暂超出
        // 上限是允许的；单根不变量不受影响。
        // Capacity bound. Best-effort between concurrent first observations;
        // briefly overshooting the cap is allowed and the single-root
        // invariant is unaffected.
        if self.table.len() >= self.config.max_traces && !self.table.contains_key(&trace_id) {
            return Err(TraceError::SubtraceTableFull(self.config.max_traces));
        }

        let mut created = false;
        let record = self.table.entry(trace_id).or_insert_with(|| {
            created = true;
            SubtraceRecord {
                subtrace_id: SubtraceId::derive(&trace_id, &span_id),
                root_span_id: span_id,
            }
        });
        let subtrace_id = record.subtrace_id;
        drop(record);

        if created {
            span.set_attribute(SUBTRACE_IS_ROOT_SPAN_KEY, true);
        }
        span.set_attribute(SUBTRACE_ID_KEY, subtrace_id.to_hex());

        Ok(())
    }
}

impl Default for SubtraceIdProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SpanProcessor for SubtraceIdProcessor {
    fn on_start(&self, span: &Span, _parent_context: Option<&SpanContext>) {
        // 注解失败绝不能打断 span 的创建：这里有意丢弃 Result，span 继续
        // 走完创建流程，只是不带 subtrace 属性。日志是尽力而为的旁路，
        // 不属于契约。
        // An annotation failure must never break span creation: the Result
        // is deliberately discarded here and the span proceeds without
        // subtrace attributes. The log line is a best-effort side channel,
        // not part of the contract.
        if let Err(err) = self.annotate(span) {
            tracing::debug!(trace_id = %span.trace_id(), "subtrace annotation skipped: {}", err);
        }
    }

    async fn on_end(&self, _span: SpanData) {
        // 启动时分配，之后不再回访。
        // Assign at start, never revisit.
    }

    async fn shutdown(&self) -> TraceResult<()> {
        self.table.clear();
        Ok(())
    }

    async fn force_flush(&self) -> TraceResult<()> {
        // 没有缓冲的工作，立即成功。
        // No buffered work; succeeds immediately.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TraceFlags;
    use crate::span::{SpanAttribute, SpanKind};

    fn span_with_ids(trace: u128, span: u64) -> Span {
        let ctx = SpanContext::new(
            TraceId::from_u128(trace),
            SpanId::from_u64(span),
            TraceFlags::SAMPLED,
            false,
        );
        Span::new("test-span", ctx, None, SpanKind::Internal, "test-service")
    }

    #[test]
    fn test_subtrace_id_golden_values() {
        // SHA-256("00000000000000000000000000000001" || "0000000000000001"),
        // first 8 digest bytes.
        let id = SubtraceId::derive(&TraceId::from_u128(1), &SpanId::from_u64(1));
        assert_eq!(id.to_hex(), "6c7acdb51f2191c8");

        let id = SubtraceId::derive(
            &TraceId::from_hex("0af7651916cd43dd8448eb211c80319c").unwrap(),
            &SpanId::from_hex("b7ad6b7169203331").unwrap(),
        );
        assert_eq!(id.to_hex(), "723cf076dbf487b7");
    }

    #[test]
    fn test_subtrace_id_is_deterministic() {
        let trace = TraceId::new();
        let span = SpanId::new();
        assert_eq!(
            SubtraceId::derive(&trace, &span),
            SubtraceId::derive(&trace, &span)
        );
    }

    #[test]
    fn test_subtrace_id_depends_on_both_inputs() {
        let a = SubtraceId::derive(&TraceId::from_u128(1), &SpanId::from_u64(1));
        let b = SubtraceId::derive(&TraceId::from_u128(1), &SpanId::from_u64(2));
        let c = SubtraceId::derive(&TraceId::from_u128(2), &SpanId::from_u64(1));
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_subtrace_id_hex_roundtrip() {
        let id = SubtraceId::derive(&TraceId::new(), &SpanId::new());
        assert_eq!(SubtraceId::from_hex(&id.to_hex()).unwrap(), id);
        assert!(SubtraceId::from_hex("nope").is_err());
    }

    #[test]
    fn test_first_span_becomes_root() {
        let processor = SubtraceIdProcessor::new();
        let root = span_with_ids(7, 1);
        processor.on_start(&root, None);

        assert_eq!(
            root.attribute(SUBTRACE_IS_ROOT_SPAN_KEY),
            Some(SpanAttribute::Bool(true))
        );
        assert_eq!(
            root.attribute(SUBTRACE_ID_KEY).and_then(|a| a.as_str().map(String::from)),
            Some(SubtraceId::derive(&TraceId::from_u128(7), &SpanId::from_u64(1)).to_hex())
        );
        assert_eq!(
            processor.root_span_id(&TraceId::from_u128(7)),
            Some(SpanId::from_u64(1))
        );
    }

    #[test]
    fn test_followup_spans_share_id_without_root_marker() {
        let processor = SubtraceIdProcessor::new();
        let root = span_with_ids(7, 1);
        let child_a = span_with_ids(7, 2);
        let child_b = span_with_ids(7, 3);

        processor.on_start(&root, None);
        processor.on_start(&child_a, None);
        processor.on_start(&child_b, None);

        let root_id = root.attribute(SUBTRACE_ID_KEY);
        assert!(root_id.is_some());
        assert_eq!(child_a.attribute(SUBTRACE_ID_KEY), root_id);
        assert_eq!(child_b.attribute(SUBTRACE_ID_KEY), root_id);

        // Absence — not `false` — marks the non-root spans.
        assert!(child_a.attribute(SUBTRACE_IS_ROOT_SPAN_KEY).is_none());
        assert!(child_b.attribute(SUBTRACE_IS_ROOT_SPAN_KEY).is_none());
    }

    #[test]
    fn test_distinct_traces_get_independent_subtraces() {
        let processor = SubtraceIdProcessor::new();
        let a = span_with_ids(1, 1);
        let b = span_with_ids(2, 1);

        processor.on_start(&a, None);
        processor.on_start(&b, None);

        assert_ne!(
            a.attribute(SUBTRACE_ID_KEY),
            b.attribute(SUBTRACE_ID_KEY)
        );
        // Both are roots of their own subtrace.
        assert_eq!(a.attribute(SUBTRACE_IS_ROOT_SPAN_KEY), Some(SpanAttribute::Bool(true)));
        assert_eq!(b.attribute(SUBTRACE_IS_ROOT_SPAN_KEY), Some(SpanAttribute::Bool(true)));
        assert_eq!(processor.tracked_traces(), 2);
    }

    #[test]
    fn test_table_at_capacity_fails_open() {
        let processor =
            SubtraceIdProcessor::with_config(SubtraceConfig::new().with_max_traces(1));

        let tracked = span_with_ids(1, 1);
        processor.on_start(&tracked, None);
        assert!(tracked.attribute(SUBTRACE_ID_KEY).is_some());

        // The table is full: the span of an unseen trace is created
        // untouched, and no error reaches the caller.
        let overflow = span_with_ids(2, 1);
        processor.on_start(&overflow, None);
        assert!(overflow.attribute(SUBTRACE_ID_KEY).is_none());
        assert!(overflow.attribute(SUBTRACE_IS_ROOT_SPAN_KEY).is_none());

        // Already-tracked traces keep annotating.
        let sibling = span_with_ids(1, 2);
        processor.on_start(&sibling, None);
        assert_eq!(sibling.attribute(SUBTRACE_ID_KEY), tracked.attribute(SUBTRACE_ID_KEY));
    }

    #[test]
    fn test_invalid_context_is_ignored() {
        let processor = SubtraceIdProcessor::new();
        let span = Span::new(
            "no-ids",
            SpanContext::invalid(),
            None,
            SpanKind::Internal,
            "test-service",
        );
        processor.on_start(&span, None);
        assert!(span.attribute(SUBTRACE_ID_KEY).is_none());
        assert_eq!(processor.tracked_traces(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_clears_state() {
        let processor = SubtraceIdProcessor::new();
        processor.on_start(&span_with_ids(9, 1), None);
        assert_eq!(processor.tracked_traces(), 1);

        processor.shutdown().await.unwrap();
        assert_eq!(processor.tracked_traces(), 0);

        // The same trace id is brand-new again: a fresh record and a fresh
        // root, derived from the new first-observed span id.
        let reborn = span_with_ids(9, 5);
        processor.on_start(&reborn, None);
        assert_eq!(
            reborn.attribute(SUBTRACE_IS_ROOT_SPAN_KEY),
            Some(SpanAttribute::Bool(true))
        );
        assert_eq!(
            reborn.attribute(SUBTRACE_ID_KEY).and_then(|a| a.as_str().map(String::from)),
            Some(SubtraceId::derive(&TraceId::from_u128(9), &SpanId::from_u64(5)).to_hex())
        );

        // Idempotent.
        processor.shutdown().await.unwrap();
        processor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_force_flush_succeeds_immediately() {
        let processor = SubtraceIdProcessor::new();
        processor.force_flush().await.unwrap();
    }
}
