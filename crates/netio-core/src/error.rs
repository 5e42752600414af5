//! 稳定错误域：`NetError`。
//!
//! # 设计背景（Why）
//! - 所有可能失败的算子（bind/accept/connect/read/write/flush/shutdown/handshake/
//!   unwrap/wrap/configure/register/rebuild）需要合流为同一枚举，便于 `error`
//!   事件与 `tracing` 记录使用稳定字符串分类，而不是各处手写 `io::Error` 的
//!   `Display`；
//! - 错误分类（[`ErrorCategory`]）驱动传播策略：哪些错误会触发重建、哪些只是
//!   静默记录、哪些必须 `destroy()`。
//!
//! # 契约说明（What）
//! - 每个变体携带一个 `'static` 操作标签（见 [`Op`]），以及可选的 `source`；
//! - `category()` 永远返回一个确定的分类，供调用方据此决定是否重试/记录级别。

use std::fmt;
use std::io;

/// 产生错误的算子标签：稳定的操作名集合。
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Op {
    Bind,
    Accept,
    Connect,
    Read,
    Write,
    Flush,
    Shutdown,
    Handshake,
    Unwrap,
    Wrap,
    Configure,
    Register,
    Rebuild,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Op::Bind => "bind",
            Op::Accept => "accept",
            Op::Connect => "connect",
            Op::Read => "read",
            Op::Write => "write",
            Op::Flush => "flush",
            Op::Shutdown => "shutdown",
            Op::Handshake => "handshake",
            Op::Unwrap => "unwrap",
            Op::Wrap => "wrap",
            Op::Configure => "configure",
            Op::Register => "register",
            Op::Rebuild => "rebuild",
        };
        f.write_str(name)
    }
}

/// 错误的处置分类。
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorCategory {
    /// 传输层 I/O 失败：不可本地恢复，触发 `error` 再 `close`。
    TransportIo,
    /// TLS/DTLS 握手阶段失败。
    TlsHandshake,
    /// 握手完成后的记录层失败。
    TlsRecord,
    /// 引擎缓冲区耗尽且已在硬上限，无法再扩容。
    BufferOverflow,
    /// 建连超时。
    ConnectTimeout,
    /// 空闲超时触发的优雅关闭；不是真正的“错误”，但共享同一传播路径。
    IdleTimeout,
    /// 调用方误用 API（写已销毁的连接、重复注册本地关闭回调等）。
    ProtocolMisuse,
    /// 选择器连续空转，达到重建或失败的阈值。
    SelectorSpurious,
}

impl ErrorCategory {
    /// 该分类下的错误是否应当在无 `error` 处理器时直接 panic/向上传播，
    /// 而不是静默吞掉。协议误用永远立即失败。
    pub fn is_programming_error(self) -> bool {
        matches!(self, ErrorCategory::ProtocolMisuse)
    }
}

/// netio 核心库的统一错误类型。
///
/// 保留 `source`（当存在）以便 `tracing::error!(error = %err, ...)` 记录完整
/// 根因链路；`op` 与 `category` 则是供调用方做分支判断的稳定机读字段。
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("{op} failed: {source}")]
    Io {
        op: Op,
        #[source]
        source: io::Error,
    },

    #[error("{op} failed: {reason}")]
    Protocol {
        op: Op,
        reason: &'static str,
        category: ErrorCategory,
    },

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("buffer overflow: {buffer} already at engine maximum {max} bytes")]
    BufferOverflow { buffer: &'static str, max: usize },

    #[error("selector exceeded REBUILDS_MAX ({max}) consecutive rebuilds")]
    SelectorRebuildsExhausted { max: u32 },

    #[error("handler panicked: {message}")]
    HandlerPanicked { message: String },

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),
}

impl NetError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            NetError::Io { op, .. } => match op {
                Op::Handshake => ErrorCategory::TlsHandshake,
                Op::Unwrap | Op::Wrap => ErrorCategory::TlsRecord,
                Op::Register | Op::Rebuild => ErrorCategory::SelectorSpurious,
                _ => ErrorCategory::TransportIo,
            },
            NetError::Protocol { category, .. } => *category,
            NetError::ConnectTimeout => ErrorCategory::ConnectTimeout,
            NetError::BufferOverflow { .. } => ErrorCategory::BufferOverflow,
            NetError::SelectorRebuildsExhausted { .. } => ErrorCategory::SelectorSpurious,
            NetError::HandlerPanicked { .. } => ErrorCategory::ProtocolMisuse,
            NetError::UnsupportedOperation(_) => ErrorCategory::ProtocolMisuse,
        }
    }

    pub fn op(&self) -> Option<Op> {
        match self {
            NetError::Io { op, .. } => Some(*op),
            NetError::Protocol { op, .. } => Some(*op),
            _ => None,
        }
    }
}

/// 将一次 `std::io::Error` 映射为带算子标签的 [`NetError`]。
pub fn map_io_error(op: Op, source: io::Error) -> NetError {
    NetError::Io { op, source }
}

pub fn protocol_error(op: Op, reason: &'static str, category: ErrorCategory) -> NetError {
    NetError::Protocol {
        op,
        reason,
        category,
    }
}

pub type Result<T> = std::result::Result<T, NetError>;
