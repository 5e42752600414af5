//! 单调时钟来源。
//!
//! 规范要求把"最近一次 I/O 时间戳"从源实现的墙钟毫秒值换成单调时钟
//! （`std::time::Instant`），idle-timeout 的比较因此不再受系统时间跳变影响
//! ——除了规范 §5 明确允许的"负增量按已过期处理"这一条，那一条只适用于
//! 源实现保留的墙钟语义，这里的 `Instant` 差值永不为负，因而天然满足它。

use std::time::{Duration, Instant};

/// 可替换的时钟抽象，方便测试注入虚拟时间而不必真的睡眠。
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// 默认时钟：直接委托给 `Instant::now()`。
#[derive(Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// 判断 `last_io` 距 `now` 是否已超过 `timeout`；`timeout == Duration::ZERO`
/// 视为“禁用”，永远不超时（对应规范 `connectionIdleTimeout` 的 `0 = disabled`）。
pub fn is_idle(now: Instant, last_io: Instant, timeout: Duration) -> bool {
    if timeout.is_zero() {
        return false;
    }
    now.saturating_duration_since(last_io) >= timeout
}
