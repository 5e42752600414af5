//! 一次性定时任务堆：承载 connect 超时检查。
//!
//! 每轮 `loop_iteration`检查一次到期条目；用单线程堆代替外部调度器依赖，
//! 避免引入第二个线程。

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use crate::connection::ConnectionHandle;

struct TimerEntry {
    deadline: Instant,
    connection: ConnectionHandle,
    /// 单调递增的序号，配合 `deadline` 让 `BinaryHeap` 的比较保持全序
    /// （两个相同 deadline 的条目不应被判定为 `Equal` 而随意排序颠倒触发）。
    seq: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // `BinaryHeap` 是大顶堆；反转比较以取"最早到期"者在堆顶。
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// 一次性定时任务堆。`fire_expired` 在每个 `loop_iteration` 调用一次，
/// 弹出所有到期条目交给调用方处理（通常是检查 `has_connected` 后派发
/// `timeout`/`error` 并销毁连接）。
#[derive(Default)]
pub struct TimerWheel {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn schedule(&mut self, deadline: Instant, connection: ConnectionHandle) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(TimerEntry {
            deadline,
            connection,
            seq,
        });
    }

    /// 弹出所有截至 `now` 已到期的条目。
    pub fn drain_expired(&mut self, now: Instant) -> Vec<ConnectionHandle> {
        let mut expired = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let entry = self.heap.pop().expect("peeked entry must pop");
            expired.push(entry.connection);
        }
        expired
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
