//! Connection-Aware Selector：本地发起关闭的收敛队列。
//!
//! 当一个 channel 通过自己的 `close()` 系统调用关闭时，其 selection key
//! 会在下一次 `select()` 返回之前就已从 selector 移除，因而不会有对应的
//! 就绪事件来触发 `close` 派发。这里用一条线程安全队列把"任意线程发起的
//! 本地关闭"收敛回 I/O 线程：`on_connection_closed` 入队并唤醒 selector；
//! `drain` 在每轮 `loop_iteration` 顶部被调用，对出队的连接派发 `close`。

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::connection::ConnectionHandle;
use crate::selector::SelectorHandler;

/// 本地关闭队列：用 `std::sync::Mutex<VecDeque<_>>` 实现，足够用时优先选择
/// `std` 原语而非额外引入 `crossbeam`。
#[derive(Default)]
pub struct LocalCloseQueue {
    queue: Mutex<VecDeque<ConnectionHandle>>,
}

impl LocalCloseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// `onConnectionClosed`：任意线程都可调用。入队后必须唤醒 selector，
    /// 否则排空要等到下一次真实就绪事件才会发生。
    pub fn on_connection_closed(&self, selector: &SelectorHandler, connection: ConnectionHandle) {
        self.queue
            .lock()
            .expect("local close queue poisoned")
            .push_back(connection);
        let _ = selector.wakeup();
    }

    /// 在每轮 `loop_iteration` 顶部调用：把所有排队的本地关闭连接的 `close`
    /// 事件在 I/O 线程上有序派发。
    pub fn drain(&self) {
        let drained: Vec<_> = {
            let mut queue = self.queue.lock().expect("local close queue poisoned");
            queue.drain(..).collect()
        };
        for connection in drained {
            connection.destroy();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().expect("local close queue poisoned").is_empty()
    }
}
