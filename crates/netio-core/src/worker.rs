//! 每连接 worker：按提交顺序、互不并发地执行回调。
//!
//! 一个 worker 必须严格按提交顺序执行任务，且同一 worker 上任意时刻至多一个
//! 任务在执行。
//!
//! 默认 worker（[`InlineWorker`]）在调用方线程（通常是 I/O 线程）上同步执行；
//! 应用可提供 [`ThreadPoolWorker`] 把耗时回调挪到其他线程，避免阻塞 selector。

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::error::NetError;

/// 提交给 worker 的任务：执行一次回调，捕获其 panic。
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Worker 抽象：执行按序、非并发的任务流。
///
/// 每个实现必须保证：同一 worker 上提交的任务严格按提交顺序执行，且任意时刻
/// 至多一个任务在执行。
pub trait Worker: Send + Sync {
    fn submit(&self, task: Task);
}

/// 捕获任务 panic 并转换成 [`NetError::HandlerPanicked`]：
/// 若注册了 `error` 处理器，调用它；否则在当前线程上恢复 panic。
pub fn run_guarded(task: Task, on_panic: impl FnOnce(NetError) + Send + 'static) {
    let result = panic::catch_unwind(AssertUnwindSafe(task));
    if let Err(payload) = result {
        let message = panic_message(&payload);
        on_panic(NetError::HandlerPanicked { message });
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// 默认 worker：同步内联执行，提交即执行完毕。
///
/// 对于从就绪事件产生的回调，调用方就是 I/O 线程——这正是规范所说的
/// "executes tasks synchronously on the caller"。
#[derive(Default)]
pub struct InlineWorker;

impl Worker for InlineWorker {
    fn submit(&self, task: Task) {
        task();
    }
}

/// 单线程队列 worker：把任务移交给专属后台线程，按 FIFO 顺序执行。
///
/// 每个连接各持有一个队列，彼此互不干扰，因此“池”其实是每连接一条队列，
/// 而非暗示共享线程池。
pub struct ThreadPoolWorker {
    sender: Mutex<mpsc::Sender<Task>>,
    _handle: Arc<thread::JoinHandle<()>>,
}

impl ThreadPoolWorker {
    pub fn spawn() -> Self {
        let (sender, receiver) = mpsc::channel::<Task>();
        let handle = thread::Builder::new()
            .name("netio-conn-worker".into())
            .spawn(move || {
                while let Ok(task) = receiver.recv() {
                    task();
                }
            })
            .expect("spawning a connection worker thread");
        Self {
            sender: Mutex::new(sender),
            _handle: Arc::new(handle),
        }
    }
}

impl Worker for ThreadPoolWorker {
    fn submit(&self, task: Task) {
        let sender = self.sender.lock().expect("worker sender mutex poisoned");
        // 接收端线程退出（panic）后发送会失败；静默丢弃比二次 panic 更安全，
        // 调用方仍可通过 `error` 事件感知连接已被销毁。
        let _ = sender.send(task);
    }
}
