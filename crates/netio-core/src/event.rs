//! 连接事件表：host-object 风格的 "set-one" 回调槽位，收敛成单一事件表，
//! 键是封闭枚举 [`EventKind`]，值是固定签名的回调。

use std::sync::Mutex;

use bytes::Bytes;

use crate::error::NetError;

/// 连接生命周期事件。
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum EventKind {
    Connect,
    Timeout,
    Data,
    Writable,
    Close,
    Error,
}

pub type ConnectHandler = Box<dyn FnMut() + Send>;
pub type TimeoutHandler = Box<dyn FnMut() + Send>;
pub type DataHandler = Box<dyn FnMut(Bytes) + Send>;
pub type WritableHandler = Box<dyn FnMut() + Send>;
pub type CloseHandler = Box<dyn FnMut() + Send>;
pub type ErrorHandler = Box<dyn FnMut(&NetError) + Send>;

/// 单个连接的事件表：每种事件至多一个处理器（"set-one" 语义），
/// `error` 之外的一切事件都经由 worker 调度（调用方自行负责，本结构
/// 只保存回调本身，不关心是否已经过 worker）。
#[derive(Default)]
pub struct EventTable {
    connect: Mutex<Option<ConnectHandler>>,
    timeout: Mutex<Option<TimeoutHandler>>,
    data: Mutex<Option<DataHandler>>,
    writable: Mutex<Option<WritableHandler>>,
    close: Mutex<Option<CloseHandler>>,
    error: Mutex<Option<ErrorHandler>>,
}

impl EventTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connect(&self, handler: ConnectHandler) {
        *self.connect.lock().expect("event table poisoned") = Some(handler);
    }

    pub fn on_timeout(&self, handler: TimeoutHandler) {
        *self.timeout.lock().expect("event table poisoned") = Some(handler);
    }

    pub fn on_data(&self, handler: DataHandler) {
        *self.data.lock().expect("event table poisoned") = Some(handler);
    }

    pub fn on_writable(&self, handler: WritableHandler) {
        *self.writable.lock().expect("event table poisoned") = Some(handler);
    }

    pub fn on_close(&self, handler: CloseHandler) {
        *self.close.lock().expect("event table poisoned") = Some(handler);
    }

    pub fn on_error(&self, handler: ErrorHandler) {
        *self.error.lock().expect("event table poisoned") = Some(handler);
    }

    pub fn has_error_handler(&self) -> bool {
        self.error.lock().expect("event table poisoned").is_some()
    }

    pub fn has_timeout_handler(&self) -> bool {
        self.timeout.lock().expect("event table poisoned").is_some()
    }

    pub(crate) fn fire_connect(&self) {
        if let Some(handler) = self.connect.lock().expect("event table poisoned").as_mut() {
            handler();
        }
    }

    pub(crate) fn fire_timeout(&self) {
        if let Some(handler) = self.timeout.lock().expect("event table poisoned").as_mut() {
            handler();
        }
    }

    pub(crate) fn fire_data(&self, payload: Bytes) {
        if let Some(handler) = self.data.lock().expect("event table poisoned").as_mut() {
            handler(payload);
        }
    }

    pub(crate) fn fire_writable(&self) {
        if let Some(handler) = self.writable.lock().expect("event table poisoned").as_mut() {
            handler();
        }
    }

    pub(crate) fn fire_close(&self) {
        if let Some(handler) = self.close.lock().expect("event table poisoned").as_mut() {
            handler();
        }
    }

    /// `error` 调度永远同步、永远在调用方线程上，不走 worker。
    /// 返回 `true` 说明确有处理器被调用；调用方据此决定是否需要"unhandled"
    /// 传播。
    pub(crate) fn fire_error(&self, err: &NetError) -> bool {
        if let Some(handler) = self.error.lock().expect("event table poisoned").as_mut() {
            handler(err);
            true
        } else {
            false
        }
    }
}
