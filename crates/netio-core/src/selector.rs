//! Selector Handler：规范 §4.E 的就绪循环。
//!
//! `mio::Poll` 提供跨平台（epoll/kqueue/IOCP/poll(2) 回退）的就绪原语；
//! `SelectorHandler` 在它之上加装规范要求的三件事：
//! 1. 跨线程安全的 `register_channel`（`register_pending` 标志 + `Waker`）；
//! 2. 连续空轮询的重建策略（`REBUILD_THRESHOLD`/`REBUILDS_MAX`）；
//! 3. 每轮 `loop_iteration` 钩子，供 `TcpServer`/`UdpServer`/`*ClientManager`
//!    把空闲超时扫描与"已完成连接"排空塞进同一根 I/O 线程，免去第二个线程
//!    （设计笔记 §9 末条）。

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, trace, warn};

use crate::error::{ErrorCategory, NetError, Op};

/// 连续空轮询次数达到该值后触发一次重建。
pub const REBUILD_THRESHOLD: u32 = 1024;
/// 连续重建次数达到该值后，选择器宣告失败。
pub const REBUILDS_MAX: u32 = 8;
/// 等待 `register_pending` 清零的上限；超出后继续 `select`，避免无限阻塞。
const REGISTER_PENDING_WAIT: Duration = Duration::from_secs(2);

/// 一个已注册 channel 的可重建描述：重建时需要用同样的关注事件与
/// 附件重新向新 `Poll` 注册。
pub trait Registrable: Send {
    fn reregister(&mut self, registry: &mio::Registry, token: Token, interest: Interest) -> io::Result<()>;
    fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()>;
}

struct RegisteredChannel {
    source: Box<dyn Registrable>,
    interest: Interest,
}

/// `loop_iteration` 钩子：默认空实现，`TcpServer`/`UdpServer`/`TcpClientManager`
/// 等覆写它以便每轮都跑一次空闲扫描或已完成连接排空。
pub trait SelectorTick: Send {
    fn on_tick(&mut self, selector: &SelectorHandler) {
        let _ = selector;
    }

    /// 某个 key 就绪（可读/可写/可接受/已完成连接）时调用。
    fn on_ready(&mut self, token: Token, readable: bool, writable: bool);
}

/// Selector Handler 本体。持有 `mio::Poll`、注册表与跨线程协调状态。
pub struct SelectorHandler {
    poll: Mutex<Poll>,
    waker: Arc<Waker>,
    registered: Mutex<HashMap<Token, RegisteredChannel>>,
    register_pending: AtomicBool,
    running: AtomicBool,
    spins: Mutex<u32>,
    rebuilds: Mutex<u32>,
}

impl SelectorHandler {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Self {
            poll: Mutex::new(poll),
            waker,
            registered: Mutex::new(HashMap::new()),
            register_pending: AtomicBool::new(false),
            running: AtomicBool::new(true),
            spins: Mutex::new(0),
            rebuilds: Mutex::new(0),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn wakeup(&self) -> io::Result<()> {
        self.waker.wake()
    }

    /// 跨线程注册：规范三步协议。
    ///
    /// 1. 置位 `register_pending` 并唤醒 selector；
    /// 2. 在内部锁保护下执行平台注册；
    /// 3. 清除 `register_pending`。
    ///
    /// selector 循环发现 `register_pending` 已置位时，会忙等（至多
    /// [`REGISTER_PENDING_WAIT`]）直到它清零后才继续 `select`，避免重新进入
    /// `select` 持有注册线程需要的内部锁。
    pub fn register_channel(
        &self,
        mut source: Box<dyn Registrable>,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.register_pending.store(true, Ordering::Release);
        let _ = self.wakeup();

        let result = {
            let poll = self.poll.lock().expect("poll mutex poisoned");
            let outcome = source.reregister(poll.registry(), token, interest);
            if outcome.is_ok() {
                let mut registered = self.registered.lock().expect("registered mutex poisoned");
                registered.insert(token, RegisteredChannel { source, interest });
            }
            outcome
        };

        self.register_pending.store(false, Ordering::Release);
        result
    }

    pub fn deregister(&self, token: Token) {
        let mut registered = self.registered.lock().expect("registered mutex poisoned");
        if let Some(mut channel) = registered.remove(&token) {
            let poll = self.poll.lock().expect("poll mutex poisoned");
            let _ = channel.source.deregister(poll.registry());
        }
    }

    pub fn reregister_interest(&self, token: Token, interest: Interest) -> io::Result<()> {
        let mut registered = self.registered.lock().expect("registered mutex poisoned");
        if let Some(channel) = registered.get_mut(&token) {
            let poll = self.poll.lock().expect("poll mutex poisoned");
            channel.source.reregister(poll.registry(), token, interest)?;
            channel.interest = interest;
        }
        Ok(())
    }

    pub fn close(&self) {
        self.running.store(false, Ordering::Release);
        let mut registered = self.registered.lock().expect("registered mutex poisoned");
        let poll = self.poll.lock().expect("poll mutex poisoned");
        for (_, mut channel) in registered.drain() {
            let _ = channel.source.deregister(poll.registry());
        }
    }

    /// 主循环：规范 §4.E 伪代码的直接翻译。`tick` 承载 `loop_iteration` 与
    /// `handle_selected_key`。
    pub fn run(&self, tick: &mut dyn SelectorTick, poll_timeout: Option<Duration>) -> Result<(), NetError> {
        let mut events = Events::with_capacity(1024);
        while self.is_running() {
            tick.on_tick(self);
            if !self.is_running() {
                break;
            }

            let n = {
                let mut poll = self.poll.lock().expect("poll mutex poisoned");
                match poll.poll(&mut events, poll_timeout) {
                    Ok(()) => events.iter().count(),
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => 0,
                    Err(err) => return Err(NetError::Io { op: Op::Register, source: err }),
                }
            };

            if n > 0 {
                for event in events.iter() {
                    if event.token() == WAKE_TOKEN {
                        continue;
                    }
                    tick.on_ready(event.token(), event.is_readable(), event.is_writable());
                }
                *self.spins.lock().expect("spins mutex poisoned") = 0;
                *self.rebuilds.lock().expect("rebuilds mutex poisoned") = 0;
            } else {
                let mut spins = self.spins.lock().expect("spins mutex poisoned");
                *spins += 1;
            }

            self.wait_out_register_pending();

            let spins_now = *self.spins.lock().expect("spins mutex poisoned");
            if spins_now >= REBUILD_THRESHOLD {
                self.rebuild()?;
            }
        }
        Ok(())
    }

    fn wait_out_register_pending(&self) {
        let deadline = Instant::now() + REGISTER_PENDING_WAIT;
        while self.register_pending.load(Ordering::Acquire) {
            if Instant::now() >= deadline {
                warn!("register_pending stayed set past the wait bound; continuing anyway");
                break;
            }
            std::thread::yield_now();
        }
    }

    /// 重建选择器：应对历史平台缺陷（`select` 连续空返回）。
    ///
    /// 打开新的 `Poll`，把仍然有效的 channel 用原有 token/interest 重新注册，
    /// 注销旧 key 并关闭旧 `Poll`。达到 `REBUILDS_MAX` 的最后一次重建不再重注册，
    /// 而是销毁受影响的 channel。
    fn rebuild(&self) -> Result<(), NetError> {
        let mut rebuilds = self.rebuilds.lock().expect("rebuilds mutex poisoned");
        *rebuilds += 1;
        if *rebuilds > REBUILDS_MAX {
            return Err(NetError::SelectorRebuildsExhausted { max: REBUILDS_MAX });
        }
        let destroy = *rebuilds == REBUILDS_MAX;
        debug!(rebuild_count = *rebuilds, destroy, "selector spurious-wakeup rebuild");
        drop(rebuilds);

        let new_poll = Poll::new().map_err(|err| NetError::Io { op: Op::Rebuild, source: err })?;
        let mut registered = self.registered.lock().expect("registered mutex poisoned");
        let mut old_poll = self.poll.lock().expect("poll mutex poisoned");

        if destroy {
            for (_, mut channel) in registered.drain() {
                let _ = channel.source.deregister(old_poll.registry());
            }
        } else {
            for (token, channel) in registered.iter_mut() {
                let _ = channel.source.deregister(old_poll.registry());
                if let Err(err) = channel.source.reregister(new_poll.registry(), *token, channel.interest) {
                    warn!(token = token.0, error = %err, "failed to re-register channel during selector rebuild");
                }
            }
        }

        *old_poll = new_poll;
        *self.spins.lock().expect("spins mutex poisoned") = 0;
        trace!("selector rebuild complete");
        Ok(())
    }

    pub fn registry_waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    pub(crate) fn error_category_for_rebuild() -> ErrorCategory {
        ErrorCategory::SelectorSpurious
    }
}

/// 保留给 `Waker` 的 token；任何真实 channel 都不应使用它。
pub const WAKE_TOKEN: Token = Token(usize::MAX);
