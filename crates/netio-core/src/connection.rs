//! Connection (base): 字节级 I/O、写回退（backlog）、预连接写队列与生命
//! 周期事件派发的共享基础。
//!
//! 用组合代替继承：[`Connection<P>`] 拥有回退队列、预连接队列、事件表与
//! worker；明文/ TLS 连接（分别位于 `netio-tcp`/`netio-tls`）各自持有一个
//! `Connection<P>`，把自己的读路径建在它之上，并把"编码后的字节交给内核，
//! 溢出部分进回退队列"这一步直接委托给 [`Connection::backlog_write`]。
//!
//! # 不变式
//! - `pre_connect_queue.is_some() XOR has_connected` 恒成立；
//! - `backlog.is_empty() <=> is_writable()`（在已连接的前提下）；
//! - `closed` 只会从 `false` 翻到 `true` 一次；
//! - 除 `error` 外的一切事件派发都经由 `worker`；`error` 在调用方线程上同步执行，
//!   并总是以 `destroy()` 收尾。

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use crate::endpoint::Endpoint;
use crate::error::{ErrorCategory, NetError, Op, map_io_error, protocol_error};
use crate::event::EventTable;
use crate::time::{Clock, SystemClock};
use crate::worker::{Task, Worker};

/// 进程内唯一连接标识，仅用于日志与测试断言，不承载协议语义。
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransportKind {
    Stream,
    Datagram,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EncryptionKind {
    None,
    Tls,
    Dtls,
}

/// 不可变的连接参数描述符。
#[derive(Clone, Debug, Default)]
pub struct ConnectionParams {
    pub remote: Option<Endpoint>,
    pub local_bind: Option<Endpoint>,
    pub alpn: Vec<String>,
    pub sni: Vec<String>,
}

impl ConnectionParams {
    pub fn with_remote(remote: Endpoint) -> Self {
        Self {
            remote: Some(remote),
            ..Default::default()
        }
    }
}

/// Channel Provider：对单个 OS 套接字的最小抽象，流式与数据报实现各异，
/// 但暴露同一套操作面。
///
/// 实现者（`netio-tcp::TcpChannelProvider`、`netio-udp::UdpChannelProvider`）
/// 负责把 `0` 字节返回值映射成"内核暂不接受更多数据"（`EWOULDBLOCK`），
/// 并在 `write_backlog_started`/`write_backlog_ended` 中对 `mio::Registry`
/// 做 `reregister` 与 `Waker::wake`。
pub trait ChannelProvider: Send {
    /// 非阻塞 connect；`true` 表示内核同步完成（回环地址常见），`false`
    /// 表示调用方需要等待写就绪事件。
    fn connect(&mut self, remote: SocketAddr, timeout: Duration) -> Result<bool, NetError>;

    /// `None` = kernel has nothing ready right now (`EWOULDBLOCK`, the normal
    /// case after a spurious or already-drained readiness event); `Some(0)`
    /// = genuine EOF (peer performed an orderly shutdown); `Some(n > 0)` =
    /// `n` bytes read. Collapsing EOF into the same `0` as `EWOULDBLOCK`
    /// (as a bare `usize` return would) would make a spurious wakeup
    /// indistinguishable from the peer hanging up.
    fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, NetError>;

    fn write(&mut self, buf: &[u8]) -> Result<usize, NetError>;

    fn write_backlog_started(&mut self) -> Result<(), NetError>;

    fn write_backlog_ended(&mut self) -> Result<(), NetError>;

    fn set_read_block(&mut self, block: bool) -> Result<(), NetError>;

    fn is_available(&self) -> bool;

    fn close(&mut self) -> Result<(), NetError>;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn peer_addr(&self) -> Option<SocketAddr>;

    /// 把底层 mio event source 向新的 `Registry` (重新) 注册。由
    /// [`crate::selector::SelectorHandler`] 在跨线程注册与选择器重建两条
    /// 路径上调用；provider 始终由 `Connection<P>` 单独拥有，这里只是借用。
    fn reregister(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interest: mio::Interest,
    ) -> std::io::Result<()>;

    fn deregister(&mut self, registry: &mio::Registry) -> std::io::Result<()>;
}

/// `ConnectionLifecycle` 是 selector/server 层用来泛化驱动任意连接
/// （明文或 TLS，TCP 或 UDP）的对象安全接口。`netio-tcp`/`netio-udp`/
/// `netio-tls` 的具体连接类型都实现它，从而可以被 `Arc<dyn ConnectionLifecycle>`
/// 均匀地放进 selector 的 `Token -> handle` 映射、idle-timeout 的存活集合、
/// 以及连接感知 selector 的本地关闭队列。
pub trait ConnectionLifecycle: Send + Sync {
    fn id(&self) -> ConnectionId;
    fn last_io(&self) -> Instant;
    fn is_closed(&self) -> bool;
    fn has_connected(&self) -> bool;
    /// 就绪事件：该连接的注册 key 报告可读。
    fn on_readable(&self);
    /// 就绪事件：该连接的注册 key 报告可写（回退队列冲刷 / 完成 connect / 握手步进）。
    fn on_writable(&self);
    /// 用户线程发起的 `close()`：有待发送数据则推迟，否则立即 `destroy()`。
    fn request_close(&self);
    /// 幂等的强制销毁。
    fn destroy(&self);
    /// `TimerWheel` 到期回调：检查 `has_connected`，否则派发 `timeout`/`error` 并销毁。
    fn fire_connect_timeout(&self);
}

pub type ConnectionHandle = Arc<dyn ConnectionLifecycle>;

/// 写侧状态：暂存缓冲 + 回退队列 + 挂起关闭标志。全部在 `write_lock` 下变更。
struct WriteState {
    staging: BytesMut,
    backlog: VecDeque<Bytes>,
    backlog_active: bool,
    pending_close: bool,
}

impl WriteState {
    fn new(capacity: usize) -> Self {
        Self {
            staging: BytesMut::with_capacity(capacity),
            backlog: VecDeque::new(),
            backlog_active: false,
            pending_close: false,
        }
    }

    fn backlog_empty(&self) -> bool {
        self.backlog.is_empty()
    }
}

struct Flags {
    connected: AtomicBool,
    has_connected: AtomicBool,
    closed: AtomicBool,
}

/// 预连接写队列：从构造起存在，直到首个 `connect` 事件触发为止。
struct PreConnectQueue {
    items: VecDeque<Bytes>,
}

/// Connection (base)：泛型参数 `P` 是底层传输提供者
/// （[`ChannelProvider`] 的具体实现）。
pub struct Connection<P: ChannelProvider> {
    id: ConnectionId,
    transport_kind: TransportKind,
    encryption_kind: EncryptionKind,
    remote: Mutex<Option<Endpoint>>,
    local: Mutex<Option<Endpoint>>,
    apparent_remote: Mutex<Option<Endpoint>>,
    flags: Flags,
    last_io: Mutex<Instant>,
    clock: Arc<dyn Clock>,
    provider: Mutex<P>,
    write: Mutex<WriteState>,
    pre_connect: Mutex<Option<PreConnectQueue>>,
    events: EventTable,
    worker: Arc<dyn Worker>,
    attachment: Mutex<Option<Box<dyn std::any::Any + Send + Sync>>>,
    local_close_notify: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl<P: ChannelProvider + 'static> Connection<P> {
    pub fn new(
        transport_kind: TransportKind,
        encryption_kind: EncryptionKind,
        provider: P,
        params: ConnectionParams,
        worker: Arc<dyn Worker>,
        staging_capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::next(),
            transport_kind,
            encryption_kind,
            remote: Mutex::new(params.remote),
            local: Mutex::new(params.local_bind),
            apparent_remote: Mutex::new(None),
            flags: Flags {
                connected: AtomicBool::new(false),
                has_connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            },
            last_io: Mutex::new(Instant::now()),
            clock: Arc::new(SystemClock),
            provider: Mutex::new(provider),
            write: Mutex::new(WriteState::new(staging_capacity)),
            pre_connect: Mutex::new(Some(PreConnectQueue {
                items: VecDeque::new(),
            })),
            events: EventTable::new(),
            worker,
            attachment: Mutex::new(None),
            local_close_notify: Mutex::new(None),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport_kind
    }

    pub fn encryption_kind(&self) -> EncryptionKind {
        self.encryption_kind
    }

    pub fn events(&self) -> &EventTable {
        &self.events
    }

    pub fn set_attachment(&self, value: Box<dyn std::any::Any + Send + Sync>) {
        *self.attachment.lock().expect("attachment mutex poisoned") = Some(value);
    }

    pub fn remote(&self) -> Option<Endpoint> {
        self.remote.lock().expect("remote mutex poisoned").clone()
    }

    pub fn set_apparent_remote(&self, addr: Endpoint) {
        *self
            .apparent_remote
            .lock()
            .expect("apparent remote mutex poisoned") = Some(addr);
    }

    /// 广告对端地址：若未设置覆盖值则回退到真实远端。
    pub fn apparent_remote(&self) -> Option<Endpoint> {
        let guard = self
            .apparent_remote
            .lock()
            .expect("apparent remote mutex poisoned");
        guard.clone().or_else(|| self.remote())
    }

    pub fn is_connected(&self) -> bool {
        self.flags.connected.load(Ordering::Acquire)
    }

    pub fn has_connected(&self) -> bool {
        self.flags.has_connected.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.flags.closed.load(Ordering::Acquire)
    }

    pub fn last_io(&self) -> Instant {
        *self.last_io.lock().expect("last_io mutex poisoned")
    }

    pub fn touch_io(&self) {
        *self.last_io.lock().expect("last_io mutex poisoned") = self.clock.now();
    }

    /// `isWritable()` 恒等于"已连接 且 回退队列为空"。
    pub fn is_writable(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.write
            .lock()
            .expect("write mutex poisoned")
            .backlog_empty()
    }

    pub fn with_provider<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        let mut guard = self.provider.lock().expect("provider mutex poisoned");
        f(&mut guard)
    }

    /// 非阻塞 connect。无远端地址时立即失败（规范："Fails with
    /// `UnsupportedOperation` when no remote address is configured"）。
    pub fn start_connect(self: &Arc<Self>) -> Result<bool, NetError> {
        let remote = self
            .remote()
            .ok_or(NetError::UnsupportedOperation("connect: no remote address configured"))?;
        let socket_addr = remote
            .as_socket_addr()
            .ok_or(NetError::UnsupportedOperation("connect: remote is not a socket address"))?;
        let immediate = self.with_provider(|p| p.connect(socket_addr, Duration::from_secs(0)))?;
        if immediate {
            self.mark_connected();
        }
        Ok(immediate)
    }

    /// Dispatches `data` with one application-level payload, via the worker
    /// like every other non-`error` event.
    pub fn dispatch_data(self: &Arc<Self>, payload: Bytes) {
        let this = Arc::clone(self);
        self.worker.submit(Box::new(move || {
            this.events.fire_data(payload);
        }) as Task);
    }

    /// 建连完成：置位 `connected`/`has_connected`，清空预连接队列，派发 `connect`。
    pub fn mark_connected(self: &Arc<Self>) {
        self.flags.connected.store(true, Ordering::Release);
        self.flags.has_connected.store(true, Ordering::Release);
        self.touch_io();
        self.flush_pre_connect_queue();
        let this = Arc::clone(self);
        self.worker.submit(Box::new(move || {
            this.events.fire_connect();
        }) as Task);
    }

    /// `queue_write`/`write_queue`：预连接阶段把字节原样保存，待 `connect`
    /// 完成后按顺序重放到 `write`。`connect` 完成之后调用的 `write` 永远看不到队列。
    pub fn queue_pre_connect_write(&self, data: Bytes) -> bool {
        let mut guard = self.pre_connect.lock().expect("pre_connect mutex poisoned");
        match guard.as_mut() {
            Some(queue) => {
                queue.items.push_back(data);
                true
            }
            None => false,
        }
    }

    fn flush_pre_connect_queue(self: &Arc<Self>) {
        let queue = {
            let mut guard = self.pre_connect.lock().expect("pre_connect mutex poisoned");
            guard.take()
        };
        if let Some(queue) = queue {
            for chunk in queue.items {
                // 重放时连接已标记为 connected，因而会直接走 backlog_write。
                let _ = self.backlog_write(&chunk);
            }
        }
    }

    pub fn has_pre_connect_queue(&self) -> bool {
        self.pre_connect
            .lock()
            .expect("pre_connect mutex poisoned")
            .is_some()
    }

    /// 写回退算法核心。
    ///
    /// 这是明文/ TLS 连接共用的"物理落盘"步骤：明文直接把应用字节传进来；
    /// TLS 把 `wrap()` 产生的线缆字节传进来。
    pub fn backlog_write(&self, data: &[u8]) -> Result<(), NetError> {
        if data.is_empty() {
            return Ok(());
        }
        let mut write = self.write.lock().expect("write mutex poisoned");
        if !write.backlog_empty() {
            write.backlog.push_back(Bytes::copy_from_slice(data));
            return Ok(());
        }
        let written = self.with_provider(|p| p.write(data))?;
        self.touch_io();
        if written < data.len() {
            let remainder = &data[written..];
            write.backlog.push_back(Bytes::copy_from_slice(remainder));
            if !write.backlog_active {
                write.backlog_active = true;
                drop(write);
                self.with_provider(|p| p.write_backlog_started())?;
            }
        }
        Ok(())
    }

    /// 请求关闭：有待发送字节则推迟到回退队列排空，否则立即销毁。
    pub fn request_close(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        let has_pending = {
            let mut write = self.write.lock().expect("write mutex poisoned");
            if write.backlog_empty() {
                false
            } else {
                write.pending_close = true;
                true
            }
        };
        if !has_pending {
            self.destroy_or_notify_local_close();
        }
    }

    /// Registers a hook invoked instead of an immediate `destroy()` when a
    /// local (backlog-empty) `close()` has nothing to wait on. Servers wire
    /// this to their [`crate::conn_selector::LocalCloseQueue`] so the
    /// resulting `close` event dispatch is funneled back onto the I/O
    /// thread (§4.F) rather than firing wherever the caller happened to be.
    /// Connections with nothing registered (construction default, and every
    /// connection in this crate's own unit tests) fall back to destroying
    /// immediately.
    pub fn set_local_close_notify(&self, notify: Arc<dyn Fn() + Send + Sync>) {
        *self
            .local_close_notify
            .lock()
            .expect("local close notify mutex poisoned") = Some(notify);
    }

    fn destroy_or_notify_local_close(self: &Arc<Self>) {
        let notify = self
            .local_close_notify
            .lock()
            .expect("local close notify mutex poisoned")
            .clone();
        match notify {
            Some(notify) => notify(),
            None => self.destroy(),
        }
    }

    /// 冲刷回退队列：在写就绪事件或显式 `flush()` 中调用。
    ///
    /// 返回 `true` 表示回退队列在本次调用结束时已完全排空。
    pub fn flush_backlog(self: &Arc<Self>) -> Result<bool, NetError> {
        loop {
            let next_chunk = {
                let write = self.write.lock().expect("write mutex poisoned");
                write.backlog.front().cloned()
            };
            let Some(chunk) = next_chunk else { break };
            let written = self.with_provider(|p| p.write(&chunk))?;
            self.touch_io();
            if written == chunk.len() {
                let mut write = self.write.lock().expect("write mutex poisoned");
                write.backlog.pop_front();
            } else if written == 0 {
                break;
            } else {
                let mut write = self.write.lock().expect("write mutex poisoned");
                if let Some(front) = write.backlog.front_mut() {
                    *front = front.slice(written..);
                }
                break;
            }
        }

        let (drained, pending_close) = {
            let write = self.write.lock().expect("write mutex poisoned");
            (write.backlog_empty(), write.pending_close)
        };

        if drained {
            let was_active = {
                let mut write = self.write.lock().expect("write mutex poisoned");
                let was_active = write.backlog_active;
                write.backlog_active = false;
                was_active
            };
            if was_active {
                self.with_provider(|p| p.write_backlog_ended())?;
                if self.is_connected() {
                    let this = Arc::clone(self);
                    self.worker.submit(Box::new(move || {
                        this.events.fire_writable();
                    }) as Task);
                }
            }
            if pending_close {
                self.destroy();
            }
        }
        Ok(drained)
    }

    /// 幂等销毁：触发 provider 关闭，然后（至多一次）派发 `close`。
    pub fn destroy(self: &Arc<Self>) {
        if self.flags.closed.swap(true, Ordering::AcqRel) {
            return; // 已经销毁过，直接返回——destroy() 是幂等的。
        }
        self.flags.connected.store(false, Ordering::Release);
        let _ = self.with_provider(|p| p.close());
        let this = Arc::clone(self);
        self.worker.submit(Box::new(move || {
            this.events.fire_close();
        }) as Task);
    }

    /// `error` 派发：同步、在调用方线程上运行；若无处理器则按 §7 向上传播。
    pub fn dispatch_error(self: &Arc<Self>, err: NetError) {
        let handled = self.events.fire_error(&err);
        self.destroy();
        if !handled && err.category().is_programming_error() {
            panic!("unhandled netio error with no `error` handler: {err}");
        }
    }

    pub fn read_block(&self, block: bool) -> Result<(), NetError> {
        self.with_provider(|p| p.set_read_block(block))
    }

    /// Connect-timeout firing, shared by every connection kind (plain, TLS,
    /// UDP peer): the timer only ever watches the transport-level connect,
    /// never the TLS handshake layered on top of it, so there is exactly one
    /// implementation of "what happens when the clock runs out" regardless
    /// of encryption.
    pub fn fire_connect_timeout(self: &Arc<Self>) {
        if self.has_connected() {
            return;
        }
        if self.events.has_timeout_handler() {
            let this = Arc::clone(self);
            self.worker.submit(Box::new(move || {
                this.events.fire_timeout();
            }) as Task);
            self.destroy();
        } else {
            self.dispatch_error(NetError::ConnectTimeout);
        }
    }
}

pub fn map_connect_error(err: std::io::Error) -> NetError {
    map_io_error(Op::Connect, err)
}

pub fn unsupported(reason: &'static str) -> NetError {
    protocol_error(Op::Configure, reason, ErrorCategory::ProtocolMisuse)
}

/// Blanket bridge letting `SelectorHandler` re-register/deregister a
/// connection's provider without knowing its concrete type: the provider is
/// owned by `Connection<P>` itself, this just forwards through the lock.
impl<P: ChannelProvider + 'static> crate::selector::Registrable for Arc<Connection<P>> {
    fn reregister(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interest: mio::Interest,
    ) -> std::io::Result<()> {
        self.with_provider(|p| p.reregister(registry, token, interest))
    }

    fn deregister(&mut self, registry: &mio::Registry) -> std::io::Result<()> {
        self.with_provider(|p| p.deregister(registry))
    }
}
