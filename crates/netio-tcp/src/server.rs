//! TCP Server: accept loop for plaintext stream connections.
//!
//! Accepts run on a synchronous readiness loop rather than handing each
//! socket to an async task, so accept/read/write/idle-sweep all happen on
//! one `SelectorHandler`-driven thread.
//!
//! `TcpServer::bind` opens one listening socket per `bind_addresses` entry,
//! registers each for read-readiness, and starts `run()`'s loop, which:
//! accepts new connections, dispatches `data`/`writable` on accepted ones,
//! drains locally-initiated closes, and sweeps idle connections every five
//! seconds.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream};
use mio::{Interest, Token};
use netio_core::conn_selector::LocalCloseQueue;
use netio_core::connection::ConnectionParams;
use netio_core::endpoint::Endpoint;
use netio_core::error::{map_io_error, Op};
use netio_core::selector::{Registrable, SelectorHandler, SelectorTick};
use netio_core::time::is_idle;
use netio_core::worker::{InlineWorker, Worker};
use netio_core::{ConnectionHandle, NetError, PlainConnection};
use tracing::warn;

use crate::provider::{TcpChannelProvider, TcpSocketConfig};

pub type TcpPlainConnection = PlainConnection<TcpChannelProvider>;

/// How often the idle-timeout sweep runs, regardless of how often
/// `loop_iteration` itself fires.
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

pub type WorkerCreator = Arc<dyn Fn() -> Arc<dyn Worker> + Send + Sync>;
pub type NewConnectionHandler = Box<dyn FnMut(&Arc<TcpPlainConnection>) + Send>;

/// Server builder surface: only the options this core cares about.
/// `applicationLayerProtocols`/`sslContext`/`encrypted` live one layer up in
/// `netio-tls`, which composes a `TcpServer` rather than replacing it.
pub struct ServerConfig {
    pub bind_addresses: Vec<SocketAddr>,
    pub connection_backlog: u32,
    pub connection_idle_timeout: Duration,
    pub socket_config: TcpSocketConfig,
    pub worker_creator: Option<WorkerCreator>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addresses: Vec::new(),
            connection_backlog: 0,
            connection_idle_timeout: Duration::ZERO,
            socket_config: TcpSocketConfig::new(),
            worker_creator: None,
        }
    }
}

/// A single listening socket, shared between `TcpServer`'s own accept loop
/// and `SelectorHandler`'s rebuild bookkeeping via the same `Arc`.
struct ListenerSource {
    listener: Mutex<MioTcpListener>,
}

impl ListenerSource {
    fn accept(&self) -> io::Result<(MioTcpStream, SocketAddr)> {
        self.listener.lock().expect("listener mutex poisoned").accept()
    }
}

impl Registrable for Arc<ListenerSource> {
    fn reregister(&mut self, registry: &mio::Registry, token: Token, interest: Interest) -> io::Result<()> {
        let mut listener = self.listener.lock().expect("listener mutex poisoned");
        match registry.register(&mut *listener, token, interest) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                registry.reregister(&mut *listener, token, interest)
            }
            Err(e) => Err(e),
        }
    }

    fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        let mut listener = self.listener.lock().expect("listener mutex poisoned");
        registry.deregister(&mut *listener)
    }
}

pub struct TcpServer {
    selector: Arc<SelectorHandler>,
    listeners: HashMap<Token, Arc<ListenerSource>>,
    connections: Mutex<HashMap<Token, Arc<TcpPlainConnection>>>,
    local_close: Arc<LocalCloseQueue>,
    next_token: AtomicUsize,
    config: ServerConfig,
    new_connection_handler: Mutex<Option<NewConnectionHandler>>,
    last_sweep: Mutex<Instant>,
}

impl TcpServer {
    pub fn bind(config: ServerConfig, new_connection_handler: NewConnectionHandler) -> Result<Arc<Self>, NetError> {
        let selector = Arc::new(SelectorHandler::new().map_err(|e| map_io_error(Op::Bind, e))?);
        let mut listeners = HashMap::new();
        let next_token = AtomicUsize::new(1);
        for addr in &config.bind_addresses {
            let listener = MioTcpListener::bind(*addr).map_err(|e| map_io_error(Op::Bind, e))?;
            let token = Token(next_token.fetch_add(1, Ordering::Relaxed));
            let source = Arc::new(ListenerSource {
                listener: Mutex::new(listener),
            });
            selector
                .register_channel(Box::new(Arc::clone(&source)), token, Interest::READABLE)
                .map_err(|e| map_io_error(Op::Register, e))?;
            listeners.insert(token, source);
        }
        Ok(Arc::new(Self {
            selector,
            listeners,
            connections: Mutex::new(HashMap::new()),
            local_close: Arc::new(LocalCloseQueue::new()),
            next_token,
            config,
            new_connection_handler: Mutex::new(Some(new_connection_handler)),
            last_sweep: Mutex::new(Instant::now()),
        }))
    }

    pub fn run(self: &Arc<Self>) -> Result<(), NetError> {
        let mut tick = ServerTick(Arc::clone(self));
        self.selector.run(&mut tick, Some(Duration::from_secs(1)))
    }

    pub fn shutdown(&self) {
        self.selector.close();
        let mut connections = self.connections.lock().expect("connections mutex poisoned");
        for (_, conn) in connections.drain() {
            conn.destroy();
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().expect("connections mutex poisoned").len()
    }

    /// Bound local addresses, one per `bind_addresses` entry — useful when
    /// the caller bound to port `0` and needs the kernel-assigned port.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .values()
            .filter_map(|l| l.listener.lock().expect("listener mutex poisoned").local_addr().ok())
            .collect()
    }

    fn on_tick(&self) {
        self.local_close.drain();
        self.sweep_idle();
    }

    fn sweep_idle(&self) {
        if self.config.connection_idle_timeout.is_zero() {
            return;
        }
        let now = Instant::now();
        {
            let mut last_sweep = self.last_sweep.lock().expect("last_sweep mutex poisoned");
            if now.duration_since(*last_sweep) < IDLE_SWEEP_INTERVAL {
                return;
            }
            *last_sweep = now;
        }
        // Collect candidates into a separate list before calling `close()`
        // on any of them, so the closing connections' eventual removal from
        // `connections` (on the next `on_ready`) never races this iteration.
        let idle: Vec<_> = {
            let connections = self.connections.lock().expect("connections mutex poisoned");
            connections
                .values()
                .filter(|conn| is_idle(now, conn.inner().last_io(), self.config.connection_idle_timeout))
                .cloned()
                .collect()
        };
        for conn in idle {
            conn.close();
        }
    }

    fn on_ready(self: &Arc<Self>, token: Token, readable: bool, writable: bool) {
        if let Some(listener) = self.listeners.get(&token).cloned() {
            if readable {
                self.accept_loop(&listener);
            }
            return;
        }
        let conn = {
            self.connections
                .lock()
                .expect("connections mutex poisoned")
                .get(&token)
                .cloned()
        };
        let Some(conn) = conn else { return };
        if readable {
            conn.on_readable();
        }
        if writable {
            conn.on_writable();
        }
        if conn.is_closed() {
            self.connections.lock().expect("connections mutex poisoned").remove(&token);
        }
    }

    fn accept_loop(self: &Arc<Self>, listener: &Arc<ListenerSource>) {
        loop {
            match listener.accept() {
                Ok((stream, peer_addr)) => self.handle_accept(stream, peer_addr),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "tcp accept failed");
                    break;
                }
            }
        }
    }

    fn handle_accept(self: &Arc<Self>, stream: MioTcpStream, peer_addr: SocketAddr) {
        let provider = match TcpChannelProvider::from_accepted(stream, self.config.socket_config.clone()) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to configure accepted tcp socket");
                return;
            }
        };
        let worker = self
            .config
            .worker_creator
            .as_ref()
            .map(|f| f())
            .unwrap_or_else(|| Arc::new(InlineWorker) as Arc<dyn Worker>);
        let params = ConnectionParams::with_remote(Endpoint::Socket(peer_addr));
        let conn = PlainConnection::new(provider, params, worker);

        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        conn.inner()
            .with_provider(|p| p.bind_registration(Arc::clone(&self.selector), token));
        if let Err(e) = self
            .selector
            .register_channel(Box::new(Arc::clone(conn.inner())), token, Interest::READABLE)
        {
            warn!(error = %e, "failed to register accepted tcp connection");
            return;
        }

        let handle: ConnectionHandle = conn.clone();
        let local_close = Arc::clone(&self.local_close);
        let selector = Arc::clone(&self.selector);
        conn.set_local_close_notify(Arc::new(move || {
            local_close.on_connection_closed(&selector, Arc::clone(&handle));
        }));

        self.connections
            .lock()
            .expect("connections mutex poisoned")
            .insert(token, Arc::clone(&conn));

        if let Some(handler) = self
            .new_connection_handler
            .lock()
            .expect("new_connection_handler mutex poisoned")
            .as_mut()
        {
            handler(&conn);
        }

        // An accepted socket is already transport-connected; dispatch
        // `connect` now that the application's handlers (if any) are wired.
        conn.mark_connected();
    }
}

struct ServerTick(Arc<TcpServer>);

impl SelectorTick for ServerTick {
    fn on_tick(&mut self, _selector: &SelectorHandler) {
        self.0.on_tick();
    }

    fn on_ready(&mut self, token: Token, readable: bool, writable: bool) {
        self.0.on_ready(token, readable, writable);
    }
}
