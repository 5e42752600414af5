//! TCP Client Manager: regulates §4.G's outbound-connection branch.
//!
//! `connection(params)` and `connect(conn, timeout)` are split the same way
//! the API contract describes them: the first only builds a
//! [`TcpPlainConnection`] handle the caller can attach event handlers to,
//! the second performs the actual non-blocking `connect()` syscall. A TCP
//! socket does not exist (and so cannot be registered with a selector)
//! until `connect()` opens it, which is why registration happens inside
//! `connect`, never inside `connection`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mio::{Interest, Token};
use netio_core::conn_selector::LocalCloseQueue;
use netio_core::connection::ConnectionParams;
use netio_core::error::{map_io_error, Op};
use netio_core::selector::{SelectorHandler, SelectorTick};
use netio_core::worker::{InlineWorker, Worker};
use netio_core::{ConnectionHandle, NetError, PlainConnection, TimerWheel};
use tracing::warn;

use crate::provider::{TcpChannelProvider, TcpSocketConfig};

pub type TcpPlainConnection = PlainConnection<TcpChannelProvider>;

/// Default connect timeout (spec's `connectionTimeout` builder option falls
/// back to this when unset).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

enum Phase {
    /// Connect in flight; watching for writable-readiness to call
    /// `finish_connect`.
    Connecting(Arc<TcpPlainConnection>),
    /// Transport-connected; normal readable/writable dispatch.
    Established(Arc<TcpPlainConnection>),
}

pub struct TcpClientManager {
    selector: Arc<SelectorHandler>,
    local_close: Arc<LocalCloseQueue>,
    connections: Mutex<HashMap<Token, Phase>>,
    timers: Mutex<TimerWheel>,
    next_token: AtomicUsize,
    socket_config: TcpSocketConfig,
    default_worker: Option<Arc<dyn Fn() -> Arc<dyn Worker> + Send + Sync>>,
}

impl TcpClientManager {
    pub fn new(socket_config: TcpSocketConfig) -> Result<Arc<Self>, NetError> {
        let selector = SelectorHandler::new().map_err(|e| map_io_error(Op::Bind, e))?;
        Ok(Arc::new(Self {
            selector: Arc::new(selector),
            local_close: Arc::new(LocalCloseQueue::new()),
            connections: Mutex::new(HashMap::new()),
            timers: Mutex::new(TimerWheel::new()),
            next_token: AtomicUsize::new(1),
            socket_config,
            default_worker: None,
        }))
    }

    pub fn with_default_worker(mut self: Arc<Self>, creator: Arc<dyn Fn() -> Arc<dyn Worker> + Send + Sync>) -> Arc<Self> {
        Arc::get_mut(&mut self)
            .expect("with_default_worker must run before the manager is shared")
            .default_worker = Some(creator);
        self
    }

    pub fn run(self: &Arc<Self>) -> Result<(), NetError> {
        let mut tick = ClientTick(Arc::clone(self));
        self.selector.run(&mut tick, Some(Duration::from_millis(250)))
    }

    pub fn shutdown(&self) {
        self.selector.close();
    }

    /// Builds an unconnected handle. No socket exists yet and nothing is
    /// registered with the selector; the caller attaches event handlers
    /// before calling [`Self::connect`].
    pub fn connection(&self, params: ConnectionParams) -> Arc<TcpPlainConnection> {
        let worker = self
            .default_worker
            .as_ref()
            .map(|f| f())
            .unwrap_or_else(|| Arc::new(InlineWorker) as Arc<dyn Worker>);
        PlainConnection::new(TcpChannelProvider::unconnected(self.socket_config.clone()), params, worker)
    }

    /// Starts the non-blocking connect. On synchronous completion the
    /// `connect` event has already fired inside `start_connect`; otherwise
    /// the token is registered for writable-readiness and a connect-timeout
    /// entry is scheduled.
    pub fn connect(self: &Arc<Self>, conn: Arc<TcpPlainConnection>, timeout: Duration) -> Result<(), NetError> {
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));

        let handle: ConnectionHandle = conn.clone();
        let local_close = Arc::clone(&self.local_close);
        let selector = Arc::clone(&self.selector);
        conn.set_local_close_notify(Arc::new(move || {
            local_close.on_connection_closed(&selector, Arc::clone(&handle));
        }));

        let immediate = conn.start_connect()?;

        conn.inner()
            .with_provider(|p| p.bind_registration(Arc::clone(&self.selector), token));

        let interest = if immediate {
            Interest::READABLE
        } else {
            Interest::WRITABLE
        };
        self.selector
            .register_channel(Box::new(Arc::clone(conn.inner())), token, interest)
            .map_err(|e| map_io_error(Op::Register, e))?;

        let timeout = if timeout.is_zero() { DEFAULT_CONNECT_TIMEOUT } else { timeout };
        {
            let handle: ConnectionHandle = conn.clone();
            self.timers
                .lock()
                .expect("timers mutex poisoned")
                .schedule(Instant::now() + timeout, handle);
        }

        let phase = if immediate {
            Phase::Established(Arc::clone(&conn))
        } else {
            Phase::Connecting(Arc::clone(&conn))
        };
        self.connections.lock().expect("connections mutex poisoned").insert(token, phase);
        Ok(())
    }

    fn on_tick(&self) {
        self.local_close.drain();
        let expired = self
            .timers
            .lock()
            .expect("timers mutex poisoned")
            .drain_expired(Instant::now());
        for conn in expired {
            conn.fire_connect_timeout();
        }
    }

    fn on_ready(&self, token: Token, readable: bool, writable: bool) {
        let phase_is_connecting = matches!(
            self.connections.lock().expect("connections mutex poisoned").get(&token),
            Some(Phase::Connecting(_))
        );
        if phase_is_connecting {
            if writable {
                self.finish_connect(token);
            }
            return;
        }

        let conn = match self.connections.lock().expect("connections mutex poisoned").get(&token) {
            Some(Phase::Established(conn)) => Some(Arc::clone(conn)),
            _ => None,
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

    fn finish_connect(&self, token: Token) {
        let conn = {
            let mut connections = self.connections.lock().expect("connections mutex poisoned");
            match connections.remove(&token) {
                Some(Phase::Connecting(conn)) => conn,
                Some(other) => {
                    connections.insert(token, other);
                    return;
                }
                None => return,
            }
        };

        let socket_error = conn.inner().with_provider(|p| p.take_socket_error());
        match socket_error {
            Ok(None) => {
                conn.mark_connected();
                if let Err(e) = self.selector.reregister_interest(token, Interest::READABLE) {
                    warn!(error = %e, "failed to reregister established tcp connection");
                }
                self.connections
                    .lock()
                    .expect("connections mutex poisoned")
                    .insert(token, Phase::Established(conn));
            }
            Ok(Some(io_err)) => {
                conn.dispatch_error(map_io_error(Op::Connect, io_err));
            }
            Err(e) => {
                conn.dispatch_error(e);
            }
        }
    }
}

struct ClientTick(Arc<TcpClientManager>);

impl SelectorTick for ClientTick {
    fn on_tick(&mut self, _selector: &SelectorHandler) {
        self.0.on_tick();
    }

    fn on_ready(&mut self, token: Token, readable: bool, writable: bool) {
        self.0.on_ready(token, readable, writable);
    }
}
