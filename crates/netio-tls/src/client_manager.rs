//! TLS Client Manager: the encrypted-stream analogue of
//! `netio_tcp::client_manager::TcpClientManager`.
//!
//! Cannot simply wrap `TcpClientManager`: the phase transition that matters
//! here is "transport connected, handshake pending" rather than
//! "transport connected, done" — `TcpPlainConnection::start_connect`/
//! `mark_connected` fire `connect` on transport completion, which is wrong
//! for TLS. So this manager drives its own `SelectorHandler` and
//! `TimerWheel`, built the same way `TcpClientManager` builds its, but
//! routes the phase-transition points through `TlsConnection::
//! start_transport_connect`/`begin_handshake` instead.
//!
//! Once the transport is connected, dispatch degenerates back to exactly
//! what `TcpClientManager::on_ready` does — `TlsConnection::on_readable`/
//! `on_writable` already know whether to pump the handshake or move
//! application data, so there's no separate "handshaking" phase tracked
//! here beyond `Connecting`/`Established` (§4.D, §4.G).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mio::{Interest, Token};
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tracing::warn;

use netio_core::conn_selector::LocalCloseQueue;
use netio_core::connection::ConnectionParams;
use netio_core::error::{map_io_error, Op};
use netio_core::selector::{SelectorHandler, SelectorTick};
use netio_core::worker::{InlineWorker, Worker};
use netio_core::{ConnectionHandle, NetError, TimerWheel};

use netio_tcp::client_manager::DEFAULT_CONNECT_TIMEOUT;
use netio_tcp::provider::{TcpChannelProvider, TcpSocketConfig};

use crate::connection::TlsConnection;
use crate::rustls_engine::RustlsEngine;
use crate::TcpTlsConnection;

enum Phase {
    /// Transport connect in flight; watching for writable-readiness to call
    /// `finish_connect`. The handshake has not started yet.
    Connecting(Arc<TcpTlsConnection>),
    /// Transport-connected; `on_readable`/`on_writable` route to the
    /// handshake pump until `TlsConnection::is_connected` flips, then to
    /// ordinary read/flush — the same dispatch either way.
    Established(Arc<TcpTlsConnection>),
}

pub struct TlsClientManager {
    selector: Arc<SelectorHandler>,
    local_close: Arc<LocalCloseQueue>,
    connections: Mutex<HashMap<Token, Phase>>,
    timers: Mutex<TimerWheel>,
    next_token: AtomicUsize,
    socket_config: TcpSocketConfig,
    client_config: Arc<ClientConfig>,
    default_worker: Option<Arc<dyn Fn() -> Arc<dyn Worker> + Send + Sync>>,
}

impl TlsClientManager {
    pub fn new(socket_config: TcpSocketConfig, client_config: Arc<ClientConfig>) -> Result<Arc<Self>, NetError> {
        let selector = SelectorHandler::new().map_err(|e| map_io_error(Op::Bind, e))?;
        Ok(Arc::new(Self {
            selector: Arc::new(selector),
            local_close: Arc::new(LocalCloseQueue::new()),
            connections: Mutex::new(HashMap::new()),
            timers: Mutex::new(TimerWheel::new()),
            next_token: AtomicUsize::new(1),
            socket_config,
            client_config,
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

    /// Builds an unconnected handle with its own `RustlsEngine::client`,
    /// bound to `server_name` for SNI and certificate verification. No
    /// socket exists yet; the caller attaches event handlers before calling
    /// [`Self::connect`].
    pub fn connection(
        &self,
        params: ConnectionParams,
        server_name: ServerName<'static>,
    ) -> Result<Arc<TcpTlsConnection>, NetError> {
        let worker = self
            .default_worker
            .as_ref()
            .map(|f| f())
            .unwrap_or_else(|| Arc::new(InlineWorker) as Arc<dyn Worker>);
        let engine = RustlsEngine::client(Arc::clone(&self.client_config), server_name)?;
        let provider = TcpChannelProvider::unconnected(self.socket_config.clone());
        Ok(TlsConnection::new_tls(engine, provider, params, worker))
    }

    /// Starts the non-blocking transport connect. Unlike
    /// `TcpClientManager::connect`, synchronous completion does *not* mean
    /// `connect` has fired yet — it only means the handshake pump has
    /// started (`TlsConnection::start_transport_connect` drives that pump
    /// itself on the immediate path).
    pub fn connect(
        self: &Arc<Self>,
        conn: Arc<TcpTlsConnection>,
        remote: std::net::SocketAddr,
        timeout: Duration,
    ) -> Result<(), NetError> {
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));

        let handle: ConnectionHandle = conn.clone();
        let local_close = Arc::clone(&self.local_close);
        let selector = Arc::clone(&self.selector);
        conn.set_local_close_notify(Arc::new(move || {
            local_close.on_connection_closed(&selector, Arc::clone(&handle));
        }));

        let immediate = conn.start_transport_connect(remote)?;

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
            Phase::Established(conn)
        } else {
            Phase::Connecting(conn)
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
        if conn.inner().is_closed() {
            self.connections.lock().expect("connections mutex poisoned").remove(&token);
        }
    }

    /// Confirms the transport connect succeeded, then hands off to the
    /// handshake pump instead of `PlainConnection::mark_connected` — the
    /// `connect` event still hasn't fired at this point; it fires later,
    /// from inside `TlsConnection::finish_handshake`.
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
                if let Err(e) = self.selector.reregister_interest(token, Interest::READABLE) {
                    warn!(error = %e, "failed to reregister established tls connection");
                }
                conn.begin_handshake();
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

struct ClientTick(Arc<TlsClientManager>);

impl SelectorTick for ClientTick {
    fn on_tick(&mut self, _selector: &SelectorHandler) {
        self.0.on_tick();
    }

    fn on_ready(&mut self, token: Token, readable: bool, writable: bool) {
        self.0.on_ready(token, readable, writable);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener as StdTcpListener;
    use std::sync::atomic::AtomicBool;

    use netio_core::Endpoint;
    use rustls::RootCertStore;

    fn insecure_client_config() -> Arc<ClientConfig> {
        // Tests never complete a real handshake against a loopback peer
        // that isn't speaking TLS; they only exercise the transport-connect
        // phase transition, so an empty root store is enough.
        let roots = RootCertStore::empty();
        Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    }

    #[test]
    fn synchronous_connect_starts_the_handshake_pump_without_firing_connect() {
        let listener = StdTcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
        let addr = listener.local_addr().expect("listener addr");

        let manager = TlsClientManager::new(TcpSocketConfig::new(), insecure_client_config()).expect("client manager");
        let params = ConnectionParams::with_remote(Endpoint::Socket(addr));
        let server_name = ServerName::try_from("localhost").expect("server name").to_owned();
        let conn = manager.connection(params, server_name).expect("build connection");

        let connected = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&connected);
        conn.events().on_connect(Box::new(move || {
            flag.store(true, Ordering::SeqCst);
        }));

        manager
            .connect(Arc::clone(&conn), addr, Duration::from_secs(1))
            .expect("start connect");

        // A loopback accept-only peer never completes a TLS handshake, so
        // `connect` must not have fired even though the transport connected.
        assert!(!connected.load(Ordering::SeqCst));
        assert!(!conn.is_connected());
        assert_eq!(manager.connections.lock().unwrap().len(), 1);

        drop(listener);
    }
}
