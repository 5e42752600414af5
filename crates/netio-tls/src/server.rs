//! TLS Server: the encrypted-stream analogue of `netio_tcp::server::TcpServer`.
//!
//! `netio_tcp::server::ServerConfig`'s own doc comment says
//! `applicationLayerProtocols`/`sslContext`/`encrypted` "live one layer up in
//! `netio-tls`, which composes a `TcpServer` rather than replacing it" — this
//! is that layer. It can't literally wrap an already-built `TcpServer`,
//! though: `TcpServer::handle_accept` hardcodes `PlainConnection` and calls
//! `mark_connected()` the instant a socket is accepted, which is exactly the
//! behavior a TLS accept must not have (`connect` has to wait for the
//! handshake). So this type repeats `TcpServer`'s listener/accept-loop/
//! idle-sweep structure verbatim, substituting `TlsConnection::begin_handshake`
//! for `PlainConnection::mark_connected` at the one point they differ.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream};
use mio::{Interest, Token};
use rustls::ServerConfig as RustlsServerConfig;
use tracing::warn;

use netio_core::conn_selector::LocalCloseQueue;
use netio_core::connection::ConnectionParams;
use netio_core::endpoint::Endpoint;
use netio_core::error::{map_io_error, Op};
use netio_core::selector::{Registrable, SelectorHandler, SelectorTick};
use netio_core::time::is_idle;
use netio_core::worker::{InlineWorker, Worker};
use netio_core::{ConnectionHandle, NetError};

use netio_tcp::provider::{TcpChannelProvider, TcpSocketConfig};

use crate::connection::TlsConnection;
use crate::rustls_engine::RustlsEngine;
use crate::TcpTlsConnection;

const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

pub type WorkerCreator = Arc<dyn Fn() -> Arc<dyn Worker> + Send + Sync>;
pub type NewConnectionHandler = Box<dyn FnMut(&Arc<TcpTlsConnection>) + Send>;

/// Server builder surface (§6): `sslContext` (`rustls_config`, already
/// carrying the negotiated ALPN list, minimum version floor, and optional
/// weak-cipher filter per [`crate::rustls_engine::build_server_config`])
/// plus the same transport-level options `netio_tcp::server::ServerConfig`
/// exposes.
pub struct TlsServerConfig {
    pub bind_addresses: Vec<SocketAddr>,
    pub connection_idle_timeout: Duration,
    pub socket_config: TcpSocketConfig,
    pub worker_creator: Option<WorkerCreator>,
    pub rustls_config: Arc<RustlsServerConfig>,
}

/// A single listening socket; identical in shape to
/// `netio_tcp::server::TcpServer`'s own `ListenerSource`.
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

pub struct TlsServer {
    selector: Arc<SelectorHandler>,
    listeners: HashMap<Token, Arc<ListenerSource>>,
    connections: Mutex<HashMap<Token, Arc<TcpTlsConnection>>>,
    local_close: Arc<LocalCloseQueue>,
    next_token: AtomicUsize,
    config: TlsServerConfig,
    new_connection_handler: Mutex<Option<NewConnectionHandler>>,
    last_sweep: Mutex<Instant>,
}

impl TlsServer {
    pub fn bind(config: TlsServerConfig, new_connection_handler: NewConnectionHandler) -> Result<Arc<Self>, NetError> {
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
        if conn.inner().is_closed() {
            self.connections.lock().expect("connections mutex poisoned").remove(&token);
        }
    }

    fn accept_loop(self: &Arc<Self>, listener: &Arc<ListenerSource>) {
        loop {
            match listener.accept() {
                Ok((stream, peer_addr)) => self.handle_accept(stream, peer_addr),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "tls accept failed");
                    break;
                }
            }
        }
    }

    fn handle_accept(self: &Arc<Self>, stream: MioTcpStream, peer_addr: SocketAddr) {
        let provider = match TcpChannelProvider::from_accepted(stream, self.config.socket_config.clone()) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to configure accepted tls socket");
                return;
            }
        };
        let engine = match RustlsEngine::server(Arc::clone(&self.config.rustls_config)) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "failed to build tls server engine for accepted socket");
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
        let conn = TlsConnection::new_tls(engine, provider, params, worker);

        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        conn.inner()
            .with_provider(|p| p.bind_registration(Arc::clone(&self.selector), token));
        if let Err(e) = self
            .selector
            .register_channel(Box::new(Arc::clone(conn.inner())), token, Interest::READABLE)
        {
            warn!(error = %e, "failed to register accepted tls connection");
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

        // An accepted socket is already transport-connected, but `connect`
        // must wait for the handshake: drive the pump instead of
        // `PlainConnection::mark_connected`.
        conn.begin_handshake();
    }
}

struct ServerTick(Arc<TlsServer>);

impl SelectorTick for ServerTick {
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
    use std::net::TcpStream as StdTcpStream;

    use rcgen::generate_simple_self_signed;
    use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};

    fn self_signed_server_config() -> Arc<RustlsServerConfig> {
        let cert = generate_simple_self_signed(vec!["localhost".to_string()]).expect("generate self-signed cert");
        let cert_der = CertificateDer::from(cert.cert.der().to_vec());
        let key_der = PrivatePkcs8KeyDer::from(cert.signing_key.serialize_der());
        crate::rustls_engine::build_server_config(
            vec![cert_der],
            rustls::pki_types::PrivateKeyDer::Pkcs8(key_der),
            &crate::params::TlsParams::new(),
        )
        .expect("build server config")
    }

    #[test]
    fn accepted_socket_starts_handshake_without_marking_connected_synchronously() {
        let config = TlsServerConfig {
            bind_addresses: vec!["127.0.0.1:0".parse().unwrap()],
            connection_idle_timeout: Duration::ZERO,
            socket_config: TcpSocketConfig::new(),
            worker_creator: None,
            rustls_config: self_signed_server_config(),
        };
        let server = TlsServer::bind(config, Box::new(|_| {})).expect("bind tls server");
        let addr = {
            let listener = server.listeners.values().next().expect("one listener");
            listener.listener.lock().unwrap().local_addr().expect("listener addr")
        };

        let client = StdTcpStream::connect(addr).expect("connect loopback client");
        std::thread::sleep(Duration::from_millis(50));

        let listener = server.listeners.values().next().cloned().expect("one listener");
        server.accept_loop(&listener);

        // A raw TCP client never completes a TLS handshake with the server,
        // so the connection is transport-connected but not yet `connect`-fired.
        assert_eq!(server.connection_count(), 1);
        let conn = server.connections.lock().unwrap().values().next().cloned().unwrap();
        assert!(!conn.is_connected());

        drop(client);
    }
}
