//! DTLS Server: the encrypted-datagram analogue of `netio_udp::server::UdpServer`.
//!
//! Repeats `UdpServer`'s peer-demultiplexing structure (one shared
//! `UdpSharedSocket` per bind address, one synthesized connection per remote
//! address) verbatim, substituting [`TlsConnection::begin_handshake`] for
//! `PlainConnection::mark_connected` at peer-creation time — `UdpServer`'s
//! own `create_peer_connection` doc comment notes this exact handoff point:
//! "DTLS (layered in `netio-tls`) constructs its own peer connections and
//! defers this call until the handshake finishes". Established peers
//! dispatch through `TlsConnection::on_readable`/`on_writable` rather than
//! `UdpServer`'s direct `dispatch_data` call, since inbound datagrams must
//! pass through the DTLS record engine before they are application bytes.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::{Interest, Token};
use openssl::ssl::SslContext;
use tracing::warn;

use netio_core::conn_selector::LocalCloseQueue;
use netio_core::connection::ConnectionParams;
use netio_core::endpoint::Endpoint;
use netio_core::error::{map_io_error, Op};
use netio_core::selector::{SelectorHandler, SelectorTick};
use netio_core::time::is_idle;
use netio_core::worker::{InlineWorker, Worker};
use netio_core::{ConnectionHandle, NetError};

use netio_udp::provider::{BacklogNotify, UdpChannelProvider, UdpSharedSocket, UdpSocketConfig};

use crate::connection::TlsConnection;
use crate::openssl_engine::OpensslEngine;

pub type UdpDtlsConnection = TlsConnection<OpensslEngine, UdpChannelProvider>;

pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

pub type WorkerCreator = Arc<dyn Fn() -> Arc<dyn Worker> + Send + Sync>;
pub type NewConnectionHandler = Box<dyn FnMut(&Arc<UdpDtlsConnection>) + Send>;

/// Server builder surface (§6): `sslContext` (`ssl_context`, built via
/// [`crate::openssl_engine::build_dtls_context`]) plus the same datagram
/// options `netio_udp::server::ServerConfig` exposes.
pub struct DtlsServerConfig {
    pub bind_addresses: Vec<SocketAddr>,
    pub connection_idle_timeout: Duration,
    pub socket_config: UdpSocketConfig,
    pub receive_buffer_size: usize,
    pub worker_creator: Option<WorkerCreator>,
    pub ssl_context: SslContext,
}

struct UdpSocketEntry {
    shared: Arc<UdpSharedSocket>,
    token: Token,
    connections: Mutex<HashMap<SocketAddr, Arc<UdpDtlsConnection>>>,
    backlogged: Mutex<HashMap<SocketAddr, Arc<UdpDtlsConnection>>>,
}

pub struct DtlsServer {
    selector: Arc<SelectorHandler>,
    sockets: HashMap<Token, Arc<UdpSocketEntry>>,
    local_close: Arc<LocalCloseQueue>,
    config: DtlsServerConfig,
    new_connection_handler: Mutex<Option<NewConnectionHandler>>,
    last_sweep: Mutex<Instant>,
}

impl DtlsServer {
    pub fn bind(config: DtlsServerConfig, new_connection_handler: NewConnectionHandler) -> Result<Arc<Self>, NetError> {
        let selector = Arc::new(SelectorHandler::new().map_err(|e| map_io_error(Op::Bind, e))?);
        let mut sockets = HashMap::new();
        let mut next_token = 1usize;
        for addr in &config.bind_addresses {
            let shared =
                UdpSharedSocket::bind(*addr, &config.socket_config).map_err(|e| map_io_error(Op::Bind, e))?;
            let token = Token(next_token);
            next_token += 1;
            selector
                .register_channel(Box::new(Arc::clone(&shared)), token, Interest::READABLE)
                .map_err(|e| map_io_error(Op::Register, e))?;
            sockets.insert(
                token,
                Arc::new(UdpSocketEntry {
                    shared,
                    token,
                    connections: Mutex::new(HashMap::new()),
                    backlogged: Mutex::new(HashMap::new()),
                }),
            );
        }
        Ok(Arc::new(Self {
            selector,
            sockets,
            local_close: Arc::new(LocalCloseQueue::new()),
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
        for entry in self.sockets.values() {
            for (_, conn) in entry.connections.lock().expect("connections mutex poisoned").drain() {
                conn.destroy();
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.sockets
            .values()
            .map(|e| e.connections.lock().expect("connections mutex poisoned").len())
            .sum()
    }

    /// Bound local addresses, one per `bind_addresses` entry — useful when
    /// the caller bound to port `0` and needs the kernel-assigned port.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.sockets.values().filter_map(|e| e.shared.local_addr()).collect()
    }

    fn on_tick(&self) {
        self.local_close.drain();
        self.reap_closed();
        self.sweep_idle();
    }

    fn reap_closed(&self) {
        for entry in self.sockets.values() {
            entry
                .connections
                .lock()
                .expect("connections mutex poisoned")
                .retain(|_, conn| !conn.inner().is_closed());
        }
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
        for entry in self.sockets.values() {
            let idle: Vec<_> = {
                let connections = entry.connections.lock().expect("connections mutex poisoned");
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
    }

    fn on_ready(self: &Arc<Self>, token: Token, readable: bool, writable: bool) {
        let Some(entry) = self.sockets.get(&token).cloned() else {
            return;
        };
        if readable {
            self.receive_loop(&entry);
        }
        if writable {
            self.flush_backlogged(&entry);
        }
    }

    fn receive_loop(self: &Arc<Self>, entry: &Arc<UdpSocketEntry>) {
        let cap = self.config.receive_buffer_size + 1;
        loop {
            let mut buf = vec![0u8; cap];
            match entry.shared.recv_from(&mut buf) {
                Ok((n, peer)) => {
                    if n == cap {
                        warn!(
                            peer = %peer,
                            max = self.config.receive_buffer_size,
                            "dropping dtls datagram larger than receive_buffer_size"
                        );
                        continue;
                    }
                    let payload = Bytes::copy_from_slice(&buf[..n]);
                    self.handle_datagram(entry, peer, payload);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "dtls recv_from failed");
                    break;
                }
            }
        }
    }

    fn handle_datagram(self: &Arc<Self>, entry: &Arc<UdpSocketEntry>, peer: SocketAddr, payload: Bytes) {
        let existing = entry
            .connections
            .lock()
            .expect("connections mutex poisoned")
            .get(&peer)
            .cloned();
        match existing {
            Some(conn) => {
                conn.inner().with_provider(|p| p.push_inbound(payload));
                conn.on_readable();
            }
            None => {
                let conn = self.create_peer_connection(entry, peer);
                conn.inner().with_provider(|p| p.push_inbound(payload));
                conn.begin_handshake();
            }
        }
    }

    fn create_peer_connection(self: &Arc<Self>, entry: &Arc<UdpSocketEntry>, peer: SocketAddr) -> Arc<UdpDtlsConnection> {
        let worker = self
            .config
            .worker_creator
            .as_ref()
            .map(|f| f())
            .unwrap_or_else(|| Arc::new(InlineWorker) as Arc<dyn Worker>);

        let notify: BacklogNotify = {
            let connections = Arc::clone(&entry.connections);
            let backlogged = Arc::clone(&entry.backlogged);
            let selector = Arc::clone(&self.selector);
            let token = entry.token;
            Arc::new(move |peer, started| {
                let mut backlogged = backlogged.lock().expect("backlogged mutex poisoned");
                if started {
                    let was_empty = backlogged.is_empty();
                    if let Some(conn) = connections.lock().expect("connections mutex poisoned").get(&peer) {
                        backlogged.insert(peer, Arc::clone(conn));
                    }
                    if was_empty && !backlogged.is_empty() {
                        let _ = selector.reregister_interest(token, Interest::READABLE | Interest::WRITABLE);
                        let _ = selector.wakeup();
                    }
                } else {
                    backlogged.remove(&peer);
                    if backlogged.is_empty() {
                        let _ = selector.reregister_interest(token, Interest::READABLE);
                    }
                }
            })
        };

        let provider = UdpChannelProvider::for_peer(Arc::clone(&entry.shared), peer, notify);
        let params = ConnectionParams::with_remote(Endpoint::Socket(peer));
        let engine = OpensslEngine::server(&self.config.ssl_context).expect("dtls server engine setup");
        let conn = TlsConnection::new_dtls(engine, provider, params, worker);

        let handle: ConnectionHandle = conn.clone();
        let local_close = Arc::clone(&self.local_close);
        let selector = Arc::clone(&self.selector);
        conn.set_local_close_notify(Arc::new(move || {
            local_close.on_connection_closed(&selector, Arc::clone(&handle));
        }));

        entry
            .connections
            .lock()
            .expect("connections mutex poisoned")
            .insert(peer, Arc::clone(&conn));

        if let Some(handler) = self
            .new_connection_handler
            .lock()
            .expect("new_connection_handler mutex poisoned")
            .as_mut()
        {
            handler(&conn);
        }

        conn
    }

    fn flush_backlogged(&self, entry: &Arc<UdpSocketEntry>) {
        let snapshot: Vec<_> = entry
            .backlogged
            .lock()
            .expect("backlogged mutex poisoned")
            .values()
            .cloned()
            .collect();
        for conn in snapshot {
            conn.on_writable();
        }
    }
}

struct ServerTick(Arc<DtlsServer>);

impl SelectorTick for ServerTick {
    fn on_tick(&mut self, _selector: &SelectorHandler) {
        self.0.on_tick();
    }

    fn on_ready(&mut self, token: Token, readable: bool, writable: bool) {
        self.0.on_ready(token, readable, writable);
    }
}
