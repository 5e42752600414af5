//! UDP Server: regulates §4.H.
//!
//! # 设计背景（Why）
//! UDP has no OS-level accept and no persistent per-peer channel, so the
//! server synthesizes per-peer connections by keying on remote address
//! (§1's "UDP demultiplexer"). One `mio::net::UdpSocket`
//! ([`netio_udp::provider::UdpSharedSocket`]) is bound per
//! `bind_addresses` entry and registered with the selector exactly once;
//! every peer's [`UdpPeerConnection`] shares it through a
//! [`crate::provider::UdpChannelProvider`] in server mode.
//!
//! # 契约说明（What）
//! `receive_loop` drains the shared socket to `WouldBlock`, routing each
//! datagram into its peer's provider-owned backlog queue and dispatching
//! `data` directly — no per-peer kernel readiness bit exists to drive this,
//! mirroring §4.H step 1-4. `flush_backlogged` walks a snapshot of the
//! sockets entry's backlogged-peer map on shared write-readiness; peers
//! leave that map automatically through `BacklogNotify` once their backlog
//! drains (see `provider.rs`), so no separate prune pass is needed here.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::{Interest, Token};
use netio_core::conn_selector::LocalCloseQueue;
use netio_core::connection::{Connection, ConnectionParams, EncryptionKind, TransportKind};
use netio_core::endpoint::Endpoint;
use netio_core::error::{map_io_error, Op};
use netio_core::selector::{SelectorHandler, SelectorTick};
use netio_core::time::is_idle;
use netio_core::worker::{InlineWorker, Worker};
use netio_core::{ConnectionHandle, NetError, PlainConnection};
use tracing::warn;

use crate::provider::{BacklogNotify, UdpChannelProvider, UdpSharedSocket, UdpSocketConfig};

pub type UdpPeerConnection = PlainConnection<UdpChannelProvider>;

/// Default per-datagram buffer, also the doubly-used write-buffer capacity
/// for plain UDP connections (no record framing, so one buffer serves
/// both directions); overridable per spec's `receiveBufferSize`.
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

pub type WorkerCreator = Arc<dyn Fn() -> Arc<dyn Worker> + Send + Sync>;
pub type NewConnectionHandler = Box<dyn FnMut(&Arc<UdpPeerConnection>) + Send>;

/// Server builder surface (§6), the datagram analogue of
/// `netio_tcp::server::ServerConfig`.
pub struct ServerConfig {
    pub bind_addresses: Vec<SocketAddr>,
    pub connection_idle_timeout: Duration,
    pub socket_config: UdpSocketConfig,
    pub receive_buffer_size: usize,
    pub worker_creator: Option<WorkerCreator>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addresses: Vec::new(),
            connection_idle_timeout: Duration::ZERO,
            socket_config: UdpSocketConfig::new(),
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            worker_creator: None,
        }
    }
}

/// Per-bind-address state: the shared socket plus this socket's peer map
/// and backlogged-peer set. A server with multiple `bind_addresses`
/// entries keeps these fully independent — a peer address colliding across
/// two different bound sockets is a different connection on each.
struct UdpSocketEntry {
    shared: Arc<UdpSharedSocket>,
    token: Token,
    connections: Mutex<HashMap<SocketAddr, Arc<UdpPeerConnection>>>,
    backlogged: Mutex<HashMap<SocketAddr, Arc<UdpPeerConnection>>>,
}

pub struct UdpServer {
    selector: Arc<SelectorHandler>,
    sockets: HashMap<Token, Arc<UdpSocketEntry>>,
    local_close: Arc<LocalCloseQueue>,
    config: ServerConfig,
    new_connection_handler: Mutex<Option<NewConnectionHandler>>,
    last_sweep: Mutex<Instant>,
}

impl UdpServer {
    pub fn bind(config: ServerConfig, new_connection_handler: NewConnectionHandler) -> Result<Arc<Self>, NetError> {
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

    /// No per-peer readiness event exists to trigger cleanup of a destroyed
    /// connection (unlike TCP, where a closed token simply stops appearing
    /// in `on_ready`), so every loop iteration prunes the peer map of
    /// anything `destroy()` has already finished with.
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
            // Collected into a separate list before any `close()` call, so
            // the closing connections' removal from `connections` (on the
            // next `reap_closed`) never races this iteration (§4.H).
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
                            "dropping udp datagram larger than receive_buffer_size"
                        );
                        continue;
                    }
                    let payload = Bytes::copy_from_slice(&buf[..n]);
                    self.handle_datagram(entry, peer, payload);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "udp recv_from failed");
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
        let conn = existing.unwrap_or_else(|| self.create_peer_connection(entry, peer));
        conn.inner().touch_io();
        conn.inner().dispatch_data(payload);
    }

    fn create_peer_connection(self: &Arc<Self>, entry: &Arc<UdpSocketEntry>, peer: SocketAddr) -> Arc<UdpPeerConnection> {
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
        let inner = Connection::new(
            TransportKind::Datagram,
            EncryptionKind::None,
            provider,
            params,
            worker,
            self.config.receive_buffer_size,
        );
        let conn = PlainConnection::wrap(inner);

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

        // Plaintext UDP has no handshake to wait on; DTLS (layered in
        // `netio-tls`) constructs its own peer connections and defers this
        // call until the handshake finishes (§4.H step 2).
        conn.mark_connected();
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

struct ServerTick(Arc<UdpServer>);

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
    use std::net::UdpSocket as StdUdpSocket;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ephemeral_addr() -> SocketAddr {
        StdUdpSocket::bind("127.0.0.1:0")
            .expect("bind ephemeral probe")
            .local_addr()
            .expect("local addr")
    }

    #[test]
    fn datagram_from_new_peer_creates_a_connection_and_dispatches_data() {
        let addr = ephemeral_addr();
        let config = ServerConfig {
            bind_addresses: vec![addr],
            receive_buffer_size: 2048,
            ..ServerConfig::default()
        };

        let received = Arc::new(AtomicUsize::new(0));
        let received_for_handler = Arc::clone(&received);
        let server = UdpServer::bind(
            config,
            Box::new(move |conn| {
                let counter = Arc::clone(&received_for_handler);
                conn.events().on_data(Box::new(move |payload| {
                    counter.fetch_add(payload.len(), Ordering::SeqCst);
                }));
            }),
        )
        .expect("bind udp server");

        let client = StdUdpSocket::bind("127.0.0.1:0").expect("bind loopback client");
        client.send_to(b"hello", addr).expect("send datagram");
        std::thread::sleep(Duration::from_millis(50));

        let entry = server.sockets.values().next().cloned().expect("one bound socket");
        server.receive_loop(&entry);

        assert_eq!(received.load(Ordering::SeqCst), 5);
        assert_eq!(server.connection_count(), 1);
    }

    #[test]
    fn oversized_datagram_is_dropped_without_creating_a_connection() {
        let addr = ephemeral_addr();
        let config = ServerConfig {
            bind_addresses: vec![addr],
            receive_buffer_size: 4,
            ..ServerConfig::default()
        };
        let server = UdpServer::bind(config, Box::new(|_| {})).expect("bind udp server");

        let client = StdUdpSocket::bind("127.0.0.1:0").expect("bind loopback client");
        client.send_to(b"toolong", addr).expect("send oversized datagram");
        std::thread::sleep(Duration::from_millis(50));

        let entry = server.sockets.values().next().cloned().expect("one bound socket");
        server.receive_loop(&entry);

        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn reap_closed_removes_destroyed_peers() {
        let addr = ephemeral_addr();
        let config = ServerConfig {
            bind_addresses: vec![addr],
            ..ServerConfig::default()
        };
        let server = UdpServer::bind(config, Box::new(|_| {})).expect("bind udp server");

        let client = StdUdpSocket::bind("127.0.0.1:0").expect("bind loopback client");
        client.send_to(b"x", addr).expect("send datagram");
        std::thread::sleep(Duration::from_millis(50));
        let entry = server.sockets.values().next().cloned().expect("one bound socket");
        server.receive_loop(&entry);
        assert_eq!(server.connection_count(), 1);

        entry
            .connections
            .lock()
            .expect("connections mutex poisoned")
            .values()
            .next()
            .expect("peer connection")
            .destroy();
        server.reap_closed();
        assert_eq!(server.connection_count(), 0);
    }
}
