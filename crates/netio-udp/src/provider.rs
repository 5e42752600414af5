//! UDP Channel Provider: regulates §4.A's datagram branch.
//!
//! # 设计背景（Why）
//! Two modes coexist over one OS socket, same as the spec describes. Client
//! mode kernel-connects the socket to a single remote (`connect()` on a UDP
//! socket just sets the default peer; `send`/`recv` become direct
//! syscalls). Server mode never connects the socket — many peers share it,
//! so `write` uses `sendto`, and `read` draws from a per-peer backlog queue
//! that [`crate::server::UdpServer`]'s receive loop fills as datagrams
//! arrive for that peer's address. In server mode the provider must never
//! disarm read-readiness (every other peer shares the same socket) and must
//! never close the socket on a single peer's `close()`.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use mio::net::UdpSocket as MioUdpSocket;
use mio::{Interest, Registry, Token};
use netio_core::error::{map_io_error, Op};
use netio_core::selector::{Registrable, SelectorHandler};
use netio_core::{ChannelProvider, NetError};
use socket2::SockRef;

/// Socket-level configuration applied once at bind/connect time.
///
/// Mirrors the teacher's `TcpSocketConfig` builder idiom
/// (`netio_tcp::provider::TcpSocketConfig`); UDP has no `SO_LINGER`, but
/// server-mode sockets benefit from `SO_REUSEPORT` where the platform
/// supports it, so multiple processes (or, in tests, multiple binds in the
/// same run) can share a port.
#[derive(Clone, Debug, Default)]
pub struct UdpSocketConfig {
    reuse_address: bool,
    reuse_port: bool,
}

impl UdpSocketConfig {
    pub const fn new() -> Self {
        Self {
            reuse_address: false,
            reuse_port: false,
        }
    }

    pub fn with_reuse_address(mut self, reuse: bool) -> Self {
        self.reuse_address = reuse;
        self
    }

    pub fn with_reuse_port(mut self, reuse: bool) -> Self {
        self.reuse_port = reuse;
        self
    }

    fn apply(&self, socket: &MioUdpSocket) -> io::Result<()> {
        let sock = SockRef::from(socket);
        if self.reuse_address {
            sock.set_reuse_address(true)?;
        }
        #[cfg(unix)]
        if self.reuse_port {
            sock.set_reuse_port(true)?;
        }
        Ok(())
    }
}

/// Invoked by a server-mode provider's `write_backlog_started`/`_ended` so
/// [`crate::server::UdpServer`] can keep its backlogged-connection list
/// (§4.H) and the shared socket's write-interest in sync. `true` = backlog
/// started, `false` = backlog drained (or the peer closed).
pub type BacklogNotify = Arc<dyn Fn(SocketAddr, bool) + Send + Sync>;

/// The single OS socket a server shares across every peer connection it has
/// synthesized. Owns the `mio` registration; individual peer connections
/// never register themselves (see [`UdpChannelProvider::reregister`]).
pub struct UdpSharedSocket {
    socket: Mutex<MioUdpSocket>,
}

impl UdpSharedSocket {
    pub fn new(socket: MioUdpSocket) -> Arc<Self> {
        Arc::new(Self {
            socket: Mutex::new(socket),
        })
    }

    pub fn bind(addr: SocketAddr, config: &UdpSocketConfig) -> io::Result<Arc<Self>> {
        let socket = MioUdpSocket::bind(addr)?;
        config.apply(&socket)?;
        Ok(Self::new(socket))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.lock().expect("shared udp socket poisoned").local_addr().ok()
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.lock().expect("shared udp socket poisoned").recv_from(buf)
    }

    pub fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<usize> {
        self.socket.lock().expect("shared udp socket poisoned").send_to(buf, peer)
    }
}

impl Registrable for Arc<UdpSharedSocket> {
    fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        let mut socket = self.socket.lock().expect("shared udp socket poisoned");
        match registry.register(&mut *socket, token, interest) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                registry.reregister(&mut *socket, token, interest)
            }
            Err(e) => Err(e),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        let mut socket = self.socket.lock().expect("shared udp socket poisoned");
        registry.deregister(&mut *socket)
    }
}

#[derive(Clone, Copy, Debug)]
struct InterestState {
    read_blocked: bool,
    write_backlog: bool,
}

impl InterestState {
    fn to_mio(self) -> Interest {
        match (self.read_blocked, self.write_backlog) {
            (true, true) => Interest::WRITABLE,
            (true, false) => Interest::WRITABLE,
            (false, true) => Interest::READABLE | Interest::WRITABLE,
            (false, false) => Interest::READABLE,
        }
    }
}

enum Mode {
    /// Kernel-connected to a single remote once `ChannelProvider::connect`
    /// runs; `socket` is `None` until then, mirroring `netio-tcp`'s
    /// `unconnected()` / lazy-`connect()` split so `UdpClientManager` can
    /// build a handle before a remote address is known to be reachable.
    Client {
        socket: Option<MioUdpSocket>,
        config: UdpSocketConfig,
        selector: Option<Arc<SelectorHandler>>,
        token: Option<Token>,
        interest: InterestState,
    },
    /// Unconnected; shares `shared` with every other peer of the same bound
    /// socket. `read_queue` is this peer's own slice of the demultiplexer's
    /// inbound traffic, filled by [`crate::server::UdpServer`]'s receive
    /// loop, never by this provider's own `read()` directly observing the
    /// kernel.
    Server {
        shared: Arc<UdpSharedSocket>,
        peer: SocketAddr,
        read_queue: Mutex<VecDeque<Bytes>>,
        backlog_active: AtomicBool,
        backlog_notify: BacklogNotify,
    },
}

pub struct UdpChannelProvider {
    mode: Mode,
}

impl UdpChannelProvider {
    /// Client-mode constructor, lazy like `TcpChannelProvider::unconnected`:
    /// no socket exists until `ChannelProvider::connect` opens and
    /// kernel-connects one.
    pub fn unconnected(config: UdpSocketConfig) -> Self {
        Self {
            mode: Mode::Client {
                socket: None,
                config,
                selector: None,
                token: None,
                interest: InterestState {
                    read_blocked: false,
                    write_backlog: false,
                },
            },
        }
    }

    /// Opens a fresh socket and connects it to `remote` right away, for
    /// callers that already know the peer and do not need the
    /// `connection()`/`connect()` two-step (e.g. direct unit tests).
    pub fn connected(remote: SocketAddr, config: &UdpSocketConfig) -> io::Result<Self> {
        let mut provider = Self::unconnected(config.clone());
        provider.connect(remote, Duration::from_secs(0)).map_err(|e| match e {
            NetError::Io { source, .. } => source,
            other => io::Error::other(other.to_string()),
        })?;
        Ok(provider)
    }

    /// Server-mode constructor: one per synthesized peer, sharing `shared`'s
    /// socket. `backlog_notify` is how this peer's backlog transitions
    /// reach [`crate::server::UdpServer`]'s bookkeeping (§4.H).
    pub fn for_peer(shared: Arc<UdpSharedSocket>, peer: SocketAddr, backlog_notify: BacklogNotify) -> Self {
        Self {
            mode: Mode::Server {
                shared,
                peer,
                read_queue: Mutex::new(VecDeque::new()),
                backlog_active: AtomicBool::new(false),
                backlog_notify,
            },
        }
    }

    pub fn bind_registration(&mut self, selector: Arc<SelectorHandler>, token: Token) {
        if let Mode::Client {
            selector: slot,
            token: token_slot,
            ..
        } = &mut self.mode
        {
            *slot = Some(selector);
            *token_slot = Some(token);
        }
    }

    /// Pushed by the server's demultiplexing receive loop for this peer's
    /// address; has no effect in client mode (a client's inbound datagrams
    /// arrive through the kernel-connected socket directly, not a queue).
    pub fn push_inbound(&self, datagram: Bytes) {
        if let Mode::Server { read_queue, .. } = &self.mode {
            read_queue.lock().expect("udp read queue poisoned").push_back(datagram);
        }
    }

    pub fn peer_addr_for_server_mode(&self) -> Option<SocketAddr> {
        match &self.mode {
            Mode::Server { peer, .. } => Some(*peer),
            Mode::Client { .. } => None,
        }
    }

    fn reapply_client_interest(&mut self) -> Result<(), NetError> {
        if let Mode::Client {
            selector, token, interest, ..
        } = &self.mode
        {
            let (Some(selector), Some(token)) = (selector.clone(), *token) else {
                return Ok(());
            };
            selector
                .reregister_interest(token, interest.to_mio())
                .map_err(|e| map_io_error(Op::Register, e))?;
            let _ = selector.wakeup();
        }
        Ok(())
    }
}

impl ChannelProvider for UdpChannelProvider {
    /// A UDP `connect()` only records the kernel default-peer association;
    /// it never blocks on the network, so this always completes
    /// synchronously. Server mode has no socket of its own to open — its
    /// provider is only ever constructed via [`Self::for_peer`] — so this is
    /// unreachable there in practice; it still returns `Ok(true)` rather
    /// than panicking, since `Connection::start_connect` is the only caller
    /// and a server-mode peer connection never calls it.
    fn connect(&mut self, remote: SocketAddr, _timeout: Duration) -> Result<bool, NetError> {
        match &mut self.mode {
            Mode::Client { socket, config, .. } => {
                let any = if remote.is_ipv4() {
                    "0.0.0.0:0".parse().unwrap()
                } else {
                    "[::]:0".parse().unwrap()
                };
                let new_socket = MioUdpSocket::bind(any).map_err(|e| map_io_error(Op::Bind, e))?;
                config.apply(&new_socket).map_err(|e| map_io_error(Op::Configure, e))?;
                new_socket.connect(remote).map_err(|e| map_io_error(Op::Connect, e))?;
                *socket = Some(new_socket);
                Ok(true)
            }
            Mode::Server { .. } => Ok(true),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, NetError> {
        match &mut self.mode {
            Mode::Client { socket, .. } => {
                let socket = socket
                    .as_mut()
                    .ok_or(NetError::UnsupportedOperation("read before the socket is established"))?;
                match socket.recv(buf) {
                    Ok(n) => Ok(Some(n)),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
                    Err(e) => Err(map_io_error(Op::Read, e)),
                }
            }
            Mode::Server { read_queue, .. } => {
                let mut queue = read_queue.lock().expect("udp read queue poisoned");
                match queue.pop_front() {
                    Some(datagram) => {
                        let n = datagram.len().min(buf.len());
                        buf[..n].copy_from_slice(&datagram[..n]);
                        Ok(Some(n))
                    }
                    None => Ok(None),
                }
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, NetError> {
        match &mut self.mode {
            Mode::Client { socket, .. } => {
                let socket = socket
                    .as_mut()
                    .ok_or(NetError::UnsupportedOperation("write before the socket is established"))?;
                match socket.send(buf) {
                    Ok(n) => Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
                    Err(e) => Err(map_io_error(Op::Write, e)),
                }
            }
            Mode::Server { shared, peer, .. } => match shared.send_to(buf, *peer) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
                Err(e) => Err(map_io_error(Op::Write, e)),
            },
        }
    }

    fn write_backlog_started(&mut self) -> Result<(), NetError> {
        match &self.mode {
            Mode::Client { .. } => {
                if let Mode::Client { interest, .. } = &mut self.mode {
                    interest.write_backlog = true;
                }
                self.reapply_client_interest()
            }
            Mode::Server {
                peer,
                backlog_active,
                backlog_notify,
                ..
            } => {
                backlog_active.store(true, Ordering::Release);
                backlog_notify(*peer, true);
                Ok(())
            }
        }
    }

    fn write_backlog_ended(&mut self) -> Result<(), NetError> {
        match &self.mode {
            Mode::Client { .. } => {
                if let Mode::Client { interest, .. } = &mut self.mode {
                    interest.write_backlog = false;
                }
                self.reapply_client_interest()
            }
            Mode::Server {
                peer,
                backlog_active,
                backlog_notify,
                ..
            } => {
                backlog_active.store(false, Ordering::Release);
                backlog_notify(*peer, false);
                Ok(())
            }
        }
    }

    /// Server mode never disarms read-readiness: the socket is shared with
    /// every other peer, and this peer's own inbound datagrams arrive via
    /// `push_inbound`, not a per-peer kernel readiness bit (spec §4.A).
    fn set_read_block(&mut self, block: bool) -> Result<(), NetError> {
        match &mut self.mode {
            Mode::Client { interest, .. } => {
                interest.read_blocked = block;
                self.reapply_client_interest()
            }
            Mode::Server { .. } => Ok(()),
        }
    }

    fn is_available(&self) -> bool {
        match &self.mode {
            Mode::Client { socket, .. } => socket.is_some(),
            Mode::Server { .. } => true,
        }
    }

    /// Client mode closes (drops) the owned socket. Server mode must never
    /// close the shared socket; it only unregisters this peer's backlog
    /// membership so the server's write-interest bookkeeping stays correct.
    fn close(&mut self) -> Result<(), NetError> {
        match &mut self.mode {
            Mode::Client { selector, token, socket, .. } => {
                if let (Some(selector), Some(token)) = (selector.take(), token.take()) {
                    selector.deregister(token);
                }
                *socket = None;
                Ok(())
            }
            Mode::Server {
                peer,
                backlog_active,
                backlog_notify,
                ..
            } => {
                if backlog_active.swap(false, Ordering::AcqRel) {
                    backlog_notify(*peer, false);
                }
                Ok(())
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match &self.mode {
            Mode::Client { socket, .. } => socket.as_ref().and_then(|s| s.local_addr().ok()),
            Mode::Server { shared, .. } => shared.local_addr(),
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        match &self.mode {
            Mode::Client { socket, .. } => socket.as_ref().and_then(|s| s.peer_addr().ok()),
            Mode::Server { peer, .. } => Some(*peer),
        }
    }

    /// Server-mode peer connections are never individually registered with
    /// the selector — only [`UdpSharedSocket`] is, once, by
    /// [`crate::server::UdpServer`] — so this is a no-op there; client mode
    /// registers its own socket exactly like `netio-tcp`'s provider does.
    fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        match &mut self.mode {
            Mode::Client { socket, .. } => {
                let socket = socket
                    .as_mut()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "udp socket not yet established"))?;
                match registry.register(socket, token, interest) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => registry.reregister(socket, token, interest),
                    Err(e) => Err(e),
                }
            }
            Mode::Server { .. } => Ok(()),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match &mut self.mode {
            Mode::Client { socket, .. } => match socket.as_mut() {
                Some(socket) => registry.deregister(socket),
                None => Ok(()),
            },
            Mode::Server { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_state_default_watches_only_readable() {
        let state = InterestState {
            read_blocked: false,
            write_backlog: false,
        };
        assert_eq!(state.to_mio(), Interest::READABLE);
    }

    #[test]
    fn server_mode_push_inbound_is_drained_in_fifo_order() {
        let shared = UdpSharedSocket::bind("127.0.0.1:0".parse().unwrap(), &UdpSocketConfig::new())
            .expect("bind local ephemeral port");
        let notify: BacklogNotify = Arc::new(|_, _| {});
        let mut provider = UdpChannelProvider::for_peer(shared, "127.0.0.1:9999".parse().unwrap(), notify);
        provider.push_inbound(Bytes::from_static(b"first"));
        provider.push_inbound(Bytes::from_static(b"second"));

        let mut buf = [0u8; 16];
        let n = provider.read(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"first");
        let n = provider.read(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"second");
        assert!(provider.read(&mut buf).unwrap().is_none());
    }

    #[test]
    fn server_mode_set_read_block_is_a_no_op() {
        let shared = UdpSharedSocket::bind("127.0.0.1:0".parse().unwrap(), &UdpSocketConfig::new())
            .expect("bind local ephemeral port");
        let notify: BacklogNotify = Arc::new(|_, _| {});
        let mut provider = UdpChannelProvider::for_peer(shared, "127.0.0.1:9999".parse().unwrap(), notify);
        // Server mode must never disarm read-readiness; this must not error
        // and must not touch the shared socket's registration.
        assert!(provider.set_read_block(true).is_ok());
    }
}
