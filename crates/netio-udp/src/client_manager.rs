//! UDP Client Manager: regulates §4.H's outbound-connection branch.
//!
//! # 设计背景（Why）
//! Unlike TCP, a UDP `connect()` never blocks on the network — it only
//! records a kernel-side default-peer association — so there is no
//! writable-readiness wait to drive through a `Connecting` phase the way
//! `netio_tcp::client_manager::TcpClientManager` does. `connect` always
//! completes before this method returns, meaning the `connect` event has
//! already fired by the time the caller sees `Ok(())`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::{Interest, Token};
use netio_core::conn_selector::LocalCloseQueue;
use netio_core::connection::ConnectionParams;
use netio_core::error::{map_io_error, Op};
use netio_core::selector::{SelectorHandler, SelectorTick};
use netio_core::worker::{InlineWorker, Worker};
use netio_core::{ConnectionHandle, NetError, PlainConnection};

use crate::provider::{UdpChannelProvider, UdpSocketConfig};

pub type UdpPlainConnection = PlainConnection<UdpChannelProvider>;

pub struct UdpClientManager {
    selector: Arc<SelectorHandler>,
    local_close: Arc<LocalCloseQueue>,
    connections: Mutex<HashMap<Token, Arc<UdpPlainConnection>>>,
    next_token: AtomicUsize,
    socket_config: UdpSocketConfig,
    default_worker: Option<Arc<dyn Fn() -> Arc<dyn Worker> + Send + Sync>>,
}

impl UdpClientManager {
    pub fn new(socket_config: UdpSocketConfig) -> Result<Arc<Self>, NetError> {
        let selector = SelectorHandler::new().map_err(|e| map_io_error(Op::Bind, e))?;
        Ok(Arc::new(Self {
            selector: Arc::new(selector),
            local_close: Arc::new(LocalCloseQueue::new()),
            connections: Mutex::new(HashMap::new()),
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

    /// Builds an unconnected handle. No socket exists yet; the caller
    /// attaches event handlers before calling [`Self::connect`].
    pub fn connection(&self, params: ConnectionParams) -> Arc<UdpPlainConnection> {
        let worker = self
            .default_worker
            .as_ref()
            .map(|f| f())
            .unwrap_or_else(|| Arc::new(InlineWorker) as Arc<dyn Worker>);
        PlainConnection::new(UdpChannelProvider::unconnected(self.socket_config.clone()), params, worker)
    }

    /// Opens and kernel-connects the socket, registers it for
    /// read-readiness, and returns once `connect` has fired. `timeout` is
    /// accepted for API parity with `TcpClientManager::connect` but plays no
    /// role: a UDP connect never blocks, so there is nothing to time out.
    pub fn connect(self: &Arc<Self>, conn: Arc<UdpPlainConnection>, _timeout: Duration) -> Result<(), NetError> {
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));

        let handle: ConnectionHandle = conn.clone();
        let local_close = Arc::clone(&self.local_close);
        let selector = Arc::clone(&self.selector);
        conn.set_local_close_notify(Arc::new(move || {
            local_close.on_connection_closed(&selector, Arc::clone(&handle));
        }));

        conn.start_connect()?;

        conn.inner()
            .with_provider(|p| p.bind_registration(Arc::clone(&self.selector), token));
        self.selector
            .register_channel(Box::new(Arc::clone(conn.inner())), token, Interest::READABLE)
            .map_err(|e| map_io_error(Op::Register, e))?;

        self.connections
            .lock()
            .expect("connections mutex poisoned")
            .insert(token, conn);
        Ok(())
    }

    fn on_tick(&self) {
        self.local_close.drain();
    }

    fn on_ready(&self, token: Token, readable: bool, writable: bool) {
        let conn = self
            .connections
            .lock()
            .expect("connections mutex poisoned")
            .get(&token)
            .cloned();
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
}

struct ClientTick(Arc<UdpClientManager>);

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
    use netio_core::Endpoint;
    use std::net::UdpSocket as StdUdpSocket;

    #[test]
    fn connect_fires_synchronously_against_a_bound_peer() {
        let peer = StdUdpSocket::bind("127.0.0.1:0").expect("bind loopback peer");
        let peer_addr = peer.local_addr().expect("peer local addr");

        let manager = UdpClientManager::new(UdpSocketConfig::new()).expect("client manager");
        let params = ConnectionParams::with_remote(Endpoint::Socket(peer_addr));
        let conn = manager.connection(params);

        let connected = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&connected);
        conn.events().on_connect(Box::new(move || {
            flag.store(true, Ordering::SeqCst);
        }));

        manager.connect(Arc::clone(&conn), Duration::from_secs(1)).expect("connect");
        assert!(connected.load(Ordering::SeqCst), "udp connect must fire `connect` synchronously");
        assert!(conn.is_connected());
    }
}
