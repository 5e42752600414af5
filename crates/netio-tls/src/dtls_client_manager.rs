//! DTLS Client Manager: the encrypted-datagram analogue of
//! `netio_udp::client_manager::UdpClientManager`.
//!
//! A UDP `connect()` only records a kernel default-peer association, so it
//! always completes synchronously — there is no writable-readiness wait and
//! so no `Connecting`/`Established` phase split the way
//! `TlsClientManager` (TLS-over-TCP) needs one. What differs from plain UDP
//! is what happens once the socket is connected: `TlsConnection::
//! start_transport_connect` starts the handshake pump itself instead of
//! firing `connect` immediately, so the caller only ever observes `connect`
//! once the handshake (driven by subsequent readable events) completes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::{Interest, Token};
use openssl::ssl::SslContext;

use netio_core::conn_selector::LocalCloseQueue;
use netio_core::connection::ConnectionParams;
use netio_core::error::{map_io_error, Op};
use netio_core::selector::{SelectorHandler, SelectorTick};
use netio_core::worker::{InlineWorker, Worker};
use netio_core::{ConnectionHandle, NetError};

use netio_udp::provider::{UdpChannelProvider, UdpSocketConfig};

use crate::connection::TlsConnection;
use crate::dtls_server::UdpDtlsConnection;
use crate::openssl_engine::OpensslEngine;

pub struct DtlsClientManager {
    selector: Arc<SelectorHandler>,
    local_close: Arc<LocalCloseQueue>,
    connections: Mutex<HashMap<Token, Arc<UdpDtlsConnection>>>,
    next_token: AtomicUsize,
    socket_config: UdpSocketConfig,
    ssl_context: SslContext,
    default_worker: Option<Arc<dyn Fn() -> Arc<dyn Worker> + Send + Sync>>,
}

impl DtlsClientManager {
    pub fn new(socket_config: UdpSocketConfig, ssl_context: SslContext) -> Result<Arc<Self>, NetError> {
        let selector = SelectorHandler::new().map_err(|e| map_io_error(Op::Bind, e))?;
        Ok(Arc::new(Self {
            selector: Arc::new(selector),
            local_close: Arc::new(LocalCloseQueue::new()),
            connections: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(1),
            socket_config,
            ssl_context,
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

    /// Builds an unconnected handle with its own `OpensslEngine::client`. No
    /// socket exists yet; the caller attaches event handlers before calling
    /// [`Self::connect`].
    pub fn connection(&self, params: ConnectionParams) -> Result<Arc<UdpDtlsConnection>, NetError> {
        let worker = self
            .default_worker
            .as_ref()
            .map(|f| f())
            .unwrap_or_else(|| Arc::new(InlineWorker) as Arc<dyn Worker>);
        let engine = OpensslEngine::client(&self.ssl_context)?;
        let provider = UdpChannelProvider::unconnected(self.socket_config.clone());
        Ok(TlsConnection::new_dtls(engine, provider, params, worker))
    }

    /// Kernel-connects the socket, registers it for read-readiness, and
    /// starts the handshake pump. `timeout` is accepted for API parity with
    /// `TlsClientManager::connect`; a UDP connect never blocks, so there is
    /// no connect-timeout timer to schedule here (the handshake itself has
    /// no deadline of its own in this state machine — see DESIGN.md).
    pub fn connect(self: &Arc<Self>, conn: Arc<UdpDtlsConnection>, remote: SocketAddr, _timeout: Duration) -> Result<(), NetError> {
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));

        let handle: ConnectionHandle = conn.clone();
        let local_close = Arc::clone(&self.local_close);
        let selector = Arc::clone(&self.selector);
        conn.set_local_close_notify(Arc::new(move || {
            local_close.on_connection_closed(&selector, Arc::clone(&handle));
        }));

        conn.start_transport_connect(remote)?;

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
        if conn.inner().is_closed() {
            self.connections.lock().expect("connections mutex poisoned").remove(&token);
        }
    }
}

struct ClientTick(Arc<DtlsClientManager>);

impl SelectorTick for ClientTick {
    fn on_tick(&mut self, _selector: &SelectorHandler) {
        self.0.on_tick();
    }

    fn on_ready(&mut self, token: Token, readable: bool, writable: bool) {
        self.0.on_ready(token, readable, writable);
    }
}
