//! TLS/DTLS Connection: drives any [`TlsEngine`] over any
//! `netio_core::ChannelProvider`, following the same buffering and
//! write-backlog machinery [`netio_core::plain::PlainConnection`] uses for
//! plaintext, but with its own handshake state machine layered in front of
//! it instead of `netio_core::Connection`'s `connect` firing on transport
//! connect.
//!
//! That's the one place this type cannot simply wrap `PlainConnection`:
//! `Connection::start_connect` dispatches `connect` the moment the kernel
//! reports success, and `Connection::mark_connected` is what flips
//! `has_connected`/`is_connected`. A TLS connection's `connect` event must
//! wait for the handshake, so this type never calls `start_connect`/
//! `mark_connected` until the handshake engine reports [`HandshakeState::Done`],
//! and keeps its own pre-handshake write queue rather than `Connection`'s
//! pre-connect queue (which replays queued bytes through the raw,
//! unencrypted backlog — fine for plaintext, wrong for ciphertext that can
//! only be produced once the engine is ready to `wrap_app`).
//!
//! Like `PlainConnection`, every method here takes `&self`: `inner` is
//! already an `Arc<Connection<P>>`, so the `Arc<Self>`-requiring calls on it
//! (`mark_connected`, `dispatch_data`, ...) go through that field rather than
//! needing `TlsConnection` itself reconstituted as an `Arc`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, warn};

use netio_core::connection::{
    ChannelProvider, Connection, ConnectionId, ConnectionLifecycle, ConnectionParams, EncryptionKind,
    TransportKind,
};
use netio_core::error::{protocol_error, ErrorCategory, Op};
use netio_core::event::EventTable;
use netio_core::staging::StagingBuffer;
use netio_core::worker::Worker;
use netio_core::NetError;

use crate::engine::{HandshakeState, TlsEngine};

/// Initial/default capacities, sized to roughly one TLS record (§4.D: "sized
/// to the engine's packet buffer size ≈ max TLS record").
pub const DEFAULT_WIRE_BUFFER: usize = 16 * 1024;
pub const DEFAULT_APP_BUFFER: usize = 16 * 1024;
/// Hard ceiling past which growth fails with [`NetError::BufferOverflow`]
/// (§4.D: "If the capacity already equals the engine's hard maximum, fail").
pub const MAX_WIRE_BUFFER: usize = 1024 * 1024;
pub const MAX_APP_BUFFER: usize = 8 * 1024 * 1024;

/// DTLS doubles the wire buffers relative to TLS, to cover the larger
/// datagrams `openssl`'s DTLS record layer can legitimately produce
/// (§4.D: "DTLS variant doubles certain capacities").
pub const DTLS_WIRE_BUFFER_MULTIPLIER: usize = 2;

/// Safety cap on close-notify round-trips (§4.D "Orderly close").
const CLOSE_NOTIFY_MAX_MESSAGES: u32 = 15;

/// Defensive bound on handshake-step iterations per readiness event, so a
/// misbehaving engine that kept reporting `NeedWrap` without ever draining
/// could not spin the I/O thread forever.
const HANDSHAKE_STEP_BUDGET: u32 = 64;

struct BufferCaps {
    wire_read: usize,
    app_read: usize,
}

impl BufferCaps {
    fn new(wire: usize, app: usize) -> Self {
        Self { wire_read: wire, app_read: app }
    }

    /// §4.D growth rule: app read buffer grows ×8-up-to-max; everything else
    /// (wire read/write, app write) grows ×2-up-to-max. Only the wire-read
    /// and app-read caps need tracking here: wire-write/app-write bound how
    /// much we try to hand the engine in one call, and both `BioPipe` and
    /// `Vec` grow on demand rather than ever rejecting a write, so there is
    /// no analogous "grow before retry" step for them (see DESIGN.md OQ-2).
    fn grow_wire_read(&mut self) -> Result<(), NetError> {
        grow("wire_read", &mut self.wire_read, 2, MAX_WIRE_BUFFER)
    }

    fn grow_app_read(&mut self) -> Result<(), NetError> {
        grow("app_read", &mut self.app_read, 8, MAX_APP_BUFFER)
    }
}

fn grow(buffer: &'static str, current: &mut usize, multiplier: usize, max: usize) -> Result<(), NetError> {
    if *current >= max {
        return Err(NetError::BufferOverflow { buffer, max });
    }
    *current = (*current * multiplier).min(max);
    Ok(())
}

/// Bytes queued by `write`/`write_queue` calls made before the handshake has
/// completed. Distinct from `netio_core::connection::Connection`'s own
/// pre-connect queue — see the module docs.
struct PreHandshakeQueue {
    items: VecDeque<Bytes>,
}

/// Outcome of one non-blocking handshake-phase socket read.
enum HandshakeRead {
    /// Bytes were read and fed to the engine; keep stepping.
    Fed,
    /// Kernel has nothing ready; wait for the next readable event.
    WouldBlock,
    /// EOF or I/O error; already dispatched, caller must stop driving.
    Stopped,
}

pub struct TlsConnection<E: TlsEngine, P: ChannelProvider + 'static> {
    inner: Arc<Connection<P>>,
    engine: Mutex<E>,
    buffers: Mutex<BufferCaps>,
    staging: StagingBuffer,
    pre_handshake: Mutex<Option<PreHandshakeQueue>>,
    socket_connected: AtomicBool,
}

impl<E: TlsEngine, P: ChannelProvider + 'static> TlsConnection<E, P> {
    /// Builds a TLS-over-stream connection (`EncryptionKind::Tls`,
    /// `TransportKind::Stream`).
    pub fn new_tls(engine: E, provider: P, params: ConnectionParams, worker: Arc<dyn Worker>) -> Arc<Self> {
        Self::build(
            engine,
            provider,
            params,
            worker,
            TransportKind::Stream,
            EncryptionKind::Tls,
            DEFAULT_WIRE_BUFFER,
        )
    }

    /// Builds a DTLS-over-datagram connection (`EncryptionKind::Dtls`,
    /// `TransportKind::Datagram`), with doubled wire-buffer capacity.
    pub fn new_dtls(engine: E, provider: P, params: ConnectionParams, worker: Arc<dyn Worker>) -> Arc<Self> {
        Self::build(
            engine,
            provider,
            params,
            worker,
            TransportKind::Datagram,
            EncryptionKind::Dtls,
            DEFAULT_WIRE_BUFFER * DTLS_WIRE_BUFFER_MULTIPLIER,
        )
    }

    fn build(
        engine: E,
        provider: P,
        params: ConnectionParams,
        worker: Arc<dyn Worker>,
        transport_kind: TransportKind,
        encryption_kind: EncryptionKind,
        wire_buffer: usize,
    ) -> Arc<Self> {
        let inner = Connection::new(transport_kind, encryption_kind, provider, params, worker, wire_buffer);
        Arc::new(Self {
            inner,
            engine: Mutex::new(engine),
            buffers: Mutex::new(BufferCaps::new(wire_buffer, DEFAULT_APP_BUFFER)),
            staging: StagingBuffer::new(DEFAULT_APP_BUFFER),
            pre_handshake: Mutex::new(Some(PreHandshakeQueue { items: VecDeque::new() })),
            socket_connected: AtomicBool::new(false),
        })
    }

    pub fn inner(&self) -> &Arc<Connection<P>> {
        &self.inner
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id()
    }

    pub fn events(&self) -> &EventTable {
        self.inner.events()
    }

    /// `true` once the handshake has completed and `connect` has fired.
    /// Distinct from [`Self::is_socket_connected`] — see §4.D's accessor
    /// contract.
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// `true` once the transport is connected, regardless of handshake
    /// progress.
    pub fn is_socket_connected(&self) -> bool {
        self.socket_connected.load(Ordering::Acquire)
    }

    pub fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }

    pub fn protocol_name(&self) -> Option<String> {
        self.engine.lock().expect("engine mutex poisoned").protocol_name()
    }

    pub fn cipher_name(&self) -> Option<String> {
        self.engine.lock().expect("engine mutex poisoned").cipher_name()
    }

    /// Negotiated ALPN protocol, with an empty string normalized to `None`
    /// (§4.D: "negotiated application protocol (empty string normalized to
    /// none)").
    pub fn application_protocol(&self) -> Option<Vec<u8>> {
        self.engine
            .lock()
            .expect("engine mutex poisoned")
            .alpn_protocol()
            .filter(|proto| !proto.is_empty())
    }

    /// Non-blocking transport-level connect. Returns `true` if the kernel
    /// completed synchronously — the caller still must not treat the
    /// connection as usable until [`Self::is_connected`], since the
    /// handshake has not run yet. Callers own registering the resulting
    /// socket with a selector and driving the `ConnectionLifecycle` events
    /// the same way `netio_tcp::TcpClientManager`/`netio_udp::UdpClientManager`
    /// drive plaintext connects, but must route the immediate case through
    /// this type's own handshake pump instead of `Connection::mark_connected`.
    pub fn start_transport_connect(&self, remote: std::net::SocketAddr) -> Result<bool, NetError> {
        let immediate = self
            .inner
            .with_provider(|p| p.connect(remote, std::time::Duration::from_secs(0)))?;
        if immediate {
            self.socket_connected.store(true, Ordering::Release);
            self.inner.touch_io();
            self.pump_handshake();
        }
        Ok(immediate)
    }

    /// Called once the transport side has confirmed connected (accepted
    /// server-side, or a deferred client connect whose writable-readiness
    /// event checked `SO_ERROR` and found none). Starts driving the
    /// handshake state machine.
    pub fn begin_handshake(&self) {
        self.socket_connected.store(true, Ordering::Release);
        self.inner.touch_io();
        self.pump_handshake();
    }

    pub fn fire_connect_timeout(&self) {
        self.inner.fire_connect_timeout();
    }

    pub fn set_local_close_notify(&self, notify: Arc<dyn Fn() + Send + Sync>) {
        self.inner.set_local_close_notify(notify);
    }

    /// §4.D's handshake-state table, driven until the engine needs more
    /// wire bytes than are currently available (at which point it waits for
    /// the next readable event) or the handshake finishes.
    fn pump_handshake(&self) {
        for _ in 0..HANDSHAKE_STEP_BUDGET {
            let state = {
                let mut engine = self.engine.lock().expect("engine mutex poisoned");
                engine.step()
            };
            match state {
                Ok(HandshakeState::NeedWrap) => {
                    let out = self.engine.lock().expect("engine mutex poisoned").take_wire_output();
                    if out.is_empty() {
                        // Nothing queued despite `NeedWrap`; avoid spinning.
                        break;
                    }
                    if let Err(e) = self.inner.backlog_write(&out) {
                        self.inner.dispatch_error(e);
                        return;
                    }
                }
                Ok(HandshakeState::NeedTask) => continue, // dead on both engines; see DESIGN.md OQ-1
                Ok(HandshakeState::NeedUnwrap) => match self.pump_handshake_read() {
                    HandshakeRead::Fed => continue,
                    HandshakeRead::WouldBlock => return, // wait for the next readable event
                    HandshakeRead::Stopped => return,    // EOF/error already dispatched
                },
                Ok(HandshakeState::Done) => {
                    self.finish_handshake();
                    return;
                }
                Err(e) => {
                    self.inner.dispatch_error(e);
                    return;
                }
            }
        }
        warn!("tls handshake exceeded its per-event step budget; yielding to the next readiness event");
    }

    /// One non-blocking socket read feeding the engine, used only while
    /// `NeedUnwrap`.
    fn pump_handshake_read(&self) -> HandshakeRead {
        let cap = self.buffers.lock().expect("buffers mutex poisoned").wire_read;
        let mut buf = vec![0u8; cap];
        match self.inner.with_provider(|p| p.read(&mut buf)) {
            Ok(None) => HandshakeRead::WouldBlock,
            Ok(Some(0)) => {
                self.inner.dispatch_error(protocol_error(
                    Op::Handshake,
                    "peer closed the connection before the tls handshake completed",
                    ErrorCategory::TlsHandshake,
                ));
                HandshakeRead::Stopped
            }
            Ok(Some(n)) => {
                self.inner.touch_io();
                if n == cap {
                    let mut buffers = self.buffers.lock().expect("buffers mutex poisoned");
                    if let Err(e) = buffers.grow_wire_read() {
                        drop(buffers);
                        self.inner.dispatch_error(e);
                        return HandshakeRead::Stopped;
                    }
                }
                self.engine.lock().expect("engine mutex poisoned").feed_wire(&buf[..n]);
                HandshakeRead::Fed
            }
            Err(e) => {
                self.inner.dispatch_error(e);
                HandshakeRead::Stopped
            }
        }
    }

    fn finish_handshake(&self) {
        debug!(
            protocol = self.protocol_name().as_deref().unwrap_or("unknown"),
            cipher = self.cipher_name().as_deref().unwrap_or("unknown"),
            "tls handshake complete"
        );
        self.flush_pre_handshake();
        self.inner.mark_connected();
    }

    fn flush_pre_handshake(&self) {
        let queue = self.pre_handshake.lock().expect("pre_handshake mutex poisoned").take();
        if let Some(queue) = queue {
            for chunk in queue.items {
                if let Err(e) = self.wrap_and_backlog(&chunk) {
                    self.inner.dispatch_error(e);
                    return;
                }
            }
        }
    }

    /// `write`: queues application bytes ahead of the handshake, or wraps
    /// and hands them to the base connection's backlog machinery once
    /// connected.
    pub fn write(&self, data: &[u8]) -> Result<(), NetError> {
        if !self.is_connected() {
            self.queue_pre_handshake(data);
            return Ok(());
        }
        self.staging.queue(data);
        self.flush().map(|_| ())
    }

    /// `write_queue`: same as `write` but defers flushing to the kernel.
    pub fn write_queue(&self, data: &[u8]) {
        if !self.is_connected() {
            self.queue_pre_handshake(data);
            return;
        }
        self.staging.queue(data);
    }

    fn queue_pre_handshake(&self, data: &[u8]) {
        let mut guard = self.pre_handshake.lock().expect("pre_handshake mutex poisoned");
        guard
            .get_or_insert_with(|| PreHandshakeQueue { items: VecDeque::new() })
            .items
            .push_back(Bytes::copy_from_slice(data));
    }

    /// Drains the staging buffer through `wrap_app` into the wire backlog,
    /// then drains the backlog itself.
    pub fn flush(&self) -> Result<bool, NetError> {
        let pending = self.staging.take();
        if !pending.is_empty() {
            self.wrap_and_backlog(&pending)?;
        }
        self.inner.flush_backlog()
    }

    /// §4.D "Write": wraps from the app buffer into the wire buffer in a
    /// loop while bytes remain, failing if a call makes no progress, then
    /// hands the accumulated wire bytes to the backlog in one shot.
    fn wrap_and_backlog(&self, mut data: &[u8]) -> Result<(), NetError> {
        let mut engine = self.engine.lock().expect("engine mutex poisoned");
        while !data.is_empty() {
            let n = engine.wrap_app(data)?;
            if n == 0 {
                return Err(protocol_error(
                    Op::Wrap,
                    "tls engine made no progress wrapping application data",
                    ErrorCategory::TlsRecord,
                ));
            }
            data = &data[n..];
        }
        let out = engine.take_wire_output();
        drop(engine);
        if !out.is_empty() {
            self.inner.backlog_write(&out)?;
        }
        Ok(())
    }

    pub fn close(&self) {
        if !self.is_connected() {
            // Handshake never completed; nothing to close-notify.
            self.inner.request_close();
            return;
        }
        let mut engine = self.engine.lock().expect("engine mutex poisoned");
        if let Err(e) = engine.close_notify() {
            debug!(error = %e, "tls close-notify initiation failed; closing anyway");
        }
        for _ in 0..CLOSE_NOTIFY_MAX_MESSAGES {
            let out = engine.take_wire_output();
            if out.is_empty() {
                break;
            }
            if let Err(e) = self.inner.backlog_write(&out) {
                debug!(error = %e, "tls close-notify write failed; closing anyway");
                break;
            }
        }
        drop(engine);
        self.inner.request_close();
    }

    pub fn destroy(&self) {
        self.inner.destroy();
    }

    /// Single non-blocking read attempt, matching `PlainConnection::do_read`'s
    /// one-syscall-per-readiness-event shape. Before the handshake completes
    /// this drives `pump_handshake` instead.
    pub fn do_read(&self) {
        if !self.is_connected() {
            self.pump_handshake();
            return;
        }

        let cap = self.buffers.lock().expect("buffers mutex poisoned").wire_read;
        let mut buf = vec![0u8; cap];
        match self.inner.with_provider(|p| p.read(&mut buf)) {
            Ok(None) => {}
            Ok(Some(0)) => {
                // Abrupt transport EOF without a close-notify: still a
                // forced close, same as plaintext's EOF handling.
                self.inner.destroy();
            }
            Ok(Some(n)) => {
                self.inner.touch_io();
                if n == cap {
                    let mut buffers = self.buffers.lock().expect("buffers mutex poisoned");
                    if let Err(e) = buffers.grow_wire_read() {
                        drop(buffers);
                        self.inner.dispatch_error(e);
                        return;
                    }
                }
                self.unwrap_and_dispatch(&buf[..n]);
            }
            Err(e) => {
                self.inner.dispatch_error(e);
            }
        }
    }

    fn unwrap_and_dispatch(&self, wire_bytes: &[u8]) {
        let mut engine = self.engine.lock().expect("engine mutex poisoned");
        engine.feed_wire(wire_bytes);

        let mut app_out = Vec::new();
        let app_cap = self.buffers.lock().expect("buffers mutex poisoned").app_read;
        loop {
            let before = app_out.len();
            match engine.unwrap_app(&mut app_out) {
                Ok(0) => break,
                Ok(_) => {
                    if app_out.len() - before >= app_cap {
                        let mut buffers = self.buffers.lock().expect("buffers mutex poisoned");
                        if let Err(e) = buffers.grow_app_read() {
                            drop(buffers);
                            drop(engine);
                            self.inner.dispatch_error(e);
                            return;
                        }
                    }
                }
                Err(e) => {
                    drop(engine);
                    self.inner.dispatch_error(e);
                    return;
                }
            }
        }
        let peer_closed = engine.is_peer_closed();
        drop(engine);

        if !app_out.is_empty() {
            self.inner.dispatch_data(Bytes::from(app_out));
        }
        if peer_closed {
            // §4.D: "CLOSED = initiate close-notify and stop".
            self.close();
        }
    }

    pub fn dispatch_error(&self, err: NetError) {
        self.inner.dispatch_error(err);
    }
}

impl<E: TlsEngine, P: ChannelProvider + 'static> ConnectionLifecycle for TlsConnection<E, P> {
    fn id(&self) -> ConnectionId {
        self.inner.id()
    }

    fn last_io(&self) -> Instant {
        self.inner.last_io()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn has_connected(&self) -> bool {
        self.inner.has_connected()
    }

    fn on_readable(&self) {
        self.do_read();
    }

    fn on_writable(&self) {
        if !self.is_connected() {
            self.pump_handshake();
        } else {
            let _ = self.flush();
        }
    }

    fn request_close(&self) {
        self.close();
    }

    fn destroy(&self) {
        self.inner.destroy();
    }

    fn fire_connect_timeout(&self) {
        self.inner.fire_connect_timeout();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    use netio_core::connection::TransportKind;
    use netio_core::worker::InlineWorker;

    struct StubProvider {
        written: StdMutex<Vec<u8>>,
        inbound: StdMutex<VecDeque<Vec<u8>>>,
    }

    impl StubProvider {
        fn new() -> Self {
            Self {
                written: StdMutex::new(Vec::new()),
                inbound: StdMutex::new(VecDeque::new()),
            }
        }

        fn push_inbound(&self, bytes: &[u8]) {
            self.inbound.lock().unwrap().push_back(bytes.to_vec());
        }
    }

    impl ChannelProvider for StubProvider {
        fn connect(&mut self, _remote: std::net::SocketAddr, _timeout: std::time::Duration) -> Result<bool, NetError> {
            Ok(true)
        }
        fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, NetError> {
            match self.inbound.lock().unwrap().pop_front() {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    Ok(Some(n))
                }
                None => Ok(None),
            }
        }
        fn write(&mut self, buf: &[u8]) -> Result<usize, NetError> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn write_backlog_started(&mut self) -> Result<(), NetError> {
            Ok(())
        }
        fn write_backlog_ended(&mut self) -> Result<(), NetError> {
            Ok(())
        }
        fn set_read_block(&mut self, _block: bool) -> Result<(), NetError> {
            Ok(())
        }
        fn is_available(&self) -> bool {
            true
        }
        fn close(&mut self) -> Result<(), NetError> {
            Ok(())
        }
        fn local_addr(&self) -> Option<std::net::SocketAddr> {
            None
        }
        fn peer_addr(&self) -> Option<std::net::SocketAddr> {
            None
        }
        fn reregister(
            &mut self,
            _registry: &mio::Registry,
            _token: mio::Token,
            _interest: mio::Interest,
        ) -> std::io::Result<()> {
            Ok(())
        }
        fn deregister(&mut self, _registry: &mio::Registry) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Trivial engine that treats the wire as plaintext and completes its
    /// handshake after a fixed number of `step()` calls, just enough to
    /// exercise `TlsConnection`'s state machine without a real handshake.
    struct StubEngine {
        steps_remaining: u32,
        done: bool,
        peer_closed: bool,
        inbound: Vec<u8>,
        outbound: Vec<u8>,
    }

    impl StubEngine {
        fn new(steps: u32) -> Self {
            Self {
                steps_remaining: steps,
                done: false,
                peer_closed: false,
                inbound: Vec::new(),
                outbound: Vec::new(),
            }
        }
    }

    impl TlsEngine for StubEngine {
        fn feed_wire(&mut self, bytes: &[u8]) {
            self.inbound.extend_from_slice(bytes);
        }

        fn take_wire_output(&mut self) -> Bytes {
            Bytes::from(std::mem::take(&mut self.outbound))
        }

        fn step(&mut self) -> Result<HandshakeState, NetError> {
            if self.done {
                return Ok(HandshakeState::Done);
            }
            if self.steps_remaining == 0 {
                self.done = true;
                return Ok(HandshakeState::Done);
            }
            self.steps_remaining -= 1;
            Ok(HandshakeState::NeedUnwrap)
        }

        fn unwrap_app(&mut self, app_out: &mut Vec<u8>) -> Result<usize, NetError> {
            let n = self.inbound.len();
            app_out.extend_from_slice(&self.inbound);
            self.inbound.clear();
            Ok(n)
        }

        fn is_peer_closed(&self) -> bool {
            self.peer_closed
        }

        fn wrap_app(&mut self, app_in: &[u8]) -> Result<usize, NetError> {
            self.outbound.extend_from_slice(app_in);
            Ok(app_in.len())
        }

        fn close_notify(&mut self) -> Result<(), NetError> {
            Ok(())
        }

        fn alpn_protocol(&self) -> Option<Vec<u8>> {
            None
        }

        fn cipher_name(&self) -> Option<String> {
            None
        }

        fn protocol_name(&self) -> Option<String> {
            None
        }
    }

    fn test_connection(steps: u32) -> Arc<TlsConnection<StubEngine, StubProvider>> {
        TlsConnection::new_tls(
            StubEngine::new(steps),
            StubProvider::new(),
            ConnectionParams::default(),
            Arc::new(InlineWorker),
        )
    }

    #[test]
    fn writes_before_handshake_completes_are_queued_not_dropped() {
        let conn = test_connection(0);
        conn.write_queue(b"hello");
        assert!(!conn.is_connected());
        conn.inner().with_provider(|p| assert!(p.written.lock().unwrap().is_empty()));

        conn.begin_handshake();
        assert!(conn.is_connected());
        conn.inner()
            .with_provider(|p| assert_eq!(&p.written.lock().unwrap()[..], b"hello"));
    }

    #[test]
    fn handshake_fires_connect_event_exactly_once() {
        let conn = test_connection(0);
        let fired = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&fired);
        conn.events().on_connect(Box::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        }));
        conn.begin_handshake();
        assert!(conn.is_connected());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn post_handshake_read_dispatches_decrypted_application_bytes() {
        let conn = test_connection(0);
        conn.begin_handshake();
        assert!(conn.is_connected());

        let received = Arc::new(StdMutex::new(Vec::new()));
        let captured = Arc::clone(&received);
        conn.events().on_data(Box::new(move |payload: Bytes| {
            captured.lock().unwrap().extend_from_slice(&payload);
        }));

        conn.inner().with_provider(|p: &mut StubProvider| p.push_inbound(b"wire bytes"));
        conn.do_read();
        assert_eq!(&received.lock().unwrap()[..], b"wire bytes");
    }

    #[test]
    fn peer_close_notify_triggers_local_close() {
        struct ClosingEngine(StubEngine);
        // Reuse StubEngine's Done behavior but report peer_closed on the
        // first unwrap_app call, exercising TlsConnection's "CLOSED ->
        // close()" transition from §4.D.
        impl TlsEngine for ClosingEngine {
            fn feed_wire(&mut self, bytes: &[u8]) {
                self.0.feed_wire(bytes)
            }
            fn take_wire_output(&mut self) -> Bytes {
                self.0.take_wire_output()
            }
            fn step(&mut self) -> Result<HandshakeState, NetError> {
                self.0.step()
            }
            fn unwrap_app(&mut self, app_out: &mut Vec<u8>) -> Result<usize, NetError> {
                self.0.peer_closed = true;
                self.0.unwrap_app(app_out)
            }
            fn is_peer_closed(&self) -> bool {
                self.0.is_peer_closed()
            }
            fn wrap_app(&mut self, app_in: &[u8]) -> Result<usize, NetError> {
                self.0.wrap_app(app_in)
            }
            fn close_notify(&mut self) -> Result<(), NetError> {
                self.0.close_notify()
            }
            fn alpn_protocol(&self) -> Option<Vec<u8>> {
                None
            }
            fn cipher_name(&self) -> Option<String> {
                None
            }
            fn protocol_name(&self) -> Option<String> {
                None
            }
        }

        let conn = TlsConnection::new_tls(
            ClosingEngine(StubEngine::new(0)),
            StubProvider::new(),
            ConnectionParams::default(),
            Arc::new(InlineWorker),
        );
        conn.begin_handshake();
        conn.inner().with_provider(|p: &mut StubProvider| p.push_inbound(b"x"));
        conn.do_read();
        assert!(conn.inner().is_closed());
    }
}
