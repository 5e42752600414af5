//! Plaintext Connection: regulates §4.C. A trivial wrapper around
//! [`Connection`] that reads directly into an 8 KiB buffer and writes
//! straight through the provider — no record framing, so `wrap`/`unwrap`
//! are the identity function and the staging buffer exists only to satisfy
//! `write_queue`'s "defer until the next flush" contract.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};

use crate::connection::{ChannelProvider, Connection, ConnectionId, ConnectionLifecycle, ConnectionParams};
use crate::endpoint::Endpoint;
use crate::error::NetError;
use crate::event::EventTable;
use crate::staging::StagingBuffer;
use crate::worker::Worker;

/// Read/write buffer size for plaintext connections (spec §4.C).
pub const PLAIN_BUFFER_SIZE: usize = 8 * 1024;

pub struct PlainConnection<P: ChannelProvider + 'static> {
    inner: Arc<Connection<P>>,
    staging: StagingBuffer,
}

impl<P: ChannelProvider + 'static> PlainConnection<P> {
    pub fn new(provider: P, params: ConnectionParams, worker: Arc<dyn Worker>) -> Arc<Self> {
        let inner = Connection::new(
            crate::connection::TransportKind::Stream,
            crate::connection::EncryptionKind::None,
            provider,
            params,
            worker,
            PLAIN_BUFFER_SIZE,
        );
        Self::wrap(inner)
    }

    /// Wraps an already-constructed base [`Connection`] (e.g. one whose
    /// `TransportKind` is `Datagram`, for UDP's per-peer plaintext case).
    pub fn wrap(inner: Arc<Connection<P>>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            staging: StagingBuffer::new(PLAIN_BUFFER_SIZE),
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

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }

    pub fn set_apparent_remote(&self, addr: Endpoint) {
        self.inner.set_apparent_remote(addr);
    }

    pub fn apparent_remote(&self) -> Option<Endpoint> {
        self.inner.apparent_remote()
    }

    pub fn remote(&self) -> Option<Endpoint> {
        self.inner.remote()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.with_provider(|p| p.local_addr())
    }

    /// Non-blocking connect (§4.B `connect`). Returns `true` if the
    /// transport completed synchronously, in which case `connect` has
    /// already been dispatched.
    pub fn start_connect(&self) -> Result<bool, NetError> {
        self.inner.start_connect()
    }

    pub fn mark_connected(&self) {
        self.inner.mark_connected();
    }

    /// `write`: pre-connect bytes go to the pre-connect queue; otherwise
    /// straight through the staging buffer and an eager flush attempt.
    pub fn write(&self, data: &[u8]) -> Result<(), NetError> {
        if !self.inner.has_connected() {
            self.inner.queue_pre_connect_write(Bytes::copy_from_slice(data));
            return Ok(());
        }
        self.staging.queue(data);
        self.flush().map(|_| ())
    }

    /// `write_queue`: stage the bytes but do not attempt to flush to the
    /// kernel yet.
    pub fn write_queue(&self, data: &[u8]) {
        if !self.inner.has_connected() {
            self.inner.queue_pre_connect_write(Bytes::copy_from_slice(data));
            return;
        }
        self.staging.queue(data);
    }

    /// Drains the staging buffer through the (identity) wrap step into the
    /// backlog, then drains the backlog itself. Returns `true` iff
    /// everything was written.
    pub fn flush(&self) -> Result<bool, NetError> {
        let pending = self.staging.take();
        if !pending.is_empty() {
            self.inner.backlog_write(&pending)?;
        }
        self.inner.flush_backlog()
    }

    pub fn close(&self) {
        self.inner.request_close();
    }

    pub fn destroy(&self) {
        self.inner.destroy();
    }

    /// Single non-blocking read attempt, matching the spec's "read;
    /// if bytes materialized, call handle_data" (one syscall per
    /// readiness event, not a drain-to-EAGAIN loop).
    pub fn do_read(&self) {
        let mut buf = BytesMut::zeroed(PLAIN_BUFFER_SIZE);
        let outcome = self.inner.with_provider(|p| p.read(&mut buf));
        match outcome {
            Ok(None) => {}
            Ok(Some(0)) => {
                // Orderly peer shutdown: `Ok(0)` on a non-empty buffer is
                // Rust's EOF convention (the negative-count signal in the
                // source becomes this in `std::io::Read`).
                self.inner.destroy();
            }
            Ok(Some(n)) => {
                self.inner.touch_io();
                let payload = Bytes::copy_from_slice(&buf[..n]);
                self.inner.dispatch_data(payload);
            }
            Err(err) => {
                self.dispatch_error(err);
            }
        }
    }

    pub fn dispatch_error(&self, err: NetError) {
        self.inner.dispatch_error(err);
    }

    pub fn fire_connect_timeout(&self) {
        self.inner.fire_connect_timeout();
    }

    pub fn set_local_close_notify(&self, notify: Arc<dyn Fn() + Send + Sync>) {
        self.inner.set_local_close_notify(notify);
    }
}

impl<P: ChannelProvider + 'static> ConnectionLifecycle for PlainConnection<P> {
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
        let _ = self.flush();
    }

    fn request_close(&self) {
        self.inner.request_close();
    }

    fn destroy(&self) {
        self.inner.destroy();
    }

    fn fire_connect_timeout(&self) {
        self.inner.fire_connect_timeout();
    }
}
