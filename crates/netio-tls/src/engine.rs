//! The handshake state enum and the engine trait `TlsConnection` drives.
//!
//! `HandshakeState` mirrors a JSSE `SSLEngineResult.HandshakeStatus`, which
//! is the shape this crate's handshake state machine was translated from
//! (see the crate-level docs and the grounding ledger). Neither backing
//! engine (`rustls` nor `openssl`) has a delegated-task concept, so
//! `NeedTask` is never actually returned by either `step()` implementation
//! today — it stays in the enum because the state machine in
//! [`crate::connection::TlsConnection`] is written generically against the
//! full table, not against what any one engine happens to need.

use bytes::Bytes;

use netio_core::NetError;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HandshakeState {
    /// The engine needs more wire bytes before it can make progress.
    NeedUnwrap,
    /// The engine has wire bytes ready (or wants to produce some); the
    /// caller should drain [`TlsEngine::take_wire_output`] and write it to
    /// the socket.
    NeedWrap,
    /// Reserved for parity with the source state table; see module docs.
    NeedTask,
    /// The handshake is complete.
    Done,
}

/// Record-layer engine abstraction shared by the `rustls`-backed TLS engine
/// and the `openssl`-backed DTLS engine.
///
/// Both backends are driven through the same in-memory [`crate::bio_pipe::BioPipe`]
/// rather than touching the socket directly — `feed_wire`/`take_wire_output`
/// are how [`crate::connection::TlsConnection`] moves bytes between the real,
/// non-blocking socket and the engine.
pub trait TlsEngine: Send {
    /// Queues bytes the connection just read off the socket for the engine
    /// to consume on the next `step`/`unwrap_app` call.
    fn feed_wire(&mut self, bytes: &[u8]);

    /// Drains whatever wire bytes the engine has queued for the socket.
    /// Empty if there is currently nothing to send.
    fn take_wire_output(&mut self) -> Bytes;

    /// Advances the handshake by one step, consuming whatever wire bytes
    /// are currently buffered and producing whatever wire bytes the engine
    /// is ready to emit. Call in a loop until `Done` or `NeedUnwrap` (at
    /// which point the caller must wait for more wire bytes to arrive).
    fn step(&mut self) -> Result<HandshakeState, NetError>;

    /// Post-handshake: decrypts whatever wire bytes are buffered into
    /// `app_out`, returning the number of bytes appended. `0` means no
    /// application bytes materialized (not necessarily an error — the
    /// buffered wire bytes may not yet form a complete record).
    fn unwrap_app(&mut self, app_out: &mut Vec<u8>) -> Result<usize, NetError>;

    /// `true` once the engine has observed and processed the peer's
    /// close-notify (or DTLS equivalent).
    fn is_peer_closed(&self) -> bool;

    /// Post-handshake: encrypts `app_in`, queuing the resulting wire bytes
    /// for [`Self::take_wire_output`]. Returns the number of app bytes
    /// consumed; every call must consume at least one byte if `app_in` is
    /// non-empty, or the caller treats it as a protocol failure.
    fn wrap_app(&mut self, app_in: &[u8]) -> Result<usize, NetError>;

    /// Initiates (and queues the wire bytes for) an orderly close-notify.
    fn close_notify(&mut self) -> Result<(), NetError>;

    fn alpn_protocol(&self) -> Option<Vec<u8>>;

    fn cipher_name(&self) -> Option<String>;

    fn protocol_name(&self) -> Option<String>;
}
