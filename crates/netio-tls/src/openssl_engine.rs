//! `openssl`-backed [`TlsEngine`] for DTLS-over-`netio-udp`.
//!
//! `openssl::ssl::SslStream<S>` is generic over any `S: Read + Write`, so
//! the same [`crate::bio_pipe::BioPipe`] duplex adapter the rustls engine
//! uses doubles as the DTLS engine's transport: `Ssl::connect`/`accept`
//! drive the handshake directly against the pipe, and `ErrorCode::WANT_READ`/
//! `WANT_WRITE` (surfaced whenever the pipe's `Read` impl returns
//! `WouldBlock`) map onto [`HandshakeState::NeedUnwrap`]/[`HandshakeState::NeedWrap`].
//! This is the BIO-pump shape grounded on `other_examples`'
//! `AlexanderSchuetz97-rust-tls-duplex-stream` and `partim-netmachines`'
//! socket-trait split, adapted to run on no background thread: this engine
//! never blocks, because the pipe it rides on never blocks.

use openssl::error::ErrorStack;
use openssl::ssl::{
    ErrorCode, HandshakeError, MidHandshakeSslStream, Ssl, SslContext, SslContextBuilder, SslMethod,
    SslRef, SslStream,
};

use bytes::Bytes;

use netio_core::error::{protocol_error, ErrorCategory, Op};
use netio_core::NetError;

use crate::bio_pipe::BioPipe;
use crate::engine::{HandshakeState, TlsEngine};
use crate::params::TlsParams;

enum State {
    PendingClient(Ssl, BioPipe),
    PendingServer(Ssl, BioPipe),
    MidClient(MidHandshakeSslStream<BioPipe>),
    MidServer(MidHandshakeSslStream<BioPipe>),
    Established(SslStream<BioPipe>),
    /// Terminal: the handshake failed. Kept distinct from `Established` so
    /// accessor calls after a failed handshake return `None` rather than
    /// panicking.
    Failed,
}

pub struct OpensslEngine {
    state: Option<State>,
    peer_closed: bool,
    scratch: BioPipe,
}

impl OpensslEngine {
    pub fn client(ctx: &SslContext) -> Result<Self, NetError> {
        let ssl = Ssl::new(ctx).map_err(|e| protocol_error_from_stack(Op::Handshake, &e))?;
        Ok(Self {
            state: Some(State::PendingClient(ssl, BioPipe::new())),
            peer_closed: false,
            scratch: BioPipe::new(),
        })
    }

    pub fn server(ctx: &SslContext) -> Result<Self, NetError> {
        let ssl = Ssl::new(ctx).map_err(|e| protocol_error_from_stack(Op::Handshake, &e))?;
        Ok(Self {
            state: Some(State::PendingServer(ssl, BioPipe::new())),
            peer_closed: false,
            scratch: BioPipe::new(),
        })
    }

    fn pipe_mut(&mut self) -> &mut BioPipe {
        match self.state.as_mut().expect("engine state missing during pipe access") {
            State::PendingClient(_, pipe) | State::PendingServer(_, pipe) => pipe,
            State::MidClient(mid) | State::MidServer(mid) => mid.get_mut(),
            State::Established(stream) => stream.get_mut(),
            State::Failed => &mut self.scratch,
        }
    }

    fn ssl_ref(&self) -> Option<&SslRef> {
        match self.state.as_ref()? {
            State::Established(stream) => Some(stream.ssl()),
            State::MidClient(mid) => Some(mid.ssl()),
            State::MidServer(mid) => Some(mid.ssl()),
            _ => None,
        }
    }
}

fn protocol_error_from_stack(op: Op, _err: &ErrorStack) -> NetError {
    protocol_error(op, "openssl handshake setup failure", ErrorCategory::TlsHandshake)
}

/// Turns one `connect`/`accept`/`handshake` attempt into the engine's next
/// `State` plus the `HandshakeState` reported back to [`crate::connection::TlsConnection`].
/// `wrap_mid` picks `State::MidClient` vs `State::MidServer` so this helper
/// stays shared between both roles.
fn handshake_outcome(
    result: Result<SslStream<BioPipe>, HandshakeError<BioPipe>>,
    wrap_mid: impl FnOnce(MidHandshakeSslStream<BioPipe>) -> State,
) -> (State, Result<HandshakeState, NetError>) {
    match result {
        Ok(stream) => (State::Established(stream), Ok(HandshakeState::Done)),
        Err(HandshakeError::WouldBlock(mid)) => {
            let needs_write = mid.get_ref().has_outbound();
            let reported = if needs_write { HandshakeState::NeedWrap } else { HandshakeState::NeedUnwrap };
            (wrap_mid(mid), Ok(reported))
        }
        Err(HandshakeError::Failure(_mid)) => {
            let err = protocol_error(Op::Handshake, "dtls handshake rejected", ErrorCategory::TlsHandshake);
            (State::Failed, Err(err))
        }
        Err(HandshakeError::SetupFailure(stack)) => {
            (State::Failed, Err(protocol_error_from_stack(Op::Handshake, &stack)))
        }
    }
}

impl TlsEngine for OpensslEngine {
    fn feed_wire(&mut self, bytes: &[u8]) {
        self.pipe_mut().feed(bytes);
    }

    fn take_wire_output(&mut self) -> Bytes {
        self.pipe_mut().take_outbound()
    }

    fn step(&mut self) -> Result<HandshakeState, NetError> {
        let state = self.state.take().expect("engine state missing during step");
        let (next, result) = match state {
            State::PendingClient(ssl, pipe) => handshake_outcome(ssl.connect(pipe), State::MidClient),
            State::PendingServer(ssl, pipe) => handshake_outcome(ssl.accept(pipe), State::MidServer),
            State::MidClient(mid) => handshake_outcome(mid.handshake(), State::MidClient),
            State::MidServer(mid) => handshake_outcome(mid.handshake(), State::MidServer),
            State::Established(stream) => (State::Established(stream), Ok(HandshakeState::Done)),
            State::Failed => (State::Failed, Ok(HandshakeState::Done)),
        };
        self.state = Some(next);
        result
    }

    fn unwrap_app(&mut self, app_out: &mut Vec<u8>) -> Result<usize, NetError> {
        let Some(State::Established(stream)) = self.state.as_mut() else {
            return Ok(0);
        };
        let mut buf = [0u8; 4096];
        let mut total = 0usize;
        loop {
            match stream.ssl_read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    app_out.extend_from_slice(&buf[..n]);
                    total += n;
                }
                Err(e) => match e.code() {
                    ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => break,
                    ErrorCode::ZERO_RETURN => {
                        self.peer_closed = true;
                        break;
                    }
                    _ => return Err(protocol_error(Op::Unwrap, "dtls record decode failure", ErrorCategory::TlsRecord)),
                },
            }
        }
        Ok(total)
    }

    fn is_peer_closed(&self) -> bool {
        self.peer_closed
    }

    fn wrap_app(&mut self, app_in: &[u8]) -> Result<usize, NetError> {
        if app_in.is_empty() {
            return Ok(0);
        }
        let Some(State::Established(stream)) = self.state.as_mut() else {
            return Ok(0);
        };
        match stream.ssl_write(app_in) {
            Ok(n) => Ok(n),
            Err(e) => match e.code() {
                ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => Ok(0),
                _ => Err(protocol_error(Op::Wrap, "dtls record encode failure", ErrorCategory::TlsRecord)),
            },
        }
    }

    fn close_notify(&mut self) -> Result<(), NetError> {
        let Some(State::Established(stream)) = self.state.as_mut() else {
            return Ok(());
        };
        match stream.shutdown() {
            Ok(_) => Ok(()),
            Err(e) => match e.code() {
                ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => Ok(()),
                _ => Err(protocol_error(Op::Shutdown, "dtls close-notify failure", ErrorCategory::TlsRecord)),
            },
        }
    }

    fn alpn_protocol(&self) -> Option<Vec<u8>> {
        self.ssl_ref()?.selected_alpn_protocol().map(|b| b.to_vec())
    }

    fn cipher_name(&self) -> Option<String> {
        self.ssl_ref()?.current_cipher().map(|c| c.name().to_string())
    }

    fn protocol_name(&self) -> Option<String> {
        Some(self.ssl_ref()?.version_str().to_string())
    }
}

/// Builds an `SslContext` configured for `SslMethod::dtls()`, applying
/// `params`' weak-cipher filter via OpenSSL's cipher-list string syntax.
/// The minimum-version floor is DTLS's own (1.0/1.2); §3's "TLS-family
/// only, never SSL" note means this filter never touches the DTLS context.
pub fn build_dtls_context(
    cert_chain_pem: &[u8],
    private_key_pem: &[u8],
    params: &TlsParams,
) -> Result<SslContext, NetError> {
    let mut builder =
        SslContextBuilder::new(SslMethod::dtls()).map_err(|e| protocol_error_from_stack(Op::Configure, &e))?;
    builder
        .set_certificate_chain_pem(cert_chain_pem)
        .map_err(|e| protocol_error_from_stack(Op::Configure, &e))?;
    builder
        .set_private_key_pem(private_key_pem)
        .map_err(|e| protocol_error_from_stack(Op::Configure, &e))?;
    if params.disable_weak_ciphers() {
        builder
            .set_cipher_list("HIGH:!CBC:!ECDH:!RENEGOTIATION:!RSA")
            .map_err(|e| protocol_error_from_stack(Op::Configure, &e))?;
    }
    if !params.alpn().is_empty() {
        let wire_format = encode_alpn_wire_format(params.alpn());
        builder
            .set_alpn_protos(&wire_format)
            .map_err(|e| protocol_error_from_stack(Op::Configure, &e))?;
    }
    Ok(builder.build())
}

/// Encodes an ALPN preference list into the length-prefixed wire format
/// `set_alpn_protos` expects (one length byte followed by that many bytes,
/// repeated).
fn encode_alpn_wire_format(protocols: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for proto in protocols {
        out.push(proto.len() as u8);
        out.extend_from_slice(proto);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpn_wire_format_is_length_prefixed() {
        let protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        let encoded = encode_alpn_wire_format(&protocols);
        assert_eq!(encoded, b"\x02h2\x08http/1.1".to_vec());
    }

    #[test]
    fn alpn_wire_format_of_empty_list_is_empty() {
        assert!(encode_alpn_wire_format(&[]).is_empty());
    }

    #[test]
    fn fresh_client_engine_has_no_peer_close_observed() {
        let ctx = SslContextBuilder::new(SslMethod::dtls()).unwrap().build();
        let engine = OpensslEngine::client(&ctx).unwrap();
        assert!(!engine.is_peer_closed());
    }

    #[test]
    fn fresh_engines_report_no_negotiated_parameters() {
        let ctx = SslContextBuilder::new(SslMethod::dtls()).unwrap().build();
        let engine = OpensslEngine::server(&ctx).unwrap();
        assert!(engine.alpn_protocol().is_none());
        assert!(engine.cipher_name().is_none());
    }
}
