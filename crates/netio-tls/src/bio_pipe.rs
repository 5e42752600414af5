//! In-memory duplex adapter between a TLS/DTLS engine and the connection's
//! wire-level read/write path.
//!
//! Neither `rustls`'s `read_tls`/`write_tls` nor `openssl`'s `SslStream<S>`
//! talk to a socket directly from this crate's point of view — `Connection<P>`
//! already owns the real, non-blocking socket via `ChannelProvider`. Both
//! engines instead read and write through a small `Read + Write` adapter
//! sitting in between, the same shape `other_examples`' duplex-stream and
//! socket-trait examples use to decouple an engine from its transport.
//! Unlike those examples this one runs on no background thread: `feed`/
//! `take_outbound` are called directly from the connection's own readable/
//! writable handling on the single I/O thread, so a read with nothing
//! buffered returns `WouldBlock` immediately rather than blocking.

use std::io::{self, Read, Write};

use bytes::{Bytes, BytesMut};

/// Holds wire bytes in each direction between the socket and the engine.
///
/// `inbound` is wire bytes the socket produced but the engine has not yet
/// consumed; `outbound` is wire bytes the engine produced but the socket
/// has not yet sent.
#[derive(Default)]
pub struct BioPipe {
    inbound: BytesMut,
    outbound: BytesMut,
}

impl BioPipe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly-read socket bytes for the engine to consume.
    pub fn feed(&mut self, data: &[u8]) {
        self.inbound.extend_from_slice(data);
    }

    /// Takes everything the engine has queued for the socket.
    pub fn take_outbound(&mut self) -> Bytes {
        self.outbound.split().freeze()
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    pub fn has_inbound(&self) -> bool {
        !self.inbound.is_empty()
    }
}

impl Read for BioPipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.inbound.is_empty() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "no wire bytes buffered"));
        }
        let n = buf.len().min(self.inbound.len());
        buf[..n].copy_from_slice(&self.inbound[..n]);
        let _ = self.inbound.split_to(n);
        Ok(n)
    }
}

impl Write for BioPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outbound.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_on_empty_pipe_is_would_block() {
        let mut pipe = BioPipe::new();
        let mut buf = [0u8; 8];
        let err = pipe.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn fed_bytes_are_read_in_order_and_consumed_once() {
        let mut pipe = BioPipe::new();
        pipe.feed(b"hello");
        let mut buf = [0u8; 3];
        assert_eq!(pipe.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(pipe.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");
        assert!(!pipe.has_inbound());
    }

    #[test]
    fn written_bytes_are_queued_for_take_outbound() {
        let mut pipe = BioPipe::new();
        pipe.write_all(b"record").unwrap();
        assert!(pipe.has_outbound());
        assert_eq!(pipe.take_outbound().as_ref(), b"record");
        assert!(!pipe.has_outbound());
    }
}
