//! `netio-core`: selector 驱动的连接运行时，供 `netio-tcp`/`netio-udp`/
//! `netio-tls` 共享。
//!
//! 本 crate 承载规范 §4 的 B（Connection 基类）、E（Selector Handler）与
//! F（Connection-Aware Selector）三个组件，以及跨组件共享的错误/事件/
//! 时间/worker/定时器类型。传输细节（TCP/UDP 的 `ChannelProvider` 实现、
//! accept/connect 编排）留给下游 crate。

pub mod conn_selector;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod plain;
pub mod selector;
pub mod staging;
pub mod time;
pub mod timer;
pub mod worker;

pub use connection::{
    ChannelProvider, Connection, ConnectionHandle, ConnectionId, ConnectionLifecycle,
    ConnectionParams, EncryptionKind, TransportKind,
};
pub use endpoint::Endpoint;
pub use error::{ErrorCategory, NetError, Op, Result};
pub use event::{EventKind, EventTable};
pub use plain::{PlainConnection, PLAIN_BUFFER_SIZE};
pub use selector::{REBUILD_THRESHOLD, REBUILDS_MAX, SelectorHandler, SelectorTick};
pub use staging::StagingBuffer;
pub use timer::TimerWheel;
pub use worker::{InlineWorker, ThreadPoolWorker, Worker};

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct StubProvider {
        written: Vec<u8>,
        refuse_after: usize,
    }

    impl ChannelProvider for StubProvider {
        fn connect(&mut self, _remote: SocketAddr, _timeout: std::time::Duration) -> Result<bool> {
            Ok(true)
        }
        fn read(&mut self, _buf: &mut [u8]) -> Result<Option<usize>> {
            Ok(None)
        }
        fn write(&mut self, buf: &[u8]) -> Result<usize> {
            let allowed = self.refuse_after.min(buf.len());
            self.written.extend_from_slice(&buf[..allowed]);
            self.refuse_after -= allowed;
            Ok(allowed)
        }
        fn write_backlog_started(&mut self) -> Result<()> {
            Ok(())
        }
        fn write_backlog_ended(&mut self) -> Result<()> {
            Ok(())
        }
        fn set_read_block(&mut self, _block: bool) -> Result<()> {
            Ok(())
        }
        fn is_available(&self) -> bool {
            true
        }
        fn close(&mut self) -> Result<()> {
            Ok(())
        }
        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }
        fn peer_addr(&self) -> Option<SocketAddr> {
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

    fn test_connection(refuse_after: usize) -> Arc<Connection<StubProvider>> {
        let provider = StubProvider {
            written: Vec::new(),
            refuse_after,
        };
        let params = ConnectionParams::with_remote(Endpoint::Socket(
            "127.0.0.1:9999".parse().unwrap(),
        ));
        Connection::new(
            TransportKind::Stream,
            EncryptionKind::None,
            provider,
            params,
            Arc::new(InlineWorker),
            8192,
        )
    }

    #[test]
    fn zero_byte_write_is_a_no_op() {
        let conn = test_connection(usize::MAX);
        conn.backlog_write(&[]).expect("zero byte write never fails");
        assert!(conn.is_writable());
    }

    #[test]
    fn pre_connect_writes_flush_in_order_after_connect() {
        let conn = test_connection(usize::MAX);
        assert!(conn.queue_pre_connect_write(bytes::Bytes::from_static(b"A")));
        assert!(conn.queue_pre_connect_write(bytes::Bytes::from_static(b"B")));
        conn.mark_connected();
        conn.with_provider(|p| {
            assert_eq!(p.written, b"AB");
        });
    }

    #[test]
    fn partial_kernel_write_spills_to_backlog_and_arms_writable() {
        let conn = test_connection(2);
        conn.mark_connected();
        conn.backlog_write(b"hello").expect("write stages to backlog on partial drain");
        assert!(!conn.is_writable(), "backlog nonempty implies not writable");
        conn.with_provider(|p| assert_eq!(p.written, b"he"));

        // Kernel now accepts everything on the next attempt.
        conn.with_provider(|p| p.refuse_after = usize::MAX);
        let drained = conn.flush_backlog().expect("flush drains backlog");
        assert!(drained);
        assert!(conn.is_writable());
        conn.with_provider(|p| assert_eq!(p.written, b"hello"));
    }

    #[test]
    fn destroy_is_idempotent_and_fires_close_once() {
        let conn = test_connection(usize::MAX);
        let close_count = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&close_count);
        conn.events().on_close(Box::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        }));
        conn.destroy();
        conn.destroy();
        assert_eq!(close_count.load(Ordering::SeqCst), 1);
        assert!(conn.is_closed());
    }

    #[test]
    fn close_with_empty_backlog_behaves_like_destroy() {
        let conn = test_connection(usize::MAX);
        conn.mark_connected();
        conn.request_close();
        assert!(conn.is_closed());
    }

    #[test]
    fn close_with_pending_backlog_defers_until_drained() {
        let conn = test_connection(0);
        conn.mark_connected();
        conn.backlog_write(b"pending").expect("spills entirely to backlog");
        conn.request_close();
        assert!(!conn.is_closed(), "destroy must wait for the backlog to drain");
        conn.with_provider(|p| p.refuse_after = usize::MAX);
        conn.flush_backlog().expect("flush drains the remaining backlog");
        assert!(conn.is_closed());
    }
}
