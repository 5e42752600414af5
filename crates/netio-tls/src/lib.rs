//! TLS/DTLS record engine and handshake state machine layered over
//! `netio-tcp`/`netio-udp`.
//!
//! [`engine::TlsEngine`] unifies `rustls` (TLS-over-TCP, [`rustls_engine::RustlsEngine`])
//! and `openssl` (DTLS-over-UDP, [`openssl_engine::OpensslEngine`]) behind
//! one sans-IO interface, driven by [`connection::TlsConnection`] instead of
//! `netio_core::plain::PlainConnection`'s plaintext byte-shuffling — the
//! handshake has to complete before `connect` fires, which `Connection::
//! start_connect`/`mark_connected` don't know how to wait for. [`server::TlsServer`]
//! and [`client_manager::TlsClientManager`] drive that connection type the
//! same way `netio_tcp::server::TcpServer`/`client_manager::TcpClientManager`
//! drive plaintext ones.

pub mod bio_pipe;
pub mod client_manager;
pub mod connection;
pub mod dtls_client_manager;
pub mod dtls_server;
pub mod engine;
pub mod openssl_engine;
pub mod params;
pub mod rustls_engine;
pub mod server;

pub use bio_pipe::BioPipe;
pub use client_manager::TlsClientManager;
pub use connection::TlsConnection;
pub use dtls_client_manager::DtlsClientManager;
pub use dtls_server::{DtlsServer, DtlsServerConfig, UdpDtlsConnection};
pub use engine::{HandshakeState, TlsEngine};
pub use openssl_engine::OpensslEngine;
pub use params::TlsParams;
pub use rustls_engine::RustlsEngine;
pub use server::{TlsServer, TlsServerConfig};

/// TLS-over-TCP connection: the pairing `client_manager`/`server` both
/// build and drive.
pub type TcpTlsConnection = TlsConnection<RustlsEngine, netio_tcp::provider::TcpChannelProvider>;
