//! Non-blocking TCP channel provider, server and client manager.
//!
//! Covers the stream branch of the accept/connect components shared with
//! `netio-udp`'s datagram branch: [`TcpChannelProvider`] implements
//! `netio_core::ChannelProvider` over `mio::net::TcpStream`, [`TcpServer`]
//! runs the accept loop and idle sweep, and [`TcpClientManager`] drives
//! outbound non-blocking connects.

pub mod client_manager;
pub mod provider;
pub mod server;

pub use client_manager::{TcpClientManager, TcpPlainConnection as ClientTcpConnection, DEFAULT_CONNECT_TIMEOUT};
pub use provider::{TcpChannelProvider, TcpSocketConfig};
pub use server::{ServerConfig, TcpServer, TcpPlainConnection};
