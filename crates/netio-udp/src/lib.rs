//! Non-blocking UDP channel provider plus the peer-demultiplexing server and
//! client manager built on top of it.
//!
//! UDP has no OS-level accept and no persistent per-peer channel: a single
//! `mio::net::UdpSocket` in server mode serves every remote peer at once.
//! [`provider::UdpChannelProvider`] hides that behind the same
//! `netio_core::ChannelProvider` surface `netio-tcp` implements, by
//! synthesizing a per-peer read backlog queue that [`server::UdpServer`]'s
//! receive loop fills in as datagrams arrive (spec §4.A/§4.H).

pub mod client_manager;
pub mod provider;
pub mod server;

pub use client_manager::{UdpClientManager, UdpPlainConnection};
pub use provider::{UdpChannelProvider, UdpSharedSocket, UdpSocketConfig};
pub use server::{ServerConfig, UdpPeerConnection, UdpServer};
