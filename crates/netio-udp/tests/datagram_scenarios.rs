//! Loopback end-to-end scenario against a real selector thread on
//! `127.0.0.1`: plain UDP echo over the synthesized per-peer connection
//! (the datagram analogue of `netio_tcp`'s scenario 1).

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;

use netio_core::{ConnectionParams, Endpoint};
use netio_udp::client_manager::UdpClientManager;
use netio_udp::provider::UdpSocketConfig;
use netio_udp::server::{ServerConfig, UdpServer};

#[test]
fn scenario_udp_echo_over_synthesized_peer_connection() {
    let config = ServerConfig {
        bind_addresses: vec!["127.0.0.1:0".parse().unwrap()],
        ..ServerConfig::default()
    };
    let server = UdpServer::bind(
        config,
        Box::new(|conn| {
            let echo = Arc::clone(conn);
            conn.events().on_data(Box::new(move |data: Bytes| {
                let _ = echo.write(&data);
            }));
        }),
    )
    .expect("bind udp server");
    let addr = server.local_addrs()[0];
    let run_server = Arc::clone(&server);
    thread::spawn(move || {
        let _ = run_server.run();
    });

    let manager = UdpClientManager::new(UdpSocketConfig::new()).expect("client manager");
    let run_manager = Arc::clone(&manager);
    thread::spawn(move || {
        let _ = run_manager.run();
    });

    let params = ConnectionParams::with_remote(Endpoint::Socket(addr));
    let conn = manager.connection(params);

    let (data_tx, data_rx) = mpsc::channel();
    conn.events().on_data(Box::new(move |chunk: Bytes| {
        let _ = data_tx.send(chunk);
    }));

    // UDP connect completes synchronously; no connect-timeout branch to race.
    manager.connect(Arc::clone(&conn), Duration::from_secs(1)).expect("connect");
    assert!(conn.is_connected());

    conn.write(b"ping").expect("write datagram");
    let echoed = data_rx.recv_timeout(Duration::from_secs(2)).expect("echoed datagram arrives");
    assert_eq!(&echoed[..], b"ping");

    conn.close();
    server.shutdown();
    manager.shutdown();
}

/// Two independent peers against the same bound socket must be
/// demultiplexed by remote address into separate synthesized connections,
/// each only ever observing its own datagrams.
#[test]
fn scenario_udp_server_demultiplexes_peers_by_remote_address() {
    let config = ServerConfig {
        bind_addresses: vec!["127.0.0.1:0".parse().unwrap()],
        ..ServerConfig::default()
    };
    let server = UdpServer::bind(
        config,
        Box::new(|conn| {
            let echo = Arc::clone(conn);
            conn.events().on_data(Box::new(move |data: Bytes| {
                let _ = echo.write(&data);
            }));
        }),
    )
    .expect("bind udp server");
    let addr = server.local_addrs()[0];
    let run_server = Arc::clone(&server);
    thread::spawn(move || {
        let _ = run_server.run();
    });

    let manager = UdpClientManager::new(UdpSocketConfig::new()).expect("client manager");
    let run_manager = Arc::clone(&manager);
    thread::spawn(move || {
        let _ = run_manager.run();
    });

    let make_peer = |tag: &'static [u8]| {
        let params = ConnectionParams::with_remote(Endpoint::Socket(addr));
        let conn = manager.connection(params);
        let (tx, rx) = mpsc::channel();
        conn.events().on_data(Box::new(move |chunk: Bytes| {
            let _ = tx.send(chunk);
        }));
        manager.connect(Arc::clone(&conn), Duration::from_secs(1)).expect("connect");
        conn.write(tag).expect("write tag");
        (conn, rx)
    };

    let (conn_a, rx_a) = make_peer(b"from-a");
    let (conn_b, rx_b) = make_peer(b"from-b");

    let echo_a = rx_a.recv_timeout(Duration::from_secs(2)).expect("peer a echo");
    let echo_b = rx_b.recv_timeout(Duration::from_secs(2)).expect("peer b echo");
    assert_eq!(&echo_a[..], b"from-a");
    assert_eq!(&echo_b[..], b"from-b");
    assert_eq!(server.connection_count(), 2);

    conn_a.close();
    conn_b.close();
    server.shutdown();
    manager.shutdown();
}
