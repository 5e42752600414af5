//! Loopback end-to-end scenario against a real selector thread on
//! `127.0.0.1`: TLS handshake completion and ALPN negotiation (scenario 5).

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rcgen::generate_simple_self_signed;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::RootCertStore;

use netio_core::{ConnectionParams, Endpoint};
use netio_tcp::provider::TcpSocketConfig;
use netio_tls::client_manager::TlsClientManager;
use netio_tls::params::TlsParams;
use netio_tls::rustls_engine::{build_client_config, build_server_config};
use netio_tls::server::{TlsServer, TlsServerConfig};

/// Self-signed cert trusted directly as its own root: good enough for a
/// loopback handshake test, not a substitute for a real certificate chain.
fn self_signed_cert() -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
    let cert = generate_simple_self_signed(vec!["localhost".to_string()]).expect("generate self-signed cert");
    let cert_der = CertificateDer::from(cert.cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.signing_key.serialize_der()));
    (cert_der, key_der)
}

#[test]
fn scenario_5_tls_handshake_negotiates_alpn() {
    let (cert_der, key_der) = self_signed_cert();

    let server_params = TlsParams::new().with_alpn(vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    let rustls_config = build_server_config(vec![cert_der.clone()], key_der, &server_params).expect("server config");

    let server_config = TlsServerConfig {
        bind_addresses: vec!["127.0.0.1:0".parse().unwrap()],
        connection_idle_timeout: Duration::ZERO,
        socket_config: TcpSocketConfig::new(),
        worker_creator: None,
        rustls_config,
    };
    let (server_alpn_tx, server_alpn_rx) = mpsc::channel();
    let server = TlsServer::bind(
        server_config,
        Box::new(move |conn| {
            let conn = Arc::clone(conn);
            let server_alpn_tx = server_alpn_tx.clone();
            conn.events().on_connect(Box::new(move || {
                let _ = server_alpn_tx.send(conn.application_protocol());
            }));
        }),
    )
    .expect("bind tls server");
    let addr = server.local_addrs()[0];
    let run_server = Arc::clone(&server);
    thread::spawn(move || {
        let _ = run_server.run();
    });

    let mut roots = RootCertStore::empty();
    roots.add(cert_der).expect("trust self-signed cert as root");
    let client_params = TlsParams::new().with_alpn(vec![b"http/1.1".to_vec(), b"h2".to_vec()]);
    let client_config = build_client_config(roots, &client_params).expect("client config");

    let manager = TlsClientManager::new(TcpSocketConfig::new(), client_config).expect("client manager");
    let run_manager = Arc::clone(&manager);
    thread::spawn(move || {
        let _ = run_manager.run();
    });

    let params = ConnectionParams::with_remote(Endpoint::Socket(addr));
    let server_name = ServerName::try_from("localhost").expect("server name").to_owned();
    let conn = manager.connection(params, server_name).expect("build tls connection");

    let (client_connect_tx, client_connect_rx) = mpsc::channel();
    let connected_conn = Arc::clone(&conn);
    conn.events().on_connect(Box::new(move || {
        let _ = client_connect_tx.send(connected_conn.application_protocol());
    }));

    manager
        .connect(Arc::clone(&conn), addr, Duration::from_secs(2))
        .expect("start tls connect");

    let client_alpn = client_connect_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("client connect fires");
    let server_alpn = server_alpn_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("server connect fires");

    // Both offered lists overlap on {"h2", "http/1.1"}; whichever rustls
    // resolves to, client and server must agree on the exact same protocol.
    assert_eq!(client_alpn, server_alpn);
    assert!(matches!(client_alpn.as_deref(), Some(b"h2") | Some(b"http/1.1")));
    assert!(conn.is_connected());

    conn.close();
    server.shutdown();
    manager.shutdown();
}
