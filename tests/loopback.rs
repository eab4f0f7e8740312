//! End-to-end scenarios over real carriers on localhost.

use std::net::SocketAddr;
use std::time::Duration;

use omx::app::{Session, SessionEvent, SessionPhase};
use omx::carrier::{Carrier, MemoryCarrier, ObfsClientCarrier, ObfsServerCarrier, Peer, UdpCarrier};
use omx::config::{InitialSeq, ObfsConfig, TransportConfig};
use omx::transport::Endpoint;
use omx::Mode;

fn fast_transport() -> TransportConfig {
    TransportConfig {
        timeout: Duration::from_millis(200),
        max_retries: 5,
        initial_seq: InitialSeq::Zero,
    }
}

fn fast_obfs() -> ObfsConfig {
    ObfsConfig {
        poll_interval: Duration::from_millis(25),
        queue_limit: 64,
    }
}

/// Accept one session, collect chat messages until the client leaves, and
/// return everything seen in order.
async fn serve_one_session<C: Carrier>(mut server: Session<C>) -> (Session<C>, Vec<String>) {
    server.accept().await.expect("server accept");
    let mut seen = Vec::new();
    loop {
        match server.poll(Duration::from_millis(100)).await {
            Ok(Some(SessionEvent::Chat { text, .. })) => seen.push(text),
            Ok(Some(SessionEvent::Bye { .. })) => break,
            Ok(Some(SessionEvent::PeerError { code, detail })) => {
                panic!("client error {code}: {detail}")
            }
            Ok(None) => {
                if server.phase() == SessionPhase::Closed {
                    break;
                }
            }
            Err(e) => panic!("server poll failed: {e}"),
        }
    }
    (server, seen)
}

// Scenario: default mode over UDP, two messages, clean goodbye.
#[tokio::test]
async fn test_udp_default_mode_happy_path() {
    let server_carrier = UdpCarrier::bind("127.0.0.1:0".parse::<SocketAddr>().unwrap())
        .await
        .unwrap();
    let server_addr = server_carrier.local_addr().unwrap();
    let server = Session::server(
        Endpoint::new(server_carrier, fast_transport()),
        Mode::Default,
        "server_main",
    );
    let server_task = tokio::spawn(serve_one_session(server));

    let client_carrier = UdpCarrier::bind("127.0.0.1:0".parse::<SocketAddr>().unwrap())
        .await
        .unwrap();
    let mut client = Session::client(
        Endpoint::new(client_carrier, fast_transport()),
        Mode::Default,
        "client_test",
    );

    client.connect(Peer::Socket(server_addr)).await.unwrap();
    client.send_chat("hello").await.unwrap();
    client.send_chat("world").await.unwrap();
    client.bye(None).await.unwrap();

    let (server, seen) = server_task.await.unwrap();
    assert_eq!(seen, vec!["hello", "world"]);
    assert_eq!(server.phase(), SessionPhase::Closed);
    assert_eq!(client.phase(), SessionPhase::Closed);
}

// Scenario: secure mode; the chat plaintext never appears on the wire
// after key exchange, and the server still reads it.
#[tokio::test]
async fn test_secure_mode_plaintext_never_on_wire() {
    use parking_lot::Mutex;
    use std::sync::Arc;

    let (a, b) = MemoryCarrier::pair();
    let peer = a.peer();

    let wire: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    for side in [&a, &b] {
        let tap = Arc::clone(&wire);
        side.set_wire_hook(Arc::new(move |frame| {
            tap.lock().push(frame.to_vec());
            true
        }));
    }

    let server = Session::server(Endpoint::new(b, fast_transport()), Mode::Secure, "server_main");
    let server_task = tokio::spawn(serve_one_session(server));

    let mut client = Session::client(Endpoint::new(a, fast_transport()), Mode::Secure, "c1");
    client.connect(peer).await.unwrap();
    client.send_chat("top secret").await.unwrap();
    client.bye(None).await.unwrap();

    let (_, seen) = server_task.await.unwrap();
    assert_eq!(seen, vec!["top secret"]);

    let needle = b"top secret";
    for frame in wire.lock().iter() {
        assert!(
            !frame.windows(needle.len()).any(|w| w == needle),
            "chat plaintext visible on the wire"
        );
    }
}

// Scenario: the first DATA frame is lost once; retransmission delivers the
// message exactly once.
#[tokio::test]
async fn test_single_loss_heals_without_duplication() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    let (a, b) = MemoryCarrier::pair();
    let peer = a.peer();

    let dropped = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&dropped);
    a.set_wire_hook(Arc::new(move |frame| {
        // Byte 1 is the flags field; 0x01 is DATA.
        if frame.len() > 1 && frame[1] & 0x01 != 0 && !flag.swap(true, Ordering::SeqCst) {
            return false;
        }
        true
    }));

    let server = Session::server(Endpoint::new(b, fast_transport()), Mode::Default, "server_main");
    let server_task = tokio::spawn(serve_one_session(server));

    let mut client = Session::client(Endpoint::new(a, fast_transport()), Mode::Default, "c1");
    client.connect(peer).await.unwrap();
    client.send_chat("retry me").await.unwrap();
    client.bye(None).await.unwrap();

    let (_, seen) = server_task.await.unwrap();
    assert_eq!(seen, vec!["retry me"]);
    assert!(dropped.load(Ordering::SeqCst));
    assert!(client.stats().retransmissions >= 1);
}

// Scenario: full session through the HTTP tunnel; the observable wire is
// HTTP request/response, exercised end to end.
#[tokio::test]
async fn test_obfs_mode_round_trip() {
    let obfs = fast_obfs();
    let server_carrier = ObfsServerCarrier::bind("127.0.0.1:0".parse().unwrap(), &obfs)
        .await
        .unwrap();
    let server_addr = server_carrier.local_addr();
    let server = Session::server(
        Endpoint::new(server_carrier, fast_transport()),
        Mode::Obfs,
        "server_main",
    );
    let server_task = tokio::spawn(serve_one_session(server));

    let client_carrier = ObfsClientCarrier::new(server_addr, "tunnel_client", &obfs);
    let peer = client_carrier.server_peer();
    let mut client = Session::client(
        Endpoint::new(client_carrier, fast_transport()),
        Mode::Obfs,
        "tunnel_client",
    );

    client.connect(peer).await.unwrap();
    client.send_chat("via https").await.unwrap();
    client.bye(None).await.unwrap();

    let (server, seen) = server_task.await.unwrap();
    assert_eq!(seen, vec!["via https"]);
    assert_eq!(server.phase(), SessionPhase::Closed);
}

// Scenario: encrypted chat through the tunnel (secure_obfs).
#[tokio::test]
async fn test_secure_obfs_mode_round_trip() {
    let obfs = fast_obfs();
    let server_carrier = ObfsServerCarrier::bind("127.0.0.1:0".parse().unwrap(), &obfs)
        .await
        .unwrap();
    let server_addr = server_carrier.local_addr();
    let server = Session::server(
        Endpoint::new(server_carrier, fast_transport()),
        Mode::SecureObfs,
        "server_main",
    );
    let server_task = tokio::spawn(serve_one_session(server));

    let client_carrier = ObfsClientCarrier::new(server_addr, "sec_tunnel", &obfs);
    let peer = client_carrier.server_peer();
    let mut client = Session::client(
        Endpoint::new(client_carrier, fast_transport()),
        Mode::SecureObfs,
        "sec_tunnel",
    );

    client.connect(peer).await.unwrap();
    client.send_chat("tunneled secret").await.unwrap();
    client.bye(None).await.unwrap();

    let (_, seen) = server_task.await.unwrap();
    assert_eq!(seen, vec!["tunneled secret"]);
}

// Scenario: client and server configured with different modes; the client
// observes the server's MODE_MISMATCH error and both close.
#[tokio::test]
async fn test_mode_mismatch_over_udp() {
    let server_carrier = UdpCarrier::bind("127.0.0.1:0".parse::<SocketAddr>().unwrap())
        .await
        .unwrap();
    let server_addr = server_carrier.local_addr().unwrap();
    let mut server = Session::server(
        Endpoint::new(server_carrier, fast_transport()),
        Mode::Default,
        "server_main",
    );
    let server_task = tokio::spawn(async move {
        let result = server.accept().await;
        (server, result)
    });

    let client_carrier = UdpCarrier::bind("127.0.0.1:0".parse::<SocketAddr>().unwrap())
        .await
        .unwrap();
    let mut client = Session::client(
        Endpoint::new(client_carrier, fast_transport()),
        Mode::Secure,
        "c1",
    );

    match client.connect(Peer::Socket(server_addr)).await {
        Err(omx::Error::Peer { code, .. }) => assert_eq!(code, "MODE_MISMATCH"),
        other => panic!("expected MODE_MISMATCH from peer, got {other:?}"),
    }
    assert_eq!(client.phase(), SessionPhase::Closed);

    let (server, result) = server_task.await.unwrap();
    assert!(matches!(result, Err(omx::Error::ModeMismatch { .. })));
    assert_eq!(server.phase(), SessionPhase::Closed);
}

// Scenario: the wire dies after the handshake; the sender gives up after
// its full retry budget, taking roughly retries × timeout.
#[tokio::test]
async fn test_exhausted_retries_over_udp() {
    use std::time::Instant;

    let server_carrier = UdpCarrier::bind("127.0.0.1:0".parse::<SocketAddr>().unwrap())
        .await
        .unwrap();
    let server_addr = server_carrier.local_addr().unwrap();

    let config = TransportConfig {
        timeout: Duration::from_millis(100),
        max_retries: 3,
        initial_seq: InitialSeq::Zero,
    };

    let mut server = Endpoint::new(server_carrier, config.clone());
    let server_task = tokio::spawn(async move {
        let peer = server.accept().await.unwrap();
        // Fall silent: never receive again, never acknowledge.
        (server, peer)
    });

    let client_carrier = UdpCarrier::bind("127.0.0.1:0".parse::<SocketAddr>().unwrap())
        .await
        .unwrap();
    let mut client = Endpoint::new(client_carrier, config.clone());
    client.connect(Peer::Socket(server_addr)).await.unwrap();
    let _server = server_task.await.unwrap();

    let started = Instant::now();
    let result = client.send(b"nobody listens").await;
    let elapsed = started.elapsed();

    match result {
        Err(omx::Error::TransportUnreliable { attempts }) => {
            assert_eq!(attempts, config.max_retries)
        }
        other => panic!("expected TransportUnreliable, got {other:?}"),
    }
    assert!(elapsed >= config.timeout * config.max_retries);
    assert!(elapsed < config.timeout * (config.max_retries + 3));
}
