//! End-to-end tests over real loopback sockets.
//!
//! Each test spins up a listener on an OS-chosen port, connects a client
//! through the full handshake, and exercises the stream adapters. Server
//! halves run as background tasks so both sides make progress concurrently.

use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use rudp::error::RudpError;
use rudp::events::StateListener;
use rudp::profile::RudpProfile;
use rudp::server::RudpListener;
use rudp::socket::RudpSocket;

/// Records lifecycle notifications on a channel for later assertions.
struct RecordingListener {
    events: std::sync::Mutex<mpsc::Sender<(&'static str, SocketAddr)>>,
}

impl RecordingListener {
    fn new() -> (Arc<RecordingListener>, mpsc::Receiver<(&'static str, SocketAddr)>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(RecordingListener { events: std::sync::Mutex::new(tx) }), rx)
    }

    fn record(&self, kind: &'static str, peer: SocketAddr) {
        let _ = self.events.lock().unwrap().send((kind, peer));
    }
}

impl StateListener for RecordingListener {
    fn connection_opened(&self, peer: SocketAddr) {
        self.record("opened", peer);
    }

    fn connection_closed(&self, peer: SocketAddr) {
        self.record("closed", peer);
    }

    fn connection_failure(&self, peer: SocketAddr) {
        self.record("failure", peer);
    }
}

async fn bind_listener() -> (RudpListener, SocketAddr) {
    let listener = RudpListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    (listener, addr)
}

/// Reads from `socket` until `expected` bytes arrived or EOF.
async fn read_all(socket: &mut RudpSocket, expected: usize) -> Vec<u8> {
    let mut collected = Vec::with_capacity(expected);
    let mut buf = [0u8; 4096];
    while collected.len() < expected {
        let n = socket.read(&mut buf).await.expect("read");
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&buf[..n]);
    }
    collected
}

#[tokio::test(flavor = "multi_thread")]
async fn test_handshake_notifies_both_sides() {
    let (listener, addr) = bind_listener().await;
    let (server_events, server_rx) = RecordingListener::new();
    listener.add_state_listener(server_events);

    let (client_events, client_rx) = RecordingListener::new();
    let client = tokio::time::timeout(
        Duration::from_secs(5),
        RudpSocket::connect_with_listeners(addr, RudpProfile::default(), vec![client_events as Arc<dyn StateListener>]),
    )
    .await
    .expect("connect timed out")
    .expect("connect failed");

    let accepted = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("accept timed out")
        .expect("accept failed");

    assert_eq!(accepted.peer_addr(), client.local_addr());
    assert_eq!(client.peer_addr(), addr);

    let (kind, _) = server_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(kind, "opened");
    let (kind, peer) = client_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(kind, "opened");
    assert_eq!(peer, addr);

    listener.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ordered_delivery_minimal_mss() {
    let (listener, addr) = bind_listener().await;

    // the smallest MSS the protocol allows: just enough for the SYN's
    // parameter block, leaving 16 payload bytes per data segment
    let profile = RudpProfile::new(32, 32, 22, 3, 0, 3, 3, 3, 0, 600, 300).unwrap();

    let server = tokio::spawn(async move {
        let mut accepted = listener.accept().await.expect("accept");
        let data = read_all(&mut accepted, 3).await;
        (listener, data)
    });

    let mut client = RudpSocket::connect_with(addr, profile).await.expect("connect");
    client.write(&[0x01, 0x02, 0x03]).await.expect("write");
    client.flush().await.expect("flush");

    let (listener, data) = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server timed out")
        .unwrap();
    assert_eq!(data, vec![0x01, 0x02, 0x03]);

    client.close().await.expect("close");
    listener.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bulk_transfer_exercises_window() {
    let (listener, addr) = bind_listener().await;

    // far more data than window * MSS: the sender has to cycle the window
    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let server = tokio::spawn(async move {
        let mut accepted = listener.accept().await.expect("accept");
        let data = read_all(&mut accepted, expected.len()).await;
        (listener, data)
    });

    let mut client = RudpSocket::connect(addr).await.expect("connect");
    client.write(&payload).await.expect("write");
    client.flush().await.expect("flush");

    let (listener, data) = tokio::time::timeout(Duration::from_secs(30), server)
        .await
        .expect("server timed out")
        .unwrap();
    assert_eq!(data.len(), payload.len());
    assert_eq!(data, payload);

    client.close().await.expect("close");
    listener.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_full_duplex_echo() {
    let (listener, addr) = bind_listener().await;

    let server = tokio::spawn(async move {
        let mut accepted = listener.accept().await.expect("accept");
        let data = read_all(&mut accepted, 5).await;
        accepted.write(&data).await.expect("echo write");
        accepted.flush().await.expect("echo flush");
        (listener, accepted)
    });

    let mut client = RudpSocket::connect(addr).await.expect("connect");
    client.write(b"hello").await.expect("write");
    client.flush().await.expect("flush");

    let echoed = read_all(&mut client, 5).await;
    assert_eq!(echoed, b"hello");

    let (listener, _accepted) = server.await.unwrap();
    listener.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_orderly_close_reaches_eof() {
    let (listener, addr) = bind_listener().await;
    let (server_events, server_rx) = RecordingListener::new();
    listener.add_state_listener(server_events);

    let server = tokio::spawn(async move {
        let mut accepted = listener.accept().await.expect("accept");
        let data = read_all(&mut accepted, 4).await;

        // after the client's FIN, read signals EOF
        let mut buf = [0u8; 16];
        let n = accepted.read(&mut buf).await.expect("read at eof");
        (listener, data, n)
    });

    let (client_events, client_rx) = RecordingListener::new();
    let mut client =
        RudpSocket::connect_with_listeners(addr, RudpProfile::default(), vec![client_events as Arc<dyn StateListener>])
            .await
            .expect("connect");
    client.write(b"bye!").await.expect("write");
    client.flush().await.expect("flush");
    client.close().await.expect("close");

    let (listener, data, n) = tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .expect("server timed out")
        .unwrap();
    assert_eq!(data, b"bye!");
    assert_eq!(n, 0, "read after peer close must return EOF");

    // both sides observe opened and then closed
    let events: Vec<&str> = (0..2)
        .map(|_| server_rx.recv_timeout(Duration::from_secs(5)).unwrap().0)
        .collect();
    assert_eq!(events, vec!["opened", "closed"]);
    let events: Vec<&str> = (0..2)
        .map(|_| client_rx.recv_timeout(Duration::from_secs(5)).unwrap().0)
        .collect();
    assert_eq!(events, vec!["opened", "closed"]);

    listener.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_keepalive_sustains_idle_connection() {
    let (listener, addr) = bind_listener().await;
    let (client_events, client_rx) = RecordingListener::new();

    // aggressive keepalive so several NUL round trips fit into the test
    let profile = RudpProfile::new(32, 32, 128, 3, 3, 3, 3, 3, 150, 600, 300).unwrap();

    let server = tokio::spawn(async move {
        let mut accepted = listener.accept().await.expect("accept");
        let data = read_all(&mut accepted, 2).await;
        (listener, data)
    });

    let mut client = RudpSocket::connect_with_listeners(addr, profile, vec![client_events as Arc<dyn StateListener>])
        .await
        .expect("connect");

    // idle long enough for multiple keepalive intervals
    tokio::time::sleep(Duration::from_millis(700)).await;

    client.write(b"ok").await.expect("write after idle");
    client.flush().await.expect("flush after idle");

    let (listener, data) = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server timed out")
        .unwrap();
    assert_eq!(data, b"ok");

    // opened, and no failure despite the idle period
    assert_eq!(client_rx.recv_timeout(Duration::from_secs(5)).unwrap().0, "opened");
    assert!(client_rx.try_recv().is_err());

    client.close().await.expect("close");
    listener.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_to_silent_peer_fails() {
    // a bare UDP socket that never answers: the SYN retransmission limit trips
    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = silent.local_addr().unwrap();

    let profile = RudpProfile::new(32, 32, 128, 3, 1, 3, 3, 3, 0, 100, 100).unwrap();
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        RudpSocket::connect_with(addr, profile),
    )
    .await
    .expect("connect must fail, not hang");
    assert!(matches!(result, Err(RudpError::Closed)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_clients_demultiplexed() {
    let (listener, addr) = bind_listener().await;

    let server = tokio::spawn(async move {
        let mut first = listener.accept().await.expect("accept first");
        let mut second = listener.accept().await.expect("accept second");
        let a = read_all(&mut first, 1).await;
        let b = read_all(&mut second, 1).await;
        (listener, first.peer_addr(), a, second.peer_addr(), b)
    });

    let mut client_a = RudpSocket::connect(addr).await.expect("connect a");
    let mut client_b = RudpSocket::connect(addr).await.expect("connect b");

    client_a.write(&[0xaa]).await.unwrap();
    client_a.flush().await.unwrap();
    client_b.write(&[0xbb]).await.unwrap();
    client_b.flush().await.unwrap();

    let (listener, first_peer, a, second_peer, b) =
        tokio::time::timeout(Duration::from_secs(10), server)
            .await
            .expect("server timed out")
            .unwrap();

    // accept order matches connect order; payloads stay with their connection
    assert_eq!(first_peer, client_a.local_addr());
    assert_eq!(second_peer, client_b.local_addr());
    assert_eq!(a, vec![0xaa]);
    assert_eq!(b, vec![0xbb]);

    listener.close().await;
}
