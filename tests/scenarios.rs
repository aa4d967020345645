//! End-to-end scenarios over loopback sockets.

use std::net::SocketAddr;
use std::time::Duration;

use peerlink::prelude::*;
use peerlink::server::ListenerState;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

async fn start_server(builder: ServerBuilder) -> (Server, ServerEvents) {
    Server::start(builder.bind_addr(loopback()).build())
        .await
        .expect("server starts")
}

async fn join(port: u16, params: Parameters) -> (Connection, ConnectionEvents) {
    let (conn, events) = Connection::connect(Endpoint::host_port("127.0.0.1", port), params);
    conn.ready().await.expect("connection ready");
    (conn, events)
}

async fn wait_registered(events: &mut ServerEvents, n: usize) {
    let mut seen = 0;
    while seen < n {
        match timeout(WAIT, events.recv()).await.expect("server event") {
            Some(ServerEvent::Connected { .. }) => seen += 1,
            Some(_) => {}
            None => panic!("server events ended"),
        }
    }
}

async fn next_message(events: &mut ConnectionEvents) -> Message {
    loop {
        match timeout(WAIT, events.recv()).await.expect("message in time") {
            Some(ConnectionEvent::Message(message)) => return message,
            Some(ConnectionEvent::State(_)) => {}
            None => panic!("connection events ended"),
        }
    }
}

async fn no_message(events: &mut ConnectionEvents) {
    let quiet = timeout(Duration::from_millis(150), async {
        loop {
            match events.recv().await {
                Some(ConnectionEvent::Message(message)) => return message,
                Some(ConnectionEvent::State(_)) => {}
                None => std::future::pending::<()>().await,
            }
        }
    })
    .await;
    assert!(quiet.is_err(), "unexpected message {:?}", quiet.ok());
}

#[tokio::test]
async fn hello_is_relayed_to_others_only() {
    let (server, mut server_events) = start_server(ServerBuilder::new()).await;
    let port = server.local_port();

    let (_b, mut b_events) = join(port, Parameters::stream()).await;
    let (_c, mut c_events) = join(port, Parameters::stream()).await;

    let (client, mut client_events) = Client::new(ClientBuilder::new().build());
    client.connect("127.0.0.1", port).unwrap();
    assert_eq!(
        timeout(WAIT, client_events.recv()).await.unwrap(),
        Some(ClientEvent::Connected)
    );
    wait_registered(&mut server_events, 3).await;

    client.send(b"hello".to_vec()).await.unwrap();

    for events in [&mut b_events, &mut c_events] {
        let message = next_message(events).await;
        assert_eq!(message.payload, b"hello");
        assert!(!message.is_final);
        no_message(events).await;
    }

    let echoed = timeout(Duration::from_millis(150), client_events.recv()).await;
    assert!(echoed.is_err(), "sender must not receive its own message");
    assert_eq!(server.relayed_messages(), 2);
}

#[tokio::test]
async fn shutdown_sends_final_to_every_connection() {
    let (server, mut server_events) = start_server(ServerBuilder::new()).await;
    let port = server.local_port();

    let mut peers = Vec::new();
    for _ in 0..3 {
        peers.push(join(port, Parameters::stream()).await);
    }
    wait_registered(&mut server_events, 3).await;

    server.shutdown().await;

    for (conn, events) in &mut peers {
        let message = next_message(events).await;
        assert!(message.is_final);
        assert!(message.payload.is_empty());
        let mut state = conn.watch_state();
        timeout(WAIT, state.wait_for(|s| s.is_terminal()))
            .await
            .expect("connection closed")
            .unwrap();
    }

    assert_eq!(server.listener_state(), ListenerState::Cancelled);
    assert_eq!(server.connection_count(), 0);

    let (late, _late_events) = Connection::connect(
        Endpoint::host_port("127.0.0.1", port),
        Parameters::stream().waiting_retry(Duration::from_millis(5), 0),
    );
    assert!(late.ready().await.is_err(), "no connection after shutdown");
}

#[tokio::test]
async fn broadcast_reaches_all_but_excluded() {
    let (server, mut server_events) = start_server(ServerBuilder::new().relay(false)).await;
    let port = server.local_port();

    let mut peers = Vec::new();
    for _ in 0..4 {
        peers.push(join(port, Parameters::stream()).await);
    }
    wait_registered(&mut server_events, 4).await;

    // Server-side ids differ from client-side ids; exclude by server id.
    let excluded = server.connections()[2];
    let report = server.broadcast(b"round 2", Some(excluded)).await;
    assert_eq!(report.delivered, 3);
    assert!(report.failed.is_empty());

    let mut received = 0;
    for (_, events) in &mut peers {
        let got = timeout(Duration::from_millis(300), async {
            loop {
                if let Some(ConnectionEvent::Message(message)) = events.recv().await {
                    return message;
                }
            }
        })
        .await;
        if let Ok(message) = got {
            assert_eq!(message.payload, b"round 2");
            received += 1;
        }
    }
    assert_eq!(received, 3);
}

#[tokio::test]
async fn secure_relay_with_pinned_certificate() {
    let identity = Identity::generate().unwrap();
    let pinned = identity.certificate();
    let (server, mut server_events) =
        start_server(ServerBuilder::new().security(SecurityConfig::server(identity))).await;
    let port = server.local_port();

    let secure = || Parameters::stream().security(SecurityConfig::client(TrustPolicy::Pinned(pinned.clone())));
    let (a, _a_events) = join(port, secure()).await;
    let (_b, mut b_events) = join(port, secure()).await;
    wait_registered(&mut server_events, 2).await;

    let metadata = a.security().expect("negotiated security");
    assert_eq!(metadata.version, ProtocolVersion::V1_3);
    assert_eq!(metadata.peer_certificates, vec![pinned]);

    a.send(b"sealed hello".to_vec(), false).await.unwrap();
    assert_eq!(next_message(&mut b_events).await.payload, b"sealed hello");

    let stranger = Identity::generate().unwrap().certificate();
    let (rogue, _rogue_events) = Connection::connect(
        Endpoint::host_port("127.0.0.1", port),
        Parameters::stream().security(SecurityConfig::client(TrustPolicy::Pinned(stranger))),
    );
    let failure = rogue.ready().await.unwrap_err();
    assert_eq!(failure.kind, ErrorKind::HandshakeFailed);
    assert!(failure.description.contains("security handshake failed"));
}

#[tokio::test]
async fn version_floor_above_server_fails_handshake() {
    let identity = Identity::generate().unwrap();
    let pinned = identity.certificate();
    let server_security = SecurityConfig::server(identity).max_version(ProtocolVersion::V1_2);
    let (server, _server_events) = start_server(ServerBuilder::new().security(server_security)).await;

    let client_security = SecurityConfig::client(TrustPolicy::Pinned(pinned))
        .min_version(ProtocolVersion::V1_3);
    let (conn, _events) = Connection::connect(
        Endpoint::host_port("127.0.0.1", server.local_port()),
        Parameters::stream().security(client_security),
    );
    assert_eq!(conn.ready().await.unwrap_err().kind, ErrorKind::HandshakeFailed);
}

#[tokio::test]
async fn secure_datagram_state_sync_through_relay() {
    let identity = Identity::generate().unwrap();
    let pinned = identity.certificate();
    let (server, mut server_events) = start_server(
        ServerBuilder::new()
            .transport(TransportKind::Datagram)
            .security(SecurityConfig::server(identity)),
    )
    .await;
    let port = server.local_port();

    let params = || {
        Parameters::datagram().security(
            SecurityConfig::client(TrustPolicy::Pinned(pinned.clone()))
                .handshake_retransmit(Duration::from_millis(50)),
        )
    };
    let (a, a_events) = join(port, params()).await;
    let (b, b_events) = join(port, params()).await;
    wait_registered(&mut server_events, 2).await;

    let mut alice = SequencedChannel::new(a, a_events, "alice");
    let mut bob = SequencedChannel::new(b, b_events, "bob");

    for x in 0..5u8 {
        alice.publish(vec![x]).await.unwrap();
    }

    let mut last = None;
    while last.as_ref().map(|e: &Envelope| e.sequence) != Some(5) {
        let update = timeout(WAIT, bob.next_update()).await.unwrap().unwrap();
        assert_eq!(update.sender_id, "alice");
        if let Some(previous) = &last {
            assert!(update.sequence > previous.sequence);
        }
        last = Some(update);
    }
    assert_eq!(last.unwrap().payload, vec![4]);
    assert_eq!(bob.receiver().highest_seen("alice"), Some(5));
}

#[tokio::test]
async fn connect_timeout_fails_exactly_once() {
    // A datagram peer that never answers the handshake.
    let silent = tokio::net::UdpSocket::bind(loopback()).await.unwrap();
    let params = Parameters::datagram()
        .connect_timeout(Duration::from_millis(200))
        .security(SecurityConfig::client(TrustPolicy::default()));
    let (conn, mut events) = Connection::connect(silent.local_addr().unwrap().into(), params);

    let mut failures = 0;
    let outcome = timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if let ConnectionEvent::State(ConnectionState::Failed(failure)) = event {
                assert_eq!(failure.kind, ErrorKind::Timeout);
                failures += 1;
                conn.cancel();
            }
        }
    })
    .await;
    assert!(outcome.is_ok());
    assert_eq!(failures, 1);
    assert_eq!(conn.state(), ConnectionState::Cancelled);
}
