//! End-to-end relay tests over loopback sockets.
//!
//! Each test spins up a real server, connects real clients through the full
//! handshake and authentication path, and asserts on the event streams.

use std::sync::Arc;
use std::time::Duration;

use umbra_core::{
    ClientEvent, Connection, HandshakeConfig, OutboundQueue, QueueConfig, ReconnectConfig,
    StopReason,
};
use umbra_crypto::{Identity, NoiseEngine, Role, TrustAnyVerified};
use umbra_tests::{
    collect_deliveries, connect_client, connect_client_with, eventually, init_tracing, next_event,
    start_server, test_client_config, wait_connected, wait_for_event,
};

// ============================================================================
// Authentication
// ============================================================================

#[test]
fn test_client_authenticates_and_connects() {
    let server = start_server();
    let alice = connect_client(&server, "alice");
    assert!(matches!(next_event(&alice), ClientEvent::Connected));
    assert!(eventually(|| server.is_bound("alice")));
    alice.stop_and_join();
    server.stop_and_join().unwrap();
}

#[test]
fn test_bad_credentials_stop_the_client_permanently() {
    let server = start_server();
    let client = connect_client_with(&server, "alice", "wrong", test_client_config());

    let rejected = wait_for_event(&client, |event| {
        matches!(event, ClientEvent::AuthRejected { .. })
    });
    let ClientEvent::AuthRejected { reason } = rejected else {
        unreachable!()
    };
    assert_eq!(reason, "USERNAME_PWD_NOT_MATCH");

    // No retry follows a rejection
    let stopped = wait_for_event(&client, |event| {
        matches!(event, ClientEvent::Stopped { .. })
    });
    assert!(matches!(
        stopped,
        ClientEvent::Stopped {
            reason: StopReason::AuthRejected
        }
    ));
    assert!(client.is_stopped());
    assert!(client.send_to("bob", "hi").is_err());
    server.stop_and_join().unwrap();
}

// ============================================================================
// Routing
// ============================================================================

#[test]
fn test_messages_are_routed_with_sender_tag() {
    let server = start_server();
    let alice = connect_client(&server, "alice");
    let bob = connect_client(&server, "bob");
    wait_connected(&alice);
    wait_connected(&bob);

    alice.send_to("bob", "hello bob").unwrap();

    let deliveries = collect_deliveries(&bob, 1);
    assert_eq!(deliveries[0], ("alice".to_owned(), "hello bob".to_owned()));

    alice.stop_and_join();
    bob.stop_and_join();
    server.stop_and_join().unwrap();
}

#[test]
fn test_burst_arrives_in_order() {
    let server = start_server();
    let alice = connect_client(&server, "alice");
    let bob = connect_client(&server, "bob");
    wait_connected(&alice);
    wait_connected(&bob);

    for i in 0..50 {
        alice.send_to("bob", &format!("message-{i}")).unwrap();
    }

    let deliveries = collect_deliveries(&bob, 50);
    for (i, (from, payload)) in deliveries.iter().enumerate() {
        assert_eq!(from, "alice");
        assert_eq!(payload, &format!("message-{i}"));
    }

    alice.stop_and_join();
    bob.stop_and_join();
    server.stop_and_join().unwrap();
}

#[test]
fn test_unknown_target_is_dropped_not_fatal() {
    let server = start_server();
    let alice = connect_client(&server, "alice");
    let bob = connect_client(&server, "bob");
    wait_connected(&alice);
    wait_connected(&bob);

    // Nobody is bound to this id; the relay drops the message
    alice.send_to("nobody", "into the void").unwrap();
    // The session survives and later traffic still flows
    alice.send_to("bob", "still here").unwrap();

    let deliveries = collect_deliveries(&bob, 1);
    assert_eq!(deliveries[0].1, "still here");

    alice.stop_and_join();
    bob.stop_and_join();
    server.stop_and_join().unwrap();
}

#[test]
fn test_server_handle_injects_deliveries() {
    let server = start_server();
    let alice = connect_client(&server, "alice");
    wait_connected(&alice);

    server.send_to("alice", "operator broadcast").unwrap();

    let deliveries = collect_deliveries(&alice, 1);
    assert_eq!(
        deliveries[0],
        ("server".to_owned(), "operator broadcast".to_owned())
    );

    assert!(server.send_to("nobody", "x").is_err());
    alice.stop_and_join();
    server.stop_and_join().unwrap();
}

// ============================================================================
// Binding eviction
// ============================================================================

#[test]
fn test_second_login_evicts_the_first() {
    let server = start_server();

    // First session must not fight back after eviction
    let mut config = test_client_config();
    config.reconnect = ReconnectConfig {
        max_attempts: 0,
        backoff_base: Duration::from_millis(10),
    };
    let first = connect_client_with(&server, "bob", "bob", config);
    wait_connected(&first);

    let second = connect_client(&server, "bob");
    wait_connected(&second);

    // The evicted session is dropped; with no reconnect budget it stops
    let stopped = wait_for_event(&first, |event| {
        matches!(event, ClientEvent::Stopped { .. })
    });
    assert!(matches!(
        stopped,
        ClientEvent::Stopped {
            reason: StopReason::AttemptsExhausted
        }
    ));

    // Traffic for the id reaches the surviving session
    let alice = connect_client(&server, "alice");
    wait_connected(&alice);
    alice.send_to("bob", "who is there").unwrap();
    let deliveries = collect_deliveries(&second, 1);
    assert_eq!(deliveries[0].1, "who is there");

    alice.stop_and_join();
    second.stop_and_join();
    server.stop_and_join().unwrap();
}

// ============================================================================
// Reconnection
// ============================================================================

#[test]
fn test_reconnect_budget_exhaustion_stops_the_client() {
    init_tracing();
    // An address with nothing listening
    let addr = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap()
    };

    let mut config = test_client_config();
    config.reconnect = ReconnectConfig {
        max_attempts: 2,
        backoff_base: Duration::from_millis(20),
    };
    let client = umbra_core::RelayClient::connect(
        addr,
        "alice",
        "alice",
        config,
        Arc::new(TrustAnyVerified),
    )
    .unwrap();

    let stopped = wait_for_event(&client, |event| {
        matches!(event, ClientEvent::Stopped { .. })
    });
    assert!(matches!(
        stopped,
        ClientEvent::Stopped {
            reason: StopReason::AttemptsExhausted
        }
    ));
    assert!(client.is_stopped());
    client.stop_and_join();
}

#[test]
fn test_stop_interrupts_backoff() {
    init_tracing();
    let addr = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap()
    };

    let mut config = test_client_config();
    config.reconnect = ReconnectConfig {
        max_attempts: 100,
        backoff_base: Duration::from_secs(30),
    };
    let client = umbra_core::RelayClient::connect(
        addr,
        "alice",
        "alice",
        config,
        Arc::new(TrustAnyVerified),
    )
    .unwrap();

    // Let it fail once and enter the 30s backoff, then stop
    std::thread::sleep(Duration::from_millis(200));
    let started = std::time::Instant::now();
    client.stop();
    let stopped = wait_for_event(&client, |event| {
        matches!(event, ClientEvent::Stopped { .. })
    });
    assert!(matches!(
        stopped,
        ClientEvent::Stopped {
            reason: StopReason::Requested
        }
    ));
    assert!(started.elapsed() < Duration::from_secs(5));
    client.stop_and_join();
}

// ============================================================================
// Keepalive
// ============================================================================

#[test]
fn test_session_survives_keepalive_probing() {
    let server = start_server();
    let mut config = test_client_config();
    config.keepalive.interval = Duration::from_millis(50);
    config.keepalive.max_missed = 2;
    let client = connect_client_with(&server, "alice", "alice", config);
    wait_connected(&client);

    // Several keepalive rounds pass; the server answers every PING, so the
    // client must still be running
    std::thread::sleep(Duration::from_millis(500));
    assert!(!client.is_stopped());
    assert!(client.events().try_recv().is_err());

    client.stop_and_join();
    server.stop_and_join().unwrap();
}

// ============================================================================
// Protocol enforcement
// ============================================================================

/// A handshaked connection that skips AUTH and speaks out of turn.
#[test]
fn test_traffic_before_auth_closes_the_connection() {
    let server = start_server();

    let stream = mio::net::TcpStream::connect(server.local_addr()).unwrap();
    let identity = Identity::generate().unwrap();
    let engine =
        NoiseEngine::new(Role::Initiator, &identity, Arc::new(TrustAnyVerified)).unwrap();
    let mut conn = Connection::new(
        stream,
        Box::new(engine),
        Arc::new(OutboundQueue::new(&QueueConfig::default())),
        &HandshakeConfig::default(),
        64 * 1024,
    );

    let pool = umbra_transport::TaskPool::new(umbra_transport::TaskPoolConfig::default());
    let config = HandshakeConfig {
        timeout: Duration::from_secs(2),
        ..Default::default()
    };
    let driver = umbra_core::HandshakeDriver::new(&config, &pool);
    {
        let (stream, engine, bufs) = conn.parts_mut();
        driver.connect_and_drive(stream, engine, bufs).unwrap();
    }

    // First frame is routing traffic, not AUTH
    conn.enqueue("TO bob sneaky".into()).unwrap();
    let mut closed = false;
    for _ in 0..200 {
        if conn.wants_write() && conn.on_writable().is_err() {
            // Write against a connection the server already dropped
            closed = true;
            break;
        }
        match conn.on_readable() {
            Ok(event) if event.peer_closed => {
                closed = true;
                break;
            }
            Ok(_) => {}
            // An abrupt server-side close can also surface as an I/O error
            Err(_) => {
                closed = true;
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(closed, "server tolerated traffic before AUTH");

    pool.shutdown();
    server.stop_and_join().unwrap();
}
