//! Runs a real client against a real server over the loopback interface.
//!
//! Raw sockets need CAP_NET_RAW; without it every test here logs why and returns early.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use pmtu_socket::{
    Client, ClientConfig, MAX_UDP_PAYLOAD, Outcome, RecvError, SendError, Server, ServerConfig,
    Session, SessionError,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn open_server() -> Option<Session> {
    match Session::bind(0) {
        Ok(session) => Some(session),
        Err(SessionError::Create(e)) => {
            eprintln!("skipping loopback test: {e}");
            None
        }
        Err(e) => panic!("failed to bind server session: {e}"),
    }
}

async fn probe(config: ClientConfig) -> Option<Outcome> {
    let mut server_session = open_server()?;
    let server_addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, server_session.local_addr().port());
    let mut client_session = Session::connect(server_addr).unwrap();
    assert_eq!(client_session.remote_addr(), Some(server_addr));
    assert_eq!(*client_session.local_addr().ip(), Ipv4Addr::LOCALHOST);

    let server = Server::new(ServerConfig {
        recv_timeout: Duration::from_millis(100),
    });
    let client = Client::new(config).unwrap();

    let outcome = tokio::select! {
        outcome = client.run(&mut client_session) => outcome,
        result = server.run(&mut server_session) => panic!("server stopped: {result:?}"),
    };

    client_session.close().await.unwrap();
    server_session.close().await.unwrap();
    Some(outcome)
}

#[tokio::test]
async fn test_loopback_probe_default_sizes() {
    init_logging();
    let config = ClientConfig {
        attempts: 3,
        backoff: Duration::from_millis(100),
        ..ClientConfig::default()
    };
    if let Some(outcome) = probe(config).await {
        assert_eq!(outcome, Outcome::Success { attempts: 1 });
    }
}

#[tokio::test]
async fn test_loopback_probe_asymmetric_sizes() {
    init_logging();
    let config = ClientConfig {
        request_size: 32,
        response_size: 4000,
        attempts: 3,
        backoff: Duration::from_millis(100),
        ..ClientConfig::default()
    };
    if let Some(outcome) = probe(config).await {
        assert_eq!(outcome, Outcome::Success { attempts: 1 });
    }
}

#[tokio::test]
async fn test_session_after_close() {
    init_logging();
    let Some(mut session) = open_server() else {
        return;
    };
    let peer = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9);

    session.close().await.unwrap();

    assert!(matches!(session.close().await, Err(SessionError::AlreadyClosed)));
    assert!(matches!(
        session.send(b"\x00\x10", Some(peer)).await,
        Err(SendError::Closed)
    ));
    assert_eq!(
        session.receive(Duration::from_millis(10)).await,
        Err(RecvError::Closed)
    );
}

#[tokio::test]
async fn test_send_errors() {
    init_logging();
    let Some(mut session) = open_server() else {
        return;
    };

    // a bound session has no default destination
    assert!(matches!(
        session.send(b"\x00\x10", None).await,
        Err(SendError::NoDestination)
    ));

    let oversized = vec![0u8; MAX_UDP_PAYLOAD + 1];
    let peer = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9);
    assert!(matches!(
        session.send(&oversized, Some(peer)).await,
        Err(SendError::PayloadTooLarge(_))
    ));

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_close_with_undrained_queue() {
    init_logging();
    let Some(mut server_session) = open_server() else {
        return;
    };
    let server_addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, server_session.local_addr().port());
    let mut sender = Session::connect(server_addr).unwrap();

    // one datagram fills the queue, the rest keep the reader waiting to enqueue
    for i in 0..4u8 {
        sender.send(&[0x00, 0x04, i, i], None).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let closed = tokio::time::timeout(Duration::from_secs(1), server_session.close()).await;
    assert!(matches!(closed, Ok(Ok(()))), "close did not finish: {closed:?}");

    sender.close().await.unwrap();
}
