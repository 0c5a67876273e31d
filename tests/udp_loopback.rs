use holepunch::nat_traversal::{
    Peer, PeerConfig, PeerEvent, RendezvousConfig, RendezvousService, SessionState, TransportKind,
};
use holepunch::Error;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::time::timeout;

const RETRY: Duration = Duration::from_millis(50);

fn loopback() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
}

async fn start_service() -> holepunch::nat_traversal::RendezvousHandle {
    let config = RendezvousConfig {
        bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        bind_port: 0,
        ..RendezvousConfig::default()
    };
    RendezvousService::bind(config).await.unwrap().spawn()
}

async fn next_payload(peer: &mut Peer) -> Vec<u8> {
    loop {
        match timeout(Duration::from_secs(10), peer.next_event()).await {
            Ok(Some(PeerEvent::Payload { body, .. })) => return body,
            Ok(Some(PeerEvent::Connected { .. })) | Ok(Some(PeerEvent::Error(_))) => continue,
            other => panic!("Expected Payload, got {other:?}"),
        }
    }
}

async fn handshake_over_udp(transport: TransportKind, initiator_bind: SocketAddr) {
    let service = start_service().await;
    let rendezvous = service.local_addr().to_string();

    let mut a = Peer::bind(
        PeerConfig::receiver("A", rendezvous.clone())
            .with_bind_addr(loopback())
            .with_retry_interval(RETRY)
            .with_transport(transport),
    )
    .await
    .unwrap();
    let mut b = Peer::bind(
        PeerConfig::initiator("B", rendezvous)
            .with_bind_addr(initiator_bind)
            .with_retry_interval(RETRY)
            .with_transport(transport),
    )
    .await
    .unwrap();

    a.listen().await.unwrap();
    b.connect("A").await.unwrap();

    timeout(Duration::from_secs(10), b.wait_for_state(SessionState::Connected))
        .await
        .unwrap()
        .unwrap();
    timeout(Duration::from_secs(10), a.wait_for_state(SessionState::Connected))
        .await
        .unwrap()
        .unwrap();

    b.send("hello").await.unwrap();
    assert_eq!(next_payload(&mut a).await, b"hello");

    a.send("hi back").await.unwrap();
    assert_eq!(next_payload(&mut b).await, b"hi back");

    a.close().await.unwrap();
    b.close().await.unwrap();
    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_handshake_over_raw_udp() {
    handshake_over_udp(TransportKind::Udp, loopback()).await;
}

#[tokio::test]
async fn test_handshake_over_overlay() {
    handshake_over_udp(TransportKind::Overlay, loopback()).await;
}

fn dual_stack() -> Option<SocketAddr> {
    let wildcard = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0);
    std::net::UdpSocket::bind(wildcard).ok().map(|_| wildcard)
}

#[tokio::test]
async fn test_handshake_from_dual_stack_initiator() {
    // Skipped on hosts without IPv6.
    let Some(wildcard) = dual_stack() else {
        return;
    };
    handshake_over_udp(TransportKind::Udp, wildcard).await;
}

#[tokio::test]
async fn test_overlay_handshake_from_dual_stack_initiator() {
    let Some(wildcard) = dual_stack() else {
        return;
    };
    handshake_over_udp(TransportKind::Overlay, wildcard).await;
}

#[tokio::test]
async fn test_rendezvous_port_in_use_is_bind_error() {
    let service = start_service().await;
    let taken = service.local_addr();

    let config = RendezvousConfig {
        bind_host: taken.ip(),
        bind_port: taken.port(),
        ..RendezvousConfig::default()
    };
    match RendezvousService::bind(config).await {
        Err(Error::Bind { addr, .. }) => assert_eq!(addr, taken),
        Err(other) => panic!("Expected Bind error, got {other:?}"),
        Ok(_) => panic!("Expected Bind error, got a second service"),
    }

    service.shutdown().await.unwrap();
}
