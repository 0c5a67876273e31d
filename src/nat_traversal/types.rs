/**
 * nat_traversal/types.rs
 *
 * Core types for NAT traversal
 */

use crate::error::Error;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default rendezvous port.
pub const DEFAULT_RENDEZVOUS_PORT: u16 = 4321;

/// Default interval between signalling retries and between probes.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(1000);

/// Capacity of the peer event and service error queues. Once a queue is
/// full, further entries are logged and dropped until the owner drains it.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Which side of the exchange a peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Requests a connection to a named peer.
    Initiator,
    /// Registers and waits to be punched.
    Receiver,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Receiver => "receiver",
        }
    }
}

/// Transport used by a peer agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Plain UDP datagrams.
    #[default]
    Udp,
    /// UDP socket pinned to the remote once the session is established.
    Overlay,
}

/// Transport used by the rendezvous service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RendezvousProtocol {
    #[default]
    Udp,
    /// Declared but not implemented; selecting it fails at listen time.
    Tcp,
}

/// Peer agent configuration
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Identifier registered with the rendezvous service
    pub peer_id: String,

    /// Rendezvous endpoint (host:port), resolved when the agent binds
    pub rendezvous: String,

    /// Local bind address (0.0.0.0:0 for any/ephemeral)
    pub bind_addr: SocketAddr,

    /// Interval between signalling retries and between probes
    pub retry_interval: Duration,

    pub role: Role,

    pub transport: TransportKind,
}

impl PeerConfig {
    pub fn new(peer_id: impl Into<String>, rendezvous: impl Into<String>, role: Role) -> Self {
        Self {
            peer_id: peer_id.into(),
            rendezvous: rendezvous.into(),
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            role,
            transport: TransportKind::Udp,
        }
    }

    pub fn receiver(peer_id: impl Into<String>, rendezvous: impl Into<String>) -> Self {
        Self::new(peer_id, rendezvous, Role::Receiver)
    }

    pub fn initiator(peer_id: impl Into<String>, rendezvous: impl Into<String>) -> Self {
        Self::new(peer_id, rendezvous, Role::Initiator)
    }

    pub fn with_bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }
}

/// Rendezvous service configuration
#[derive(Debug, Clone)]
pub struct RendezvousConfig {
    pub bind_host: IpAddr,
    pub bind_port: u16,
    pub protocol: RendezvousProtocol,

    /// Records older than this are ignored and evicted on lookup.
    /// `None` keeps records forever (last write wins).
    pub record_ttl: Option<Duration>,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: DEFAULT_RENDEZVOUS_PORT,
            protocol: RendezvousProtocol::Udp,
            record_ttl: None,
        }
    }
}

impl RendezvousConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.bind_port)
    }
}

/// Peer session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Registering,
    Requesting,
    AwaitingHandshake,
    Punching,
    Connected,
    Errored,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "IDLE",
            SessionState::Registering => "REGISTERING",
            SessionState::Requesting => "REQUESTING",
            SessionState::AwaitingHandshake => "AWAITING_HANDSHAKE",
            SessionState::Punching => "PUNCHING",
            SessionState::Connected => "CONNECTED",
            SessionState::Errored => "ERRORED",
            SessionState::Closed => "CLOSED",
        }
    }

    /// True once the session can no longer make progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Errored | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events observable by the embedding application
#[derive(Debug)]
pub enum PeerEvent {
    /// The session reached CONNECTED. `pinned` is true when the transport
    /// attached itself to the remote (overlay mode).
    Connected { remote: SocketAddr, pinned: bool },
    /// An application payload from the remote peer.
    Payload { from: SocketAddr, body: Vec<u8> },
    /// A recoverable fault, or the fatal fault that precedes `Closed`.
    Error(Error),
    /// The agent shut down and its socket is gone.
    Closed,
}
