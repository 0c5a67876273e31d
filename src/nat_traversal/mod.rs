/**
 * nat_traversal/mod.rs
 *
 * NAT traversal module implementing:
 * - UDP rendezvous (signalling) service
 * - Peer session state machine (register, request, punch, ack)
 * - Peer agent runtime driving the state machine
 * - Swappable datagram transports
 */

mod hole_punching;
mod peer;
mod rendezvous;
mod transport;
mod types;

pub use hole_punching::{Action, PeerSession, TimerPhase};
pub use peer::Peer;
pub use rendezvous::{PeerRecord, PeerRegistry, RendezvousHandle, RendezvousService};
pub use transport::{
    canonical, BrokenTransport, MemoryNetwork, MemoryTransport, Transport, UdpTransport,
    MAX_DATAGRAM,
};
pub use types::{
    PeerConfig, PeerEvent, RendezvousConfig, RendezvousProtocol, Role, SessionState,
    TransportKind, DEFAULT_RENDEZVOUS_PORT, DEFAULT_RETRY_INTERVAL, EVENT_QUEUE_CAPACITY,
};
