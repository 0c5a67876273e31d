/**
 * nat_traversal/rendezvous.rs
 *
 * Rendezvous (signalling) service: remembers where each peer id was last
 * seen and answers connection requests with the target's observed address.
 */

use crate::error::{Error, Result};
use crate::messages::SignalMessage;
use crate::nat_traversal::transport::{Transport, UdpTransport};
use crate::nat_traversal::types::{
    RendezvousConfig, RendezvousProtocol, TransportKind, EVENT_QUEUE_CAPACITY,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Server-side record of a peer, keyed by peer id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer_id: String,
    pub observed: SocketAddr,
    pub updated_at: Instant,
}

/// Peer id -> last observed address. Last write wins.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    records: HashMap<String, PeerRecord>,
    ttl: Option<Duration>,
}

impl PeerRegistry {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            records: HashMap::new(),
            ttl,
        }
    }

    pub fn upsert(&mut self, peer_id: &str, observed: SocketAddr, now: Instant) {
        let record = PeerRecord {
            peer_id: peer_id.to_string(),
            observed,
            updated_at: now,
        };
        if let Some(previous) = self.records.insert(peer_id.to_string(), record) {
            if previous.observed != observed {
                debug!(peer = peer_id, from = %previous.observed, to = %observed, "Peer address changed");
            }
        }
    }

    /// Observed address of `peer_id`, evicting it first if it outlived the TTL.
    pub fn lookup(&mut self, peer_id: &str, now: Instant) -> Option<SocketAddr> {
        let record = self.records.get(peer_id)?;
        if let Some(ttl) = self.ttl {
            if now.saturating_duration_since(record.updated_at) > ttl {
                debug!(peer = peer_id, "Evicting expired peer record");
                self.records.remove(peer_id);
                return None;
            }
        }
        Some(record.observed)
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerRecord> {
        self.records.get(peer_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// The rendezvous service. Owns its registry; only its receive loop mutates it.
pub struct RendezvousService {
    transport: Arc<dyn Transport>,
    registry: PeerRegistry,
    local_addr: SocketAddr,
    errors: Option<mpsc::Sender<Error>>,
}

impl RendezvousService {
    /// Bind the service on `config.bind_host:config.bind_port`.
    pub async fn bind(config: RendezvousConfig) -> Result<Self> {
        check_protocol(&config)?;
        let transport = UdpTransport::bind(config.bind_addr(), TransportKind::Udp)?;
        Self::with_transport(&config, Arc::new(transport))
    }

    /// Run the service over an already bound transport.
    pub fn with_transport(config: &RendezvousConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        check_protocol(config)?;
        let local_addr = transport.local_addr()?;

        Ok(Self {
            transport,
            registry: PeerRegistry::new(config.record_ttl),
            local_addr,
            errors: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Process one datagram from `from`. Returns the reply to send, if any.
    ///
    /// Every message carrying a peer id refreshes that peer's record with
    /// the UDP source address; addresses inside the payload are never used.
    pub fn handle_datagram(
        &mut self,
        datagram: &[u8],
        from: SocketAddr,
    ) -> Result<Option<(SocketAddr, Vec<u8>)>> {
        let message = SignalMessage::decode_request(datagram)?;
        let now = Instant::now();
        self.registry.upsert(message.peer_id(), from, now);

        let (peer_id, remote_peer_id) = match message {
            SignalMessage::ConnectionRequest {
                peer_id,
                remote_peer_id,
            } => (peer_id, remote_peer_id),
            registration => {
                debug!(peer = registration.peer_id(), addr = %from, "Registration");
                return Ok(None);
            }
        };

        let observed = match self.registry.lookup(&remote_peer_id, now) {
            Some(observed) => observed,
            None => {
                debug!(peer = %peer_id, remote = %remote_peer_id, "Peer not yet registered");
                return Ok(None);
            }
        };

        info!(peer = %peer_id, remote = %remote_peer_id, endpoint = %observed, "Handshake");
        let reply = SignalMessage::HandshakeReply {
            peer_id: remote_peer_id,
            host: observed.ip().to_canonical().to_string(),
            port: observed.port(),
        };
        Ok(Some((from, reply.encode())))
    }

    /// Serve until `shutdown` fires (or its sender is dropped).
    ///
    /// Returns `Err` on a socket failure, which closes the service.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> Result<()> {
        info!(addr = %self.local_addr, "Rendezvous service listening");

        loop {
            let received = tokio::select! {
                _ = &mut shutdown => {
                    info!(addr = %self.local_addr, "Rendezvous service shutting down");
                    return Ok(());
                }
                received = self.transport.recv_from() => received,
            };

            let (datagram, from) = match received {
                Ok(received) => received,
                Err(e) => {
                    error!(error = %e, "Receive failed, closing rendezvous service");
                    return Err(Error::Transport(e));
                }
            };

            match self.handle_datagram(&datagram, from) {
                Ok(Some((to, reply))) => {
                    if let Err(e) = self.transport.send_to(&reply, to).await {
                        error!(error = %e, to = %to, "Send failed, closing rendezvous service");
                        return Err(Error::Transport(e));
                    }
                }
                Ok(None) => {}
                Err(e) => self.report(e, from),
            }
        }
    }

    /// Run on a background task.
    pub fn spawn(mut self) -> RendezvousHandle {
        let (errors_tx, errors_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.errors = Some(errors_tx);
        let local_addr = self.local_addr;

        let task = tokio::spawn(self.run(shutdown_rx));

        RendezvousHandle {
            local_addr,
            errors: errors_rx,
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    fn report(&self, error: Error, from: SocketAddr) {
        warn!(from = %from, error = %error, "Dropping signalling datagram");
        if let Some(errors) = &self.errors {
            if let Err(TrySendError::Full(_)) = errors.try_send(error) {
                debug!(from = %from, "Error queue full, report dropped");
            }
        }
    }
}

fn check_protocol(config: &RendezvousConfig) -> Result<()> {
    match config.protocol {
        RendezvousProtocol::Udp => Ok(()),
        RendezvousProtocol::Tcp => Err(Error::NotImplemented("TCP")),
    }
}

/// Handle to a spawned [`RendezvousService`].
pub struct RendezvousHandle {
    local_addr: SocketAddr,
    errors: mpsc::Receiver<Error>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl RendezvousHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next non-fatal error reported by the service.
    pub async fn next_error(&mut self) -> Option<Error> {
        self.errors.recv().await
    }

    /// Stop the service and return how it ended.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        match (&mut self.task).await {
            Ok(result) => result,
            Err(_) => Err(Error::Closed),
        }
    }
}
