/**
 * nat_traversal/transport.rs
 *
 * Datagram transports consumed by the peer agent and the rendezvous service:
 * - raw UDP (socket2 bound, driven by tokio)
 * - overlay UDP (pinned to the remote once connected)
 * - in-process memory network with optional NAT rewriting, for tests
 */

use crate::error::{Error, Result};
use crate::nat_traversal::types::TransportKind;
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::debug;

/// Largest datagram accepted by the receive loop.
pub const MAX_DATAGRAM: usize = 64 * 1024;

/// Strip the IPv4-mapped IPv6 form (`[::ffff:a.b.c.d]:p` becomes `a.b.c.d:p`)
/// so addresses compare equal whichever socket family observed them.
pub fn canonical(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip().to_canonical(), addr.port())
}

/// Bind/send/receive/connect capability.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    async fn send_to(&self, datagram: &[u8], to: SocketAddr) -> io::Result<usize>;

    /// Wait for the next datagram. Must be cancel safe.
    async fn recv_from(&self) -> io::Result<(Vec<u8>, SocketAddr)>;

    /// Called once the session with `remote` is established. Returns true
    /// when the transport attached itself to `remote`.
    async fn connect(&self, remote: SocketAddr) -> io::Result<bool>;
}

/// UDP transport
pub struct UdpTransport {
    socket: UdpSocket,
    pin_on_connect: bool,
    dual_stack: bool,
}

impl UdpTransport {
    /// Bind a UDP socket. Must be called from within a tokio runtime.
    pub fn bind(addr: SocketAddr, kind: TransportKind) -> Result<Self> {
        let socket = bind_socket(addr).map_err(|source| Error::Bind { addr, source })?;
        let socket = UdpSocket::from_std(socket).map_err(|source| Error::Bind { addr, source })?;

        Ok(Self {
            socket,
            pin_on_connect: kind == TransportKind::Overlay,
            dual_stack: addr.is_ipv6(),
        })
    }

    // IPv4 destinations on a dual-stack socket go out in mapped form.
    fn outbound(&self, to: SocketAddr) -> SocketAddr {
        match to {
            SocketAddr::V4(v4) if self.dual_stack => {
                SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port())
            }
            _ => to,
        }
    }
}

fn bind_socket(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;

    // Accept IPv4 peers on an IPv6 wildcard bind as well
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    async fn send_to(&self, datagram: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(datagram, self.outbound(to)).await
    }

    async fn recv_from(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
        let mut buffer = vec![0u8; MAX_DATAGRAM];
        let (len, from) = self.socket.recv_from(&mut buffer).await?;
        buffer.truncate(len);
        Ok((buffer, canonical(from)))
    }

    async fn connect(&self, remote: SocketAddr) -> io::Result<bool> {
        if !self.pin_on_connect {
            return Ok(false);
        }
        self.socket.connect(self.outbound(remote)).await?;
        debug!(remote = %remote, "Overlay socket pinned to remote");
        Ok(true)
    }
}

type Datagram = (Vec<u8>, SocketAddr);
type DropFilter = Box<dyn Fn(SocketAddr, SocketAddr, &[u8]) -> bool + Send>;

#[derive(Default)]
struct NetworkInner {
    endpoints: HashMap<SocketAddr, mpsc::UnboundedSender<Datagram>>,
    // private -> public
    outbound: HashMap<SocketAddr, SocketAddr>,
    // public -> private
    inbound: HashMap<SocketAddr, SocketAddr>,
    drop_filter: Option<DropFilter>,
    next_port: u16,
}

/// In-process datagram fabric. Delivery is immediate and lossless unless a
/// drop filter says otherwise; datagrams to unbound addresses vanish.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a raw endpoint. Port 0 allocates an ephemeral port.
    pub fn bind(&self, addr: SocketAddr) -> io::Result<MemoryTransport> {
        self.bind_with(addr, TransportKind::Udp)
    }

    pub fn bind_with(&self, mut addr: SocketAddr, kind: TransportKind) -> io::Result<MemoryTransport> {
        let mut inner = self.lock()?;

        if addr.port() == 0 {
            loop {
                inner.next_port = inner.next_port.checked_add(1).unwrap_or(49152).max(49152);
                addr.set_port(inner.next_port);
                if !inner.endpoints.contains_key(&addr) {
                    break;
                }
            }
        }

        if inner.endpoints.contains_key(&addr) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{addr} already bound"),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        inner.endpoints.insert(addr, tx);

        Ok(MemoryTransport {
            local: addr,
            network: self.clone(),
            inbox: tokio::sync::Mutex::new(rx),
            pin_on_connect: kind == TransportKind::Overlay,
            pinned: Mutex::new(None),
        })
    }

    /// Put `private` behind a NAT: its traffic appears to come from `public`
    /// and traffic sent to `public` reaches it.
    pub fn map_public(&self, private: SocketAddr, public: SocketAddr) -> io::Result<()> {
        let mut inner = self.lock()?;
        inner.outbound.insert(private, public);
        inner.inbound.insert(public, private);
        Ok(())
    }

    /// Drop every datagram for which `filter(from, to, datagram)` is true.
    /// Addresses are the public ones, as seen on the wire.
    pub fn set_drop_filter<F>(&self, filter: F) -> io::Result<()>
    where
        F: Fn(SocketAddr, SocketAddr, &[u8]) -> bool + Send + 'static,
    {
        self.lock()?.drop_filter = Some(Box::new(filter));
        Ok(())
    }

    pub fn clear_drop_filter(&self) -> io::Result<()> {
        self.lock()?.drop_filter = None;
        Ok(())
    }

    fn deliver(&self, from_local: SocketAddr, to: SocketAddr, datagram: &[u8]) -> io::Result<()> {
        let inner = self.lock()?;
        let from = inner.outbound.get(&from_local).copied().unwrap_or(from_local);

        if let Some(filter) = &inner.drop_filter {
            if filter(from, to, datagram) {
                return Ok(());
            }
        }

        let target = inner.inbound.get(&to).copied().unwrap_or(to);
        if let Some(endpoint) = inner.endpoints.get(&target) {
            let _ = endpoint.send((datagram.to_vec(), from));
        }
        Ok(())
    }

    fn unbind(&self, addr: SocketAddr) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.endpoints.remove(&addr);
        }
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, NetworkInner>> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "memory network poisoned"))
    }
}

/// Endpoint on a [`MemoryNetwork`].
pub struct MemoryTransport {
    local: SocketAddr,
    network: MemoryNetwork,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
    pin_on_connect: bool,
    pinned: Mutex<Option<SocketAddr>>,
}

impl MemoryTransport {
    fn pinned(&self) -> Option<SocketAddr> {
        self.pinned.lock().ok().and_then(|p| *p)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }

    async fn send_to(&self, datagram: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.network.deliver(self.local, to, datagram)?;
        Ok(datagram.len())
    }

    async fn recv_from(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
        let mut inbox = self.inbox.lock().await;
        loop {
            let (datagram, from) = inbox
                .recv()
                .await
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "network gone"))?;

            match self.pinned() {
                Some(remote) if remote != from => continue,
                _ => return Ok((datagram, from)),
            }
        }
    }

    async fn connect(&self, remote: SocketAddr) -> io::Result<bool> {
        if !self.pin_on_connect {
            return Ok(false);
        }
        if let Ok(mut pinned) = self.pinned.lock() {
            *pinned = Some(remote);
        }
        Ok(true)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.unbind(self.local);
    }
}

/// A transport that fails every receive, for exercising fatal paths.
pub struct BrokenTransport {
    local: SocketAddr,
    failed: AtomicBool,
}

impl BrokenTransport {
    pub fn new(local: SocketAddr) -> Self {
        Self {
            local,
            failed: AtomicBool::new(false),
        }
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for BrokenTransport {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }

    async fn send_to(&self, datagram: &[u8], _to: SocketAddr) -> io::Result<usize> {
        Ok(datagram.len())
    }

    async fn recv_from(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
        self.failed.store(true, Ordering::SeqCst);
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "socket failed"))
    }

    async fn connect(&self, _remote: SocketAddr) -> io::Result<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_memory_delivery_and_source() {
        let net = MemoryNetwork::new();
        let a = net.bind(addr("10.0.0.1:1000")).unwrap();
        let b = net.bind(addr("10.0.0.2:2000")).unwrap();

        a.send_to(b"ping", addr("10.0.0.2:2000")).await.unwrap();
        let (datagram, from) = b.recv_from().await.unwrap();
        assert_eq!(datagram, b"ping");
        assert_eq!(from, addr("10.0.0.1:1000"));
    }

    #[tokio::test]
    async fn test_memory_nat_rewrites_both_directions() {
        let net = MemoryNetwork::new();
        let inside = net.bind(addr("192.168.1.10:5000")).unwrap();
        let outside = net.bind(addr("198.51.100.1:4321")).unwrap();
        net.map_public(addr("192.168.1.10:5000"), addr("203.0.113.5:62000"))
            .unwrap();

        inside.send_to(b"out", outside.local_addr().unwrap()).await.unwrap();
        let (_, seen) = outside.recv_from().await.unwrap();
        assert_eq!(seen, addr("203.0.113.5:62000"));

        outside.send_to(b"in", seen).await.unwrap();
        let (datagram, _) = inside.recv_from().await.unwrap();
        assert_eq!(datagram, b"in");
    }

    #[tokio::test]
    async fn test_memory_bind_conflict() {
        let net = MemoryNetwork::new();
        let _a = net.bind(addr("10.0.0.1:1000")).unwrap();
        let err = net.bind(addr("10.0.0.1:1000")).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);

        let eph = net.bind(addr("10.0.0.1:0")).unwrap();
        assert_ne!(eph.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_memory_unbind_on_drop() {
        let net = MemoryNetwork::new();
        drop(net.bind(addr("10.0.0.1:1000")).unwrap());
        assert!(net.bind(addr("10.0.0.1:1000")).is_ok());
    }

    #[tokio::test]
    async fn test_overlay_pins_remote() {
        let net = MemoryNetwork::new();
        let a = net
            .bind_with(addr("10.0.0.1:1000"), TransportKind::Overlay)
            .unwrap();
        let b = net.bind(addr("10.0.0.2:2000")).unwrap();
        let c = net.bind(addr("10.0.0.3:3000")).unwrap();

        assert!(a.connect(addr("10.0.0.2:2000")).await.unwrap());

        c.send_to(b"stranger", addr("10.0.0.1:1000")).await.unwrap();
        b.send_to(b"friend", addr("10.0.0.1:1000")).await.unwrap();

        let (datagram, from) = a.recv_from().await.unwrap();
        assert_eq!(datagram, b"friend");
        assert_eq!(from, addr("10.0.0.2:2000"));
    }

    #[tokio::test]
    async fn test_drop_filter() {
        let net = MemoryNetwork::new();
        let a = net.bind(addr("10.0.0.1:1000")).unwrap();
        let b = net.bind(addr("10.0.0.2:2000")).unwrap();
        net.set_drop_filter(|_, _, datagram| datagram == b"lost").unwrap();

        a.send_to(b"lost", addr("10.0.0.2:2000")).await.unwrap();
        a.send_to(b"kept", addr("10.0.0.2:2000")).await.unwrap();
        let (datagram, _) = b.recv_from().await.unwrap();
        assert_eq!(datagram, b"kept");
    }

    #[tokio::test]
    async fn test_udp_loopback() {
        let a = UdpTransport::bind(addr("127.0.0.1:0"), TransportKind::Udp).unwrap();
        let b = UdpTransport::bind(addr("127.0.0.1:0"), TransportKind::Udp).unwrap();
        let b_addr = b.local_addr().unwrap();

        a.send_to(b"hello", b_addr).await.unwrap();
        let (datagram, from) = tokio::time::timeout(Duration::from_secs(5), b.recv_from())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(datagram, b"hello");
        assert_eq!(from, a.local_addr().unwrap());
        assert!(!a.connect(b_addr).await.unwrap());
    }

    #[tokio::test]
    async fn test_dual_stack_reports_plain_ipv4_sources() {
        // Hosts without IPv6 cannot bind the wildcard.
        let Ok(dual) = UdpTransport::bind(addr("[::]:0"), TransportKind::Udp) else {
            return;
        };
        let port = dual.local_addr().unwrap().port();
        let v4 = UdpTransport::bind(addr("127.0.0.1:0"), TransportKind::Udp).unwrap();
        let v4_addr = v4.local_addr().unwrap();

        v4.send_to(b"ping", SocketAddr::new(addr("127.0.0.1:0").ip(), port))
            .await
            .unwrap();
        let (_, from) = tokio::time::timeout(Duration::from_secs(5), dual.recv_from())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, v4_addr);

        // Replies to the plain IPv4 address go out through the mapped form.
        dual.send_to(b"pong", from).await.unwrap();
        let (datagram, _) = tokio::time::timeout(Duration::from_secs(5), v4.recv_from())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(datagram, b"pong");
    }

    #[test]
    fn test_canonical_unmaps_ipv4() {
        assert_eq!(canonical(addr("[::ffff:127.0.0.1]:4321")), addr("127.0.0.1:4321"));
        assert_eq!(canonical(addr("[2001:db8::1]:80")), addr("[2001:db8::1]:80"));
        assert_eq!(canonical(addr("10.0.0.1:9")), addr("10.0.0.1:9"));
    }

    #[tokio::test]
    async fn test_udp_bind_conflict_is_bind_error() {
        let a = UdpTransport::bind(addr("127.0.0.1:0"), TransportKind::Udp).unwrap();
        let taken = a.local_addr().unwrap();
        let err = UdpTransport::bind(taken, TransportKind::Udp).err().unwrap();
        assert!(matches!(err, Error::Bind { .. }));
        assert!(err.is_fatal());
    }
}
