use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use holepunch::logging::init_logging;
use holepunch::nat_traversal::{
    Peer, PeerConfig, PeerEvent, RendezvousConfig, RendezvousProtocol, RendezvousService, Role,
    TransportKind, DEFAULT_RENDEZVOUS_PORT,
};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;

#[derive(Clone, Copy, ValueEnum, Default)]
enum Protocol {
    /// UDP signalling
    #[default]
    Udp,
    /// TCP signalling (not implemented)
    Tcp,
}

#[derive(Clone, Copy, ValueEnum, Default)]
enum PeerTransport {
    /// Plain UDP datagrams
    #[default]
    Udp,
    /// UDP socket pinned to the remote once connected
    Overlay,
}

#[derive(Parser)]
#[command(name = "holepunch")]
#[command(version)]
#[command(about = "UDP hole punching through a rendezvous service")]
struct Args {
    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "HOLEPUNCH_LOG", default_value = "info", global = true)]
    log: String,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run the rendezvous service
    Server {
        /// Address to bind
        #[arg(long, env = "HOLEPUNCH_HOST", default_value = "0.0.0.0")]
        host: IpAddr,

        /// Port to bind
        #[arg(short, long, env = "HOLEPUNCH_PORT", default_value_t = DEFAULT_RENDEZVOUS_PORT)]
        port: u16,

        #[arg(long, default_value = "udp")]
        protocol: Protocol,

        /// Forget peers not heard from for this many seconds (default: never)
        #[arg(long, env = "HOLEPUNCH_RECORD_TTL")]
        record_ttl_secs: Option<u64>,
    },
    /// Register and wait for a peer to connect
    Listen {
        /// Identifier to register under (default: random)
        #[arg(long, env = "HOLEPUNCH_ID")]
        id: Option<String>,

        #[command(flatten)]
        peer: PeerArgs,
    },
    /// Connect to the peer registered as <remote>
    Connect {
        remote: String,

        /// Identifier to register under (default: random)
        #[arg(long, env = "HOLEPUNCH_ID")]
        id: Option<String>,

        #[command(flatten)]
        peer: PeerArgs,
    },
}

#[derive(clap::Args)]
struct PeerArgs {
    /// Rendezvous service (host:port)
    #[arg(short, long, env = "HOLEPUNCH_RENDEZVOUS")]
    rendezvous: String,

    /// Local address to bind
    #[arg(short, long, env = "HOLEPUNCH_BIND", default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Retry interval in milliseconds
    #[arg(long, env = "HOLEPUNCH_RETRY_MS", default_value_t = 1000)]
    retry_ms: u64,

    #[arg(long, default_value = "udp")]
    transport: PeerTransport,
}

impl PeerArgs {
    fn into_config(self, id: String, role: Role) -> PeerConfig {
        let transport = match self.transport {
            PeerTransport::Udp => TransportKind::Udp,
            PeerTransport::Overlay => TransportKind::Overlay,
        };
        PeerConfig::new(id, self.rendezvous, role)
            .with_bind_addr(self.bind)
            .with_retry_interval(Duration::from_millis(self.retry_ms))
            .with_transport(transport)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log)?;

    match args.mode {
        Mode::Server {
            host,
            port,
            protocol,
            record_ttl_secs,
        } => {
            let config = RendezvousConfig {
                bind_host: host,
                bind_port: port,
                protocol: match protocol {
                    Protocol::Udp => RendezvousProtocol::Udp,
                    Protocol::Tcp => RendezvousProtocol::Tcp,
                },
                record_ttl: record_ttl_secs.map(Duration::from_secs),
            };
            run_server(config).await
        }
        Mode::Listen { id, peer } => {
            let id = id.unwrap_or_else(random_id);
            let peer = Peer::bind(peer.into_config(id, Role::Receiver))
                .await
                .context("Failed to bind peer")?;
            peer.listen().await.context("Failed to start registration")?;
            run_session(peer).await
        }
        Mode::Connect { id, remote, peer } => {
            let id = id.unwrap_or_else(random_id);
            if id == remote {
                anyhow::bail!("Cannot connect to yourself: local id and remote are both '{id}'");
            }
            let peer = Peer::bind(peer.into_config(id, Role::Initiator))
                .await
                .context("Failed to bind peer")?;
            peer.connect(&remote)
                .await
                .context("Failed to request connection")?;
            run_session(peer).await
        }
    }
}

fn random_id() -> String {
    let id = format!("peer_{}", rand::random::<u32>());
    println!("No id given, using random id: {id}");
    id
}

async fn run_server(config: RendezvousConfig) -> Result<()> {
    let service = RendezvousService::bind(config)
        .await
        .context("Failed to start rendezvous service")?;
    println!("Server listening {}", service.local_addr());

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(());
        }
    });

    service.run(shutdown_rx).await?;
    Ok(())
}

enum Input {
    Line(Option<String>),
    Event(Option<PeerEvent>),
}

/// Print peer events and forward stdin lines as payloads.
async fn run_session(mut peer: Peer) -> Result<()> {
    println!("Peer {} bound on {}", peer.peer_id(), peer.local_addr());
    println!("Waiting for the remote peer...");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        let input = tokio::select! {
            line = lines.next_line(), if stdin_open => Input::Line(line?),
            event = peer.next_event() => Input::Event(event),
        };

        match input {
            Input::Line(None) => stdin_open = false,
            Input::Line(Some(line)) => {
                if line.is_empty() {
                    continue;
                }
                if let Err(e) = peer.send(line).await {
                    eprintln!("Cannot send yet: {e}");
                }
            }
            Input::Event(Some(PeerEvent::Connected { remote, pinned })) => {
                println!("Connected to {remote}{}", if pinned { " (overlay)" } else { "" });
                println!("Type a message and press Enter to send.");
            }
            Input::Event(Some(PeerEvent::Payload { from, body })) => {
                println!("{from}: {}", String::from_utf8_lossy(&body));
            }
            Input::Event(Some(PeerEvent::Error(e))) => {
                eprintln!("Error: {e}");
            }
            Input::Event(Some(PeerEvent::Closed)) | Input::Event(None) => {
                println!("Connection closed.");
                break;
            }
        }
    }

    Ok(())
}
