/**
 * nat_traversal/peer.rs
 *
 * Peer agent runtime. A single task owns the session and the transport and
 * processes one event at a time: commands from the handle, inbound
 * datagrams, and ticks of the one active timer.
 */

use crate::error::{Error, Result};
use crate::nat_traversal::hole_punching::{Action, PeerSession};
use crate::nat_traversal::transport::{Transport, UdpTransport};
use crate::nat_traversal::types::{PeerConfig, PeerEvent, SessionState, EVENT_QUEUE_CAPACITY};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

enum Request {
    Listen,
    Connect(String),
    Send(Vec<u8>),
}

enum Command {
    Request(Request, oneshot::Sender<Result<()>>),
    Close(oneshot::Sender<()>),
}

enum Step {
    Command(Option<Command>),
    Datagram(io::Result<(Vec<u8>, SocketAddr)>),
    Timer(u64),
}

/// Handle to a running peer agent.
pub struct Peer {
    peer_id: String,
    local_addr: SocketAddr,
    commands: mpsc::Sender<Command>,
    events: mpsc::Receiver<PeerEvent>,
    state: watch::Receiver<SessionState>,
    task: JoinHandle<()>,
}

impl Peer {
    /// Bind a UDP socket per `config` and start the agent in IDLE.
    pub async fn bind(config: PeerConfig) -> Result<Self> {
        let transport = UdpTransport::bind(config.bind_addr, config.transport)?;
        Self::with_transport(config, Arc::new(transport)).await
    }

    /// Start the agent over an already bound transport.
    pub async fn with_transport(config: PeerConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let rendezvous = resolve(&config.rendezvous).await?;
        let local_addr = transport.local_addr()?;
        let session = PeerSession::from_config(&config, rendezvous);

        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);

        info!(
            peer = %config.peer_id,
            role = config.role.as_str(),
            local = %local_addr,
            rendezvous = %rendezvous,
            "Peer agent bound"
        );

        let driver = Driver {
            session,
            transport,
            commands: commands_rx,
            events: events_tx,
            state: state_tx,
            timer: None,
        };
        let task = tokio::spawn(driver.run());

        Ok(Self {
            peer_id: config.peer_id,
            local_addr,
            commands: commands_tx,
            events: events_rx,
            state: state_rx,
            task,
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receiver role: register periodically and wait to be punched.
    pub async fn listen(&self) -> Result<()> {
        self.request(Request::Listen).await
    }

    /// Initiator role: ask the rendezvous service for `remote_id` and punch.
    pub async fn connect(&self, remote_id: &str) -> Result<()> {
        self.request(Request::Connect(remote_id.to_string())).await
    }

    /// Send an opaque payload to the connected remote.
    pub async fn send(&self, body: impl Into<Vec<u8>>) -> Result<()> {
        self.request(Request::Send(body.into())).await
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Wait until the session reaches `target`. Fails with `Closed` if the
    /// session ends in another terminal state first.
    pub async fn wait_for_state(&mut self, target: SessionState) -> Result<()> {
        loop {
            let current = *self.state.borrow_and_update();
            if current == target {
                return Ok(());
            }
            if current.is_terminal() {
                return Err(Error::Closed);
            }
            if self.state.changed().await.is_err() {
                return if *self.state.borrow() == target {
                    Ok(())
                } else {
                    Err(Error::Closed)
                };
            }
        }
    }

    /// Next event for the application; `None` once the agent is gone.
    ///
    /// Events are buffered up to [`EVENT_QUEUE_CAPACITY`]. While the buffer is
    /// full new events are dropped; [`Peer::state`] always stays current.
    pub async fn next_event(&mut self) -> Option<PeerEvent> {
        self.events.recv().await
    }

    /// Close the socket and cancel every timer.
    pub async fn close(self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(Command::Close(reply_tx)).await.is_ok() {
            let _ = reply_rx.await;
        }
        self.task.await.map_err(|_| Error::Closed)
    }

    async fn request(&self, request: Request) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Request(request, reply_tx))
            .await
            .map_err(|_| Error::Closed)?;
        reply_rx.await.map_err(|_| Error::Closed)?
    }
}

async fn resolve(endpoint: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(endpoint)
        .await?
        .next()
        .ok_or_else(|| {
            Error::Transport(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Rendezvous endpoint {endpoint} did not resolve"),
            ))
        })
}

struct Driver {
    session: PeerSession,
    transport: Arc<dyn Transport>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<PeerEvent>,
    state: watch::Sender<SessionState>,
    timer: Option<(u64, Interval)>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let step = tokio::select! {
                command = self.commands.recv() => Step::Command(command),
                received = self.transport.recv_from() => Step::Datagram(received),
                epoch = next_tick(&mut self.timer) => Step::Timer(epoch),
            };

            let outcome = match step {
                Step::Command(None) => {
                    debug!(peer = self.session.self_id(), "All handles dropped");
                    let actions = self.session.close();
                    let _ = self.apply(actions).await;
                    break;
                }
                Step::Command(Some(Command::Close(reply))) => {
                    let actions = self.session.close();
                    let _ = self.apply(actions).await;
                    let _ = reply.send(());
                    break;
                }
                Step::Command(Some(Command::Request(request, reply))) => {
                    self.command(request, reply).await
                }
                Step::Datagram(Ok((datagram, from))) => {
                    let actions = self.session.on_datagram(from, &datagram);
                    self.apply(actions).await
                }
                Step::Datagram(Err(e)) => Err(Error::Transport(e)),
                Step::Timer(epoch) => {
                    let actions = self.session.on_timer(epoch);
                    self.apply(actions).await
                }
            };

            if let Err(fatal) = outcome {
                let actions = self.session.fail(fatal);
                let _ = self.apply(actions).await;
                break;
            }
            self.publish();
        }

        self.timer = None;
        self.publish();
        info!(peer = self.session.self_id(), state = %self.session.state(), "Peer agent stopped");
    }

    // Command replies carry the caller's own failure. A fatal transport
    // error is returned to the loop instead, and the caller sees `Closed`.
    async fn command(
        &mut self,
        request: Request,
        reply: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        let result = match request {
            Request::Listen => self.session.listen(),
            Request::Connect(remote_id) => self.session.connect(&remote_id),
            Request::Send(body) => self.session.send_payload(body),
        };

        match result {
            Ok(actions) => {
                let applied = self.apply(actions).await;
                self.publish();
                let _ = reply.send(match &applied {
                    Ok(()) => Ok(()),
                    Err(_) => Err(Error::Closed),
                });
                applied
            }
            Err(e) => {
                let _ = reply.send(Err(e));
                Ok(())
            }
        }
    }

    async fn apply(&mut self, actions: Vec<Action>) -> Result<()> {
        for action in actions {
            match action {
                Action::Send { to, datagram } => {
                    self.transport.send_to(&datagram, to).await?;
                }
                Action::ArmTimer { epoch, period } => {
                    let mut interval = interval_at(Instant::now() + period, period);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    self.timer = Some((epoch, interval));
                }
                Action::CancelTimer { epoch } => {
                    if matches!(self.timer, Some((armed, _)) if armed == epoch) {
                        self.timer = None;
                    }
                }
                Action::Established { remote } => {
                    let pinned = self.transport.connect(remote).await?;
                    self.emit(PeerEvent::Connected { remote, pinned });
                }
                Action::Emit(event) => self.emit(event),
            }
        }
        Ok(())
    }

    fn emit(&self, event: PeerEvent) {
        if let Err(TrySendError::Full(event)) = self.events.try_send(event) {
            warn!(peer = self.session.self_id(), ?event, "Event queue full, dropping event");
        }
    }

    fn publish(&self) {
        self.state.send_if_modified(|state| {
            let current = self.session.state();
            if *state == current {
                false
            } else {
                *state = current;
                true
            }
        });
    }
}

async fn next_tick(timer: &mut Option<(u64, Interval)>) -> u64 {
    match timer {
        Some((epoch, interval)) => {
            interval.tick().await;
            *epoch
        }
        None => std::future::pending().await,
    }
}
