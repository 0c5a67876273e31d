/**
 * nat_traversal/hole_punching.rs
 *
 * Peer-side session state machine: signalling retries, synchronized
 * hole punching, acknowledgment and payload exchange.
 *
 * The machine performs no I/O. Every input (command, datagram, timer tick)
 * returns the list of actions the owning task must carry out, in order.
 */

use crate::error::{Error, Result};
use crate::messages::{decode_peer_datagram, HolepunchMessage, PeerDatagram, SignalMessage};
use crate::nat_traversal::transport::canonical;
use crate::nat_traversal::types::{PeerConfig, PeerEvent, Role, SessionState};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the single active timer is currently repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPhase {
    /// Resend Registration (receiver) or ConnectionRequest (initiator).
    Signalling,
    /// Resend Probe to the remote endpoint.
    Punch,
}

/// Side effects requested by the state machine.
#[derive(Debug)]
pub enum Action {
    Send { to: SocketAddr, datagram: Vec<u8> },
    /// Start a periodic timer. Replaces any previous timer.
    ArmTimer { epoch: u64, period: Duration },
    CancelTimer { epoch: u64 },
    /// The session reached CONNECTED with `remote`.
    Established { remote: SocketAddr },
    Emit(PeerEvent),
}

#[derive(Debug, Clone, Copy)]
struct ArmedTimer {
    epoch: u64,
    phase: TimerPhase,
}

/// Client-side session for one peer agent.
#[derive(Debug)]
pub struct PeerSession {
    self_id: String,
    role: Role,
    rendezvous: SocketAddr,
    remote_id: Option<String>,
    remote_endpoint: Option<SocketAddr>,
    retry_interval: Duration,
    state: SessionState,
    timer: Option<ArmedTimer>,
    next_epoch: u64,
}

impl PeerSession {
    pub fn new(
        self_id: impl Into<String>,
        role: Role,
        rendezvous: SocketAddr,
        retry_interval: Duration,
    ) -> Self {
        Self {
            self_id: self_id.into(),
            role,
            rendezvous: canonical(rendezvous),
            remote_id: None,
            remote_endpoint: None,
            retry_interval,
            state: SessionState::Idle,
            timer: None,
            next_epoch: 0,
        }
    }

    pub fn from_config(config: &PeerConfig, rendezvous: SocketAddr) -> Self {
        Self::new(
            config.peer_id.clone(),
            config.role,
            rendezvous,
            config.retry_interval,
        )
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn rendezvous(&self) -> SocketAddr {
        self.rendezvous
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    pub fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.remote_endpoint
    }

    /// The armed timer, if any, as `(epoch, phase)`.
    pub fn active_timer(&self) -> Option<(u64, TimerPhase)> {
        self.timer.map(|t| (t.epoch, t.phase))
    }

    /// Receiver role: start periodic registration.
    pub fn listen(&mut self) -> Result<Vec<Action>> {
        if self.role != Role::Receiver {
            return Err(Error::RoleMismatch {
                operation: "listen",
                role: self.role.as_str(),
            });
        }
        self.require_idle("listen")?;

        let mut actions = Vec::new();
        self.transition(SessionState::Registering);
        self.arm(TimerPhase::Signalling, &mut actions);
        self.push_signal(&mut actions);
        Ok(actions)
    }

    /// Initiator role: start periodic connection requests for `remote_id`.
    pub fn connect(&mut self, remote_id: &str) -> Result<Vec<Action>> {
        if self.role != Role::Initiator {
            return Err(Error::RoleMismatch {
                operation: "connect",
                role: self.role.as_str(),
            });
        }
        self.require_idle("connect")?;
        if remote_id.is_empty() {
            return Err(Error::protocol("Remote peer id must not be empty"));
        }
        if remote_id == self.self_id {
            return Err(Error::protocol("Cannot connect to yourself"));
        }

        let mut actions = Vec::new();
        self.remote_id = Some(remote_id.to_string());
        self.transition(SessionState::Requesting);
        self.arm(TimerPhase::Signalling, &mut actions);
        self.push_signal(&mut actions);
        self.transition(SessionState::AwaitingHandshake);
        Ok(actions)
    }

    /// Queue an application payload. Requires CONNECTED; otherwise fails
    /// without touching the session.
    pub fn send_payload(&self, body: Vec<u8>) -> Result<Vec<Action>> {
        match (self.state, self.remote_endpoint) {
            (SessionState::Connected, Some(remote)) => Ok(vec![Action::Send {
                to: remote,
                datagram: HolepunchMessage::Payload { body }.encode(),
            }]),
            _ => Err(Error::NotConnected),
        }
    }

    /// A timer tick. Ticks from a cancelled or superseded timer are no-ops.
    pub fn on_timer(&mut self, epoch: u64) -> Vec<Action> {
        let phase = match self.timer {
            Some(timer) if timer.epoch == epoch => timer.phase,
            _ => {
                debug!(peer = %self.self_id, epoch, "Ignoring stale timer tick");
                return Vec::new();
            }
        };

        let mut actions = Vec::new();
        match phase {
            TimerPhase::Signalling => self.push_signal(&mut actions),
            TimerPhase::Punch => self.push_probe(&mut actions),
        }
        actions
    }

    /// An inbound datagram from `from`.
    pub fn on_datagram(&mut self, from: SocketAddr, datagram: &[u8]) -> Vec<Action> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        let from = canonical(from);

        let message = match decode_peer_datagram(datagram) {
            Ok(message) => message,
            Err(e) => return self.report(e),
        };

        match message {
            PeerDatagram::Handshake { peer_id, addr } => self.on_handshake(from, peer_id, addr),
            PeerDatagram::Session(HolepunchMessage::Probe) => self.on_probe(from),
            PeerDatagram::Session(HolepunchMessage::Ack) => self.on_ack(from),
            PeerDatagram::Session(HolepunchMessage::Payload { body }) => {
                self.on_payload(from, body)
            }
        }
    }

    /// Socket close: cancel everything this session owns.
    pub fn close(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state.is_terminal() {
            return actions;
        }
        self.cancel(&mut actions);
        self.transition(SessionState::Closed);
        actions.push(Action::Emit(PeerEvent::Closed));
        actions
    }

    /// Unrecoverable transport fault.
    pub fn fail(&mut self, error: Error) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state.is_terminal() {
            return actions;
        }
        warn!(peer = %self.self_id, error = %error, "Session failed");
        self.cancel(&mut actions);
        self.transition(SessionState::Errored);
        actions.push(Action::Emit(PeerEvent::Error(error)));
        actions.push(Action::Emit(PeerEvent::Closed));
        actions
    }

    fn on_handshake(&mut self, from: SocketAddr, peer_id: String, addr: SocketAddr) -> Vec<Action> {
        match self.state {
            SessionState::Requesting | SessionState::AwaitingHandshake => {}
            SessionState::Punching | SessionState::Connected => {
                debug!(peer = %self.self_id, remote = %peer_id, "Ignoring stale handshake reply");
                return Vec::new();
            }
            state => {
                return self.report(Error::protocol(format!(
                    "Unsolicited handshake reply in state {state}"
                )));
            }
        }

        if from != self.rendezvous {
            return self.report(Error::protocol(format!(
                "Handshake reply from {from}, expected rendezvous {}",
                self.rendezvous
            )));
        }
        if self.remote_id.as_deref() != Some(peer_id.as_str()) {
            return self.report(Error::protocol(format!(
                "Handshake reply names unexpected peer {peer_id}"
            )));
        }

        info!(peer = %self.self_id, remote = %peer_id, endpoint = %addr, "Received handshake, punching");

        let mut actions = Vec::new();
        self.remote_endpoint = Some(addr);
        self.transition(SessionState::Punching);
        self.arm(TimerPhase::Punch, &mut actions);
        self.push_probe(&mut actions);
        actions
    }

    fn on_probe(&mut self, from: SocketAddr) -> Vec<Action> {
        // Once the rendezvous named an endpoint, only that endpoint may punch.
        if let Some(expected) = self.remote_endpoint {
            if from != expected && self.state != SessionState::Connected {
                return self.report(Error::protocol(format!(
                    "Probe from {from}, expected remote {expected}"
                )));
            }
        }

        match self.state {
            SessionState::Registering
            | SessionState::Requesting
            | SessionState::AwaitingHandshake
            | SessionState::Punching => {
                let mut actions = Vec::new();
                self.cancel(&mut actions);
                actions.push(Action::Send {
                    to: from,
                    datagram: HolepunchMessage::Ack.encode(),
                });
                self.establish(from, &mut actions);
                actions
            }
            SessionState::Connected => {
                debug!(peer = %self.self_id, from = %from, "Ignoring probe after connect");
                Vec::new()
            }
            state => {
                debug!(peer = %self.self_id, from = %from, %state, "Ignoring probe");
                Vec::new()
            }
        }
    }

    fn on_ack(&mut self, from: SocketAddr) -> Vec<Action> {
        match self.state {
            SessionState::Punching if self.remote_endpoint == Some(from) => {
                let mut actions = Vec::new();
                self.cancel(&mut actions);
                self.establish(from, &mut actions);
                actions
            }
            SessionState::Connected => {
                debug!(peer = %self.self_id, from = %from, "Ignoring duplicate ack");
                Vec::new()
            }
            state => self.report(Error::protocol(format!(
                "Unexpected ack from {from} in state {state}"
            ))),
        }
    }

    fn on_payload(&mut self, from: SocketAddr, body: Vec<u8>) -> Vec<Action> {
        if self.remote_endpoint != Some(from) {
            return self.report(Error::protocol(format!(
                "Payload from unknown source {from}"
            )));
        }

        let mut actions = Vec::new();
        match self.state {
            SessionState::Connected => {}
            // The remote only sends payloads once it is connected, so this
            // stands in for an ack that was lost or reordered.
            SessionState::Punching => {
                self.cancel(&mut actions);
                self.establish(from, &mut actions);
            }
            state => {
                return self.report(Error::protocol(format!(
                    "Payload before connection in state {state}"
                )));
            }
        }

        debug!(peer = %self.self_id, from = %from, len = body.len(), "Payload received");
        actions.push(Action::Emit(PeerEvent::Payload { from, body }));
        actions
    }

    fn establish(&mut self, remote: SocketAddr, actions: &mut Vec<Action>) {
        self.remote_endpoint = Some(remote);
        self.transition(SessionState::Connected);
        info!(peer = %self.self_id, remote = %remote, "Connection established");
        actions.push(Action::Established { remote });
    }

    fn push_signal(&self, actions: &mut Vec<Action>) {
        let message = match &self.remote_id {
            Some(remote_id) => SignalMessage::ConnectionRequest {
                peer_id: self.self_id.clone(),
                remote_peer_id: remote_id.clone(),
            },
            None => SignalMessage::Registration {
                peer_id: self.self_id.clone(),
            },
        };
        actions.push(Action::Send {
            to: self.rendezvous,
            datagram: message.encode(),
        });
    }

    fn push_probe(&self, actions: &mut Vec<Action>) {
        if let Some(remote) = self.remote_endpoint {
            actions.push(Action::Send {
                to: remote,
                datagram: HolepunchMessage::Probe.encode(),
            });
        }
    }

    // At most one timer is armed at a time: arming always cancels first.
    fn arm(&mut self, phase: TimerPhase, actions: &mut Vec<Action>) {
        self.cancel(actions);
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        self.timer = Some(ArmedTimer { epoch, phase });
        actions.push(Action::ArmTimer {
            epoch,
            period: self.retry_interval,
        });
    }

    fn cancel(&mut self, actions: &mut Vec<Action>) {
        if let Some(timer) = self.timer.take() {
            actions.push(Action::CancelTimer { epoch: timer.epoch });
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(peer = %self.self_id, from = %self.state, to = %next, "State transition");
        self.state = next;
    }

    fn require_idle(&self, operation: &'static str) -> Result<()> {
        if self.state == SessionState::Idle {
            Ok(())
        } else {
            Err(Error::InvalidState {
                operation,
                state: self.state.as_str(),
            })
        }
    }

    fn report(&self, error: Error) -> Vec<Action> {
        warn!(peer = %self.self_id, error = %error, "Dropping datagram");
        vec![Action::Emit(PeerEvent::Error(error))]
    }
}
