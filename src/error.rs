/**
 * error.rs
 *
 * Error taxonomy shared by the rendezvous service and the peer agent
 */

use std::io;
use std::net::SocketAddr;

/// Errors raised by the signalling service and the peer agent.
///
/// `Parse`, `Protocol` and `NotConnected` are recoverable: they are reported
/// and processing continues. `Transport` and `Bind` close the component that
/// raised them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The datagram was not well-formed JSON.
    #[error("Parse error: {0}")]
    Parse(#[source] serde_json::Error),

    /// Well-formed JSON that is missing discriminating fields, carries
    /// out-of-range values, or refers to an unexpected peer.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A payload was sent before the session reached CONNECTED.
    #[error("Not connected")]
    NotConnected,

    /// Send or receive failure on the underlying socket.
    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    /// The local address could not be bound.
    #[error("Bind failed on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// A declared but unimplemented transport was selected.
    #[error("{0} transport is not implemented")]
    NotImplemented(&'static str),

    /// The operation is not legal for the configured role.
    #[error("Operation {operation} is not allowed for the {role} role")]
    RoleMismatch {
        operation: &'static str,
        role: &'static str,
    },

    /// The operation was requested from a state that does not allow it.
    #[error("Operation {operation} is not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    /// The owning task has shut down.
    #[error("Component closed")]
    Closed,
}

impl Error {
    /// Fatal errors close the owning component and are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Bind { .. })
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let io = io::Error::new(io::ErrorKind::Other, "boom");
        assert!(Error::Transport(io).is_fatal());

        let bind = Error::Bind {
            addr: "127.0.0.1:4321".parse().unwrap(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(bind.is_fatal());

        assert!(!Error::NotConnected.is_fatal());
        assert!(!Error::protocol("missing id").is_fatal());
        assert!(!Error::NotImplemented("TCP").is_fatal());
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(Error::NotConnected.to_string(), "Not connected");
        assert_eq!(
            Error::NotImplemented("TCP").to_string(),
            "TCP transport is not implemented"
        );
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(Error::Parse(parse).to_string().starts_with("Parse error"));
    }
}
