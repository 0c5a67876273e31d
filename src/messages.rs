/**
 * messages.rs
 *
 * JSON wire codec for the signalling channel (peer <-> rendezvous)
 * and the session channel (peer <-> peer). One JSON object per datagram.
 */

use crate::error::{Error, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::{IpAddr, SocketAddr};

/// Signalling messages exchanged with the rendezvous service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalMessage {
    /// `{"id": ..}`: keep my record fresh.
    Registration { peer_id: String },
    /// `{"id": .., "remote": ..}`: tell me where `remote_peer_id` is.
    ConnectionRequest {
        peer_id: String,
        remote_peer_id: String,
    },
    /// Service reply carrying the remote's server-observed address.
    HandshakeReply {
        peer_id: String,
        host: String,
        port: u16,
    },
}

/// Messages exchanged directly between peers.
///
/// Carries no identifier; the receiver trusts the source address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HolepunchMessage {
    Probe,
    Ack,
    Payload { body: Vec<u8> },
}

/// A datagram as seen by a peer agent: either the handshake reply from the
/// rendezvous service or session traffic from the remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerDatagram {
    Handshake { peer_id: String, addr: SocketAddr },
    Session(HolepunchMessage),
}

// Requests carry no `type`. `host`/`port` on a request are ignored on purpose:
// the service only trusts the UDP source address.
#[derive(Debug, Deserialize)]
struct RequestWire {
    id: Option<String>,
    #[serde(default)]
    remote: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum TypedWire {
    Handshake { id: String, host: String, port: u16 },
    Holepunch,
    Ack,
    Payload { body: BodyWire },
}

/// Payload bodies travel as a JSON string when they are UTF-8 and as an
/// array of byte values otherwise.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BodyWire {
    Text(String),
    Bytes(Vec<u8>),
}

impl SignalMessage {
    pub fn encode(&self) -> Vec<u8> {
        let value = match self {
            SignalMessage::Registration { peer_id } => json!({ "id": peer_id }),
            SignalMessage::ConnectionRequest {
                peer_id,
                remote_peer_id,
            } => json!({ "id": peer_id, "remote": remote_peer_id }),
            SignalMessage::HandshakeReply {
                peer_id,
                host,
                port,
            } => json!({
                "type": "HANDSHAKE",
                "id": peer_id,
                "host": host,
                "port": port,
            }),
        };
        value.to_string().into_bytes()
    }

    /// Decode a datagram received by the rendezvous service.
    ///
    /// The presence of a non-empty `remote` selects `ConnectionRequest`.
    pub fn decode_request(datagram: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(datagram).map_err(Error::Parse)?;
        let wire: RequestWire = serde_json::from_value(value)
            .map_err(|e| Error::protocol(format!("Malformed signalling request: {e}")))?;

        let peer_id = match wire.id {
            Some(id) if !id.is_empty() => id,
            _ => return Err(Error::protocol("No peer id provided in message")),
        };

        Ok(match wire.remote {
            Some(remote_peer_id) if !remote_peer_id.is_empty() => {
                SignalMessage::ConnectionRequest {
                    peer_id,
                    remote_peer_id,
                }
            }
            _ => SignalMessage::Registration { peer_id },
        })
    }

    pub fn peer_id(&self) -> &str {
        match self {
            SignalMessage::Registration { peer_id }
            | SignalMessage::ConnectionRequest { peer_id, .. }
            | SignalMessage::HandshakeReply { peer_id, .. } => peer_id,
        }
    }
}

impl HolepunchMessage {
    pub fn encode(&self) -> Vec<u8> {
        let value = match self {
            HolepunchMessage::Probe => json!({ "type": "HOLEPUNCH" }),
            HolepunchMessage::Ack => json!({ "type": "ACK" }),
            HolepunchMessage::Payload { body } => {
                let body = match std::str::from_utf8(body) {
                    Ok(text) => json!(text),
                    Err(_) => json!(body),
                };
                json!({ "type": "PAYLOAD", "body": body })
            }
        };
        value.to_string().into_bytes()
    }
}

/// Decode a datagram received by a peer agent.
///
/// Field values are untrusted: the handshake host must be an IP literal and
/// the port must be a non-zero u16.
pub fn decode_peer_datagram(datagram: &[u8]) -> Result<PeerDatagram> {
    let value: Value = serde_json::from_slice(datagram).map_err(Error::Parse)?;
    let wire: TypedWire = serde_json::from_value(value)
        .map_err(|e| Error::protocol(format!("Malformed session message: {e}")))?;

    Ok(match wire {
        TypedWire::Handshake { id, host, port } => {
            if id.is_empty() {
                return Err(Error::protocol("Handshake reply without peer id"));
            }
            let ip: IpAddr = host
                .parse()
                .map_err(|_| Error::protocol(format!("Invalid handshake host: {host}")))?;
            if port == 0 {
                return Err(Error::protocol("Handshake reply with port 0"));
            }
            PeerDatagram::Handshake {
                peer_id: id,
                addr: SocketAddr::new(ip, port),
            }
        }
        TypedWire::Holepunch => PeerDatagram::Session(HolepunchMessage::Probe),
        TypedWire::Ack => PeerDatagram::Session(HolepunchMessage::Ack),
        TypedWire::Payload { body } => {
            let body = match body {
                BodyWire::Text(text) => text.into_bytes(),
                BodyWire::Bytes(bytes) => bytes,
            };
            PeerDatagram::Session(HolepunchMessage::Payload { body })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shapes() {
        let reg = SignalMessage::Registration {
            peer_id: "A".into(),
        };
        let value: Value = serde_json::from_slice(&reg.encode()).unwrap();
        assert_eq!(value, json!({ "id": "A" }));

        let req = SignalMessage::ConnectionRequest {
            peer_id: "B".into(),
            remote_peer_id: "A".into(),
        };
        let value: Value = serde_json::from_slice(&req.encode()).unwrap();
        assert_eq!(value, json!({ "id": "B", "remote": "A" }));
    }

    #[test]
    fn test_remote_selects_connection_request() {
        let msg = SignalMessage::decode_request(br#"{"id":"B","remote":"A"}"#).unwrap();
        assert_eq!(
            msg,
            SignalMessage::ConnectionRequest {
                peer_id: "B".into(),
                remote_peer_id: "A".into()
            }
        );

        // An empty remote is treated like no remote at all.
        let msg = SignalMessage::decode_request(br#"{"id":"B","remote":""}"#).unwrap();
        assert_eq!(msg, SignalMessage::Registration { peer_id: "B".into() });
    }

    #[test]
    fn test_request_ignores_forged_address_fields() {
        let msg =
            SignalMessage::decode_request(br#"{"id":"A","host":"6.6.6.6","port":666}"#).unwrap();
        assert_eq!(msg, SignalMessage::Registration { peer_id: "A".into() });
    }

    #[test]
    fn test_request_error_classes() {
        assert!(matches!(
            SignalMessage::decode_request(b"not json"),
            Err(Error::Parse(_))
        ));
        assert!(matches!(
            SignalMessage::decode_request(br#"{"remote":"A"}"#),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            SignalMessage::decode_request(br#"{"id":""}"#),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            SignalMessage::decode_request(br#"{"id":42}"#),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_handshake_reply_decodes_to_socket_addr() {
        let reply = SignalMessage::HandshakeReply {
            peer_id: "A".into(),
            host: "203.0.113.7".into(),
            port: 40000,
        };
        let decoded = decode_peer_datagram(&reply.encode()).unwrap();
        assert_eq!(
            decoded,
            PeerDatagram::Handshake {
                peer_id: "A".into(),
                addr: "203.0.113.7:40000".parse().unwrap(),
            }
        );
    }

    #[test]
    fn test_handshake_reply_bounds_checked() {
        let bad_port = br#"{"type":"HANDSHAKE","id":"A","host":"10.0.0.1","port":70000}"#;
        assert!(matches!(decode_peer_datagram(bad_port), Err(Error::Protocol(_))));

        let zero_port = br#"{"type":"HANDSHAKE","id":"A","host":"10.0.0.1","port":0}"#;
        assert!(matches!(decode_peer_datagram(zero_port), Err(Error::Protocol(_))));

        let bad_host = br#"{"type":"HANDSHAKE","id":"A","host":"not-an-ip","port":1}"#;
        assert!(matches!(decode_peer_datagram(bad_host), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_session_messages() {
        let probe: Value = serde_json::from_slice(&HolepunchMessage::Probe.encode()).unwrap();
        assert_eq!(probe, json!({ "type": "HOLEPUNCH" }));

        let payload = HolepunchMessage::Payload {
            body: b"hello".to_vec(),
        };
        let value: Value = serde_json::from_slice(&payload.encode()).unwrap();
        assert_eq!(value, json!({ "type": "PAYLOAD", "body": "hello" }));
    }

    #[test]
    fn test_binary_payload_survives_codec() {
        let body = vec![0xff, 0x00, 0xfe, b'x'];
        let msg = HolepunchMessage::Payload { body: body.clone() };
        match decode_peer_datagram(&msg.encode()).unwrap() {
            PeerDatagram::Session(HolepunchMessage::Payload { body: decoded }) => {
                assert_eq!(decoded, body)
            }
            other => panic!("Expected payload, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_protocol_error() {
        assert!(matches!(
            decode_peer_datagram(br#"{"type":"DATA","body":"x"}"#),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            decode_peer_datagram(br#"{"id":"A"}"#),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(decode_peer_datagram(b"\xff\xfe"), Err(Error::Parse(_))));
    }
}
