#![allow(unused_doc_comments)]
/**
 * This style of comments threw out warnings.
 * This allow statement fixes that
 */

/**
 * lib.rs
 */

pub mod error;
pub mod logging;
pub mod messages;
pub mod nat_traversal;

pub use error::{Error, Result};
pub use nat_traversal::{Peer, PeerConfig, PeerEvent, RendezvousConfig, RendezvousService};
