//! # Gossip Transport Port
//!
//! The fabric core does not speak to the network itself. It requires only
//! this contract: a transport that gossips membership (Enter/Exit and
//! per-group Join/Leave converge without a central node), delivers a shout
//! to every current group member at most once, delivers whispers to a
//! single peer by uuid, and reports liveness heuristics (Evasive/Silent).
//!
//! A [`TransportFactory`] produces one fresh handle per node session; the
//! handle is owned exclusively by the actor thread for the lifetime of that
//! session and is stopped and dropped when the session ends.
//!
//! The reference production transport is a zyre-family gossip layer. This
//! crate ships [`memory::MemoryFabric`], an in-process implementation used
//! by the integration tests and the console demo.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::error::TransportError;

/// One event from the transport's fair-ordered stream.
///
/// Peer names arrive already canonicalized (the transport beacons the name
/// the factory was started with). Payloads are opaque framed buffers; the
/// actor decodes only the leading tag frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A peer appeared on the fabric.
    Enter { peer: String, uuid: Uuid },
    /// A peer left the fabric or expired.
    Exit { peer: String },
    /// A peer advertised membership in a group.
    Join { peer: String, group: String },
    /// A peer withdrew from a group.
    Leave { peer: String, group: String },
    /// A directed payload addressed to this node.
    Whisper { peer: String, payload: Bytes },
    /// A broadcast payload on a group this node is a member of.
    Shout {
        peer: String,
        group: String,
        payload: Bytes,
    },
    /// The peer has been quiet past the evasive timeout.
    Evasive { peer: String },
    /// The peer has stayed quiet after being pinged.
    Silent { peer: String },
}

/// Exclusive handle to a live transport endpoint.
///
/// Owned by the actor thread only; no other component touches it. All
/// methods are driven from that single task, so implementations may keep
/// interior state without locking. `next_event` must be cancellation-safe:
/// the actor races it against the host pipe and a keepalive sleep.
#[async_trait]
pub trait GossipTransport: Send {
    /// The transport identity of the local endpoint.
    fn uuid(&self) -> Uuid;

    /// Advertises membership in a group.
    async fn join(&mut self, group: &str) -> Result<(), TransportError>;

    /// Withdraws membership from a group.
    async fn leave(&mut self, group: &str) -> Result<(), TransportError>;

    /// Broadcasts a payload to every current member of a group.
    async fn shout(&mut self, group: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Sends a payload to one peer.
    async fn whisper(&mut self, peer: Uuid, payload: Bytes) -> Result<(), TransportError>;

    /// Waits for the next event. `None` means the endpoint is gone and the
    /// actor should wind down.
    async fn next_event(&mut self) -> Option<TransportEvent>;

    /// Tunes the quiet interval after which peers are reported Evasive.
    fn set_evasive_timeout(&mut self, ms: u64);

    /// Tunes the quiet interval after which peers are expired via Exit.
    fn set_expired_timeout(&mut self, ms: u64);

    /// Stops beaconing and releases the endpoint. Called exactly once, after
    /// the actor has departed its groups.
    async fn stop(&mut self);

    // -- introspection ------------------------------------------------------

    /// Groups this endpoint currently advertises.
    fn own_groups(&self) -> Vec<String>;

    /// Peers the transport sees in a group.
    fn peers_by_group(&self, group: &str) -> Vec<String>;

    /// A beacon header value of a peer, e.g. `"name"`.
    fn peer_header(&self, peer: Uuid, key: &str) -> Option<String>;
}

/// Produces a fresh transport handle per node session.
///
/// `enter()` calls this once; re-entry after `exit()` constructs a brand new
/// handle. A failure here is the one fatal error of the fabric: the node
/// stays "not entered".
pub trait TransportFactory: Send + Sync {
    fn start(
        &self,
        local_peer: &str,
        interface: Option<&str>,
    ) -> Result<Box<dyn GossipTransport>, TransportError>;
}
