// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # WEAVE Fabric — Core Library
//!
//! The peer-node runtime of WEAVE, a broker-less messaging fabric for
//! cooperating processes on a LAN. Peers discover each other through a
//! gossip transport, form named groups, exchange directed and broadcast
//! messages, evaluate expressions on each other's hosts ("query"), and hold
//! standing subscriptions that push updates when a remote value changes
//! ("observe").
//!
//! ## Architecture
//!
//! - **name** — Canonical peer naming and observer-group formatting.
//! - **membership** — Who is here and which groups they advertise.
//! - **transport** — The abstract gossip port plus an in-process fabric.
//! - **actor** — The one thread that owns the transport handle.
//! - **codec** — Length-prefixed frames and pipe-delimited arrays.
//! - **dispatch** — Inbound queue, command registry, response correlator.
//! - **commands** — The standard wire command suite.
//! - **query** — One-shot remote evaluation.
//! - **observe** — Standing subscriptions, source and consumer sides.
//! - **housekeeping** — Contextual channel reconciliation and sweeps.
//! - **node** — The facade tying it together.
//! - **host** — The `Evaluator`/`ChatSink` ports the embedding host fills.
//! - **config** — Operator settings and fabric constants.
//!
//! ## Design stance
//!
//! One actor thread per entered node owns the transport exclusively; the
//! host thread drives everything else through `tick()`. Shared tables live
//! behind per-table locks with snapshot accessors, so no caller ever holds
//! a lock across foreign code. Recoverable failures surface through state
//! rather than errors: a dropped frame is logged, an unknown peer reads as
//! a timeout, a refused expression becomes `"NULL"`.

pub mod codec;
pub mod config;
pub mod error;
pub mod host;
pub mod membership;
pub mod name;
pub mod node;
pub mod transport;

mod actor;
mod commands;
mod dispatch;
mod housekeeping;
mod observe;
mod query;

#[cfg(test)]
mod testutil;

pub use codec::{join_array, parse_array};
pub use commands::unescape_command;
pub use config::{NetSettings, FABRIC_VERSION};
pub use dispatch::{CommandArgs, CommandHandler};
pub use error::{CodecError, FabricError, TransportError};
pub use host::{ChatSink, Evaluator};
pub use node::Node;
pub use observe::Observation;
pub use transport::memory::MemoryFabric;
pub use transport::{GossipTransport, TransportEvent, TransportFactory};
