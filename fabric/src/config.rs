//! # Fabric Configuration & Constants
//!
//! Every operator-tunable knob and every magic number of the fabric lives
//! here. The knobs are collected in [`NetSettings`], which the host veneer
//! persists and writes back through node setters; the constants are the
//! defaults those knobs start from plus the class/role tables housekeeping
//! consults.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// The crate version, reported by the operator `net version` command.
pub const FABRIC_VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// Timing defaults
// ---------------------------------------------------------------------------

/// Default one-shot query timeout. The host polls the result predicate at
/// this horizon; a missing reply past it reads as failure.
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 1_000;

/// Default minimum interval between observer updates for a single
/// expression. The effective gate is `max(10 * benchmark, observe_delay)`.
pub const DEFAULT_OBSERVE_DELAY_MS: u64 = 1_000;

/// Default actor wake interval. The actor's poller never sleeps longer than
/// this, traffic or not.
pub const DEFAULT_KEEPALIVE_MS: u64 = 30_000;

/// Default transport evasive timeout: a peer silent this long gets pinged
/// and reported as `Evasive`.
pub const DEFAULT_EVASIVE_MS: u64 = 5_000;

/// Default transport expired timeout: a peer silent this long is removed
/// through the normal exit path.
pub const DEFAULT_EXPIRED_MS: u64 = 30_000;

/// Minimum interval between housekeeping passes.
pub const HOUSEKEEPING_INTERVAL_MS: u64 = 1_000;

// ---------------------------------------------------------------------------
// Group names
// ---------------------------------------------------------------------------

/// The catch-all channel every peer joins.
pub const ALL_GROUP: &str = "all";

/// Prefixes of the contextual channels housekeeping reconciles each pass.
/// The suffix is the current leader's full name (`group_`, `raid_`) or the
/// lowercased zone short name (`zone_`).
pub const CONTEXT_PREFIXES: [&str; 3] = ["group_", "raid_", "zone_"];

/// Role aggregate channels, keyed by the three-letter class codes that
/// belong to each. A peer joins every aggregate containing its class.
pub const ROLE_GROUPS: [(&str, &[&str]); 4] = [
    ("tank", &["war", "pal", "shd"]),
    ("priest", &["clr", "dru", "shm"]),
    ("melee", &["mnk", "rog", "brd", "rng", "bst", "ber"]),
    ("caster", &["nec", "wiz", "mag", "enc"]),
];

// ---------------------------------------------------------------------------
// Operator settings
// ---------------------------------------------------------------------------

/// The full set of operator-tunable flags and timeouts.
///
/// A snapshot of this struct is what `Node::settings()` returns and what the
/// host veneer persists. Timeout changes made through `Node` setters are
/// forwarded to the live transport; flag changes take effect on the next
/// message that consults them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetSettings {
    /// Network interface to bind the transport beacon to. `None` lets the
    /// transport pick.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    /// Route a small set of diagnostic lines to the chat sink.
    pub debugging: bool,
    /// Echo outgoing tells and group tells on the local chat sink.
    pub local_echo: bool,
    /// Echo remotely-issued Execute commands on the receiving chat sink.
    pub command_echo: bool,
    /// Decorate group echoes with the group name.
    pub show_groups: bool,
    /// Display peers by full `<server>_<character>` name instead of the
    /// short character name.
    pub full_names: bool,
    /// Lead pipe-delimited arrays with the delimiter instead of trailing it.
    pub front_delimiter: bool,
    /// Whisper `Reupdate` to peers the transport reports as evasive, forcing
    /// them to re-emit every active observer on their next publish pass.
    pub evasive_refresh: bool,
    /// One-shot query timeout in milliseconds.
    pub query_timeout_ms: u64,
    /// Minimum interval between observer updates in milliseconds.
    pub observe_delay_ms: u64,
    /// Actor wake interval in milliseconds.
    pub keepalive_ms: u64,
    /// Transport evasive timeout in milliseconds.
    pub evasive_ms: u64,
    /// Transport expired timeout in milliseconds.
    pub expired_ms: u64,
}

impl Default for NetSettings {
    fn default() -> Self {
        Self {
            interface: None,
            debugging: false,
            local_echo: true,
            command_echo: true,
            show_groups: true,
            full_names: true,
            front_delimiter: false,
            evasive_refresh: false,
            query_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
            observe_delay_ms: DEFAULT_OBSERVE_DELAY_MS,
            keepalive_ms: DEFAULT_KEEPALIVE_MS,
            evasive_ms: DEFAULT_EVASIVE_MS,
            expired_ms: DEFAULT_EXPIRED_MS,
        }
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Milliseconds since the Unix epoch. All fabric timestamps (observation
/// arrival, publish gating, benchmarks) use this clock.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
