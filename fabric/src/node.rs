//! # Peer Node
//!
//! The concurrent state machine at the heart of the fabric. A [`Node`] owns
//! the local identity, the membership registry, the command dispatch tables,
//! the query and observer engines, and (while entered) the actor thread that
//! drives the transport. The host glue owns the `Node` value; there is no
//! global instance.
//!
//! ## Lifecycle
//!
//! ```text
//! new() -> enter() -> [tick()* , senders, readers] -> exit() -> enter() ...
//! ```
//!
//! `enter()` constructs a fresh transport through the factory and spins up
//! the actor; `exit()` terminates the actor, which departs every joined
//! group and stops the transport. Runtime tables are cleared on exit and
//! rebuilt by traffic after re-entry; the own-group intent set survives so
//! a re-entered node rejoins its channels.
//!
//! ## Threading
//!
//! Public methods are safe from any thread; the node never blocks a caller
//! beyond a short critical section. The one rule is that `enter()`/`exit()`
//! must not be invoked from inside a dispatched command handler, since the
//! actor cannot be torn down from its own delivery path. A reentrancy guard
//! enforces it.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actor::{Actor, ControlMsg};
use crate::commands::{self, Echo, Execute};
use crate::config::NetSettings;
use crate::dispatch::{CommandHandler, CommandQueue, RESPONSE_PREFIX};
use crate::error::{FabricError, TransportError};
use crate::host::{ChatSink, Evaluator};
use crate::membership::Membership;
use crate::name;
use crate::observe::{Observation, ObservedKey, ObserverSource};
use crate::query::QueryKey;
use crate::transport::TransportFactory;

/// How long `enter()` waits for the actor to signal ready.
const ACTOR_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Handle to one peer node. Cloning is cheap and every clone addresses the
/// same node.
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Arc<NodeInner>,
}

pub(crate) struct Session {
    pub control: mpsc::UnboundedSender<ControlMsg>,
    pub thread: Option<JoinHandle<()>>,
    pub uuid: Uuid,
}

pub(crate) struct NodeInner {
    pub server: String,
    pub name: String,
    pub settings: Arc<RwLock<NetSettings>>,
    pub registry: Arc<Membership>,
    pub evaluator: Arc<dyn Evaluator>,
    pub chat: Arc<dyn ChatSink>,
    pub factory: Arc<dyn TransportFactory>,

    // dispatch
    pub commands: Mutex<HashMap<String, CommandHandler>>,
    pub queue: Arc<CommandQueue>,
    pub response_counter: AtomicU32,
    pub dispatching: AtomicBool,

    // session
    pub session: Mutex<Option<Session>>,

    // query engine
    pub query_results: DashMap<QueryKey, Observation>,
    pub recent_query: Mutex<Option<QueryKey>>,

    // observer engine
    pub observer_map: Mutex<BTreeMap<u32, ObserverSource>>,
    pub publish_cache: Mutex<HashMap<String, String>>,
    pub observed_map: Mutex<BTreeMap<ObservedKey, String>>,
    pub observed_data: Mutex<HashMap<String, Observation>>,

    // housekeeping
    pub last_housekeeping: Mutex<u64>,
}

impl Node {
    /// Builds a node for `<server>_<character>` with the standard command
    /// suite registered. The node starts un-entered.
    pub fn new(
        server: &str,
        character: &str,
        settings: NetSettings,
        evaluator: Arc<dyn Evaluator>,
        chat: Arc<dyn ChatSink>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let server = server.to_lowercase();
        let local = name::full_name(&server, character);
        let node = Self {
            inner: Arc::new(NodeInner {
                server,
                name: local,
                settings: Arc::new(RwLock::new(settings)),
                registry: Arc::new(Membership::new()),
                evaluator,
                chat,
                factory,
                commands: Mutex::new(HashMap::new()),
                queue: Arc::new(CommandQueue::new()),
                response_counter: AtomicU32::new(0),
                dispatching: AtomicBool::new(false),
                session: Mutex::new(None),
                query_results: DashMap::new(),
                recent_query: Mutex::new(None),
                observer_map: Mutex::new(BTreeMap::new()),
                publish_cache: Mutex::new(HashMap::new()),
                observed_map: Mutex::new(BTreeMap::new()),
                observed_data: Mutex::new(HashMap::new()),
                last_housekeeping: Mutex::new(0),
            }),
        };
        commands::register_standard(&node);
        node
    }

    // -- identity -----------------------------------------------------------

    /// The canonical local peer name, `<server>_<character>`.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn server(&self) -> &str {
        &self.inner.server
    }

    /// Canonicalizes a raw peer name against the local server.
    pub fn full_name(&self, raw: &str) -> String {
        name::full_name(&self.inner.server, raw)
    }

    /// Display form of a full peer name, honoring the `full_names` flag.
    pub fn display_name(&self, full: &str) -> String {
        if self.settings().full_names {
            full.to_string()
        } else {
            name::short_name(&self.inner.server, full)
        }
    }

    // -- lifecycle -----------------------------------------------------------

    /// Joins the fabric: constructs a transport through the factory and
    /// starts the actor thread. Fails if already entered, if called from a
    /// command handler, or if the transport cannot be constructed; the last
    /// leaves the node un-entered for an explicit retry.
    pub fn enter(&self) -> Result<(), FabricError> {
        if self.inner.dispatching.load(Ordering::SeqCst) {
            return Err(FabricError::Reentrant);
        }
        let mut session = self.inner.session.lock();
        if session.is_some() {
            return Err(FabricError::AlreadyEntered);
        }

        let interface = self.settings().interface;
        let transport = self
            .inner
            .factory
            .start(&self.inner.name, interface.as_deref())?;
        let uuid = transport.uuid();

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);
        let actor = Actor::new(
            self.inner.name.clone(),
            transport,
            control_rx,
            ready_tx,
            Arc::clone(&self.inner.registry),
            Arc::clone(&self.inner.queue),
            Arc::clone(&self.inner.settings),
        );
        let thread = std::thread::Builder::new()
            .name(format!("{}-actor", self.inner.name))
            .spawn(move || actor.run())
            .map_err(|err| TransportError::Construct(err.to_string()))?;

        if ready_rx.recv_timeout(ACTOR_STARTUP_TIMEOUT).is_err() {
            // Dropping the control sender unblocks the actor if it is still
            // alive; it will depart and stop the transport on its own.
            warn!(peer = %self.inner.name, "actor did not signal ready");
            return Err(FabricError::ActorStartup);
        }

        *session = Some(Session {
            control: control_tx,
            thread: Some(thread),
            uuid,
        });
        info!(peer = %self.inner.name, %uuid, "entered the fabric");
        Ok(())
    }

    /// Leaves the fabric: terminates the actor (which departs every joined
    /// group and stops the transport) and clears the runtime tables. A
    /// no-op when not entered; ignored with a warning inside a handler.
    pub fn exit(&self) {
        if self.inner.dispatching.load(Ordering::SeqCst) {
            warn!(peer = %self.inner.name, "exit() invoked from a command handler; ignoring");
            return;
        }
        let Some(mut session) = self.inner.session.lock().take() else {
            return;
        };
        let _ = session.control.send(ControlMsg::Term);
        if let Some(thread) = session.thread.take() {
            if thread.join().is_err() {
                warn!(peer = %self.inner.name, "actor thread panicked");
            }
        }
        self.clear_runtime_state();
        info!(peer = %self.inner.name, "left the fabric");
    }

    pub fn entered(&self) -> bool {
        self.inner.session.lock().is_some()
    }

    /// The transport identity of the current session.
    pub fn uuid(&self) -> Option<Uuid> {
        self.inner.session.lock().as_ref().map(|s| s.uuid)
    }

    /// Drops everything a session accumulated: queued commands, live
    /// response handlers, observers on both sides, query results, and the
    /// peer-facing membership tables. Group intent survives for re-entry.
    fn clear_runtime_state(&self) {
        self.inner.registry.clear_peers();
        self.inner.queue.clear();
        self.inner
            .commands
            .lock()
            .retain(|tag, _| !tag.starts_with(RESPONSE_PREFIX));
        self.inner.query_results.clear();
        *self.inner.recent_query.lock() = None;
        self.inner.observer_map.lock().clear();
        self.inner.publish_cache.lock().clear();
        self.inner.observed_map.lock().clear();
        self.inner.observed_data.lock().clear();
    }

    // -- host tick ------------------------------------------------------------

    /// One host pulse: dispatch at most one queued command, run a publish
    /// pass, and (rate-limited internally) a housekeeping pass.
    pub fn tick(&self) {
        self.do_next();
        self.publish();
        self.housekeep();
    }

    // -- groups ---------------------------------------------------------------

    /// Joins a group. Idempotent; takes effect on the fabric once the actor
    /// drains the pipe, immediately in the intent set.
    pub fn join(&self, group: &str) {
        let group = group.to_lowercase();
        if self.inner.registry.add_own(&group) {
            self.send_control(ControlMsg::Join(group));
        }
    }

    /// Leaves a group. Idempotent.
    pub fn leave(&self, group: &str) {
        let group = group.to_lowercase();
        if self.inner.registry.remove_own(&group) {
            self.send_control(ControlMsg::Leave(group));
        }
    }

    // -- senders --------------------------------------------------------------

    /// Whispers a chat line to one peer.
    pub fn tell(&self, peer: &str, text: &str) {
        let target = self.full_name(peer);
        if self.settings().local_echo {
            self.chat_line(&format!("[ --> ({}) ] {}", self.display_name(&target), text));
        }
        self.whisper_payload(&target, Echo::payload(text));
    }

    /// Shouts a chat line to a group.
    pub fn tell_group(&self, group: &str, text: &str) {
        let group = group.to_lowercase();
        if self.settings().local_echo {
            self.chat_line(&format!("[ --> ({}) ] {}", group, text));
        }
        self.shout_payload(&group, Echo::payload(text));
    }

    /// Whispers a command line for the target peer's host parser.
    pub fn execute(&self, peer: &str, command: &str) {
        let target = self.full_name(peer);
        if self.settings().local_echo {
            self.chat_line(&format!(
                "[ --> ({}) ] => {}",
                self.display_name(&target),
                command
            ));
        }
        self.whisper_payload(&target, Execute::payload(command));
    }

    /// Shouts a command line for every group member's host parser.
    pub fn execute_group(&self, group: &str, command: &str) {
        let group = group.to_lowercase();
        if self.settings().local_echo {
            self.chat_line(&format!("[ --> ({}) ] => {}", group, command));
        }
        self.shout_payload(&group, Execute::payload(command));
    }

    pub(crate) fn whisper_payload(&self, peer: &str, payload: Bytes) {
        self.send_control(ControlMsg::Whisper {
            peer: peer.to_string(),
            payload,
        });
    }

    pub(crate) fn shout_payload(&self, group: &str, payload: Bytes) {
        self.send_control(ControlMsg::Shout {
            group: group.to_string(),
            payload,
        });
    }

    pub(crate) fn send_control(&self, msg: ControlMsg) {
        if let Some(session) = self.inner.session.lock().as_ref() {
            if session.control.send(msg).is_err() {
                debug!(peer = %self.inner.name, "actor pipe closed; dropping control message");
            }
        }
    }

    // -- membership snapshots -------------------------------------------------

    /// Every known peer including the local one, sorted.
    pub fn peers(&self) -> Vec<String> {
        let mut peers = self.inner.registry.connected_peers();
        peers.push(self.inner.name.clone());
        peers.sort();
        peers.dedup();
        peers
    }

    pub fn peer_count(&self) -> usize {
        self.peers().len()
    }

    /// True when the (canonicalized) peer is connected or is the local peer.
    pub fn has_peer(&self, raw: &str) -> bool {
        let full = self.full_name(raw);
        full == self.inner.name || self.inner.registry.has_peer(&full)
    }

    /// Every group visible on the fabric, own or remote, sorted.
    pub fn groups(&self) -> Vec<String> {
        self.inner.registry.all_groups()
    }

    /// The groups this node has joined, sorted.
    pub fn own_groups(&self) -> Vec<String> {
        self.inner.registry.own_groups()
    }

    /// Members of a group, including the local peer when it has joined.
    pub fn group_peers(&self, group: &str) -> Vec<String> {
        let group = group.to_lowercase();
        let mut members = self.inner.registry.group_members(&group);
        if self.inner.registry.is_own(&group) {
            members.push(self.inner.name.clone());
            members.sort();
            members.dedup();
        }
        members
    }

    /// Multi-line summary of the node: identity, peers, groups, rosters.
    pub fn info(&self) -> String {
        let mut out = String::new();
        match self.uuid() {
            Some(uuid) => {
                let _ = writeln!(out, "{} {}", self.inner.name, uuid);
            }
            None => {
                let _ = writeln!(out, "{} (not entered)", self.inner.name);
            }
        }
        out.push_str("PEERS:");
        for peer in self.peers() {
            let _ = write!(out, "\n --> {peer}");
        }
        out.push_str("\nGROUPS:");
        for group in self.own_groups() {
            let _ = write!(out, "\n --> {group}");
        }
        out.push_str("\nGROUP PEERS:");
        for (group, members) in self.inner.registry.group_rosters() {
            let _ = write!(out, "\n :: {group}");
            for member in members {
                let _ = write!(out, "\n --> {member}");
            }
        }
        out
    }

    // -- settings -------------------------------------------------------------

    /// A snapshot of the operator settings.
    pub fn settings(&self) -> NetSettings {
        self.inner.settings.read().clone()
    }

    /// Mutates the operator settings. Changes to the transport liveness
    /// knobs are forwarded to the live transport.
    pub fn update_settings<F: FnOnce(&mut NetSettings)>(&self, f: F) {
        let (old_evasive, old_expired, new_evasive, new_expired) = {
            let mut settings = self.inner.settings.write();
            let old = (settings.evasive_ms, settings.expired_ms);
            f(&mut settings);
            (old.0, old.1, settings.evasive_ms, settings.expired_ms)
        };
        if new_evasive != old_evasive {
            self.send_control(ControlMsg::SetEvasive(new_evasive));
        }
        if new_expired != old_expired {
            self.send_control(ControlMsg::SetExpired(new_expired));
        }
    }

    // -- host port access -----------------------------------------------------

    pub(crate) fn evaluator(&self) -> &dyn Evaluator {
        self.inner.evaluator.as_ref()
    }

    pub(crate) fn chat_line(&self, text: &str) {
        self.inner.chat.line(text);
    }

    /// Routes a diagnostic line to chat when the `debugging` flag is on.
    pub(crate) fn debug_chat(&self, text: &str) {
        if self.settings().debugging {
            self.inner.chat.line(text);
        }
    }
}

impl Drop for NodeInner {
    fn drop(&mut self) {
        // Last handle gone: ask a still-running actor to wind down. The
        // thread is detached here; it departs and stops on its own.
        if let Some(session) = self.session.lock().as_ref() {
            let _ = session.control.send(ControlMsg::Term);
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.inner.name)
            .field("entered", &self.entered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_node, NullEvaluator, RecordingSink};
    use crate::transport::memory::MemoryFabric;

    #[test]
    fn node_starts_unentered_with_standard_commands() {
        let (node, _sink) = test_node("luclin", "alice", MemoryFabric::new());
        assert!(!node.entered());
        assert_eq!(node.name(), "luclin_alice");
        let commands = node.inner.commands.lock();
        for tag in ["Echo", "Execute", "Query", "Observe", "Update", "Reupdate"] {
            assert!(commands.contains_key(tag), "missing standard command {tag}");
        }
    }

    #[test]
    fn enter_exit_round_trip() {
        let fabric = MemoryFabric::new();
        let (node, _sink) = test_node("luclin", "alice", fabric.clone());

        node.enter().unwrap();
        assert!(node.entered());
        assert!(node.uuid().is_some());
        assert!(matches!(node.enter(), Err(FabricError::AlreadyEntered)));
        assert_eq!(fabric.peer_names(), vec!["luclin_alice"]);

        node.exit();
        assert!(!node.entered());
        assert!(fabric.peer_names().is_empty());

        // Re-entry constructs a fresh session.
        node.enter().unwrap();
        assert!(node.entered());
        node.exit();
    }

    #[test]
    fn duplicate_name_on_the_fabric_fails_enter() {
        let fabric = MemoryFabric::new();
        let (a, _s1) = test_node("luclin", "alice", fabric.clone());
        let (b, _s2) = test_node("luclin", "alice", fabric.clone());
        a.enter().unwrap();
        assert!(matches!(b.enter(), Err(FabricError::Transport(_))));
        assert!(!b.entered());
        a.exit();
    }

    #[test]
    fn peers_always_include_the_local_peer() {
        let (node, _sink) = test_node("luclin", "alice", MemoryFabric::new());
        assert_eq!(node.peers(), vec!["luclin_alice"]);
        assert_eq!(node.peer_count(), 1);
        assert!(node.has_peer("alice"), "local peer is always known");
        assert!(!node.has_peer("bob"));
    }

    #[test]
    fn group_intent_survives_exit() {
        let fabric = MemoryFabric::new();
        let (node, _sink) = test_node("luclin", "alice", fabric);
        node.enter().unwrap();
        node.join("All");
        node.join("tank");
        node.leave("TANK");
        assert_eq!(node.own_groups(), vec!["all"]);
        node.exit();
        assert_eq!(node.own_groups(), vec!["all"]);
    }

    #[test]
    fn local_echo_flag_gates_outgoing_echo() {
        let fabric = MemoryFabric::new();
        let sink = Arc::new(RecordingSink::default());
        let node = Node::new(
            "luclin",
            "alice",
            NetSettings::default(),
            Arc::new(NullEvaluator),
            sink.clone(),
            Arc::new(fabric),
        );
        node.tell("bob", "hi");
        assert_eq!(sink.lines(), vec!["[ --> (luclin_bob) ] hi"]);

        node.update_settings(|s| s.local_echo = false);
        node.tell("bob", "again");
        assert_eq!(sink.lines().len(), 1);
    }

    #[test]
    fn display_name_honors_full_names_flag() {
        let (node, _sink) = test_node("luclin", "alice", MemoryFabric::new());
        assert_eq!(node.display_name("luclin_bob"), "luclin_bob");
        node.update_settings(|s| s.full_names = false);
        assert_eq!(node.display_name("luclin_bob"), "bob");
        assert_eq!(node.display_name("drinal_bob"), "drinal_bob");
    }

    #[test]
    fn info_renders_identity_and_tables() {
        let (node, _sink) = test_node("luclin", "alice", MemoryFabric::new());
        let info = node.info();
        assert!(info.starts_with("luclin_alice (not entered)"));
        assert!(info.contains("PEERS:"));
        assert!(info.contains(" --> luclin_alice"));
        assert!(info.contains("GROUPS:"));
    }
}
