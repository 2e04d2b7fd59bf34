//! End-to-end scenarios for the WEAVE fabric.
//!
//! Every test spins real nodes on an in-process memory fabric: actor
//! threads, transport events, command dispatch, and both observer engines
//! all run exactly as they would over a production gossip layer. The host
//! tick is driven manually (dispatch + publish) so the scenarios control
//! their own pacing; housekeeping has its own scenario at the end.
//!
//! Each test stands alone with its own fabric. No shared state, no test
//! ordering dependencies.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use weave_fabric::transport::memory::MemoryFabric;
use weave_fabric::{ChatSink, Evaluator, NetSettings, Node};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

/// Variable-map evaluator with just enough arithmetic for the scenarios:
/// an expression resolves to the variable of the same name, or, failing
/// that, to the sum of its `+`-separated integer terms.
#[derive(Default)]
struct TestEvaluator {
    vars: DashMap<String, String>,
    executed: Mutex<Vec<String>>,
}

impl TestEvaluator {
    fn set(&self, key: &str, value: &str) {
        self.vars.insert(key.to_string(), value.to_string());
    }

    fn get(&self, key: &str) -> Option<String> {
        self.vars.get(key).map(|v| v.clone())
    }

    fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }
}

impl Evaluator for TestEvaluator {
    fn evaluate(&self, expr: &str) -> Option<String> {
        if let Some(value) = self.get(expr) {
            return Some(value);
        }
        let terms: Option<Vec<i64>> = expr.split('+').map(|t| t.trim().parse().ok()).collect();
        terms.map(|t| t.iter().sum::<i64>().to_string())
    }

    fn assign(&self, sink: &str, value: &str) -> bool {
        self.set(sink, value);
        true
    }

    fn sink_exists(&self, sink: &str) -> bool {
        self.vars.contains_key(sink)
    }

    fn execute(&self, command: &str) {
        self.executed.lock().push(command.to_string());
    }

    fn class_code(&self) -> Option<String> {
        self.get("Me.Class")
    }
}

#[derive(Default)]
struct RecordingSink {
    lines: Mutex<Vec<String>>,
}

impl RecordingSink {
    fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl ChatSink for RecordingSink {
    fn line(&self, text: &str) {
        self.lines.lock().push(text.to_string());
    }
}

struct Peer {
    node: Node,
    eval: Arc<TestEvaluator>,
    sink: Arc<RecordingSink>,
}

/// Builds and enters a peer on the shared fabric. Observe delay is dropped
/// to 10 ms so observer scenarios converge quickly.
fn spawn_peer(fabric: &MemoryFabric, character: &str) -> Peer {
    let eval = Arc::new(TestEvaluator::default());
    let sink = Arc::new(RecordingSink::default());
    let settings = NetSettings {
        observe_delay_ms: 10,
        ..NetSettings::default()
    };
    let node = Node::new(
        "luclin",
        character,
        settings,
        eval.clone(),
        sink.clone(),
        Arc::new(fabric.clone()),
    );
    node.enter().expect("enter fabric");
    Peer { node, eval, sink }
}

/// One manual host pulse for every peer: drain the command queue, run a
/// publish pass.
fn pulse(peers: &[&Peer]) {
    for peer in peers {
        while peer.node.do_next() {}
        peer.node.publish();
    }
}

/// Pulses everyone until `cond` holds or the deadline passes.
fn settle(peers: &[&Peer], timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        pulse(peers);
        if cond() {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn assert_settles(peers: &[&Peer], what: &str, cond: impl Fn() -> bool) {
    assert!(
        settle(peers, Duration::from_secs(2), cond),
        "timed out waiting for: {what}"
    );
}

// ---------------------------------------------------------------------------
// 1. Discovery & membership
// ---------------------------------------------------------------------------

#[test]
fn peers_discover_each_other_and_exits_propagate() {
    let fabric = MemoryFabric::new();
    let a = spawn_peer(&fabric, "alice");
    let b = spawn_peer(&fabric, "bob");

    assert_settles(&[&a, &b], "mutual discovery", || {
        a.node.has_peer("bob") && b.node.has_peer("alice")
    });
    assert_eq!(a.node.peers(), vec!["luclin_alice", "luclin_bob"]);

    b.node.exit();
    assert_settles(&[&a], "exit propagation", || !a.node.has_peer("bob"));
    assert_eq!(a.node.peers(), vec!["luclin_alice"]);
}

#[test]
fn group_rosters_converge_across_peers() {
    let fabric = MemoryFabric::new();
    let a = spawn_peer(&fabric, "alice");
    let b = spawn_peer(&fabric, "bob");

    a.node.join("all");
    b.node.join("all");
    assert_settles(&[&a, &b], "roster convergence", || {
        a.node.group_peers("all") == vec!["luclin_alice", "luclin_bob"]
            && b.node.group_peers("all") == vec!["luclin_alice", "luclin_bob"]
    });

    b.node.leave("all");
    assert_settles(&[&a, &b], "leave convergence", || {
        a.node.group_peers("all") == vec!["luclin_alice"]
    });
}

// ---------------------------------------------------------------------------
// 2. Echo whisper & shout
// ---------------------------------------------------------------------------

#[test]
fn echo_whisper_reaches_one_peer() {
    let fabric = MemoryFabric::new();
    let a = spawn_peer(&fabric, "alice");
    let b = spawn_peer(&fabric, "bob");
    assert_settles(&[&a, &b], "discovery", || a.node.has_peer("bob"));

    a.node.tell("luclin_bob", "hi");
    assert_settles(&[&a, &b], "echo delivery", || {
        b.sink.lines().contains(&"[ luclin_alice ] hi".to_string())
    });

    // Whispers change no membership state on either side.
    assert_eq!(a.node.peers(), b.node.peers());
    assert!(a.node.own_groups().is_empty());
}

#[test]
fn echo_shout_reaches_the_group_with_local_echo() {
    let fabric = MemoryFabric::new();
    let a = spawn_peer(&fabric, "alice");
    let b = spawn_peer(&fabric, "bob");
    a.node.join("all");
    b.node.join("all");
    assert_settles(&[&a, &b], "roster", || {
        a.node.group_peers("all").len() == 2
    });

    a.node.tell_group("all", "hello");
    let expected = "[ --> (all) ] hello".to_string();
    assert_settles(&[&a, &b], "shout delivery", || {
        b.sink.lines().contains(&expected)
    });
    // The sender sees the identical line through local echo.
    assert!(a.sink.lines().contains(&expected));
}

// ---------------------------------------------------------------------------
// 3. Remote execute
// ---------------------------------------------------------------------------

#[test]
fn execute_runs_on_the_target_host() {
    let fabric = MemoryFabric::new();
    let a = spawn_peer(&fabric, "alice");
    let b = spawn_peer(&fabric, "bob");
    assert_settles(&[&a, &b], "discovery", || a.node.has_peer("bob"));

    a.node.execute("bob", "/echo $\\{Me.HP}");
    assert_settles(&[&a, &b], "execute delivery", || {
        b.eval.executed() == vec!["/echo ${Me.HP}".to_string()]
    });
    // command_echo is on by default: the receiver announces the run.
    assert!(b
        .sink
        .lines()
        .contains(&"[ luclin_alice ] => /echo ${Me.HP}".to_string()));
}

// ---------------------------------------------------------------------------
// 4. Query
// ---------------------------------------------------------------------------

#[test]
fn query_round_trip_within_the_timeout() {
    let fabric = MemoryFabric::new();
    let a = spawn_peer(&fabric, "alice");
    let b = spawn_peer(&fabric, "bob");
    assert_settles(&[&a, &b], "discovery", || a.node.has_peer("bob"));

    a.node.query("luclin_bob", "1+2", None);
    assert_settles(&[&a, &b], "query reply", || {
        a.node
            .read_query("luclin_bob", "1+2")
            .is_some_and(|obs| obs.received_at > 0)
    });
    assert_eq!(a.node.read_query("luclin_bob", "1+2").unwrap().value, "3");

    // Re-querying the same expression overwrites the slot.
    b.eval.set("1+2", "overridden");
    a.node.query("luclin_bob", "1+2", None);
    assert_settles(&[&a, &b], "second reply", || {
        a.node
            .read_query("luclin_bob", "1+2")
            .is_some_and(|obs| obs.value == "overridden")
    });
}

#[test]
fn query_with_sink_writes_the_host_variable() {
    let fabric = MemoryFabric::new();
    let a = spawn_peer(&fabric, "alice");
    let b = spawn_peer(&fabric, "bob");
    b.eval.set("Me.HP", "88");
    assert_settles(&[&a, &b], "discovery", || a.node.has_peer("bob"));

    a.node.query("bob", "Me.HP", Some("hp_b"));
    assert_settles(&[&a, &b], "sink write", || {
        a.eval.get("hp_b").as_deref() == Some("88")
    });
}

#[test]
fn self_query_needs_no_transport_traffic() {
    let fabric = MemoryFabric::new();
    let a = spawn_peer(&fabric, "alice");
    a.eval.set("Me.HP", "55");

    // No pulses at all: the result must be there synchronously.
    a.node.query("alice", "Me.HP", Some("hp"));
    let obs = a.node.read_query("alice", "Me.HP").unwrap();
    assert_eq!(obs.value, "55");
    assert!(obs.received_at > 0);
    assert_eq!(a.eval.get("hp").as_deref(), Some("55"));
}

// ---------------------------------------------------------------------------
// 5. Observe life-cycle
// ---------------------------------------------------------------------------

#[test]
fn observe_lifecycle_updates_suppression_and_drop() {
    let fabric = MemoryFabric::new();
    let a = spawn_peer(&fabric, "alice");
    let b = spawn_peer(&fabric, "bob");
    b.eval.set("Me.HP", "100");
    assert_settles(&[&a, &b], "discovery", || a.node.has_peer("bob"));

    // Start observing: the reply joins a group of the form luclin_bob_<k>
    // and pre-applies the initial value.
    a.node.observe("luclin_bob", "Me.HP", Some("hp_b"));
    assert_settles(&[&a, &b], "initial observation", || {
        a.eval.get("hp_b").as_deref() == Some("100")
    });
    let (_, _, group) = a.node.observations().pop().expect("one observation");
    assert!(group.starts_with("luclin_bob_"));
    assert!(a.node.own_groups().contains(&group));

    // A value change propagates on the next due publish pass.
    b.eval.set("Me.HP", "105");
    assert_settles(&[&a, &b], "value change", || {
        a.eval.get("hp_b").as_deref() == Some("105")
    });

    // Identical values are suppressed: the arrival clock stops advancing.
    // First flush any in-flight re-emission of the current value, then
    // verify a quiet window leaves the clock untouched.
    let _ = settle(&[&a, &b], Duration::from_millis(150), || false);
    let before = a
        .node
        .read_observation("luclin_bob", "Me.HP")
        .unwrap()
        .received_at;
    let _ = settle(&[&a, &b], Duration::from_millis(200), || false);
    let after = a
        .node
        .read_observation("luclin_bob", "Me.HP")
        .unwrap()
        .received_at;
    assert_eq!(before, after, "unchanged value must not re-emit");

    // Dropping the observation leaves the group and stops updates.
    a.node.forget("luclin_bob", "Me.HP");
    assert!(!a.node.own_groups().contains(&group));
    b.eval.set("Me.HP", "110");
    let _ = settle(&[&a, &b], Duration::from_millis(150), || false);
    assert!(a.node.read_observation("luclin_bob", "Me.HP").is_none());
    assert_eq!(a.eval.get("hp_b").as_deref(), Some("105"), "sink is frozen");
}

#[test]
fn two_observers_of_one_expression_share_a_group() {
    let fabric = MemoryFabric::new();
    let a = spawn_peer(&fabric, "alice");
    let b = spawn_peer(&fabric, "bob");
    let c = spawn_peer(&fabric, "carol");
    b.eval.set("Me.HP", "70");
    assert_settles(&[&a, &b, &c], "discovery", || {
        a.node.has_peer("bob") && c.node.has_peer("bob")
    });

    a.node.observe("bob", "Me.HP", Some("hp"));
    c.node.observe("bob", "Me.HP", Some("hp"));
    assert_settles(&[&a, &b, &c], "both observations live", || {
        a.eval.get("hp").as_deref() == Some("70") && c.eval.get("hp").as_deref() == Some("70")
    });

    let (_, _, group_a) = a.node.observations().pop().unwrap();
    let (_, _, group_c) = c.node.observations().pop().unwrap();
    assert_eq!(group_a, group_c, "source reuses the slot per expression");

    // Both consumers keep receiving changes.
    b.eval.set("Me.HP", "71");
    assert_settles(&[&a, &b, &c], "fanout", || {
        a.eval.get("hp").as_deref() == Some("71") && c.eval.get("hp").as_deref() == Some("71")
    });
}

// ---------------------------------------------------------------------------
// 6. Evasive refresh
// ---------------------------------------------------------------------------

#[test]
fn evasive_peer_triggers_reupdate_resync() {
    let fabric = MemoryFabric::new();
    let a = spawn_peer(&fabric, "alice");
    let b = spawn_peer(&fabric, "bob");
    a.node.update_settings(|s| s.evasive_refresh = true);
    b.eval.set("Me.HP", "100");
    assert_settles(&[&a, &b], "discovery", || a.node.has_peer("bob"));

    a.node.observe("bob", "Me.HP", None);
    assert_settles(&[&a, &b], "initial observation", || {
        a.node
            .read_observation("bob", "Me.HP")
            .is_some_and(|obs| obs.value == "100")
    });
    // Let the steady state settle so suppression is in effect.
    let _ = settle(&[&a, &b], Duration::from_millis(100), || false);
    let before = a.node.read_observation("bob", "Me.HP").unwrap().received_at;

    // The transport flags bob as evasive on alice's side. With
    // evasive_refresh on, alice whispers Reupdate and bob's next publish
    // pass re-emits the unchanged value.
    fabric.inject_evasive("luclin_bob");
    assert_settles(&[&a, &b], "forced re-emission", || {
        a.node
            .read_observation("bob", "Me.HP")
            .is_some_and(|obs| obs.received_at > before)
    });
    assert_eq!(
        a.node.read_observation("bob", "Me.HP").unwrap().value,
        "100"
    );
}

// ---------------------------------------------------------------------------
// 7. Settings & housekeeping
// ---------------------------------------------------------------------------

#[test]
fn liveness_knobs_are_forwarded_to_the_transport() {
    let fabric = MemoryFabric::new();
    let a = spawn_peer(&fabric, "alice");
    assert_eq!(fabric.liveness_of("luclin_alice"), Some((5_000, 30_000)));

    a.node.update_settings(|s| {
        s.evasive_ms = 750;
        s.expired_ms = 9_000;
    });
    assert_settles(&[&a], "knob forwarding", || {
        fabric.liveness_of("luclin_alice") == Some((750, 9_000))
    });
}

#[test]
fn housekeeping_joins_contextual_and_role_groups() {
    let fabric = MemoryFabric::new();
    let a = spawn_peer(&fabric, "alice");
    a.eval.set("Me.Class", "WAR");

    // The first tick runs a housekeeping pass immediately.
    a.node.tick();
    let own = a.node.own_groups();
    assert!(own.contains(&"all".to_string()));
    assert!(own.contains(&"war".to_string()));
    assert!(own.contains(&"tank".to_string()));
    assert!(!own.contains(&"priest".to_string()));
}
