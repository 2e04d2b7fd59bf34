//! Shared fixtures for the in-crate unit tests: a scripted evaluator over a
//! plain variable map, a chat sink that records lines, and node builders
//! wiring them to a memory fabric.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::NetSettings;
use crate::host::{ChatSink, Evaluator};
use crate::node::Node;
use crate::transport::memory::MemoryFabric;

/// An evaluator that refuses everything. For tests that never evaluate.
pub(crate) struct NullEvaluator;

impl Evaluator for NullEvaluator {
    fn evaluate(&self, _expr: &str) -> Option<String> {
        None
    }
    fn assign(&self, _sink: &str, _value: &str) -> bool {
        false
    }
    fn sink_exists(&self, _sink: &str) -> bool {
        false
    }
    fn execute(&self, _command: &str) {}
}

/// A variable-map evaluator: expressions resolve to the variable of the
/// same name, assignment writes variables, and executed commands are
/// recorded for inspection.
#[derive(Default)]
pub(crate) struct VarEvaluator {
    vars: DashMap<String, String>,
    executed: Mutex<Vec<String>>,
}

impl VarEvaluator {
    pub fn set(&self, key: &str, value: &str) {
        self.vars.insert(key.to_string(), value.to_string());
    }

    pub fn unset(&self, key: &str) {
        self.vars.remove(key);
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.vars.get(key).map(|v| v.clone())
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }
}

impl Evaluator for VarEvaluator {
    fn evaluate(&self, expr: &str) -> Option<String> {
        self.get(expr)
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

    fn group_leader(&self) -> Option<String> {
        self.get("Group.Leader")
    }

    fn raid_leader(&self) -> Option<String> {
        self.get("Raid.Leader")
    }

    fn zone(&self) -> Option<String> {
        self.get("Zone.ShortName")
    }

    fn class_code(&self) -> Option<String> {
        self.get("Me.Class")
    }
}

/// A chat sink that appends every line to a vector.
#[derive(Default)]
pub(crate) struct RecordingSink {
    lines: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl ChatSink for RecordingSink {
    fn line(&self, text: &str) {
        self.lines.lock().push(text.to_string());
    }
}

/// A node over a null evaluator and a recording sink.
pub(crate) fn test_node(
    server: &str,
    character: &str,
    fabric: MemoryFabric,
) -> (Node, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let node = Node::new(
        server,
        character,
        NetSettings::default(),
        Arc::new(NullEvaluator),
        sink.clone(),
        Arc::new(fabric),
    );
    (node, sink)
}

/// A node over a variable-map evaluator and a recording sink.
pub(crate) fn test_node_with_vars(
    server: &str,
    character: &str,
    fabric: MemoryFabric,
) -> (Node, Arc<VarEvaluator>, Arc<RecordingSink>) {
    let eval = Arc::new(VarEvaluator::default());
    let sink = Arc::new(RecordingSink::default());
    let node = Node::new(
        server,
        character,
        NetSettings::default(),
        eval.clone(),
        sink.clone(),
        Arc::new(fabric),
    );
    (node, eval, sink)
}
