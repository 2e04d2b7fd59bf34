//! # Demo Evaluator & Console Sink
//!
//! The host side of the fabric's two ports, console edition. The evaluator
//! is a variable store with integer arithmetic: enough to make queries and
//! observations demonstrable (`set Me.HP 100` on one peer, observe
//! `Me.HP` or query `1+2` from another) without dragging in a macro
//! language. The sink prints timestamped chat lines tagged with the hosted
//! peer they belong to.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use weave_fabric::{ChatSink, Evaluator};

// ---------------------------------------------------------------------------
// Expression parsing
// ---------------------------------------------------------------------------

/// Recursive-descent parser for integer expressions: `+ - * /`, parentheses,
/// unary minus, integer literals, and identifiers resolved through the
/// variable store. Division by zero and overflow refuse the expression.
struct ExprParser<'a> {
    src: &'a [u8],
    pos: usize,
    vars: &'a DashMap<String, String>,
}

impl<'a> ExprParser<'a> {
    fn new(src: &'a str, vars: &'a DashMap<String, String>) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
            vars,
        }
    }

    fn parse(mut self) -> Option<i64> {
        let value = self.expr()?;
        self.skip_ws();
        if self.pos == self.src.len() {
            Some(value)
        } else {
            None
        }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.src.len() && self.src[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.src.get(self.pos).copied()
    }

    fn expr(&mut self) -> Option<i64> {
        let mut acc = self.term()?;
        loop {
            match self.peek() {
                Some(b'+') => {
                    self.pos += 1;
                    acc = acc.checked_add(self.term()?)?;
                }
                Some(b'-') => {
                    self.pos += 1;
                    acc = acc.checked_sub(self.term()?)?;
                }
                _ => return Some(acc),
            }
        }
    }

    fn term(&mut self) -> Option<i64> {
        let mut acc = self.factor()?;
        loop {
            match self.peek() {
                Some(b'*') => {
                    self.pos += 1;
                    acc = acc.checked_mul(self.factor()?)?;
                }
                Some(b'/') => {
                    self.pos += 1;
                    acc = acc.checked_div(self.factor()?)?;
                }
                _ => return Some(acc),
            }
        }
    }

    fn factor(&mut self) -> Option<i64> {
        match self.peek()? {
            b'-' => {
                self.pos += 1;
                self.factor()?.checked_neg()
            }
            b'(' => {
                self.pos += 1;
                let inner = self.expr()?;
                if self.peek()? != b')' {
                    return None;
                }
                self.pos += 1;
                Some(inner)
            }
            c if c.is_ascii_digit() => self.number(),
            c if c.is_ascii_alphabetic() || c == b'_' => self.identifier(),
            _ => None,
        }
    }

    fn number(&mut self) -> Option<i64> {
        let start = self.pos;
        while self.pos < self.src.len() && self.src[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        std::str::from_utf8(&self.src[start..self.pos])
            .ok()?
            .parse()
            .ok()
    }

    fn identifier(&mut self) -> Option<i64> {
        let start = self.pos;
        while self.pos < self.src.len() {
            let c = self.src[self.pos];
            if c.is_ascii_alphanumeric() || c == b'_' || c == b'.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let name = std::str::from_utf8(&self.src[start..self.pos]).ok()?;
        self.vars.get(name)?.parse().ok()
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// The console's variable store and expression evaluator.
///
/// Expressions resolve in two steps: an exact variable hit returns the
/// stored string verbatim (so non-numeric values work), anything else is
/// parsed as integer arithmetic with identifiers read from the store.
pub struct DemoEvaluator {
    peer: String,
    vars: DashMap<String, String>,
    sink: Arc<dyn ChatSink>,
}

impl DemoEvaluator {
    pub fn new(peer: &str, sink: Arc<dyn ChatSink>) -> Self {
        Self {
            peer: peer.to_string(),
            vars: DashMap::new(),
            sink,
        }
    }

    pub fn set(&self, key: &str, value: &str) {
        self.vars.insert(key.to_string(), value.to_string());
    }

    pub fn unset(&self, key: &str) {
        self.vars.remove(key);
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.vars.get(key).map(|v| v.clone())
    }

    /// `(name, value)` snapshot of the store, sorted by name.
    pub fn vars(&self) -> Vec<(String, String)> {
        let mut all: Vec<(String, String)> = self
            .vars
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort();
        all
    }
}

impl Evaluator for DemoEvaluator {
    fn evaluate(&self, expr: &str) -> Option<String> {
        let expr = expr.trim();
        if let Some(value) = self.get(expr) {
            return Some(value);
        }
        ExprParser::new(expr, &self.vars)
            .parse()
            .map(|v| v.to_string())
    }

    fn assign(&self, sink: &str, value: &str) -> bool {
        self.set(sink, value);
        true
    }

    fn sink_exists(&self, sink: &str) -> bool {
        self.vars.contains_key(sink)
    }

    /// The console's command parser: `set`, `unset`, and `echo`, with an
    /// optional leading slash the way remote hosts send them.
    fn execute(&self, command: &str) {
        let line = command.trim();
        let line = line.strip_prefix('/').unwrap_or(line);
        let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
        match verb {
            "set" => match rest.split_once(' ') {
                Some((name, value)) => self.set(name, value.trim()),
                None => self.sink.line("usage: set <var> <value>"),
            },
            "unset" if !rest.is_empty() => self.unset(rest.trim()),
            "echo" => self.sink.line(rest),
            _ => {
                debug!(peer = %self.peer, %line, "unrecognized remote command");
                self.sink.line(&format!("unrecognized command: {line}"));
            }
        }
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

// ---------------------------------------------------------------------------
// Console sink
// ---------------------------------------------------------------------------

/// Prints chat lines to stdout, timestamped and tagged with the hosted
/// peer they belong to.
pub struct ConsoleSink {
    peer: String,
}

impl ConsoleSink {
    pub fn new(peer: &str) -> Self {
        Self {
            peer: peer.to_string(),
        }
    }
}

impl ChatSink for ConsoleSink {
    fn line(&self, text: &str) {
        println!(
            "{} <{}> {}",
            chrono::Local::now().format("%H:%M:%S"),
            self.peer,
            text
        );
    }
}
