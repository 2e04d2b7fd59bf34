//! # Query Engine
//!
//! One-shot request/reply evaluation of an expression on another peer. The
//! caller's side of the exchange:
//!
//! 1. pre-insert a placeholder result (`"NULL"`, `received_at == 0`) so the
//!    outcome is always readable, success or timeout;
//! 2. register a one-shot response handler under a fresh correlator tag;
//! 3. whisper `Query` with the tag and the raw expression.
//!
//! The core never sleeps. `read_query` is the wait predicate: the host
//! drives its own delay loop and treats `received_at == 0` past the
//! configured timeout as failure. A query aimed at the local peer skips the
//! wire entirely and evaluates inline.

use tracing::debug;

use crate::commands::Query;
use crate::config::now_ms;
use crate::dispatch::CommandArgs;
use crate::node::Node;
use crate::observe::Observation;

/// Identity of one query result: the canonical target peer plus the exact
/// expression text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct QueryKey {
    pub peer: String,
    pub expr: String,
}

impl Node {
    /// Requests the value of `expr` on `peer`, optionally binding the reply
    /// into a host sink variable.
    ///
    /// Re-querying the same `(peer, expression)` is idempotent: the result
    /// slot is overwritten, and whichever reply lands last wins.
    pub fn query(&self, peer: &str, expr: &str, sink: Option<&str>) {
        let target = self.full_name(peer);
        let key = QueryKey {
            peer: target.clone(),
            expr: expr.to_string(),
        };

        if target == self.name() {
            // Local target: evaluate inline, no transport traffic.
            let value = self
                .evaluator()
                .evaluate(expr)
                .unwrap_or_else(|| "NULL".to_string());
            if let Some(sink) = sink {
                self.evaluator().assign(sink, &value);
            }
            self.inner.query_results.insert(
                key.clone(),
                Observation {
                    sink: sink.map(str::to_string),
                    value,
                    received_at: now_ms(),
                },
            );
            *self.inner.recent_query.lock() = Some(key);
            return;
        }

        self.inner.query_results.insert(
            key.clone(),
            Observation {
                sink: sink.map(str::to_string),
                value: "NULL".to_string(),
                received_at: 0,
            },
        );
        *self.inner.recent_query.lock() = Some(key.clone());

        if !self.inner.registry.has_peer(&target) {
            // Reads as a timeout: the placeholder never advances.
            debug!(peer = %target, %expr, "query target is not connected");
            return;
        }

        let tag = self.register_response(Box::new(move |node: &Node, mut args: CommandArgs| {
            let value = match args.take_str() {
                Ok(value) => value,
                Err(err) => {
                    debug!(from = %args.from, %err, "query reply: malformed payload");
                    "NULL".to_string()
                }
            };
            node.store_query_result(&key, &value);
            true
        }));
        self.whisper_payload(&target, Query::request(&tag, expr));
    }

    /// The stored result for `(peer, expr)`, if any. `received_at > 0` is
    /// the success predicate.
    pub fn read_query(&self, peer: &str, expr: &str) -> Option<Observation> {
        let key = QueryKey {
            peer: self.full_name(peer),
            expr: expr.to_string(),
        };
        self.inner.query_results.get(&key).map(|r| r.clone())
    }

    /// The most recently issued query's result, for consumers that track
    /// only one query at a time.
    pub fn last_query(&self) -> Option<Observation> {
        let key = self.inner.recent_query.lock().clone()?;
        self.inner.query_results.get(&key).map(|r| r.clone())
    }

    /// Reply-side bookkeeping: writes the sink recorded on the placeholder
    /// and replaces the result with a timestamped observation.
    pub(crate) fn store_query_result(&self, key: &QueryKey, value: &str) {
        let sink = self
            .inner
            .query_results
            .get(key)
            .and_then(|obs| obs.sink.clone());
        if let Some(sink) = &sink {
            self.evaluator().assign(sink, value);
        }
        self.inner.query_results.insert(
            key.clone(),
            Observation {
                sink,
                value: value.to_string(),
                received_at: now_ms(),
            },
        );
        self.debug_chat(&format!("{} : {} -> {}", key.peer, key.expr, value));
    }
}
