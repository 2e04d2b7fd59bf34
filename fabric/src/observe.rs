//! # Observer Engine
//!
//! Standing subscriptions to remote expressions, in both directions.
//!
//! **Source side** (this node publishes): every expression a peer has asked
//! to observe gets a slot in `observer_map` under a wrapping `u32` key; the
//! slot's dedicated group is `<local_peer>_<key>`. The host tick drives
//! [`Node::publish`], which re-evaluates due slots and shouts an `Update`
//! to the slot's group, suppressing emissions while the value is unchanged.
//! Each slot carries an EWMA of its evaluation cost so expensive
//! expressions self-throttle: a slot is due only after
//! `max(10 * benchmark, observe_delay)` milliseconds.
//!
//! **Consumer side** (this node listens): `observed_map` records which
//! group carries each observed `(expression, peer)`, and `observed_data`
//! caches the latest value per group, optionally mirrored into a host sink
//! variable. Observations whose sink variable disappears are forgotten
//! automatically, which is how subscriptions die when a host script ends.
//!
//! Updates are not queued on the source: a missed tick simply means the
//! next eligible pass re-evaluates. A consumer that suspects it missed
//! traffic (or a transport that reports the peer evasive) whispers
//! `Reupdate`, which drops the suppression cache wholesale.

use std::cmp;

use tracing::{debug, trace};

use crate::commands::{Observe, Update};
use crate::config::now_ms;
use crate::dispatch::CommandArgs;
use crate::name::observer_group;
use crate::node::Node;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// The consumer-side cache of one observed value (also reused as the query
/// result record).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// Host variable the value is mirrored into, if any.
    pub sink: Option<String>,
    /// Latest value, `"NULL"` until the first update arrives.
    pub value: String,
    /// Arrival clock of the latest update, 0 until the first one.
    pub received_at: u64,
}

impl Default for Observation {
    fn default() -> Self {
        Self {
            sink: None,
            value: "NULL".to_string(),
            received_at: 0,
        }
    }
}

/// Consumer-side index key: which `(expression, peer)` an observation is
/// about. Ordered so snapshots iterate deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct ObservedKey {
    pub expr: String,
    pub peer: String,
}

/// Source-side record of one published expression.
#[derive(Debug, Clone)]
pub(crate) struct ObserverSource {
    pub expr: String,
    /// EWMA of evaluation cost in ms; 0 until the first sample.
    pub benchmark: u64,
    /// Clock of the last publish pass that evaluated this slot.
    pub last_tick: u64,
}

// ---------------------------------------------------------------------------
// Source side
// ---------------------------------------------------------------------------

impl Node {
    /// Finds or allocates the source slot for `expr` and returns its group.
    ///
    /// Reuse keeps one group per distinct expression no matter how many
    /// peers observe it; allocation takes the next wrapping key.
    pub(crate) fn register_observer(&self, expr: &str) -> String {
        let mut map = self.inner.observer_map.lock();
        for (key, source) in map.iter() {
            if source.expr == expr {
                return observer_group(self.name(), *key);
            }
        }
        let mut key = map
            .keys()
            .next_back()
            .map(|last| last.wrapping_add(1))
            .unwrap_or(0);
        while map.contains_key(&key) {
            key = key.wrapping_add(1);
        }
        map.insert(
            key,
            ObserverSource {
                expr: expr.to_string(),
                benchmark: 0,
                last_tick: 0,
            },
        );
        debug!(peer = %self.name(), %expr, key, "registered observer slot");
        observer_group(self.name(), key)
    }

    /// One publish pass over every source slot. Driven by the host tick.
    pub fn publish(&self) {
        if !self.entered() {
            return;
        }
        let observe_delay = self.settings().observe_delay_ms;
        let snapshot: Vec<(u32, String, u64, u64)> = self
            .inner
            .observer_map
            .lock()
            .iter()
            .map(|(key, s)| (*key, s.expr.clone(), s.benchmark, s.last_tick))
            .collect();

        for (key, expr, benchmark, last_tick) in snapshot {
            let now = now_ms();
            if now.saturating_sub(last_tick) < cmp::max(10 * benchmark, observe_delay) {
                continue;
            }

            let value = self
                .evaluator()
                .evaluate(&expr)
                .unwrap_or_else(|| "NULL".to_string());
            let elapsed = now_ms().saturating_sub(now);
            let group = observer_group(self.name(), key);

            let changed = {
                let mut cache = self.inner.publish_cache.lock();
                match cache.get(&expr) {
                    Some(previous) if *previous == value => false,
                    _ => {
                        cache.insert(expr.clone(), value.clone());
                        true
                    }
                }
            };
            if changed {
                trace!(peer = %self.name(), %group, %value, "publishing update");
                self.shout_payload(&group, Update::payload(&value));
                // A shout never loops back to its sender, so observations of
                // our own expressions are fed directly.
                let self_observed = self.inner.observed_data.lock().contains_key(&group);
                if self_observed {
                    self.apply_update(&group, &value);
                }
            }

            let mut map = self.inner.observer_map.lock();
            if let Some(source) = map.get_mut(&key) {
                source.benchmark = if source.benchmark == 0 {
                    elapsed
                } else {
                    (source.benchmark + elapsed) / 2
                };
                source.last_tick = now;
            }
        }
    }

    /// Drops the publish suppression cache; the next pass re-emits every
    /// slot, changed value or not.
    pub(crate) fn clear_publish_cache(&self) {
        self.inner.publish_cache.lock().clear();
    }
}

// ---------------------------------------------------------------------------
// Consumer side
// ---------------------------------------------------------------------------

impl Node {
    /// Starts observing `expr` on `peer`, optionally mirroring values into
    /// a host sink variable.
    ///
    /// Re-observing an already-observed pair only rebinds the sink. A local
    /// target short-circuits: the slot is allocated directly and the
    /// current value fed through the update path.
    pub fn observe(&self, peer: &str, expr: &str, sink: Option<&str>) {
        let target = self.full_name(peer);
        let key = ObservedKey {
            expr: expr.to_string(),
            peer: target.clone(),
        };

        let existing = self.inner.observed_map.lock().get(&key).cloned();
        if let Some(group) = existing {
            if let Some(obs) = self.inner.observed_data.lock().get_mut(&group) {
                obs.sink = sink.map(str::to_string);
            }
            return;
        }

        if target == self.name() {
            let group = self.register_observer(expr);
            self.join(&group);
            self.inner.observed_map.lock().insert(key, group.clone());
            self.inner.observed_data.lock().insert(
                group.clone(),
                Observation {
                    sink: sink.map(str::to_string),
                    ..Observation::default()
                },
            );
            let value = self
                .evaluator()
                .evaluate(expr)
                .unwrap_or_else(|| "NULL".to_string());
            self.apply_update(&group, &value);
            return;
        }

        if !self.inner.registry.has_peer(&target) {
            debug!(peer = %target, %expr, "observe target is not connected");
            return;
        }

        let expr_owned = expr.to_string();
        let sink_owned = sink.map(str::to_string);
        let tag = self.register_response(Box::new(move |node: &Node, mut args: CommandArgs| {
            let (group, value) = match (args.take_str(), args.take_str()) {
                (Ok(group), Ok(value)) => (group, value),
                _ => {
                    debug!(from = %args.from, "observe reply: malformed payload");
                    return true;
                }
            };
            if group.is_empty() || group == "NULL" {
                debug!(from = %args.from, "observe request was refused");
                return true;
            }
            node.join(&group);
            node.inner.observed_map.lock().insert(
                ObservedKey {
                    expr: expr_owned.clone(),
                    peer: args.from.clone(),
                },
                group.clone(),
            );
            node.inner.observed_data.lock().insert(
                group.clone(),
                Observation {
                    sink: sink_owned.clone(),
                    ..Observation::default()
                },
            );
            node.apply_update(&group, &value);
            true
        }));
        self.whisper_payload(&target, Observe::request(&tag, expr));
    }

    /// Stops observing `(peer, expr)` and leaves its group if nothing else
    /// references it.
    pub fn forget(&self, peer: &str, expr: &str) {
        let key = ObservedKey {
            expr: expr.to_string(),
            peer: self.full_name(peer),
        };
        let group = self.inner.observed_map.lock().remove(&key);
        if let Some(group) = group {
            self.drop_observation(&group);
        }
    }

    /// Stops the observation carried by `group`, wherever it points.
    pub fn forget_group(&self, group: &str) {
        let key = {
            let map = self.inner.observed_map.lock();
            map.iter()
                .find(|(_, g)| g.as_str() == group)
                .map(|(k, _)| k.clone())
        };
        if let Some(key) = key {
            self.inner.observed_map.lock().remove(&key);
        }
        self.drop_observation(group);
    }

    /// Drops every observation originating from `peer`.
    pub fn forget_all(&self, peer: &str) {
        let target = self.full_name(peer);
        let groups: Vec<String> = {
            let mut map = self.inner.observed_map.lock();
            let keys: Vec<ObservedKey> = map
                .keys()
                .filter(|k| k.peer == target)
                .cloned()
                .collect();
            keys.into_iter().filter_map(|k| map.remove(&k)).collect()
        };
        for group in groups {
            self.drop_observation(&group);
        }
    }

    fn drop_observation(&self, group: &str) {
        self.inner.observed_data.lock().remove(group);
        let still_referenced = self
            .inner
            .observed_map
            .lock()
            .values()
            .any(|g| g == group);
        if !still_referenced {
            self.leave(group);
        }
    }

    /// The cached observation for `(peer, expr)`, if one is live.
    pub fn read_observation(&self, peer: &str, expr: &str) -> Option<Observation> {
        let key = ObservedKey {
            expr: expr.to_string(),
            peer: self.full_name(peer),
        };
        let group = self.inner.observed_map.lock().get(&key).cloned()?;
        self.inner.observed_data.lock().get(&group).cloned()
    }

    /// Every live consumer-side observation as `(peer, expr, group)`.
    pub fn observations(&self) -> Vec<(String, String, String)> {
        self.inner
            .observed_map
            .lock()
            .iter()
            .map(|(k, g)| (k.peer.clone(), k.expr.clone(), g.clone()))
            .collect()
    }

    /// Applies an inbound update to the cached observation at `group`:
    /// mirror into the sink (forgetting the observation when the sink has
    /// vanished), then advance value and arrival clock. Updates for unknown
    /// groups are late shouts after a forget and are dropped.
    pub(crate) fn apply_update(&self, group: &str, value: &str) {
        let sink = match self.inner.observed_data.lock().get(group) {
            None => {
                trace!(%group, "update for unknown observation; dropping");
                return;
            }
            Some(obs) => obs.sink.clone(),
        };
        if let Some(sink) = &sink {
            if !self.evaluator().sink_exists(sink) {
                debug!(%group, %sink, "observation sink vanished; forgetting");
                self.forget_group(group);
                return;
            }
            self.evaluator().assign(sink, value);
        }
        if let Some(obs) = self.inner.observed_data.lock().get_mut(group) {
            obs.value = value.to_string();
            obs.received_at = now_ms();
        }
        self.debug_chat(&format!("{} : {}", group, value));
    }

    /// Forgets every observation whose sink variable no longer exists.
    /// Invoked by housekeeping; this is the auto-clean for ended scripts.
    pub(crate) fn sweep_stale_sinks(&self) {
        let bound: Vec<(String, String)> = self
            .inner
            .observed_data
            .lock()
            .iter()
            .filter_map(|(group, obs)| obs.sink.clone().map(|s| (group.clone(), s)))
            .collect();
        for (group, sink) in bound {
            if !self.evaluator().sink_exists(&sink) {
                debug!(%group, %sink, "sweeping observation with stale sink");
                self.forget_group(&group);
            }
        }
    }
}
