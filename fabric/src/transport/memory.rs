//! # In-Process Memory Fabric
//!
//! A complete [`GossipTransport`] implementation that never touches a
//! socket: every endpoint lives in one process and exchanges events through
//! unbounded channels under a shared hub. Semantics mirror the production
//! gossip layer where it matters to the core:
//!
//! - a new endpoint sees Enter (and Join replays) for everyone already
//!   present, and everyone present sees its Enter;
//! - shout fans out to current group members only, excluding the sender;
//! - whisper is addressed by uuid;
//! - stopping an endpoint broadcasts Exit.
//!
//! Evasive/Silent are not simulated on timers; tests inject them through
//! [`MemoryFabric::inject_evasive`]/[`inject_silent`]. The configured
//! timeouts are recorded so tests can assert the knobs were forwarded.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::config::{DEFAULT_EVASIVE_MS, DEFAULT_EXPIRED_MS};
use crate::error::TransportError;
use crate::transport::{GossipTransport, TransportEvent, TransportFactory};

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct PeerSlot {
    name: String,
    tx: mpsc::UnboundedSender<TransportEvent>,
    groups: BTreeSet<String>,
    evasive_ms: u64,
    expired_ms: u64,
}

#[derive(Debug, Default)]
struct Hub {
    slots: Mutex<BTreeMap<Uuid, PeerSlot>>,
}

impl Hub {
    /// Delivers an event to every endpoint except `skip`.
    fn broadcast(&self, skip: Uuid, event: TransportEvent) {
        let slots = self.slots.lock();
        for (uuid, slot) in slots.iter() {
            if *uuid != skip {
                let _ = slot.tx.send(event.clone());
            }
        }
    }
}

/// The shared in-process fabric. Clone it freely; every clone hands out
/// endpoints on the same hub.
#[derive(Debug, Clone, Default)]
pub struct MemoryFabric {
    hub: Arc<Hub>,
}

impl MemoryFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of every endpoint currently on the hub, sorted.
    pub fn peer_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .hub
            .slots
            .lock()
            .values()
            .map(|s| s.name.clone())
            .collect();
        names.sort();
        names
    }

    /// The `(evasive_ms, expired_ms)` knobs an endpoint has applied.
    pub fn liveness_of(&self, peer: &str) -> Option<(u64, u64)> {
        self.hub
            .slots
            .lock()
            .values()
            .find(|s| s.name == peer)
            .map(|s| (s.evasive_ms, s.expired_ms))
    }

    /// Test hook: report `quiet_peer` as Evasive to every other endpoint,
    /// the way a gossip layer would after its evasive timeout.
    pub fn inject_evasive(&self, quiet_peer: &str) {
        self.inject_liveness(quiet_peer, false);
    }

    /// Test hook: report `quiet_peer` as Silent to every other endpoint.
    pub fn inject_silent(&self, quiet_peer: &str) {
        self.inject_liveness(quiet_peer, true);
    }

    fn inject_liveness(&self, quiet_peer: &str, silent: bool) {
        let slots = self.hub.slots.lock();
        for slot in slots.values() {
            if slot.name == quiet_peer {
                continue;
            }
            let event = if silent {
                TransportEvent::Silent {
                    peer: quiet_peer.to_string(),
                }
            } else {
                TransportEvent::Evasive {
                    peer: quiet_peer.to_string(),
                }
            };
            let _ = slot.tx.send(event);
        }
    }
}

impl TransportFactory for MemoryFabric {
    fn start(
        &self,
        local_peer: &str,
        _interface: Option<&str>,
    ) -> Result<Box<dyn GossipTransport>, TransportError> {
        let uuid = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut slots = self.hub.slots.lock();
        if slots.values().any(|s| s.name == local_peer) {
            return Err(TransportError::Construct(format!(
                "peer name {local_peer} already beaconing on this fabric"
            )));
        }

        // Replay the current fabric state toward the newcomer and announce
        // the newcomer to everyone else.
        for (other_uuid, slot) in slots.iter() {
            let _ = tx.send(TransportEvent::Enter {
                peer: slot.name.clone(),
                uuid: *other_uuid,
            });
            for group in &slot.groups {
                let _ = tx.send(TransportEvent::Join {
                    peer: slot.name.clone(),
                    group: group.clone(),
                });
            }
            let _ = slot.tx.send(TransportEvent::Enter {
                peer: local_peer.to_string(),
                uuid,
            });
        }

        slots.insert(
            uuid,
            PeerSlot {
                name: local_peer.to_string(),
                tx,
                groups: BTreeSet::new(),
                evasive_ms: DEFAULT_EVASIVE_MS,
                expired_ms: DEFAULT_EXPIRED_MS,
            },
        );
        drop(slots);

        trace!(peer = local_peer, %uuid, "memory endpoint started");
        Ok(Box::new(MemoryTransport {
            hub: Arc::clone(&self.hub),
            uuid,
            name: local_peer.to_string(),
            rx,
            stopped: false,
        }))
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// One endpoint on a [`MemoryFabric`].
#[derive(Debug)]
pub struct MemoryTransport {
    hub: Arc<Hub>,
    uuid: Uuid,
    name: String,
    rx: mpsc::UnboundedReceiver<TransportEvent>,
    stopped: bool,
}

impl MemoryTransport {
    /// Removes this endpoint from the hub and announces the departure.
    fn depart(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.hub.slots.lock().remove(&self.uuid);
        self.hub.broadcast(
            self.uuid,
            TransportEvent::Exit {
                peer: self.name.clone(),
            },
        );
        trace!(peer = %self.name, "memory endpoint stopped");
    }
}

#[async_trait]
impl GossipTransport for MemoryTransport {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn join(&mut self, group: &str) -> Result<(), TransportError> {
        {
            let mut slots = self.hub.slots.lock();
            let slot = slots.get_mut(&self.uuid).ok_or(TransportError::Closed)?;
            if !slot.groups.insert(group.to_string()) {
                return Ok(());
            }
        }
        self.hub.broadcast(
            self.uuid,
            TransportEvent::Join {
                peer: self.name.clone(),
                group: group.to_string(),
            },
        );
        Ok(())
    }

    async fn leave(&mut self, group: &str) -> Result<(), TransportError> {
        {
            let mut slots = self.hub.slots.lock();
            let slot = slots.get_mut(&self.uuid).ok_or(TransportError::Closed)?;
            if !slot.groups.remove(group) {
                return Ok(());
            }
        }
        self.hub.broadcast(
            self.uuid,
            TransportEvent::Leave {
                peer: self.name.clone(),
                group: group.to_string(),
            },
        );
        Ok(())
    }

    async fn shout(&mut self, group: &str, payload: Bytes) -> Result<(), TransportError> {
        let slots = self.hub.slots.lock();
        for (uuid, slot) in slots.iter() {
            if *uuid == self.uuid || !slot.groups.contains(group) {
                continue;
            }
            let _ = slot.tx.send(TransportEvent::Shout {
                peer: self.name.clone(),
                group: group.to_string(),
                payload: payload.clone(),
            });
        }
        Ok(())
    }

    async fn whisper(&mut self, peer: Uuid, payload: Bytes) -> Result<(), TransportError> {
        let slots = self.hub.slots.lock();
        let slot = slots
            .get(&peer)
            .ok_or_else(|| TransportError::Send(format!("no endpoint {peer}")))?;
        slot.tx
            .send(TransportEvent::Whisper {
                peer: self.name.clone(),
                payload,
            })
            .map_err(|_| TransportError::Closed)
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }

    fn set_evasive_timeout(&mut self, ms: u64) {
        if let Some(slot) = self.hub.slots.lock().get_mut(&self.uuid) {
            slot.evasive_ms = ms;
        }
    }

    fn set_expired_timeout(&mut self, ms: u64) {
        if let Some(slot) = self.hub.slots.lock().get_mut(&self.uuid) {
            slot.expired_ms = ms;
        }
    }

    async fn stop(&mut self) {
        self.depart();
    }

    fn own_groups(&self) -> Vec<String> {
        self.hub
            .slots
            .lock()
            .get(&self.uuid)
            .map(|s| s.groups.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn peers_by_group(&self, group: &str) -> Vec<String> {
        self.hub
            .slots
            .lock()
            .values()
            .filter(|s| s.groups.contains(group))
            .map(|s| s.name.clone())
            .collect()
    }

    fn peer_header(&self, peer: Uuid, key: &str) -> Option<String> {
        match key {
            "name" => self.hub.slots.lock().get(&peer).map(|s| s.name.clone()),
            _ => None,
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.depart();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::pack;

    async fn drain(t: &mut dyn GossipTransport) -> Vec<TransportEvent> {
        let mut out = Vec::new();
        while let Ok(Some(ev)) =
            tokio::time::timeout(std::time::Duration::from_millis(1), t.next_event()).await
        {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn newcomer_sees_existing_peers_and_their_groups() {
        let fabric = MemoryFabric::new();
        let mut a = fabric.start("luclin_alice", None).unwrap();
        a.join("all").await.unwrap();
        let mut b = fabric.start("luclin_bob", None).unwrap();

        let mut saw_enter = false;
        let mut saw_join = false;
        while let Some(ev) = tokio::time::timeout(std::time::Duration::from_millis(100), b.next_event())
            .await
            .ok()
            .flatten()
        {
            match ev {
                TransportEvent::Enter { peer, .. } if peer == "luclin_alice" => saw_enter = true,
                TransportEvent::Join { peer, group } if peer == "luclin_alice" && group == "all" => {
                    saw_join = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_enter && saw_join);
    }

    #[tokio::test]
    async fn shout_reaches_members_only_and_not_the_sender() {
        let fabric = MemoryFabric::new();
        let mut a = fabric.start("luclin_alice", None).unwrap();
        let mut b = fabric.start("luclin_bob", None).unwrap();
        let mut c = fabric.start("luclin_carol", None).unwrap();

        a.join("all").await.unwrap();
        b.join("all").await.unwrap();

        let payload = pack(&["Echo", "hi"]);
        a.shout("all", payload.clone()).await.unwrap();

        let b_events = drain(&mut *b).await;
        assert!(b_events
            .iter()
            .any(|ev| matches!(ev, TransportEvent::Shout { peer, group, .. }
                if peer == "luclin_alice" && group == "all")));

        // Carol never joined; Alice is the sender. Neither hears the shout.
        assert!(!drain(&mut *c).await
            .iter()
            .any(|ev| matches!(ev, TransportEvent::Shout { .. })));
        assert!(!drain(&mut *a).await
            .iter()
            .any(|ev| matches!(ev, TransportEvent::Shout { .. })));
    }

    #[tokio::test]
    async fn whisper_is_addressed_by_uuid() {
        let fabric = MemoryFabric::new();
        let mut a = fabric.start("luclin_alice", None).unwrap();
        let mut b = fabric.start("luclin_bob", None).unwrap();

        a.whisper(b.uuid(), pack(&["Echo", "psst"])).await.unwrap();
        let events = drain(&mut *b).await;
        assert!(events
            .iter()
            .any(|ev| matches!(ev, TransportEvent::Whisper { peer, .. } if peer == "luclin_alice")));

        let ghost = Uuid::new_v4();
        assert!(a.whisper(ghost, pack(&["Echo", "?"])).await.is_err());
    }

    #[tokio::test]
    async fn stop_broadcasts_exit_and_frees_the_name() {
        let fabric = MemoryFabric::new();
        let mut a = fabric.start("luclin_alice", None).unwrap();
        let mut b = fabric.start("luclin_bob", None).unwrap();

        b.stop().await;
        let events = drain(&mut *a).await;
        assert!(events
            .iter()
            .any(|ev| matches!(ev, TransportEvent::Exit { peer } if peer == "luclin_bob")));

        // The name can re-enter after stopping.
        assert!(fabric.start("luclin_bob", None).is_ok());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let fabric = MemoryFabric::new();
        let _a = fabric.start("luclin_alice", None).unwrap();
        assert!(matches!(
            fabric.start("luclin_alice", None),
            Err(TransportError::Construct(_))
        ));
    }

    #[tokio::test]
    async fn introspection_reports_groups_and_headers() {
        let fabric = MemoryFabric::new();
        let mut a = fabric.start("luclin_alice", None).unwrap();
        let b = fabric.start("luclin_bob", None).unwrap();

        a.join("all").await.unwrap();
        a.join("tank").await.unwrap();
        assert_eq!(a.own_groups(), vec!["all", "tank"]);
        assert_eq!(a.peers_by_group("all"), vec!["luclin_alice"]);
        assert!(a.peers_by_group("nobody").is_empty());

        assert_eq!(a.peer_header(b.uuid(), "name").as_deref(), Some("luclin_bob"));
        assert_eq!(a.peer_header(b.uuid(), "address"), None);

        a.set_evasive_timeout(1_234);
        assert_eq!(fabric.liveness_of("luclin_alice"), Some((1_234, 30_000)));
    }

    #[tokio::test]
    async fn injected_evasive_skips_the_quiet_peer() {
        let fabric = MemoryFabric::new();
        let mut a = fabric.start("luclin_alice", None).unwrap();
        let mut b = fabric.start("luclin_bob", None).unwrap();
        drain(&mut *a).await;
        drain(&mut *b).await;

        fabric.inject_evasive("luclin_bob");
        assert!(drain(&mut *a).await
            .iter()
            .any(|ev| matches!(ev, TransportEvent::Evasive { peer } if peer == "luclin_bob")));
        assert!(drain(&mut *b).await.is_empty());
    }
}
