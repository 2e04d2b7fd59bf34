//! # Membership Registry
//!
//! The eventually-consistent picture of who is on the fabric and which
//! groups they advertise. Three tables:
//!
//! - `peers`: connected peer name to transport uuid. Created on Enter,
//!   removed on Exit. Never contains the local peer.
//! - `groups`: group name to the set of remote members. Updated on
//!   Join/Leave; a group whose member set empties is removed outright.
//! - `own`: the groups this peer has asked to join. This is the host-side
//!   intent set, kept by `join()`/`leave()` so repeated joins stay
//!   idempotent even before the actor drains the pipe.
//!
//! The peer and group tables are written only by the actor thread in
//! transport-event order. Every read path returns an owned snapshot, so no
//! caller can observe a table mid-update or hold a lock across its own
//! logic.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct Membership {
    peers: RwLock<BTreeMap<String, Uuid>>,
    groups: RwLock<BTreeMap<String, BTreeSet<String>>>,
    own: RwLock<BTreeSet<String>>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    // -- actor-side mutation ------------------------------------------------

    /// Records a peer entering the fabric, replacing any stale uuid.
    pub(crate) fn peer_entered(&self, peer: &str, uuid: Uuid) {
        self.peers.write().insert(peer.to_string(), uuid);
    }

    /// Removes an exited peer from the peer table and from every group
    /// roster. Leave events should have emptied the rosters already, but
    /// an abrupt exit skips them.
    pub(crate) fn peer_exited(&self, peer: &str) {
        self.peers.write().remove(peer);
        let mut groups = self.groups.write();
        groups.retain(|_, members| {
            members.remove(peer);
            !members.is_empty()
        });
    }

    pub(crate) fn peer_joined(&self, peer: &str, group: &str) {
        self.groups
            .write()
            .entry(group.to_string())
            .or_default()
            .insert(peer.to_string());
    }

    pub(crate) fn peer_left(&self, peer: &str, group: &str) {
        let mut groups = self.groups.write();
        if let Some(members) = groups.get_mut(group) {
            members.remove(peer);
            if members.is_empty() {
                groups.remove(group);
            }
        }
    }

    /// Clears the peer-facing tables. Own-group intent survives so a
    /// re-entered node rejoins what the operator had joined.
    pub(crate) fn clear_peers(&self) {
        self.peers.write().clear();
        self.groups.write().clear();
    }

    // -- host-side intent ---------------------------------------------------

    /// Adds a group to the intent set. Returns true when it was new.
    pub(crate) fn add_own(&self, group: &str) -> bool {
        self.own.write().insert(group.to_string())
    }

    /// Drops a group from the intent set. Returns true when it was present.
    pub(crate) fn remove_own(&self, group: &str) -> bool {
        self.own.write().remove(group)
    }

    pub fn is_own(&self, group: &str) -> bool {
        self.own.read().contains(group)
    }

    // -- snapshots ----------------------------------------------------------

    pub fn uuid_of(&self, peer: &str) -> Option<Uuid> {
        self.peers.read().get(peer).copied()
    }

    pub fn has_peer(&self, peer: &str) -> bool {
        self.peers.read().contains_key(peer)
    }

    /// Connected remote peers, sorted.
    pub fn connected_peers(&self) -> Vec<String> {
        self.peers.read().keys().cloned().collect()
    }

    pub fn connected_count(&self) -> usize {
        self.peers.read().len()
    }

    /// The intent set, sorted.
    pub fn own_groups(&self) -> Vec<String> {
        self.own.read().iter().cloned().collect()
    }

    /// Every group visible on the fabric: the intent set plus every group
    /// some remote peer advertises.
    pub fn all_groups(&self) -> Vec<String> {
        let mut all: BTreeSet<String> = self.own.read().clone();
        all.extend(self.groups.read().keys().cloned());
        all.into_iter().collect()
    }

    /// Remote members of a group, sorted. Empty when nobody advertises it.
    pub fn group_members(&self, group: &str) -> Vec<String> {
        self.groups
            .read()
            .get(group)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// (group, members) snapshot of every remotely-advertised group.
    pub fn group_rosters(&self) -> Vec<(String, Vec<String>)> {
        self.groups
            .read()
            .iter()
            .map(|(g, m)| (g.clone(), m.iter().cloned().collect()))
            .collect()
    }
}
