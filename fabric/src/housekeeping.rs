//! # Housekeeping
//!
//! The once-per-second maintenance pass driven by the host tick:
//!
//! - reconcile the contextual channels (`group_<leader>`, `raid_<leader>`,
//!   `zone_<zone>`) against the host's current context, joining the one
//!   that matches and leaving stale ones;
//! - keep the static aggregates joined (`all`, the class code, and every
//!   role channel containing the class);
//! - sweep observations whose sink variable has disappeared.
//!
//! Observer groups share the namespace with everything else, so the
//! reconciliation explicitly skips names with observer shape. All joins go
//! through `Node::join`, which is idempotent against the intent set; a
//! steady context costs nothing per pass.

use crate::config::{now_ms, ALL_GROUP, CONTEXT_PREFIXES, HOUSEKEEPING_INTERVAL_MS, ROLE_GROUPS};
use crate::name::is_observer_group;
use crate::node::Node;

impl Node {
    /// One rate-limited maintenance pass. Called from `tick()`; a pass runs
    /// at most once per [`HOUSEKEEPING_INTERVAL_MS`].
    pub(crate) fn housekeep(&self) {
        if !self.entered() {
            return;
        }
        {
            let mut last = self.inner.last_housekeeping.lock();
            let now = now_ms();
            if now.saturating_sub(*last) < HOUSEKEEPING_INTERVAL_MS {
                return;
            }
            *last = now;
        }
        self.reconcile_context_channels();
        self.join_static_groups();
        self.sweep_stale_sinks();
    }

    /// Joins the channel for each current context value and leaves every
    /// same-prefix channel that no longer matches.
    fn reconcile_context_channels(&self) {
        let own = self.own_groups();
        let contexts: [(usize, Option<String>); 3] = [
            (0, self.evaluator().group_leader().map(|l| self.full_name(&l))),
            (1, self.evaluator().raid_leader().map(|l| self.full_name(&l))),
            (2, self.evaluator().zone().map(|z| z.to_lowercase())),
        ];
        for (index, suffix) in contexts {
            let prefix = CONTEXT_PREFIXES[index];
            let wanted = suffix.map(|s| format!("{prefix}{s}"));
            for group in own
                .iter()
                .filter(|g| g.starts_with(prefix) && !is_observer_group(g))
            {
                if wanted.as_deref() != Some(group.as_str()) {
                    self.leave(group);
                }
            }
            if let Some(wanted) = wanted {
                self.join(&wanted);
            }
        }
    }

    /// Keeps `all`, the class channel, and the matching role aggregates
    /// joined.
    fn join_static_groups(&self) {
        self.join(ALL_GROUP);
        if let Some(class) = self.evaluator().class_code() {
            let class = class.to_lowercase();
            self.join(&class);
            for (role, codes) in ROLE_GROUPS {
                if codes.contains(&class.as_str()) {
                    self.join(role);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::test_node_with_vars;
    use crate::transport::memory::MemoryFabric;

    // housekeep() proper is gated on an entered node and wall-clock rate
    // limiting, so these tests drive the two passes directly.

    #[test]
    fn static_groups_follow_the_class_code() {
        let (node, eval, _sink) = test_node_with_vars("luclin", "alice", MemoryFabric::new());
        eval.set("Me.Class", "CLR");
        node.join_static_groups();

        let own = node.own_groups();
        assert!(own.contains(&"all".to_string()));
        assert!(own.contains(&"clr".to_string()));
        assert!(own.contains(&"priest".to_string()));
        assert!(!own.contains(&"tank".to_string()));
    }

    #[test]
    fn unknown_class_still_joins_all() {
        let (node, _eval, _sink) = test_node_with_vars("luclin", "alice", MemoryFabric::new());
        node.join_static_groups();
        assert_eq!(node.own_groups(), vec!["all"]);
    }

    #[test]
    fn context_channels_follow_the_leader() {
        let (node, eval, _sink) = test_node_with_vars("luclin", "alice", MemoryFabric::new());
        eval.set("Group.Leader", "Bob");
        node.reconcile_context_channels();
        assert!(node.own_groups().contains(&"group_luclin_bob".to_string()));

        // Leadership moves: the stale channel is left, the new one joined.
        eval.set("Group.Leader", "Carol");
        node.reconcile_context_channels();
        let own = node.own_groups();
        assert!(!own.contains(&"group_luclin_bob".to_string()));
        assert!(own.contains(&"group_luclin_carol".to_string()));

        // Leadership gone: the channel is left.
        eval.unset("Group.Leader");
        node.reconcile_context_channels();
        assert!(!node
            .own_groups()
            .iter()
            .any(|g| g.starts_with("group_")));
    }

    #[test]
    fn zone_channel_tracks_the_zone() {
        let (node, eval, _sink) = test_node_with_vars("luclin", "alice", MemoryFabric::new());
        eval.set("Zone.ShortName", "Commons");
        node.reconcile_context_channels();
        assert!(node.own_groups().contains(&"zone_commons".to_string()));

        eval.set("Zone.ShortName", "oasis");
        node.reconcile_context_channels();
        let own = node.own_groups();
        assert!(!own.contains(&"zone_commons".to_string()));
        assert!(own.contains(&"zone_oasis".to_string()));
    }

    #[test]
    fn reconciliation_never_touches_observer_groups() {
        let (node, eval, _sink) = test_node_with_vars("luclin", "alice", MemoryFabric::new());
        // An observer-shaped group that happens to share a context prefix.
        node.join("zone_watcher_3");
        eval.set("Zone.ShortName", "oasis");
        node.reconcile_context_channels();
        let own = node.own_groups();
        assert!(own.contains(&"zone_watcher_3".to_string()));
        assert!(own.contains(&"zone_oasis".to_string()));
    }
}
