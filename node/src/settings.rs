//! # Persisted Settings
//!
//! The on-disk configuration the console reads at startup and writes
//! through whenever an operator command changes a flag or saves a group.
//! TOML with two kinds of tables:
//!
//! ```toml
//! [general]
//! local_echo = true
//! query_timeout_ms = 1000
//! groups = "all|mygroup|"          # globally saved groups
//!
//! [peers.local_alice]
//! groups = "raidcore|"             # saved for one peer only
//! ```
//!
//! Saved-group strings use the same pipe-delimited array form as the rest
//! of the fabric; the delimiter placement follows the `front_delimiter`
//! flag at save time, and parsing strips empties either way.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use weave_fabric::{join_array, parse_array, NetSettings};

/// The `[general]` table: every fabric flag plus the globally saved groups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSection {
    #[serde(flatten)]
    pub net: NetSettings,
    /// Pipe-delimited groups every hosted peer rejoins on entry.
    pub groups: String,
}

/// A `[peers.<full_name>]` table: groups saved for one peer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerSection {
    pub groups: String,
}

/// The whole settings file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsFile {
    pub general: GeneralSection,
    pub peers: BTreeMap<String, PeerSection>,
}

impl SettingsFile {
    /// Loads the file, or returns defaults when it does not exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse settings from {}", path.display()))
    }

    /// Writes the file, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create settings directory {}", parent.display())
                })?;
            }
        }
        let raw = toml::to_string_pretty(self).context("failed to serialize settings")?;
        std::fs::write(path, raw)
            .with_context(|| format!("failed to write settings to {}", path.display()))
    }

    /// Every group `peer` should rejoin on entry: global saves plus its own.
    pub fn saved_groups(&self, peer: &str) -> Vec<String> {
        let mut groups = parse_array(&self.general.groups);
        if let Some(section) = self.peers.get(peer) {
            groups.extend(parse_array(&section.groups));
        }
        groups.sort();
        groups.dedup();
        groups
    }

    /// Persists a group. `peer: None` saves it globally, `Some` under that
    /// peer's table.
    pub fn save_group(&mut self, peer: Option<&str>, group: &str) {
        let front = self.general.net.front_delimiter;
        let slot = match peer {
            None => &mut self.general.groups,
            Some(peer) => &mut self.peers.entry(peer.to_string()).or_default().groups,
        };
        let mut groups = parse_array(slot);
        if !groups.iter().any(|g| g == group) {
            groups.push(group.to_string());
        }
        *slot = join_array(&groups, front);
    }

    /// Removes a saved group from the global table, the peer's table, or
    /// both.
    pub fn unsave_group(&mut self, peer: Option<&str>, group: &str) {
        let front = self.general.net.front_delimiter;
        let mut scrub = |slot: &mut String| {
            let groups: Vec<String> = parse_array(slot).into_iter().filter(|g| g != group).collect();
            *slot = join_array(&groups, front);
        };
        match peer {
            None => scrub(&mut self.general.groups),
            Some(peer) => {
                if let Some(section) = self.peers.get_mut(peer) {
                    scrub(&mut section.groups);
                }
            }
        }
    }
}
