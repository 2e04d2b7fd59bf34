//! # Peer & Group Naming
//!
//! Canonical peer names on the fabric are `<server>_<character>`, lowercase.
//! Neither half may itself contain an underscore, which is what makes the
//! scheme parseable: a raw name without `_` is a bare character name and
//! gets the local server prefix prepended.
//!
//! Observer groups are `<peer>_<key>` with a decimal key, so any group name
//! that contains `_` and ends in a digit is reserved for the observer
//! engine. Housekeeping uses that test to keep its channel reconciliation
//! away from observer traffic.

/// Canonicalizes a raw peer name against the local server.
///
/// A name without `_` is treated as a bare character name and prefixed with
/// `<server>_`. The result is always lowercase, which is the form every
/// internal table keys on.
pub fn full_name(server: &str, raw: &str) -> String {
    let raw = raw.trim();
    if raw.contains('_') {
        raw.to_lowercase()
    } else {
        format!("{}_{}", server.to_lowercase(), raw.to_lowercase())
    }
}

/// Strips the local server prefix from a full name, if it carries one.
///
/// Names from other servers (or names that never had a prefix) come back
/// unchanged apart from lowercasing.
pub fn short_name(server: &str, name: &str) -> String {
    let name = name.to_lowercase();
    let prefix = format!("{}_", server.to_lowercase());
    match name.strip_prefix(&prefix) {
        Some(rest) => rest.to_string(),
        None => name,
    }
}

/// Formats the dedicated group for one observer slot of `peer`.
pub fn observer_group(peer: &str, key: u32) -> String {
    format!("{}_{}", peer, key)
}

/// True when `name` has the shape of an observer group: it contains an
/// underscore and its last character is an ASCII digit.
pub fn is_observer_group(name: &str) -> bool {
    name.contains('_') && name.chars().last().is_some_and(|c| c.is_ascii_digit())
}
