//! # Standard Command Suite
//!
//! The six wire commands every node understands. Each command is a unit
//! struct with a tag constant, a payload packer, and a dispatch handler;
//! `register_standard` installs the handlers at node construction.
//!
//! Payload layouts (after the actor's from/group prepend):
//!
//! | Tag        | Argument frames                    |
//! |------------|------------------------------------|
//! | `Echo`     | `text`                             |
//! | `Execute`  | `command`                          |
//! | `Query`    | `response_tag`, `expression`       |
//! | `Observe`  | `response_tag`, `expression`       |
//! | `Update`   | `value`                            |
//! | `Reupdate` | (none)                             |
//!
//! Query and Observe replies ride correlator tags (`response_<n>`) and are
//! handled by the one-shot closures the query/observer engines register.

use bytes::Bytes;
use tracing::debug;

use crate::codec::pack;
use crate::dispatch::CommandArgs;
use crate::node::Node;

/// Reverses the escaping hosts apply to keep `${...}` expansions from
/// running on the sending side: `${\{` becomes `${` again before the line
/// reaches the local command parser.
pub fn unescape_command(raw: &str) -> String {
    raw.replace("$\\{", "${")
}

// ---------------------------------------------------------------------------
// Echo
// ---------------------------------------------------------------------------

/// A chat line for the receiving peer's sink.
pub(crate) struct Echo;

impl Echo {
    pub(crate) const TAG: &'static str = "Echo";

    pub(crate) fn payload(text: &str) -> Bytes {
        pack(&[Self::TAG, text])
    }

    fn handle(node: &Node, mut args: CommandArgs) -> bool {
        let text = match args.take_str() {
            Ok(text) => text,
            Err(err) => {
                debug!(from = %args.from, %err, "echo: malformed payload");
                return false;
            }
        };
        let settings = node.settings();
        let line = if args.group.is_empty() || !settings.show_groups {
            format!("[ {} ] {}", node.display_name(&args.from), text)
        } else {
            format!("[ --> ({}) ] {}", args.group, text)
        };
        node.chat_line(&line);
        false
    }
}

// ---------------------------------------------------------------------------
// Execute
// ---------------------------------------------------------------------------

/// A command line to run through the receiving host's command parser.
pub(crate) struct Execute;

impl Execute {
    pub(crate) const TAG: &'static str = "Execute";

    pub(crate) fn payload(command: &str) -> Bytes {
        pack(&[Self::TAG, command])
    }

    fn handle(node: &Node, mut args: CommandArgs) -> bool {
        let command = match args.take_str() {
            Ok(command) => unescape_command(&command),
            Err(err) => {
                debug!(from = %args.from, %err, "execute: malformed payload");
                return false;
            }
        };
        if node.settings().command_echo {
            node.chat_line(&format!(
                "[ {} ] => {}",
                node.display_name(&args.from),
                command
            ));
        }
        node.evaluator().execute(&command);
        false
    }
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// A one-shot evaluation request. The reply whisper carries the caller's
/// response tag and the stringified value.
pub(crate) struct Query;

impl Query {
    pub(crate) const TAG: &'static str = "Query";

    pub(crate) fn request(response_tag: &str, expr: &str) -> Bytes {
        pack(&[Self::TAG, response_tag, expr])
    }

    fn handle(node: &Node, mut args: CommandArgs) -> bool {
        let (tag, expr) = match (args.take_str(), args.take_str()) {
            (Ok(tag), Ok(expr)) => (tag, expr),
            _ => {
                debug!(from = %args.from, "query: malformed payload");
                return false;
            }
        };
        let value = node
            .evaluator()
            .evaluate(&expr)
            .unwrap_or_else(|| "NULL".to_string());
        node.whisper_payload(&args.from, pack(&[tag.as_str(), value.as_str()]));
        false
    }
}

// ---------------------------------------------------------------------------
// Observe
// ---------------------------------------------------------------------------

/// A standing-subscription request. The reply whisper carries the caller's
/// response tag, the dedicated observer group, and the current value.
pub(crate) struct Observe;

impl Observe {
    pub(crate) const TAG: &'static str = "Observe";

    pub(crate) fn request(response_tag: &str, expr: &str) -> Bytes {
        pack(&[Self::TAG, response_tag, expr])
    }

    fn handle(node: &Node, mut args: CommandArgs) -> bool {
        let (tag, expr) = match (args.take_str(), args.take_str()) {
            (Ok(tag), Ok(expr)) => (tag, expr),
            _ => {
                debug!(from = %args.from, "observe: malformed payload");
                return false;
            }
        };
        let group = node.register_observer(&expr);
        let value = node
            .evaluator()
            .evaluate(&expr)
            .unwrap_or_else(|| "NULL".to_string());
        node.whisper_payload(
            &args.from,
            pack(&[tag.as_str(), group.as_str(), value.as_str()]),
        );
        false
    }
}

// ---------------------------------------------------------------------------
// Update
// ---------------------------------------------------------------------------

/// A fresh value for an observer group this node consumes.
pub(crate) struct Update;

impl Update {
    pub(crate) const TAG: &'static str = "Update";

    pub(crate) fn payload(value: &str) -> Bytes {
        pack(&[Self::TAG, value])
    }

    fn handle(node: &Node, mut args: CommandArgs) -> bool {
        let value = match args.take_str() {
            Ok(value) => value,
            Err(err) => {
                debug!(from = %args.from, %err, "update: malformed payload");
                return false;
            }
        };
        if args.group.is_empty() {
            debug!(from = %args.from, "update arrived outside a group; dropping");
            return false;
        }
        node.apply_update(&args.group, &value);
        false
    }
}

// ---------------------------------------------------------------------------
// Reupdate
// ---------------------------------------------------------------------------

/// A request to drop the publish suppression cache so every active observer
/// re-emits on the next pass, changed value or not. Whispered at peers that
/// went evasive and came back.
pub(crate) struct Reupdate;

impl Reupdate {
    pub(crate) const TAG: &'static str = "Reupdate";

    pub(crate) fn payload() -> Bytes {
        pack(&[Self::TAG])
    }

    fn handle(node: &Node, args: CommandArgs) -> bool {
        debug!(from = %args.from, "reupdate: dropping publish cache");
        node.clear_publish_cache();
        false
    }
}

/// Installs the standard suite on a freshly constructed node.
pub(crate) fn register_standard(node: &Node) {
    node.register_command(Echo::TAG, Box::new(Echo::handle));
    node.register_command(Execute::TAG, Box::new(Execute::handle));
    node.register_command(Query::TAG, Box::new(Query::handle));
    node.register_command(Observe::TAG, Box::new(Observe::handle));
    node.register_command(Update::TAG, Box::new(Update::handle));
    node.register_command(Reupdate::TAG, Box::new(Reupdate::handle));
}
