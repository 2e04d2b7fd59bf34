//! # Command Dispatch
//!
//! Inbound traffic flows through two stages. The actor thread decodes the
//! leading tag frame of every WHISPER/SHOUT payload and appends an
//! [`Inbound`] entry to the shared queue; the host tick drains the queue one
//! entry at a time through [`Node::do_next`], looking handlers up by tag.
//!
//! Handlers are `FnMut(&Node, CommandArgs) -> bool`; returning `true` means
//! "done, unregister me", which is how one-shot response handlers retire
//! themselves. A message whose tag has no registration is dropped after the
//! single lookup: the handler was transient and has already expired.
//!
//! Update messages are special-cased at enqueue time: a newer Update for the
//! same `(from, group)` supersedes any older one still waiting in the queue.
//! Everything else is delivered in arrival order.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use crate::codec::FrameReader;
use crate::commands::Update;
use crate::error::CodecError;
use crate::node::Node;

/// Tag prefix of correlator-allocated response handlers.
pub(crate) const RESPONSE_PREFIX: &str = "response_";

/// A registered command handler. Return `true` to unregister.
pub type CommandHandler = Box<dyn FnMut(&Node, CommandArgs) -> bool + Send>;

// ---------------------------------------------------------------------------
// Inbound queue
// ---------------------------------------------------------------------------

/// One decoded inbound message waiting for dispatch.
#[derive(Debug)]
pub(crate) struct Inbound {
    pub tag: String,
    pub from: String,
    /// Shout group, or empty for whispers.
    pub group: String,
    /// The argument frames after the tag, boundaries intact.
    pub rest: Bytes,
}

/// The MPSC command queue between the actor and the host tick.
#[derive(Debug, Default)]
pub(crate) struct CommandQueue {
    entries: Mutex<VecDeque<Inbound>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry. Updates coalesce: any pending Update for the same
    /// `(from, group)` is dropped in favor of the newcomer.
    pub fn push(&self, inbound: Inbound) {
        let mut entries = self.entries.lock();
        if inbound.tag == Update::TAG {
            entries.retain(|e| {
                e.tag != Update::TAG || e.from != inbound.from || e.group != inbound.group
            });
        }
        entries.push_back(inbound);
    }

    pub fn pop(&self) -> Option<Inbound> {
        self.entries.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

// ---------------------------------------------------------------------------
// Handler arguments
// ---------------------------------------------------------------------------

/// The argument view a handler receives: the sender, the shout group (empty
/// for whispers), and a frame reader positioned after the tag.
#[derive(Debug)]
pub struct CommandArgs {
    pub from: String,
    pub group: String,
    reader: FrameReader,
}

impl CommandArgs {
    pub(crate) fn new(from: String, group: String, rest: Bytes) -> Self {
        Self {
            from,
            group,
            reader: FrameReader::new(rest),
        }
    }

    /// Consumes the next argument frame as a string.
    pub fn take_str(&mut self) -> Result<String, CodecError> {
        self.reader.take_str()
    }

    /// Consumes the next argument frame as raw bytes.
    pub fn take_bytes(&mut self) -> Result<Bytes, CodecError> {
        self.reader.take_bytes()
    }
}

// ---------------------------------------------------------------------------
// Node surface
// ---------------------------------------------------------------------------

impl Node {
    /// Registers a handler under a command tag, replacing any previous one.
    pub fn register_command(&self, tag: &str, handler: CommandHandler) {
        self.inner.commands.lock().insert(tag.to_string(), handler);
    }

    /// Removes a handler registration.
    pub fn unregister_command(&self, tag: &str) {
        self.inner.commands.lock().remove(tag);
    }

    /// Allocates a fresh one-shot response tag for `handler` and returns it.
    ///
    /// Tags are `response_<n>` with a wrapping counter. A tag still live in
    /// the registry is skipped, so no two live handlers ever share one; the
    /// slot is reclaimed when the handler returns `true` from dispatch.
    pub fn register_response(&self, handler: CommandHandler) -> String {
        let mut commands = self.inner.commands.lock();
        let tag = loop {
            let n = self
                .inner
                .response_counter
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1);
            let tag = format!("{RESPONSE_PREFIX}{n}");
            if !commands.contains_key(&tag) {
                break tag;
            }
        };
        commands.insert(tag.clone(), handler);
        tag
    }

    /// Pops at most one queued message and dispatches it. Returns whether a
    /// message was consumed.
    ///
    /// The handler runs with its registration temporarily removed, so it may
    /// freely register and unregister other tags; it is reinstated afterward
    /// unless it reported itself done (or re-registered its own tag).
    pub fn do_next(&self) -> bool {
        let Some(inbound) = self.inner.queue.pop() else {
            return false;
        };
        let Inbound {
            tag,
            from,
            group,
            rest,
        } = inbound;

        let Some(mut handler) = self.inner.commands.lock().remove(&tag) else {
            trace!(%tag, %from, "dropping message for unregistered command tag");
            return true;
        };

        let args = CommandArgs::new(from, group, rest);
        self.inner.dispatching.store(true, Ordering::SeqCst);
        let done = handler(self, args);
        self.inner.dispatching.store(false, Ordering::SeqCst);

        if !done {
            self.inner.commands.lock().entry(tag).or_insert(handler);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::pack;

    fn inbound(tag: &str, from: &str, group: &str, rest: &[&str]) -> Inbound {
        Inbound {
            tag: tag.to_string(),
            from: from.to_string(),
            group: group.to_string(),
            rest: pack(rest),
        }
    }

    #[test]
    fn queue_is_fifo_for_ordinary_tags() {
        let q = CommandQueue::new();
        q.push(inbound("Echo", "a", "", &["one"]));
        q.push(inbound("Echo", "a", "", &["two"]));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().unwrap().rest, pack(&["one"]));
        assert_eq!(q.pop().unwrap().rest, pack(&["two"]));
        assert!(q.pop().is_none());
    }

    #[test]
    fn updates_coalesce_per_sender_and_group() {
        let q = CommandQueue::new();
        q.push(inbound("Update", "bob", "bob_1", &["10"]));
        q.push(inbound("Echo", "bob", "", &["hi"]));
        q.push(inbound("Update", "bob", "bob_2", &["99"]));
        q.push(inbound("Update", "bob", "bob_1", &["11"]));
        q.push(inbound("Update", "bob", "bob_1", &["12"]));

        // The two stale bob_1 updates are gone; everything else survives.
        assert_eq!(q.len(), 3);
        let drained: Vec<Inbound> = std::iter::from_fn(|| q.pop()).collect();
        let bob_1: Vec<&Inbound> = drained.iter().filter(|i| i.group == "bob_1").collect();
        assert_eq!(bob_1.len(), 1);
        assert_eq!(bob_1[0].rest, pack(&["12"]));
        assert!(drained.iter().any(|i| i.tag == "Echo"));
        assert!(drained.iter().any(|i| i.group == "bob_2"));
    }

    #[test]
    fn updates_from_different_senders_do_not_coalesce() {
        let q = CommandQueue::new();
        q.push(inbound("Update", "bob", "shared_1", &["1"]));
        q.push(inbound("Update", "carol", "shared_1", &["2"]));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn command_args_expose_frames_in_order() {
        let mut args = CommandArgs::new("bob".into(), "all".into(), pack(&["x", "y"]));
        assert_eq!(args.from, "bob");
        assert_eq!(args.group, "all");
        assert_eq!(args.take_str().unwrap(), "x");
        assert_eq!(args.take_str().unwrap(), "y");
        assert!(args.take_str().is_err());
    }
}
