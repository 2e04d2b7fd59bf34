//! # Transport Actor
//!
//! One dedicated OS thread per entered node owns the transport handle
//! exclusively. Nothing else on the node calls `join`/`leave`/`shout`/
//! `whisper`, and nothing else writes the peer-facing membership tables.
//! The thread runs a current-thread tokio runtime and races three sources:
//!
//! 1. the host pipe (control messages from the node facade),
//! 2. the transport event stream,
//! 3. a keepalive sleep, so the loop wakes at least every `keepalive_ms`
//!    even on a dead-quiet fabric.
//!
//! Inbound WHISPER/SHOUT payloads are retagged with their sender (and shout
//! group) and appended to the host command queue; membership events are
//! applied to the registry in arrival order. The loop ends on a Term
//! message, a closed pipe, or a closed event stream, and always departs its
//! groups and stops the transport on the way out.

use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::codec::FrameReader;
use crate::commands::Reupdate;
use crate::config::NetSettings;
use crate::dispatch::{CommandQueue, Inbound};
use crate::membership::Membership;
use crate::transport::{GossipTransport, TransportEvent};

/// Control messages from the node facade to its actor.
///
/// Command-suite traffic rides `Shout`/`Whisper` as opaque framed payloads;
/// the actor never inspects more than the leading tag frame, and only for
/// inbound coalescing.
#[derive(Debug)]
pub(crate) enum ControlMsg {
    Join(String),
    Leave(String),
    Shout { group: String, payload: Bytes },
    Whisper { peer: String, payload: Bytes },
    SetEvasive(u64),
    SetExpired(u64),
    Term,
}

enum Wake {
    Control(Option<ControlMsg>),
    Event(Option<TransportEvent>),
    Keepalive,
}

pub(crate) struct Actor {
    local: String,
    transport: Box<dyn GossipTransport>,
    control: mpsc::UnboundedReceiver<ControlMsg>,
    ready: Option<SyncSender<()>>,
    registry: Arc<Membership>,
    queue: Arc<CommandQueue>,
    settings: Arc<RwLock<NetSettings>>,
}

impl Actor {
    pub(crate) fn new(
        local: String,
        transport: Box<dyn GossipTransport>,
        control: mpsc::UnboundedReceiver<ControlMsg>,
        ready: SyncSender<()>,
        registry: Arc<Membership>,
        queue: Arc<CommandQueue>,
        settings: Arc<RwLock<NetSettings>>,
    ) -> Self {
        Self {
            local,
            transport,
            control,
            ready: Some(ready),
            registry,
            queue,
            settings,
        }
    }

    /// Thread entry point. Builds the runtime and drives the loop to
    /// completion; the ready channel is released either way so `enter()`
    /// never hangs on a runtime that failed to build.
    pub(crate) fn run(mut self) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                error!(peer = %self.local, %err, "actor runtime construction failed");
                return;
            }
        };
        runtime.block_on(self.main_loop());
    }

    async fn main_loop(&mut self) {
        // Apply the configured liveness knobs and make good on any group
        // intent recorded before entry, then tell the facade we are live.
        let (evasive_ms, expired_ms) = {
            let settings = self.settings.read();
            (settings.evasive_ms, settings.expired_ms)
        };
        self.transport.set_evasive_timeout(evasive_ms);
        self.transport.set_expired_timeout(expired_ms);

        for group in self.registry.own_groups() {
            if let Err(err) = self.transport.join(&group).await {
                warn!(peer = %self.local, %group, %err, "initial group join failed");
            }
        }

        if let Some(ready) = self.ready.take() {
            let _ = ready.send(());
        }
        debug!(peer = %self.local, uuid = %self.transport.uuid(), "actor loop started");

        loop {
            let keepalive =
                Duration::from_millis(self.settings.read().keepalive_ms.max(1));
            let wake = tokio::select! {
                msg = self.control.recv() => Wake::Control(msg),
                event = self.transport.next_event() => Wake::Event(event),
                _ = tokio::time::sleep(keepalive) => Wake::Keepalive,
            };
            match wake {
                Wake::Control(None) => {
                    debug!(peer = %self.local, "host pipe closed");
                    break;
                }
                Wake::Control(Some(ControlMsg::Term)) => break,
                Wake::Control(Some(msg)) => self.handle_control(msg).await,
                Wake::Event(None) => {
                    warn!(peer = %self.local, "transport event stream closed");
                    break;
                }
                Wake::Event(Some(event)) => self.handle_event(event).await,
                Wake::Keepalive => {
                    trace!(peer = %self.local, "keepalive wake");
                }
            }
        }

        for group in self.transport.own_groups() {
            let _ = self.transport.leave(&group).await;
        }
        self.transport.stop().await;
        debug!(peer = %self.local, "actor loop stopped");
    }

    async fn handle_control(&mut self, msg: ControlMsg) {
        match msg {
            ControlMsg::Join(group) => {
                if let Err(err) = self.transport.join(&group).await {
                    warn!(peer = %self.local, %group, %err, "join failed");
                }
            }
            ControlMsg::Leave(group) => {
                if let Err(err) = self.transport.leave(&group).await {
                    warn!(peer = %self.local, %group, %err, "leave failed");
                }
            }
            ControlMsg::Shout { group, payload } => {
                if let Err(err) = self.transport.shout(&group, payload).await {
                    debug!(peer = %self.local, %group, %err, "shout failed");
                }
            }
            ControlMsg::Whisper { peer, payload } => match self.registry.uuid_of(&peer) {
                Some(uuid) => {
                    if let Err(err) = self.transport.whisper(uuid, payload).await {
                        debug!(peer = %self.local, target = %peer, %err, "whisper failed");
                    }
                }
                None => {
                    debug!(peer = %self.local, target = %peer, "dropping whisper to unknown peer");
                }
            },
            ControlMsg::SetEvasive(ms) => self.transport.set_evasive_timeout(ms),
            ControlMsg::SetExpired(ms) => self.transport.set_expired_timeout(ms),
            // Term is consumed by the main loop before dispatch.
            ControlMsg::Term => {}
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Enter { peer, uuid } => {
                if peer != self.local {
                    trace!(local = %self.local, %peer, %uuid, "peer entered");
                    self.registry.peer_entered(&peer, uuid);
                }
            }
            TransportEvent::Exit { peer } => {
                trace!(local = %self.local, %peer, "peer exited");
                self.registry.peer_exited(&peer);
            }
            TransportEvent::Join { peer, group } => {
                if peer != self.local {
                    trace!(local = %self.local, %peer, %group, "peer joined group");
                    self.registry.peer_joined(&peer, &group);
                }
            }
            TransportEvent::Leave { peer, group } => {
                self.registry.peer_left(&peer, &group);
            }
            TransportEvent::Whisper { peer, payload } => {
                self.enqueue(peer, String::new(), payload);
            }
            TransportEvent::Shout {
                peer,
                group,
                payload,
            } => {
                self.enqueue(peer, group, payload);
            }
            TransportEvent::Evasive { peer } | TransportEvent::Silent { peer } => {
                self.refresh_evasive_peer(&peer).await;
            }
        }
    }

    /// Re-syncs a peer the transport flagged as stale: once it is reachable
    /// again, a Reupdate makes it re-emit every active observer, changed
    /// value or not. Gated on the `evasive_refresh` flag.
    async fn refresh_evasive_peer(&mut self, peer: &str) {
        if peer == self.local || !self.settings.read().evasive_refresh {
            return;
        }
        let Some(uuid) = self.registry.uuid_of(peer) else {
            return;
        };
        debug!(local = %self.local, %peer, "whispering reupdate to evasive peer");
        if let Err(err) = self.transport.whisper(uuid, Reupdate::payload()).await {
            debug!(local = %self.local, %peer, %err, "evasive reupdate failed");
        }
    }

    /// Retags an inbound payload with its origin and queues it for the host
    /// tick. Malformed payloads are logged and dropped here, before they can
    /// reach a handler.
    fn enqueue(&self, from: String, group: String, payload: Bytes) {
        let mut reader = FrameReader::new(payload);
        let tag = match reader.take_str() {
            Ok(tag) => tag,
            Err(err) => {
                debug!(local = %self.local, %from, %err, "dropping malformed payload");
                return;
            }
        };
        trace!(local = %self.local, %tag, %from, %group, "queueing inbound command");
        self.queue.push(Inbound {
            tag,
            from,
            group,
            rest: reader.rest(),
        });
    }
}
