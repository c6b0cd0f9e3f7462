//! The callback surface by which the core notifies the enclosing client of
//! peer activity (§6, §9 design note: "listener set instead of subclassing").

use std::sync::Arc;

use crate::error::Error;
use crate::peer::PeerId;
use crate::Bitfield;

/// A single peer activity event, as fired by [`crate::peer::sharing_peer::SharingPeer`].
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// The peer has choked us.
    PeerChoked(PeerId),
    /// The peer has unchoked us, or we just finished a piece: the scheduler
    /// may want to assign this peer a new piece to download.
    PeerReady(PeerId),
    /// The peer announced (via HAVE) that it now has `piece_index`.
    PieceAvailability { peer: PeerId, piece_index: u32 },
    /// The peer sent its full bitfield.
    BitfieldAvailability {
        peer: PeerId,
        available: Bitfield,
    },
    /// We finished uploading the last block of `piece_index` to the peer.
    PieceSent { peer: PeerId, piece_index: u32 },
    /// We finished downloading and validating `piece_index` from the peer.
    PieceCompleted { peer: PeerId, piece_index: u32 },
    /// The peer connection has been torn down.
    PeerDisconnected(PeerId),
    /// A transport or protocol error occurred on this peer's connection.
    IoError(PeerId, Arc<Error>),
}

/// The capability object through which [`crate::peer::sharing_peer::SharingPeer`]
/// reports activity.
///
/// Implementations must not block indefinitely: the core calls this
/// synchronously from within message handling, so a slow listener stalls
/// that peer's message processing (the per-peer lock is released before
/// the event fires, so other peers' processing is unaffected). Dispatch
/// heavy work to another task instead.
pub trait PeerActivityListener: Send + Sync {
    fn on_event(&self, event: PeerEvent);
}

/// Fans a single event out to every registered listener, implementing the
/// "listener set" of the design notes as a capability object rather than a
/// single-consumer channel.
#[derive(Default)]
pub struct ListenerSet {
    listeners: Vec<Arc<dyn PeerActivityListener>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, listener: Arc<dyn PeerActivityListener>) {
        self.listeners.push(listener);
    }
}

impl PeerActivityListener for ListenerSet {
    fn on_event(&self, event: PeerEvent) {
        for listener in &self.listeners {
            listener.on_event(event.clone());
        }
    }
}

/// Forwards every event onto an `mpsc` channel, for callers who prefer a
/// single consumer draining events in its own task over implementing
/// [`PeerActivityListener`] directly (the channel-based alternative
/// mentioned in the design notes).
pub struct ChannelListener {
    sender: tokio::sync::mpsc::UnboundedSender<PeerEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<PeerEvent>) {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl PeerActivityListener for ChannelListener {
    fn on_event(&self, event: PeerEvent) {
        if self.sender.send(event).is_err() {
            log::warn!("Dropping peer event: listener channel closed");
        }
    }
}
