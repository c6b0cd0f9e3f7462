//! The crate's error type and the `Result` alias used throughout.

use crate::wire::MessageId;

/// The error kinds the peer wire protocol core can produce.
///
/// Codec-level errors ([`Error::MalformedFrame`], [`Error::UnknownType`],
/// [`Error::SemanticInvalid`]) are produced by the reader and propagate up
/// through [`crate::peer::exchange::PeerExchange`], which transitions to its
/// `Errored` state and lets the owning [`crate::peer::sharing_peer::SharingPeer`]
/// force-unbind and fire an `IOError` event. [`Error::ProtocolViolation`] is
/// raised from inside `handle_message` and is handled the same way.
/// [`Error::AlreadyBound`] and [`Error::AlreadyDownloading`] are programming
/// errors: a well-formed caller never observes them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The length-prefixed frame's declared length did not match the number
    /// of bytes actually available, or a fixed-size field was truncated.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The message type byte did not match any known message.
    #[error("unknown message type byte {0}")]
    UnknownType(u8),

    /// The message parsed structurally but failed validation against the
    /// torrent (e.g. a piece index out of range, or a request that overruns
    /// the piece).
    #[error("semantically invalid {0:?} message")]
    SemanticInvalid(MessageId),

    /// The peer violated the protocol in a way that calls for an immediate
    /// forced disconnect (e.g. REQUEST while we're choking it, or an
    /// oversized request).
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// A transport-level I/O failure.
    #[error("peer io error: {0}")]
    Io(#[from] std::io::Error),

    /// `bind` was called on a peer that already has an active exchange.
    #[error("peer session is already bound")]
    AlreadyBound,

    /// `download_piece` was called while a download was already in
    /// progress.
    #[error("peer session is already downloading a piece")]
    AlreadyDownloading,
}

/// The crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
