//! The peer message set and the types shared by the codec and the sharing
//! peer state machine.

use bytes::Bytes;

use crate::Bitfield;

/// The type byte that precedes every message's fields on the wire, per the
/// table in §4.1. KEEP_ALIVE has no type byte and no [`MessageId`]; it is
/// represented purely by [`Message::KeepAlive`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl MessageId {
    /// Maps a raw type byte to a [`MessageId`], returning `None` for unknown
    /// types (the decoder turns that into [`crate::Error::UnknownType`]).
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Piece,
            8 => Self::Cancel,
            _ => return None,
        })
    }
}

/// Identifies a block within a piece: the piece index, the byte offset of
/// the block within the piece, and its length. Shared by REQUEST, PIECE
/// (whose length is implicit in its block payload), and CANCEL.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub piece_index: u32,
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The block's length in bytes.
    pub length: u32,
}

impl BlockInfo {
    /// Returns the one-past-the-last byte offset of this block within its
    /// piece.
    pub fn end_offset(&self) -> u64 {
        self.offset as u64 + self.length as u64
    }
}

/// A single peer wire protocol message, decoded from (or to be encoded to) a
/// length-prefixed frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// An empty frame (`length == 0`) sent to keep the connection alive.
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// Announces that the sender now has the given piece.
    Have { piece_index: u32 },
    /// Announces the full set of pieces the sender has.
    Bitfield(Bitfield),
    /// Requests a block of a piece.
    Request(BlockInfo),
    /// A block of a piece, sent in response to a REQUEST.
    Piece {
        piece_index: u32,
        offset: u32,
        block: Bytes,
    },
    /// Cancels a previously sent REQUEST.
    Cancel(BlockInfo),
}

impl Message {
    /// Returns the [`MessageId`] of this message, or `None` for
    /// [`Message::KeepAlive`], which has no type byte.
    pub fn id(&self) -> Option<MessageId> {
        Some(match self {
            Self::KeepAlive => return None,
            Self::Choke => MessageId::Choke,
            Self::Unchoke => MessageId::Unchoke,
            Self::Interested => MessageId::Interested,
            Self::NotInterested => MessageId::NotInterested,
            Self::Have { .. } => MessageId::Have,
            Self::Bitfield(_) => MessageId::Bitfield,
            Self::Request(_) => MessageId::Request,
            Self::Piece { .. } => MessageId::Piece,
            Self::Cancel(_) => MessageId::Cancel,
        })
    }
}
