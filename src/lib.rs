//! The peer wire protocol core of a BitTorrent client.
//!
//! This crate implements the per-connection state machine that exchanges
//! pieces of a shared torrent with a remote peer over a framed binary
//! transport: message framing ([`wire`]), the choke/interest state machine
//! and block-request pipelining ([`peer`]), and the collaborator interfaces
//! ([`torrent`], [`listener`]) through which the enclosing client supplies
//! piece storage and receives activity events.
//!
//! Tracker announce traffic, `.torrent` metainfo parsing, piece selection,
//! piece hash validation, on-disk storage, and the swarm-wide choking
//! algorithm are all out of scope: they are consumed here only through the
//! [`torrent::Torrent`] and [`listener::PeerActivityListener`] traits.

pub mod conf;
pub mod error;
pub mod listener;
pub mod peer;
pub mod rate;
pub mod torrent;
pub mod wire;

#[cfg(test)]
pub(crate) mod test_support;

pub use bitvec::prelude::{BitVec, Msb0};

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The peer ID is an arbitrary 20 byte string.
///
/// Guidelines for choosing a peer ID: <http://bittorrent.org/beps/bep_0020.html>.
pub type RawPeerId = [u8; 20];

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector ordered most-significant-bit first, i.e. the
/// first bit represents the first piece, the second bit the second piece,
/// and so on (e.g. `0b1100_0001` means the peer has pieces 0, 1, and 7). Used
/// both for the decoded BITFIELD message and for `SharingPeer`'s
/// `available_pieces` set.
pub type Bitfield = BitVec<u8, Msb0>;

pub use error::{Error, Result};
