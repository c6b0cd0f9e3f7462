//! Framing and parsing of the BitTorrent peer wire protocol.
//!
//! [`codec::PeerCodec`] implements the steady-state, length-prefixed message
//! framing (§4.1 of the design document); [`handshake`] implements the
//! one-shot handshake frame that precedes it on every connection.

pub mod codec;
pub mod handshake;
pub mod message;

pub use codec::PeerCodec;
pub use handshake::{Handshake, HandshakeCodec, PROTOCOL_STRING};
pub use message::{BlockInfo, Message, MessageId};
