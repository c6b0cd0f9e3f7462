//! The one-shot BitTorrent handshake that precedes the framed message
//! stream on every connection (§6).

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::{RawPeerId, Sha1Hash};

/// The protocol string identifying the BitTorrent wire protocol, as sent in
/// every handshake.
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

const RESERVED_LEN: usize = 8;
const HANDSHAKE_LEN: usize =
    1 + PROTOCOL_STRING.len() + RESERVED_LEN + 20 + 20;

/// The initial BitTorrent handshake: `pstrlen (1 byte, = 19), pstr ("BitTorrent
/// protocol"), reserved (8 zero bytes), info_hash (20 bytes), peer_id (20
/// bytes)`.
#[derive(Clone, Debug, PartialEq)]
pub struct Handshake {
    /// The protocol string, always [`PROTOCOL_STRING`] for a well-formed
    /// handshake we produced ourselves, but preserved verbatim from the peer
    /// on decode so callers can reject unexpected protocols.
    pub prot: Vec<u8>,
    pub info_hash: Sha1Hash,
    pub peer_id: RawPeerId,
}

impl Handshake {
    /// Builds a handshake for the given torrent and our own peer id. The 8
    /// reserved bytes are always zero: this core does not negotiate
    /// extensions.
    pub fn new(info_hash: Sha1Hash, peer_id: RawPeerId) -> Self {
        Self {
            prot: PROTOCOL_STRING.as_bytes().to_vec(),
            info_hash,
            peer_id,
        }
    }

    /// Returns whether the advertised protocol string matches
    /// [`PROTOCOL_STRING`].
    pub fn has_valid_protocol(&self) -> bool {
        self.prot == PROTOCOL_STRING.as_bytes()
    }
}

/// The codec for the one-shot handshake frame.
///
/// After a successful handshake exchange, the connection switches to
/// [`super::codec::PeerCodec`] by reusing the underlying `Framed`'s buffers
/// via `tokio_util::codec::FramedParts`, so that any bytes the peer sent
/// immediately after its handshake are not lost.
#[derive(Clone, Copy, Debug, Default)]
pub struct HandshakeCodec;

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let pstrlen = src[0] as usize;
        let full_len = 1 + pstrlen + RESERVED_LEN + 20 + 20;
        if src.len() < full_len {
            src.reserve(full_len - src.len());
            return Ok(None);
        }

        let mut src = src.split_to(full_len);
        src.advance(1);
        let prot = src.split_to(pstrlen).to_vec();
        // reserved bytes are not surfaced: this core doesn't negotiate
        // extensions
        src.advance(RESERVED_LEN);
        let mut info_hash = [0; 20];
        src.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        src.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            info_hash,
            peer_id,
        }))
    }
}

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        item: Handshake,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        dst.reserve(1 + item.prot.len() + RESERVED_LEN + 20 + 20);
        dst.put_u8(item.prot.len() as u8);
        dst.put(item.prot.as_slice());
        dst.put_bytes(0, RESERVED_LEN);
        dst.put(&item.info_hash[..]);
        dst.put(&item.peer_id[..]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trips_a_well_formed_handshake() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
        assert!(decoded.has_valid_protocol());
    }

    #[test]
    fn waits_for_more_bytes_on_a_partial_frame() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        let mut partial = buf.split_to(buf.len() - 1);

        assert_eq!(HandshakeCodec.decode(&mut partial).unwrap(), None);
    }
}
