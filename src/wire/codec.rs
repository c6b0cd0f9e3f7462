//! The steady-state, length-prefixed peer message codec (§4.1).

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::torrent::Torrent;
use crate::Bitfield;

use super::message::{BlockInfo, Message, MessageId};

/// The largest frame we're willing to buffer before giving up on the peer.
/// Generous enough for any legitimate PIECE message (at most
/// [`crate::conf::MAX_REQUEST_SIZE`] plus a few header bytes) while still
/// bounding how much a misbehaving peer can make us allocate.
const MAX_FRAME_LEN: usize = 2 * crate::conf::MAX_REQUEST_SIZE as usize;

const LEN_HEADER_LEN: usize = 4;

/// Decodes and encodes the framed peer message stream, validating every
/// incoming message against the torrent it's scoped to (§4.1 step 5).
pub struct PeerCodec {
    torrent: Arc<dyn Torrent>,
}

impl PeerCodec {
    pub fn new(torrent: Arc<dyn Torrent>) -> Self {
        Self { torrent }
    }

    fn validate(&self, msg: &Message) -> Result<(), Error> {
        let piece_count = self.torrent.piece_count();
        match msg {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => Ok(()),
            Message::Have { piece_index } => {
                if *piece_index < piece_count {
                    Ok(())
                } else {
                    Err(Error::SemanticInvalid(MessageId::Have))
                }
            }
            Message::Bitfield(bitfield) => {
                let highest_set = bitfield.iter_ones().last();
                match highest_set {
                    Some(bit) if bit as u32 >= piece_count => {
                        Err(Error::SemanticInvalid(MessageId::Bitfield))
                    }
                    _ => Ok(()),
                }
            }
            Message::Request(block) => {
                self.validate_block(block, MessageId::Request)
            }
            Message::Cancel(block) => {
                self.validate_block(block, MessageId::Cancel)
            }
            Message::Piece {
                piece_index,
                offset,
                block,
            } => {
                let block = BlockInfo {
                    piece_index: *piece_index,
                    offset: *offset,
                    length: block.len() as u32,
                };
                self.validate_block(&block, MessageId::Piece)
            }
        }
    }

    fn validate_block(
        &self,
        block: &BlockInfo,
        id: MessageId,
    ) -> Result<(), Error> {
        match self.torrent.piece_len(block.piece_index) {
            Some(piece_len) if block.end_offset() <= piece_len as u64 => {
                Ok(())
            }
            _ => Err(Error::SemanticInvalid(id)),
        }
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LEN_HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes(src[0..4].try_into().unwrap()) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::MalformedFrame(format!(
                "frame length {} exceeds maximum {}",
                len, MAX_FRAME_LEN
            )));
        }
        if src.len() < LEN_HEADER_LEN + len {
            src.reserve(LEN_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(LEN_HEADER_LEN);

        if len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let mut payload = src.split_to(len);
        let type_byte = payload.get_u8();
        let id = MessageId::from_byte(type_byte)
            .ok_or(Error::UnknownType(type_byte))?;

        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                Self::require_len(&payload, 4, id)?;
                Message::Have {
                    piece_index: payload.get_u32(),
                }
            }
            MessageId::Bitfield => {
                Message::Bitfield(Bitfield::from_vec(payload.to_vec()))
            }
            MessageId::Request => {
                Message::Request(Self::decode_block(&mut payload, id)?)
            }
            MessageId::Piece => {
                Self::require_len(&payload, 8, id)?;
                let piece_index = payload.get_u32();
                let offset = payload.get_u32();
                Message::Piece {
                    piece_index,
                    offset,
                    block: Bytes::copy_from_slice(&payload),
                }
            }
            MessageId::Cancel => {
                Message::Cancel(Self::decode_block(&mut payload, id)?)
            }
        };

        self.validate(&msg)?;

        Ok(Some(msg))
    }
}

impl PeerCodec {
    fn require_len(
        buf: &BytesMut,
        min_len: usize,
        id: MessageId,
    ) -> Result<(), Error> {
        if buf.len() < min_len {
            Err(Error::MalformedFrame(format!(
                "{:?} payload is {} bytes, expected at least {}",
                id,
                buf.len(),
                min_len
            )))
        } else {
            Ok(())
        }
    }

    fn decode_block(
        payload: &mut BytesMut,
        id: MessageId,
    ) -> Result<BlockInfo, Error> {
        Self::require_len(payload, 12, id)?;
        Ok(BlockInfo {
            piece_index: payload.get_u32(),
            offset: payload.get_u32(),
            length: payload.get_u32(),
        })
    }
}

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(
        &mut self,
        item: Message,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match item {
            Message::KeepAlive => {
                dst.put_u32(0);
            }
            Message::Choke => Self::put_header_only(dst, MessageId::Choke),
            Message::Unchoke => {
                Self::put_header_only(dst, MessageId::Unchoke)
            }
            Message::Interested => {
                Self::put_header_only(dst, MessageId::Interested)
            }
            Message::NotInterested => {
                Self::put_header_only(dst, MessageId::NotInterested)
            }
            Message::Have { piece_index } => {
                dst.put_u32(1 + 4);
                dst.put_u8(MessageId::Have as u8);
                dst.put_u32(piece_index);
            }
            Message::Bitfield(bitfield) => {
                let raw = bitfield.into_vec();
                dst.put_u32(1 + raw.len() as u32);
                dst.put_u8(MessageId::Bitfield as u8);
                dst.put_slice(&raw);
            }
            Message::Request(block) => {
                Self::put_block(dst, MessageId::Request, &block)
            }
            Message::Cancel(block) => {
                Self::put_block(dst, MessageId::Cancel, &block)
            }
            Message::Piece {
                piece_index,
                offset,
                block,
            } => {
                dst.put_u32(1 + 4 + 4 + block.len() as u32);
                dst.put_u8(MessageId::Piece as u8);
                dst.put_u32(piece_index);
                dst.put_u32(offset);
                dst.put_slice(&block);
            }
        }
        Ok(())
    }
}

impl PeerCodec {
    fn put_header_only(dst: &mut BytesMut, id: MessageId) {
        dst.put_u32(1);
        dst.put_u8(id as u8);
    }

    fn put_block(dst: &mut BytesMut, id: MessageId, block: &BlockInfo) {
        dst.put_u32(1 + 4 + 4 + 4);
        dst.put_u8(id as u8);
        dst.put_u32(block.piece_index);
        dst.put_u32(block.offset);
        dst.put_u32(block.length);
    }
}
