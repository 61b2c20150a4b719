//! `tokio_util::codec` (de)framers for the handshake and the body messages,
//! grounded in the teacher's `peer/codec.rs` usage pattern (`Framed` +
//! `Decoder`/`Encoder`), visible from how `peer/mod.rs` drives
//! `Framed::new(socket, HandshakeCodec)` and later swaps in `PeerCodec` via
//! `FramedParts`.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{Handshake, Message, MessageId, PROTOCOL_STRING};
use crate::{Bitfield, Error, PieceIndex};

/// The fixed-size 75-byte handshake frame (spec.md §4.1).
pub const HANDSHAKE_LEN: usize = 11 + 32 + 32;

#[derive(Clone, Copy, Debug, Default)]
pub struct HandshakeCodec;

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Handshake>, Error> {
        if src.len() < HANDSHAKE_LEN {
            src.reserve(HANDSHAKE_LEN - src.len());
            return Ok(None);
        }
        let prefix = src.split_to(PROTOCOL_STRING.len());
        if prefix != PROTOCOL_STRING.as_bytes() {
            return Err(Error::InvalidHandshakePrefix {
                expected: PROTOCOL_STRING,
                got: prefix.to_vec(),
            });
        }
        let mut peer_id = [0u8; 32];
        src.copy_to_slice(&mut peer_id);
        let mut info_hash = [0u8; 32];
        src.copy_to_slice(&mut info_hash);
        Ok(Some(Handshake::new(peer_id, info_hash)))
    }
}

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, dst: &mut BytesMut) -> Result<(), Error> {
        dst.reserve(HANDSHAKE_LEN);
        dst.put_slice(PROTOCOL_STRING.as_bytes());
        dst.put_slice(&handshake.peer_id);
        dst.put_slice(&handshake.info_hash);
        Ok(())
    }
}

/// Decodes/encodes the three length-prefixed body messages (spec.md §4.1,
/// §6). The piece count must be known up front to size incoming bitfields.
#[derive(Clone, Copy, Debug)]
pub struct MessageCodec {
    piece_count: usize,
    max_block_len: u32,
}

impl MessageCodec {
    pub fn new(piece_count: usize, max_block_len: u32) -> Self {
        Self {
            piece_count,
            max_block_len,
        }
    }

    fn bitfield_byte_len(&self) -> usize {
        (self.piece_count + 7) / 8
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes(src[0..4].try_into().unwrap()) as usize;
        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let tag = src[0];
        let id = MessageId::from_tag(tag).ok_or(Error::UnknownMessageType(tag))?;
        src.advance(1);
        let body_len = length - 1;

        let msg = match id {
            MessageId::Request => {
                if body_len != 12 {
                    return Err(Error::MalformedFrame);
                }
                let piece_index = src.get_u32() as PieceIndex;
                let inner_offset = src.get_u32();
                let block_length = src.get_u32();
                Message::Request {
                    piece_index,
                    inner_offset,
                    block_length,
                }
            }
            MessageId::Piece => {
                if body_len < 12 {
                    return Err(Error::MalformedFrame);
                }
                let piece_index = src.get_u32() as PieceIndex;
                let inner_offset = src.get_u32();
                let block_length = src.get_u32();
                if block_length > self.max_block_len {
                    return Err(Error::BlockTooLarge {
                        len: block_length,
                        max: self.max_block_len,
                    });
                }
                if body_len != 12 + block_length as usize {
                    return Err(Error::MalformedFrame);
                }
                let data = src.split_to(block_length as usize).to_vec();
                Message::Piece {
                    piece_index,
                    inner_offset,
                    block_length,
                    data,
                }
            }
            MessageId::Bitfield => {
                if body_len != self.bitfield_byte_len() {
                    return Err(Error::MalformedFrame);
                }
                let raw = src.split_to(body_len);
                let mut bits = Bitfield::repeat(false, self.piece_count);
                for i in 0..self.piece_count {
                    let byte = raw[i / 8];
                    let has_piece = (byte >> (7 - (i % 8))) & 1 == 1;
                    bits.set(i, has_piece);
                }
                Message::Bitfield(bits)
            }
        };

        Ok(Some(msg))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Error> {
        match msg {
            Message::Request {
                piece_index,
                inner_offset,
                block_length,
            } => {
                dst.reserve(4 + 1 + 12);
                dst.put_u32(13);
                dst.put_u8(MessageId::Request as u8);
                dst.put_u32(piece_index as u32);
                dst.put_u32(inner_offset);
                dst.put_u32(block_length);
            }
            Message::Piece {
                piece_index,
                inner_offset,
                block_length,
                data,
            } => {
                dst.reserve(4 + 1 + 12 + data.len());
                dst.put_u32(13 + data.len() as u32);
                dst.put_u8(MessageId::Piece as u8);
                dst.put_u32(piece_index as u32);
                dst.put_u32(inner_offset);
                dst.put_u32(block_length);
                dst.put_slice(&data);
            }
            Message::Bitfield(bits) => {
                let raw = bits.as_raw_slice().to_vec();
                dst.reserve(4 + 1 + raw.len());
                dst.put_u32(1 + raw.len() as u32);
                dst.put_u8(MessageId::Bitfield as u8);
                dst.put_slice(&raw);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trips() {
        let mut codec = HandshakeCodec;
        let handshake = Handshake::new([7u8; 32], [9u8; 32]);
        let mut buf = BytesMut::new();
        codec.encode(handshake, &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn handshake_rejects_bad_prefix() {
        let mut codec = HandshakeCodec;
        let mut buf = BytesMut::new();
        buf.put_slice(&[b'x'; HANDSHAKE_LEN]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::InvalidHandshakePrefix { .. })
        ));
    }

    #[test]
    fn handshake_waits_for_more_bytes() {
        let mut codec = HandshakeCodec;
        let mut buf = BytesMut::new();
        buf.put_slice(b"TorrentInno");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn request_round_trips() {
        let mut codec = MessageCodec::new(4, 1_000_000);
        let msg = Message::Request {
            piece_index: 2,
            inner_offset: 0,
            block_length: 128,
        };
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn piece_round_trips() {
        let mut codec = MessageCodec::new(4, 1_000_000);
        let msg = Message::Piece {
            piece_index: 1,
            inner_offset: 0,
            block_length: 5,
            data: b"hello".to_vec(),
        };
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn piece_at_cap_is_accepted() {
        let mut codec = MessageCodec::new(1, 1_000_000);
        let msg = Message::Piece {
            piece_index: 0,
            inner_offset: 0,
            block_length: 1_000_000,
            data: vec![0u8; 1_000_000],
        };
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), msg);
    }

    #[test]
    fn piece_over_cap_is_rejected() {
        let mut codec = MessageCodec::new(1, 1_000_000);
        let mut buf = BytesMut::new();
        let declared_block_length = 1_500_000u32;
        let length = 13u32 + declared_block_length;
        buf.put_u32(length);
        buf.put_u8(MessageId::Piece as u8);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(declared_block_length);
        buf.put_slice(&vec![0u8; declared_block_length as usize]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::BlockTooLarge { .. })
        ));
    }

    #[test]
    fn bitfield_round_trips_with_padding() {
        // 10 pieces needs 2 bytes, 6 pad bits
        let mut codec = MessageCodec::new(10, 1_000_000);
        let mut bits = Bitfield::repeat(false, 10);
        bits.set(0, true);
        bits.set(1, true);
        bits.set(9, true);
        let msg = Message::Bitfield(bits);
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), 4 + 1 + 2);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn unknown_type_tag_errors() {
        let mut codec = MessageCodec::new(1, 1_000_000);
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(99);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::UnknownMessageType(99))
        ));
    }

    #[test]
    fn decode_waits_for_full_frame() {
        let mut codec = MessageCodec::new(1, 1_000_000);
        let mut buf = BytesMut::new();
        buf.put_u32(13);
        buf.put_u8(MessageId::Request as u8);
        // only 8 of the 12 expected body bytes so far
        buf.put_u32(0);
        buf.put_u32(0);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }
}
