//! Wire message types exchanged between peers: the handshake and the three
//! framed message kinds (spec.md §4.1, §6).

pub mod codec;

use crate::{PeerId, PieceIndex, Sha256Hash};

/// The ASCII protocol identifier sent at the start of every handshake.
pub const PROTOCOL_STRING: &str = "TorrentInno";

/// The handshake is a fixed 75-byte frame (not length-prefixed, unlike every
/// other message): the 11-byte protocol string, a 32-byte peer id, and a
/// 32-byte info hash (spec.md §4.1, §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub peer_id: PeerId,
    pub info_hash: Sha256Hash,
}

impl Handshake {
    pub fn new(peer_id: PeerId, info_hash: Sha256Hash) -> Self {
        Self { peer_id, info_hash }
    }
}

/// The four message kinds that share the body stream after the handshake.
///
/// Unlike the teacher's `Message`, there is no `Choke`/`Interested`/`Have`/
/// `Cancel`/`KeepAlive` family: this spec's Non-goals (choking fairness,
/// sub-block pipelining) mean those never existed here in the first place.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Type 1. "Send me bytes `[inner_offset, inner_offset+block_length)` of
    /// piece `piece_index`."
    Request {
        piece_index: PieceIndex,
        inner_offset: u32,
        block_length: u32,
    },
    /// Type 2. The reply to a `Request`.
    Piece {
        piece_index: PieceIndex,
        inner_offset: u32,
        block_length: u32,
        data: Vec<u8>,
    },
    /// Type 3. The sender's owned-piece bitfield, zero-padded to a whole
    /// number of bytes.
    Bitfield(crate::Bitfield),
}

impl Message {
    pub fn id(&self) -> MessageId {
        match self {
            Message::Request { .. } => MessageId::Request,
            Message::Piece { .. } => MessageId::Piece,
            Message::Bitfield(_) => MessageId::Bitfield,
        }
    }
}

/// The 1-byte type tag that precedes every framed message body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageId {
    Request = 1,
    Piece = 2,
    Bitfield = 3,
}

impl MessageId {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Request),
            2 => Some(Self::Piece),
            3 => Some(Self::Bitfield),
            _ => None,
        }
    }
}
