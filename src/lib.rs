// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

#[macro_use]
extern crate serde_derive;

pub mod conf;
pub mod connection;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod facade;
mod piece_table;
pub mod resource_file;
pub mod resume;
pub mod wire;

use bitvec::prelude::{BitVec, Msb0};

pub use error::{Error, Result};

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in the
/// source code we use `usize` to be consistent with other index types in Rust.
pub type PieceIndex = usize;

/// A peer id is 32 arbitrary bytes, chosen randomly by each client at
/// startup. Lexicographic order over the raw bytes is the same as
/// lexicographic order over their lowercase hex encoding, which is the
/// ordering the initiator rule (see [`engine`]) is specified in terms of.
pub type PeerId = [u8; 32];

/// A SHA-256 hash digest, 32 bytes long.
pub type Sha256Hash = [u8; 32];

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector from most significant to least significant
/// bits, i.e. the first highest bit represents the first piece, the second
/// highest bit the second piece, and so on (e.g. `0b1100_0001` would mean
/// that the peer has pieces 0, 1, and 7).
pub type Bitfield = BitVec<Msb0, u8>;

/// A peer id that is used by nothing and compares lower than any id derived
/// from [`rand`], useful as a placeholder in tests.
pub const NULL_PEER_ID: PeerId = [0u8; 32];

/// Returns a freshly generated, random 32-byte peer id.
///
/// Every process gets exactly one of these; see [`facade::TorrentInno`].
pub fn generate_peer_id() -> PeerId {
    let mut id = [0u8; 32];
    rand::Rng::fill(&mut rand::thread_rng(), &mut id);
    id
}

/// Hex-encodes a peer id or hash for log messages, truncated to the first
/// six hex characters, mirroring the compact peer id prefixes the original
/// implementation logs.
pub(crate) fn short_hex(bytes: &[u8]) -> String {
    let full = hex::encode(bytes);
    full[..full.len().min(6)].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_peer_ids_are_distinct() {
        let a = generate_peer_id();
        let b = generate_peer_id();
        // astronomically unlikely to collide; guards against a broken RNG
        // wiring that would always return the zero id
        assert_ne!(a, b);
        assert_ne!(a, NULL_PEER_ID);
    }

    #[test]
    fn short_hex_truncates() {
        let hash = [0xabu8; 32];
        assert_eq!(short_hex(&hash), "ababab");
    }
}
