//! The resource descriptor: immutable metadata identifying a shared file
//! and its pieces, and the info hash derived from it.
//!
//! Grounded in the teacher's `metainfo.rs` (which parses a bencoded
//! BitTorrent metainfo file and derives a SHA-1 info hash over its `info`
//! dictionary), reshaped to this spec's JSON-encoded descriptor and SHA-256
//! canonical-string info hash (spec.md §3, §6).

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{PieceIndex, Sha256Hash};

/// A single piece's metadata: its expected hash and byte length.
///
/// Accepts both `size` and `size_bytes` as the JSON key for the length field
/// on read, to interoperate with legacy descriptor files (spec.md §6, §9);
/// always writes `size`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Piece {
    pub sha256: String,
    #[serde(alias = "size_bytes")]
    pub size: u32,
}

impl Piece {
    pub fn new(sha256_hex: impl Into<String>, size_bytes: u32) -> Self {
        Self {
            sha256: sha256_hex.into(),
            size: size_bytes,
        }
    }

    /// Renders this piece the way the canonical info-hash string requires:
    /// `Path(sha256=<hex>,size_bytes=<n>)`, preserved bytewise from the
    /// original implementation (see `original_source/client/core/common/resource.py`).
    fn canonical_repr(&self) -> String {
        format!("Path(sha256={},size_bytes={})", self.sha256, self.size)
    }
}

/// Immutable metadata describing a shared file: where its tracker lives,
/// its name and pieces. Two descriptors are the same resource iff their info
/// hashes match (spec.md §3).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    #[serde(rename = "trackerIp")]
    pub tracker_host: String,
    #[serde(rename = "trackerPort")]
    pub tracker_port: u16,
    pub comment: String,
    #[serde(rename = "creationDate")]
    pub creation_timestamp: String,
    pub name: String,
    pub pieces: Vec<Piece>,
}

impl ResourceDescriptor {
    pub fn new(
        tracker_host: impl Into<String>,
        tracker_port: u16,
        comment: impl Into<String>,
        creation_timestamp: impl Into<String>,
        name: impl Into<String>,
        pieces: Vec<Piece>,
    ) -> Self {
        Self {
            tracker_host: tracker_host.into(),
            tracker_port,
            comment: comment.into(),
            creation_timestamp: creation_timestamp.into(),
            name: name.into(),
            pieces,
        }
    }

    /// Convenience constructor that stamps the descriptor with the current
    /// UTC time in RFC3339 (a valid ISO-8601 rendering).
    pub fn new_now(
        tracker_host: impl Into<String>,
        tracker_port: u16,
        comment: impl Into<String>,
        name: impl Into<String>,
        pieces: Vec<Piece>,
    ) -> Self {
        Self::new(
            tracker_host,
            tracker_port,
            comment,
            chrono::Utc::now().to_rfc3339(),
            name,
            pieces,
        )
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// The total size of the resource, in bytes, i.e. the sum of all piece
    /// sizes.
    pub fn total_len(&self) -> u64 {
        self.pieces.iter().map(|p| p.size as u64).sum()
    }

    pub fn piece_len(&self, index: PieceIndex) -> crate::Result<u32> {
        self.pieces
            .get(index)
            .map(|p| p.size)
            .ok_or(crate::Error::InvalidPieceIndex(index))
    }

    /// Builds the canonical string this descriptor's info hash is derived
    /// from, bytewise identical to the original implementation's
    /// `Resource.get_info_hash` (spec.md §6).
    fn canonical_string(&self) -> String {
        let pieces = self
            .pieces
            .iter()
            .map(Piece::canonical_repr)
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "{};{};{};{};{};{}",
            self.tracker_host,
            self.tracker_port,
            self.comment,
            self.creation_timestamp,
            self.name,
            pieces
        )
    }

    /// Returns the SHA-256 info hash of this descriptor, hex-encoded
    /// lowercase (spec.md §6).
    pub fn info_hash(&self) -> Sha256Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_string().as_bytes());
        let digest = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&digest);
        hash
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash())
    }

    pub fn from_json(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_json(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

impl fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} pieces, {} bytes, info_hash={})",
            self.name,
            self.piece_count(),
            self.total_len(),
            &self.info_hash_hex()[..self.info_hash_hex().len().min(12)]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    // shadows std's assert_eq! with a diffing version, worth it for the
    // multi-field `ResourceDescriptor`/`Piece` comparisons below.
    use pretty_assertions::assert_eq;

    fn sample() -> ResourceDescriptor {
        ResourceDescriptor::new(
            "tracker.example.org",
            6969,
            "a test resource",
            "2024-01-01T00:00:00+00:00",
            "hello.txt",
            vec![Piece::new(
                "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824",
                5,
            )],
        )
    }

    #[test]
    fn canonical_string_matches_original_format() {
        let d = sample();
        assert_eq!(
            d.canonical_string(),
            "tracker.example.org;6969;a test resource;2024-01-01T00:00:00+00:00;hello.txt;\
             Path(sha256=2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824,size_bytes=5)"
        );
    }

    #[test]
    fn equal_descriptors_collide() {
        assert_eq!(sample().info_hash(), sample().info_hash());
    }

    #[test]
    fn differing_comment_changes_info_hash() {
        let mut other = sample();
        other.comment = "a different resource".to_string();
        assert_ne!(sample().info_hash(), other.info_hash());
    }

    #[test]
    fn reads_legacy_size_bytes_key() {
        let json = r#"{
            "trackerIp": "tracker.example.org",
            "trackerPort": 6969,
            "comment": "a test resource",
            "creationDate": "2024-01-01T00:00:00+00:00",
            "name": "hello.txt",
            "pieces": [{"sha256": "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824", "size_bytes": 5}]
        }"#;
        let d = ResourceDescriptor::from_json(json.as_bytes()).unwrap();
        assert_eq!(d, sample());
    }

    #[test]
    fn round_trips_through_json() {
        let d = sample();
        let bytes = d.to_json().unwrap();
        let parsed = ResourceDescriptor::from_json(&bytes).unwrap();
        assert_eq!(d, parsed);
    }

    #[test]
    fn writes_size_not_size_bytes() {
        let bytes = sample().to_json().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("\"size\""));
        assert!(!text.contains("\"size_bytes\""));
    }
}
