//! CID and hash primitives
//!
//! Self-describing content identifiers for blocks, manifests and dataset
//! roots. CIDs are CIDv1: a varint version, a varint data codec and a
//! multihash. The data codec distinguishes raw user blocks (0xcd02),
//! encoded manifests (0xcd01) and Merkle dataset roots (0xcd03).

use cid::Cid;
use multihash::Multihash;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Manifest codec (0xcd01)
pub const MANIFEST_CODEC: u64 = 0xcd01;

/// Raw user block codec (0xcd02)
pub const BLOCK_CODEC: u64 = 0xcd02;

/// Merkle dataset root codec (0xcd03)
pub const DATASET_ROOT_CODEC: u64 = 0xcd03;

/// SHA-256 multihash codec
pub const SHA256_CODEC: u64 = 0x12;

/// Poseidon2 multihash codec (algebraic hash over a 254-bit field)
pub const POSEIDON2_CODEC: u64 = 0xb401;

/// Digest size for both supported hash codecs
pub const DIGEST_SIZE: usize = 32;

/// CID version emitted by this node
pub const CID_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CidError {
    #[error("Unknown hash codec: 0x{0:x}")]
    UnknownHashCodec(u64),

    #[error("Hash codec 0x{0:x} has no digest backend in this build")]
    UnsupportedHashCodec(u64),

    #[error("Invalid CID: {0}")]
    InvalidCid(String),

    #[error("Multihash error: {0}")]
    Multihash(String),
}

pub type Result<T> = std::result::Result<T, CidError>;

/// Compute the multihash of `data` under `hcodec`.
///
/// SHA-256 is the only codec with a digest backend. The Poseidon2 codec is
/// recognised by the data model (CIDs carrying it parse and compare fine)
/// but cannot be computed here.
pub fn multihash(hcodec: u64, data: &[u8]) -> Result<Multihash<64>> {
    match hcodec {
        SHA256_CODEC => {
            let digest = Sha256::digest(data);
            wrap_digest(SHA256_CODEC, &digest)
        }
        POSEIDON2_CODEC => Err(CidError::UnsupportedHashCodec(POSEIDON2_CODEC)),
        other => Err(CidError::UnknownHashCodec(other)),
    }
}

/// Wrap a precomputed digest in a multihash tagged with `hcodec`.
pub fn wrap_digest(hcodec: u64, digest: &[u8]) -> Result<Multihash<64>> {
    if hcodec != SHA256_CODEC && hcodec != POSEIDON2_CODEC {
        return Err(CidError::UnknownHashCodec(hcodec));
    }
    Multihash::wrap(hcodec, digest).map_err(|e| CidError::Multihash(e.to_string()))
}

/// Build a CIDv1 from a data codec and a multihash.
///
/// Assembled byte-by-byte: `<version><data-codec><multihash>`, each prefix an
/// unsigned varint.
pub fn build_cid(data_codec: u64, hash: &Multihash<64>) -> Result<Cid> {
    let mut buf = [0u8; 10];
    let mut bytes = Vec::with_capacity(4 + hash.size() as usize);

    bytes.extend_from_slice(unsigned_varint::encode::u64(u64::from(CID_VERSION), &mut buf));
    bytes.extend_from_slice(unsigned_varint::encode::u64(data_codec, &mut buf));
    bytes.extend_from_slice(&hash.to_bytes());

    Cid::try_from(bytes).map_err(|e| CidError::InvalidCid(e.to_string()))
}

/// Compute the CID of a raw user block: SHA-256, `BLOCK_CODEC`.
pub fn block_cid(data: &[u8]) -> Result<Cid> {
    build_cid(BLOCK_CODEC, &multihash(SHA256_CODEC, data)?)
}

/// Compute the CID of an encoded manifest: SHA-256, `MANIFEST_CODEC`.
pub fn manifest_cid(data: &[u8]) -> Result<Cid> {
    build_cid(MANIFEST_CODEC, &multihash(SHA256_CODEC, data)?)
}

/// Build the CID of a Merkle dataset root from its digest.
pub fn dataset_root_cid(hcodec: u64, root_digest: &[u8]) -> Result<Cid> {
    build_cid(DATASET_ROOT_CODEC, &wrap_digest(hcodec, root_digest)?)
}

/// A CID names a manifest iff its data codec is `MANIFEST_CODEC`.
pub fn is_manifest(cid: &Cid) -> bool {
    cid.codec() == MANIFEST_CODEC
}

/// Parse a CID from its canonical string form.
pub fn parse_cid(s: &str) -> Result<Cid> {
    s.parse::<Cid>()
        .map_err(|e| CidError::InvalidCid(format!("{}: {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_determinism() {
        let a = multihash(SHA256_CODEC, b"hello world").unwrap();
        let b = multihash(SHA256_CODEC, b"hello world").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.code(), SHA256_CODEC);
        assert_eq!(a.digest().len(), DIGEST_SIZE);
    }

    #[test]
    fn test_unknown_hash_codec() {
        let result = multihash(0x9999, b"data");
        assert!(matches!(result, Err(CidError::UnknownHashCodec(0x9999))));
    }

    #[test]
    fn test_poseidon2_recognised_but_unsupported() {
        // The codec tag is part of the data model, the digest backend is not.
        let result = multihash(POSEIDON2_CODEC, b"data");
        assert!(matches!(result, Err(CidError::UnsupportedHashCodec(_))));

        // Wrapping an externally-computed digest still works.
        let mh = wrap_digest(POSEIDON2_CODEC, &[7u8; 32]).unwrap();
        assert_eq!(mh.code(), POSEIDON2_CODEC);
    }

    #[test]
    fn test_cid_string_roundtrip() {
        let cid = block_cid(b"roundtrip me").unwrap();
        let parsed = parse_cid(&cid.to_string()).unwrap();
        assert_eq!(parsed, cid);
        assert_eq!(parsed.version(), cid::Version::V1);
        assert_eq!(parsed.codec(), BLOCK_CODEC);
    }

    #[test]
    fn test_cid_bytes_roundtrip() {
        let cid = manifest_cid(b"some manifest bytes").unwrap();
        let parsed = Cid::try_from(cid.to_bytes()).unwrap();
        assert_eq!(parsed, cid);
    }

    #[test]
    fn test_is_manifest() {
        assert!(is_manifest(&manifest_cid(b"m").unwrap()));
        assert!(!is_manifest(&block_cid(b"b").unwrap()));

        let root = dataset_root_cid(SHA256_CODEC, &[1u8; 32]).unwrap();
        assert!(!is_manifest(&root));
        assert_eq!(root.codec(), DATASET_ROOT_CODEC);
    }

    #[test]
    fn test_parse_invalid_cid() {
        assert!(matches!(
            parse_cid("not-a-cid"),
            Err(CidError::InvalidCid(_))
        ));
    }
}
