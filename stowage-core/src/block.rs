//! Blocks: immutable (CID, bytes) pairs
//!
//! A block either computes its own CID from its bytes, or is checked
//! against a claimed CID on construction. Producers that just hashed the
//! bytes themselves may skip the check with [`Block::trusted`].

use bytes::Bytes;
use ::cid::Cid;
use thiserror::Error;

use crate::cid::{self, CidError};

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("Block bytes do not hash to the claimed CID {0}")]
    InvalidBlock(Cid),

    #[error(transparent)]
    Cid(#[from] CidError),
}

pub type Result<T> = std::result::Result<T, BlockError>;

/// An immutable content-addressed block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub cid: Cid,
    pub data: Bytes,
}

impl Block {
    /// Create a block from raw bytes, computing its `BLOCK_CODEC` CID.
    pub fn new(data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        let cid = cid::block_cid(&data)?;
        Ok(Self { cid, data })
    }

    /// Create a block under an explicit data codec.
    pub fn with_codec(data: impl Into<Bytes>, data_codec: u64) -> Result<Self> {
        let data = data.into();
        let hash = cid::multihash(cid::SHA256_CODEC, &data)?;
        let cid = cid::build_cid(data_codec, &hash)?;
        Ok(Self { cid, data })
    }

    /// Create a block from a claimed CID, recomputing and comparing the hash.
    pub fn verified(claimed: Cid, data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        let recomputed = cid::multihash(claimed.hash().code(), &data)?;
        if recomputed.digest() != claimed.hash().digest() {
            return Err(BlockError::InvalidBlock(claimed));
        }
        Ok(Self { cid: claimed, data })
    }

    /// Create a block without re-verifying the CID.
    ///
    /// Only for producers that computed the hash themselves immediately
    /// beforehand.
    pub fn trusted(cid: Cid, data: impl Into<Bytes>) -> Self {
        Self {
            cid,
            data: data.into(),
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_manifest(&self) -> bool {
        cid::is_manifest(&self.cid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_new_computes_cid() {
        let block = Block::new(&b"hello world"[..]).unwrap();
        assert_eq!(block.cid, cid::block_cid(b"hello world").unwrap());
        assert_eq!(block.size(), 11);
        assert!(!block.is_manifest());
    }

    #[test]
    fn test_verified_accepts_correct_cid() {
        let block = Block::new(&b"payload"[..]).unwrap();
        let reverified = Block::verified(block.cid, block.data.clone()).unwrap();
        assert_eq!(reverified, block);
    }

    #[test]
    fn test_verified_rejects_any_single_byte_perturbation() {
        let data = b"some block payload".to_vec();
        let block = Block::new(data.clone()).unwrap();

        for i in 0..data.len() {
            let mut mutated = data.clone();
            mutated[i] ^= 0x01;
            let result = Block::verified(block.cid, mutated);
            assert!(
                matches!(result, Err(BlockError::InvalidBlock(_))),
                "perturbation at byte {} was not rejected",
                i
            );
        }
    }

    #[test]
    fn test_trusted_skips_verification() {
        let honest = Block::new(&b"abc"[..]).unwrap();
        // Deliberately wrong bytes under a real CID: trusted does not check.
        let lying = Block::trusted(honest.cid, &b"xyz"[..]);
        assert_eq!(lying.cid, honest.cid);
        assert_ne!(lying.data, honest.data);
    }

    #[test]
    fn test_manifest_codec_block() {
        let block = Block::with_codec(&b"manifest-ish"[..], cid::MANIFEST_CODEC).unwrap();
        assert!(block.is_manifest());
    }
}
