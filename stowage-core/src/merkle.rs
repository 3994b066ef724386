//! Merkle tree and proof machinery
//!
//! The tree is a single flattened buffer of 32-byte nodes, laid out layer by
//! layer from the leaves up. Each layer above the leaves has `ceil(prev / 2)`
//! nodes; an unpaired last node is compressed against a zero sibling with an
//! "odd" key so the position is bound into the parent.
//!
//! # Key bytes
//!
//! The compression function takes a key selecting the position class:
//! - 0x00: internal layers
//! - 0x01: bottom layer
//! - 0x02: odd node
//! - 0x03: odd node at the bottom layer

use ::cid::Cid;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::cid::{self, CidError, DIGEST_SIZE, SHA256_CODEC};

/// A tree node: one digest.
pub type Node = [u8; DIGEST_SIZE];

/// The designated zero sibling for odd nodes.
pub const ZERO_NODE: Node = [0u8; DIGEST_SIZE];

/// Leaf count at or above which construction is offloaded to the blocking
/// pool.
pub const OFFLOAD_THRESHOLD: usize = 1024;

#[derive(Debug, Error)]
pub enum MerkleError {
    #[error("Cannot build a tree from an empty leaf set")]
    EmptyLeaves,

    #[error("Index {index} out of bounds (tree has {leaves} leaves)")]
    IndexOutOfBounds { index: usize, leaves: usize },

    #[error("Node buffer holds {actual} nodes, {expected} expected for {leaves} leaves")]
    InvalidNodeCount {
        expected: usize,
        actual: usize,
        leaves: usize,
    },

    #[error("No compressor for hash codec 0x{0:x}")]
    UnsupportedCompressor(u64),

    #[error("Offloaded build failed: {0}")]
    OffloadFailed(String),

    #[error("Malformed proof encoding: {0}")]
    MalformedProof(String),

    #[error(transparent)]
    Cid(#[from] CidError),
}

pub type Result<T> = std::result::Result<T, MerkleError>;

/// Position key fed to the compression function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressKey {
    None = 0x00,
    BottomLayer = 0x01,
    Odd = 0x02,
    OddAndBottomLayer = 0x03,
}

impl CompressKey {
    fn select(bottom: bool, odd: bool) -> Self {
        match (bottom, odd) {
            (false, false) => CompressKey::None,
            (true, false) => CompressKey::BottomLayer,
            (false, true) => CompressKey::Odd,
            (true, true) => CompressKey::OddAndBottomLayer,
        }
    }

    fn oddified(self) -> Self {
        match self {
            CompressKey::None | CompressKey::Odd => CompressKey::Odd,
            CompressKey::BottomLayer | CompressKey::OddAndBottomLayer => {
                CompressKey::OddAndBottomLayer
            }
        }
    }
}

/// Identifies the compression function a tree or proof was built with.
///
/// Compressors that need no key must still accept one. A Poseidon2 variant
/// would slot in here once a field backend is chosen upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressorId {
    Sha256,
}

impl CompressorId {
    /// The multihash codec this compressor produces digests under.
    pub fn hcodec(self) -> u64 {
        match self {
            CompressorId::Sha256 => SHA256_CODEC,
        }
    }

    pub fn from_hcodec(hcodec: u64) -> Result<Self> {
        match hcodec {
            SHA256_CODEC => Ok(CompressorId::Sha256),
            other => Err(MerkleError::UnsupportedCompressor(other)),
        }
    }

    /// `compress(left, right, key)`: SHA-256 of `left || right || key_byte`.
    pub fn compress(self, left: &Node, right: &Node, key: CompressKey) -> Node {
        match self {
            CompressorId::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(left);
                hasher.update(right);
                hasher.update([key as u8]);
                hasher.finalize().into()
            }
        }
    }
}

/// Node counts per layer, leaves first.
///
/// A single leaf still gets one round of compression, so its tree has two
/// layers of one node each.
pub fn nodes_per_level(leaves: usize) -> Vec<usize> {
    if leaves == 1 {
        return vec![1, 1];
    }
    let mut levels = vec![leaves];
    let mut n = leaves;
    while n > 1 {
        n = n.div_ceil(2);
        levels.push(n);
    }
    levels
}

/// An inclusion proof for one leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    /// Index of the proved leaf.
    pub index: usize,
    /// Leaf count of the tree the proof was taken from.
    pub nleaves: usize,
    /// Sibling digests, bottom-up. Empty for a single-leaf tree.
    pub path: Vec<Node>,
    /// Compression function the tree was built with.
    pub compressor: CompressorId,
    /// The zero sibling used for odd positions.
    pub zero: Node,
}

impl MerkleProof {
    /// Recompute the root from the leaf and compare against `expected_root`.
    pub fn verify(&self, leaf: &Node, expected_root: &Node) -> bool {
        self.reconstruct_root(leaf) == *expected_root
    }

    /// Walk the path bottom-up, re-applying the compression with the same
    /// odd-child policy used during construction.
    fn reconstruct_root(&self, leaf: &Node) -> Node {
        if self.nleaves == 1 {
            // Single-leaf tree: empty path, one round with the zero sibling.
            return self
                .compressor
                .compress(leaf, &self.zero, CompressKey::OddAndBottomLayer);
        }

        let mut current = *leaf;
        let mut index = self.index;
        let mut m = self.nleaves;
        let mut key = CompressKey::BottomLayer;

        for sibling in &self.path {
            current = if index & 1 == 1 {
                self.compressor.compress(sibling, &current, key)
            } else if index == m - 1 {
                // Last node of the layer: unpaired, sibling is zero.
                self.compressor.compress(&current, sibling, key.oddified())
            } else {
                self.compressor.compress(&current, sibling, key)
            };

            key = CompressKey::None;
            index >>= 1;
            m = m.div_ceil(2);
        }

        current
    }

    /// Serialize to the repository value layout: little-endian lengths
    /// followed by the raw digests.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(8 + 8 + 8 + 4 + DIGEST_SIZE + self.path.len() * DIGEST_SIZE);
        buf.extend_from_slice(&(self.index as u64).to_le_bytes());
        buf.extend_from_slice(&(self.nleaves as u64).to_le_bytes());
        buf.extend_from_slice(&self.compressor.hcodec().to_le_bytes());
        buf.extend_from_slice(&self.zero);
        buf.extend_from_slice(&(self.path.len() as u32).to_le_bytes());
        for node in &self.path {
            buf.extend_from_slice(node);
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let fixed = 8 + 8 + 8 + DIGEST_SIZE + 4;
        if data.len() < fixed {
            return Err(MerkleError::MalformedProof(format!(
                "{} bytes, at least {} expected",
                data.len(),
                fixed
            )));
        }

        let mut u64buf = [0u8; 8];
        u64buf.copy_from_slice(&data[0..8]);
        let index = u64::from_le_bytes(u64buf) as usize;
        u64buf.copy_from_slice(&data[8..16]);
        let nleaves = u64::from_le_bytes(u64buf) as usize;
        u64buf.copy_from_slice(&data[16..24]);
        let compressor = CompressorId::from_hcodec(u64::from_le_bytes(u64buf))?;

        let mut zero = ZERO_NODE;
        zero.copy_from_slice(&data[24..24 + DIGEST_SIZE]);

        let mut u32buf = [0u8; 4];
        u32buf.copy_from_slice(&data[24 + DIGEST_SIZE..fixed]);
        let count = u32::from_le_bytes(u32buf) as usize;

        let rest = &data[fixed..];
        if rest.len() != count * DIGEST_SIZE {
            return Err(MerkleError::MalformedProof(format!(
                "path holds {} bytes, {} expected",
                rest.len(),
                count * DIGEST_SIZE
            )));
        }

        let mut path = Vec::with_capacity(count);
        for chunk in rest.chunks_exact(DIGEST_SIZE) {
            let mut node = ZERO_NODE;
            node.copy_from_slice(chunk);
            path.push(node);
        }

        Ok(Self {
            index,
            nleaves,
            path,
            compressor,
            zero,
        })
    }
}

/// A Merkle tree over leaf digests, stored as one flattened node buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    /// All nodes, layer by layer, leaves first.
    nodes: Vec<Node>,
    /// Node count per layer.
    levels: Vec<usize>,
    compressor: CompressorId,
}

impl MerkleTree {
    /// Build a tree over `leaves` synchronously.
    pub fn build(leaves: &[Node], compressor: CompressorId) -> Result<Self> {
        if leaves.is_empty() {
            return Err(MerkleError::EmptyLeaves);
        }

        let levels = nodes_per_level(leaves.len());
        let total: usize = levels.iter().sum();
        let mut nodes = vec![ZERO_NODE; total];
        nodes[..leaves.len()].copy_from_slice(leaves);

        let mut src_off = 0;
        for li in 0..levels.len() - 1 {
            let src_len = levels[li];
            let dst_off = src_off + src_len;
            let dst_len = levels[li + 1];
            let bottom = li == 0;

            for j in 0..dst_len {
                let left = nodes[src_off + 2 * j];
                let odd = 2 * j + 1 >= src_len;
                let right = if odd {
                    ZERO_NODE
                } else {
                    nodes[src_off + 2 * j + 1]
                };
                nodes[dst_off + j] =
                    compressor.compress(&left, &right, CompressKey::select(bottom, odd));
            }

            src_off = dst_off;
        }

        Ok(Self {
            nodes,
            levels,
            compressor,
        })
    }

    /// Build on the blocking pool and await the result.
    ///
    /// The worker owns the leaf buffer outright, so dropping the awaiting
    /// future cannot free memory the build still reads; the build simply runs
    /// to completion. Output is identical to [`MerkleTree::build`].
    pub async fn build_offloaded(leaves: Vec<Node>, compressor: CompressorId) -> Result<Self> {
        tokio::task::spawn_blocking(move || Self::build(&leaves, compressor))
            .await
            .map_err(|e| MerkleError::OffloadFailed(e.to_string()))?
    }

    /// Rebuild a tree from a flattened node buffer.
    ///
    /// Validates that the buffer length matches the layer arithmetic for
    /// `leaves_count`; the node contents are taken as-is.
    pub fn from_nodes(
        nodes: Vec<Node>,
        leaves_count: usize,
        compressor: CompressorId,
    ) -> Result<Self> {
        if leaves_count == 0 {
            return Err(MerkleError::EmptyLeaves);
        }
        let levels = nodes_per_level(leaves_count);
        let expected: usize = levels.iter().sum();
        if nodes.len() != expected {
            return Err(MerkleError::InvalidNodeCount {
                expected,
                actual: nodes.len(),
                leaves: leaves_count,
            });
        }
        Ok(Self {
            nodes,
            levels,
            compressor,
        })
    }

    pub fn leaves_count(&self) -> usize {
        self.levels[0]
    }

    /// Number of layers above the leaves.
    pub fn depth(&self) -> usize {
        self.levels.len() - 1
    }

    pub fn compressor(&self) -> CompressorId {
        self.compressor
    }

    /// The flattened node buffer, layer by layer.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn leaf(&self, index: usize) -> Result<Node> {
        if index >= self.leaves_count() {
            return Err(MerkleError::IndexOutOfBounds {
                index,
                leaves: self.leaves_count(),
            });
        }
        Ok(self.nodes[index])
    }

    pub fn root(&self) -> Node {
        self.nodes[self.nodes.len() - 1]
    }

    /// The dataset-root CID for this tree.
    pub fn root_cid(&self) -> Result<Cid> {
        Ok(cid::dataset_root_cid(self.compressor.hcodec(), &self.root())?)
    }

    fn level_offset(&self, level: usize) -> usize {
        self.levels[..level].iter().sum()
    }

    /// Proof for the leaf at `index`: the sibling at each layer is the node
    /// at `i ^ 1`, or the zero node when the position is unpaired.
    pub fn get_proof(&self, index: usize) -> Result<MerkleProof> {
        let nleaves = self.leaves_count();
        if index >= nleaves {
            return Err(MerkleError::IndexOutOfBounds {
                index,
                leaves: nleaves,
            });
        }

        if nleaves == 1 {
            return Ok(MerkleProof {
                index,
                nleaves,
                path: Vec::new(),
                compressor: self.compressor,
                zero: ZERO_NODE,
            });
        }

        let mut path = Vec::with_capacity(self.depth());
        let mut k = index;
        let mut m = nleaves;

        for level in 0..self.depth() {
            let j = k ^ 1;
            let sibling = if j < m {
                self.nodes[self.level_offset(level) + j]
            } else {
                ZERO_NODE
            };
            path.push(sibling);

            k >>= 1;
            m = m.div_ceil(2);
        }

        Ok(MerkleProof {
            index,
            nleaves,
            path,
            compressor: self.compressor,
            zero: ZERO_NODE,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(i: u64) -> Node {
        let mut hasher = Sha256::new();
        hasher.update(i.to_le_bytes());
        hasher.finalize().into()
    }

    fn leaves(n: usize) -> Vec<Node> {
        (0..n as u64).map(leaf).collect()
    }

    #[test]
    fn test_empty_leaves_rejected() {
        assert!(matches!(
            MerkleTree::build(&[], CompressorId::Sha256),
            Err(MerkleError::EmptyLeaves)
        ));
    }

    #[test]
    fn test_nodes_per_level() {
        assert_eq!(nodes_per_level(1), vec![1, 1]);
        assert_eq!(nodes_per_level(2), vec![2, 1]);
        assert_eq!(nodes_per_level(3), vec![3, 2, 1]);
        assert_eq!(nodes_per_level(100), vec![100, 50, 25, 13, 7, 4, 2, 1]);
    }

    #[test]
    fn test_single_leaf_tree() {
        let l = leaf(0);
        let tree = MerkleTree::build(&[l], CompressorId::Sha256).unwrap();

        // Root is one round of compression under the single-node policy.
        let expected =
            CompressorId::Sha256.compress(&l, &ZERO_NODE, CompressKey::OddAndBottomLayer);
        assert_eq!(tree.root(), expected);
        assert_eq!(tree.depth(), 1);

        // Single-leaf proofs carry an empty sibling path and still verify.
        let proof = tree.get_proof(0).unwrap();
        assert!(proof.path.is_empty());
        assert!(proof.verify(&l, &tree.root()));
    }

    #[test]
    fn test_proof_soundness_various_sizes() {
        for n in [2usize, 3, 4, 5, 7, 8, 9, 16, 33, 100] {
            let ls = leaves(n);
            let tree = MerkleTree::build(&ls, CompressorId::Sha256).unwrap();
            let root = tree.root();

            for (i, l) in ls.iter().enumerate() {
                let proof = tree.get_proof(i).unwrap();
                assert!(proof.verify(l, &root), "n={} i={}", n, i);

                // A different leaf must not verify at this index.
                let wrong = leaf(0xdead_beef);
                assert!(!proof.verify(&wrong, &root), "n={} i={} forged", n, i);
            }
        }
    }

    #[test]
    fn test_odd_leaf_from_nodes_roundtrip() {
        for n in [3usize, 5, 6, 7, 9, 11, 100] {
            let ls = leaves(n);
            let tree = MerkleTree::build(&ls, CompressorId::Sha256).unwrap();

            let rebuilt =
                MerkleTree::from_nodes(tree.nodes().to_vec(), n, CompressorId::Sha256).unwrap();
            assert_eq!(rebuilt.root(), tree.root());

            for (i, l) in ls.iter().enumerate() {
                let proof = rebuilt.get_proof(i).unwrap();
                assert!(proof.verify(l, &rebuilt.root()), "n={} i={}", n, i);
            }
        }
    }

    #[test]
    fn test_from_nodes_rejects_wrong_length() {
        let tree = MerkleTree::build(&leaves(5), CompressorId::Sha256).unwrap();
        let mut nodes = tree.nodes().to_vec();
        nodes.pop();
        assert!(matches!(
            MerkleTree::from_nodes(nodes, 5, CompressorId::Sha256),
            Err(MerkleError::InvalidNodeCount { .. })
        ));
    }

    #[test]
    fn test_proof_out_of_bounds() {
        let tree = MerkleTree::build(&leaves(4), CompressorId::Sha256).unwrap();
        assert!(matches!(
            tree.get_proof(4),
            Err(MerkleError::IndexOutOfBounds { index: 4, leaves: 4 })
        ));
    }

    #[tokio::test]
    async fn test_offloaded_build_matches_sync() {
        for n in [1usize, 3, 64, 1500] {
            let ls = leaves(n);
            let sync = MerkleTree::build(&ls, CompressorId::Sha256).unwrap();
            let offloaded = MerkleTree::build_offloaded(ls, CompressorId::Sha256)
                .await
                .unwrap();
            assert_eq!(sync.root(), offloaded.root(), "n={}", n);
            assert_eq!(sync.nodes(), offloaded.nodes(), "n={}", n);
        }
    }

    #[test]
    fn test_proof_bytes_roundtrip() {
        let tree = MerkleTree::build(&leaves(9), CompressorId::Sha256).unwrap();
        let proof = tree.get_proof(6).unwrap();
        let decoded = MerkleProof::from_bytes(&proof.to_bytes()).unwrap();
        assert_eq!(decoded, proof);
    }

    #[test]
    fn test_proof_from_bytes_rejects_truncation() {
        let tree = MerkleTree::build(&leaves(9), CompressorId::Sha256).unwrap();
        let mut bytes = tree.get_proof(2).unwrap().to_bytes();
        bytes.truncate(bytes.len() - 5);
        assert!(matches!(
            MerkleProof::from_bytes(&bytes),
            Err(MerkleError::MalformedProof(_))
        ));
    }

    #[test]
    fn test_root_cid_codec() {
        let tree = MerkleTree::build(&leaves(3), CompressorId::Sha256).unwrap();
        let root_cid = tree.root_cid().unwrap();
        assert_eq!(root_cid.codec(), crate::cid::DATASET_ROOT_CODEC);
        assert_eq!(root_cid.hash().code(), SHA256_CODEC);
        assert_eq!(root_cid.hash().digest(), tree.root());
    }
}
