//! Dataset manifests
//!
//! A manifest binds a Merkle tree root to the dataset attributes needed to
//! retrieve and verify it: sizes, codecs and optional file metadata. It is
//! encoded with protobuf, wrapped in a dag-pb node, and stored as a block
//! under `MANIFEST_CODEC`.

use ::cid::Cid;
use prost::Message as ProstMessage;
use serde::Serialize;
use std::io::Cursor;
use thiserror::Error;

use crate::block::Block;
use crate::cid::{self, CidError, BLOCK_CODEC, CID_VERSION, SHA256_CODEC};

/// Default leaf size (64 KiB)
pub const DEFAULT_BLOCK_SIZE: u32 = 64 * 1024;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Protobuf encode error: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("Protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Malformed manifest: missing required field '{0}'")]
    MalformedManifest(&'static str),

    #[error("Not a manifest: CID {0} carries data codec 0x{1:x}")]
    NotAManifest(Cid, u64),

    #[error(transparent)]
    Cid(#[from] CidError),
}

pub type Result<T> = std::result::Result<T, ManifestError>;

/// A dataset manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// CID of the Merkle root.
    pub tree_cid: Cid,
    /// Exact original byte count.
    pub dataset_size: u64,
    /// Leaf size in bytes.
    pub block_size: u32,
    /// Data codec of the contained blocks.
    pub codec: u64,
    /// Multihash codec of the contained blocks.
    pub hcodec: u64,
    /// CID version.
    pub version: u32,
    /// Original filename, if any.
    pub filename: Option<String>,
    /// MIME type, if any.
    pub mimetype: Option<String>,
}

/// JSON view of a manifest served over REST and the FFI.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestView {
    pub tree_cid: String,
    pub dataset_size: u64,
    pub block_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    pub protected: bool,
}

impl Manifest {
    pub fn new(
        tree_cid: Cid,
        dataset_size: u64,
        block_size: u32,
        filename: Option<String>,
        mimetype: Option<String>,
    ) -> Self {
        Self {
            tree_cid,
            dataset_size,
            block_size,
            codec: BLOCK_CODEC,
            hcodec: SHA256_CODEC,
            version: CID_VERSION,
            filename,
            mimetype,
        }
    }

    /// Number of blocks in the dataset.
    pub fn blocks_count(&self) -> usize {
        self.dataset_size.div_ceil(u64::from(self.block_size)) as usize
    }

    /// Encode to the wire form: a protobuf `Header` wrapped in a dag-pb node
    /// (field 1 = Data).
    ///
    /// ```protobuf
    /// Message Header {
    ///   bytes treeCid = 1;
    ///   uint32 blockSize = 2;
    ///   uint64 datasetSize = 3;
    ///   uint32 codec = 4;
    ///   uint32 hcodec = 5;
    ///   uint32 version = 6;
    ///   string filename = 7;
    ///   string mimetype = 8;
    /// }
    /// ```
    pub fn encode(&self) -> Result<Vec<u8>> {
        let header = proto::Header {
            tree_cid: Some(self.tree_cid.to_bytes()),
            block_size: Some(self.block_size),
            dataset_size: Some(self.dataset_size),
            codec: Some(self.codec as u32),
            hcodec: Some(self.hcodec as u32),
            version: Some(self.version),
            filename: self.filename.clone(),
            mimetype: self.mimetype.clone(),
        };

        let mut data = Vec::new();
        header.encode(&mut data)?;

        let node = proto::DagPbNode { data };
        let mut out = Vec::new();
        node.encode(&mut out)?;
        Ok(out)
    }

    /// Decode the wire form. Tags 1-6 are required; 7 and 8 are not.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let node = proto::DagPbNode::decode(&mut Cursor::new(data))?;
        let header = proto::Header::decode(&mut Cursor::new(node.data))?;

        let tree_cid_bytes = header
            .tree_cid
            .ok_or(ManifestError::MalformedManifest("treeCid"))?;
        let tree_cid = Cid::try_from(tree_cid_bytes)
            .map_err(|e| CidError::InvalidCid(format!("tree CID: {}", e)))?;

        // A zero block size has no block arithmetic; treat it as absent.
        let block_size = match header.block_size {
            Some(size) if size > 0 => size,
            _ => return Err(ManifestError::MalformedManifest("blockSize")),
        };

        Ok(Self {
            tree_cid,
            block_size,
            dataset_size: header
                .dataset_size
                .ok_or(ManifestError::MalformedManifest("datasetSize"))?,
            codec: u64::from(header.codec.ok_or(ManifestError::MalformedManifest("codec"))?),
            hcodec: u64::from(
                header
                    .hcodec
                    .ok_or(ManifestError::MalformedManifest("hcodec"))?,
            ),
            version: header
                .version
                .ok_or(ManifestError::MalformedManifest("cidVersion"))?,
            filename: header.filename,
            mimetype: header.mimetype,
        })
    }

    /// Encode and wrap into a `MANIFEST_CODEC` block.
    pub fn to_block(&self) -> Result<Block> {
        let data = self.encode()?;
        let cid = cid::manifest_cid(&data)?;
        Ok(Block::trusted(cid, data))
    }

    /// Decode a manifest out of a block, checking the data codec first.
    pub fn from_block(block: &Block) -> Result<Self> {
        if !block.is_manifest() {
            return Err(ManifestError::NotAManifest(
                block.cid,
                block.cid.codec(),
            ));
        }
        Self::decode(&block.data)
    }

    pub fn view(&self) -> ManifestView {
        ManifestView {
            tree_cid: self.tree_cid.to_string(),
            dataset_size: self.dataset_size,
            block_size: self.block_size,
            filename: self.filename.clone(),
            mimetype: self.mimetype.clone(),
            protected: false,
        }
    }
}

/// Protobuf message definitions
mod proto {
    use prost::Message;

    /// Dag-pb node wrapper (field 1 = Data)
    #[derive(Clone, PartialEq, Message)]
    pub struct DagPbNode {
        #[prost(bytes = "vec", tag = "1")]
        pub data: Vec<u8>,
    }

    /// Manifest header. Every field is optional on the wire so decoders can
    /// distinguish missing required tags from defaults.
    #[derive(Clone, PartialEq, Message)]
    pub struct Header {
        #[prost(bytes = "vec", optional, tag = "1")]
        pub tree_cid: Option<Vec<u8>>,
        #[prost(uint32, optional, tag = "2")]
        pub block_size: Option<u32>,
        #[prost(uint64, optional, tag = "3")]
        pub dataset_size: Option<u64>,
        #[prost(uint32, optional, tag = "4")]
        pub codec: Option<u32>,
        #[prost(uint32, optional, tag = "5")]
        pub hcodec: Option<u32>,
        #[prost(uint32, optional, tag = "6")]
        pub version: Option<u32>,
        #[prost(string, optional, tag = "7")]
        pub filename: Option<String>,
        #[prost(string, optional, tag = "8")]
        pub mimetype: Option<String>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cid::{dataset_root_cid, MANIFEST_CODEC};
    use prost::Message as ProstMessage;

    fn test_tree_cid(seed: u8) -> Cid {
        dataset_root_cid(SHA256_CODEC, &[seed; 32]).unwrap()
    }

    #[test]
    fn test_roundtrip_with_metadata() {
        let manifest = Manifest::new(
            test_tree_cid(1),
            12,
            65536,
            Some("hello_world.txt".to_string()),
            Some("text/plain".to_string()),
        );

        let decoded = Manifest::decode(&manifest.encode().unwrap()).unwrap();
        assert_eq!(decoded, manifest);
    }

    #[test]
    fn test_roundtrip_without_metadata() {
        let manifest = Manifest::new(test_tree_cid(2), 1024 * 1024, 65536, None, None);
        let decoded = Manifest::decode(&manifest.encode().unwrap()).unwrap();
        assert_eq!(decoded, manifest);
        assert_eq!(decoded.filename, None);
        assert_eq!(decoded.mimetype, None);
    }

    #[test]
    fn test_missing_required_field_fails() {
        // A header with no datasetSize must not decode.
        let header = proto::Header {
            tree_cid: Some(test_tree_cid(3).to_bytes()),
            block_size: Some(65536),
            dataset_size: None,
            codec: Some(BLOCK_CODEC as u32),
            hcodec: Some(SHA256_CODEC as u32),
            version: Some(1),
            filename: None,
            mimetype: None,
        };
        let mut data = Vec::new();
        header.encode(&mut data).unwrap();
        let node = proto::DagPbNode { data };
        let mut bytes = Vec::new();
        node.encode(&mut bytes).unwrap();

        let result = Manifest::decode(&bytes);
        assert!(matches!(
            result,
            Err(ManifestError::MalformedManifest("datasetSize"))
        ));
    }

    #[test]
    fn test_zero_block_size_rejected() {
        let header = proto::Header {
            tree_cid: Some(test_tree_cid(9).to_bytes()),
            block_size: Some(0),
            dataset_size: Some(100),
            codec: Some(BLOCK_CODEC as u32),
            hcodec: Some(SHA256_CODEC as u32),
            version: Some(1),
            filename: None,
            mimetype: None,
        };
        let mut data = Vec::new();
        header.encode(&mut data).unwrap();
        let node = proto::DagPbNode { data };
        let mut bytes = Vec::new();
        node.encode(&mut bytes).unwrap();

        assert!(matches!(
            Manifest::decode(&bytes),
            Err(ManifestError::MalformedManifest("blockSize"))
        ));
    }

    #[test]
    fn test_blocks_count() {
        let m = Manifest::new(test_tree_cid(4), 1024, 1024, None, None);
        assert_eq!(m.blocks_count(), 1);

        let m = Manifest::new(test_tree_cid(4), 1025, 1024, None, None);
        assert_eq!(m.blocks_count(), 2);

        let m = Manifest::new(test_tree_cid(4), 12, 65536, None, None);
        assert_eq!(m.blocks_count(), 1);
    }

    #[test]
    fn test_to_block_uses_manifest_codec() {
        let manifest = Manifest::new(test_tree_cid(5), 100, 10, None, None);
        let block = manifest.to_block().unwrap();
        assert_eq!(block.cid.codec(), MANIFEST_CODEC);

        let decoded = Manifest::from_block(&block).unwrap();
        assert_eq!(decoded, manifest);
    }

    #[test]
    fn test_to_block_deterministic() {
        let manifest = Manifest::new(test_tree_cid(6), 100, 10, None, None);
        assert_eq!(
            manifest.to_block().unwrap().cid,
            manifest.to_block().unwrap().cid
        );

        let other = Manifest::new(test_tree_cid(6), 200, 10, None, None);
        assert_ne!(
            manifest.to_block().unwrap().cid,
            other.to_block().unwrap().cid
        );
    }

    #[test]
    fn test_from_block_rejects_wrong_codec() {
        let block = Block::new(&b"not a manifest"[..]).unwrap();
        let result = Manifest::from_block(&block);
        assert!(matches!(result, Err(ManifestError::NotAManifest(..))));
    }

    #[test]
    fn test_view_json_shape() {
        let manifest = Manifest::new(
            test_tree_cid(7),
            12,
            65536,
            Some("hello_world.txt".to_string()),
            Some("text/plain".to_string()),
        );
        let json = serde_json::to_value(manifest.view()).unwrap();

        assert_eq!(json["datasetSize"], 12);
        assert_eq!(json["blockSize"], 65536);
        assert_eq!(json["filename"], "hello_world.txt");
        assert_eq!(json["mimetype"], "text/plain");
        assert_eq!(json["protected"], false);
        assert!(json["treeCid"].is_string());
        assert_eq!(json["treeCid"], manifest.tree_cid.to_string());
    }
}
