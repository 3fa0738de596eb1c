//! Core types for the verifiable log

use serde::{Deserialize, Serialize};

/// 32-byte hash
pub type Hash32 = [u8; 32];

/// A node of the Merkle tree, addressed by its flat index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub index: u64,
    /// Total byte length of the leaves below this node
    pub size: u64,
    pub hash: Hash32,
}

impl Node {
    pub fn new(index: u64, size: u64, hash: Hash32) -> Self {
        Self { index, size, hash }
    }
}

/// Ask for the inclusion proof of a block.
///
/// `nodes` is how many levels above the leaf the requester is missing; the
/// proof stops at that ancestor, which the requester already holds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRequest {
    pub index: u64,
    pub nodes: u64,
    /// Inline the block payload. Only honoured by the core, the tree never
    /// reads block storage.
    pub value: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRequest {
    /// Flat index of the node whose hash is wanted
    pub index: u64,
    pub nodes: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeekRequest {
    pub bytes: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeRequest {
    /// Length the requester already trusts
    pub start: u64,
    /// Number of blocks to add on top of `start`
    pub length: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofRequest {
    pub block: Option<BlockRequest>,
    pub hash: Option<HashRequest>,
    pub seek: Option<SeekRequest>,
    pub upgrade: Option<UpgradeRequest>,
}

impl ProofRequest {
    pub fn block(index: u64, nodes: u64) -> Self {
        Self {
            block: Some(BlockRequest { index, nodes, value: false }),
            ..Default::default()
        }
    }

    pub fn upgrade(start: u64, length: u64) -> Self {
        Self {
            upgrade: Some(UpgradeRequest { start, length }),
            ..Default::default()
        }
    }

    pub fn hash(index: u64, nodes: u64) -> Self {
        Self {
            hash: Some(HashRequest { index, nodes }),
            ..Default::default()
        }
    }

    pub fn with_upgrade(mut self, start: u64, length: u64) -> Self {
        self.upgrade = Some(UpgradeRequest { start, length });
        self
    }

    pub fn with_seek(mut self, bytes: u64) -> Self {
        self.seek = Some(SeekRequest { bytes });
        self
    }

    pub fn with_value(mut self) -> Self {
        if let Some(block) = self.block.as_mut() {
            block.value = true;
        }
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockProof {
    pub index: u64,
    pub value: Option<Vec<u8>>,
    pub nodes: Vec<Node>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashProof {
    pub index: u64,
    pub nodes: Vec<Node>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeekProof {
    pub bytes: u64,
    pub nodes: Vec<Node>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeProof {
    pub start: u64,
    pub length: u64,
    /// Nodes that connect the trusted roots at `start` to the roots at
    /// `start + length`
    pub nodes: Vec<Node>,
    /// Nodes that extend the roots at `start + length` to the sender's head
    pub additional_nodes: Vec<Node>,
    pub signature: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub fork: u64,
    pub block: Option<BlockProof>,
    pub hash: Option<HashProof>,
    pub seek: Option<SeekProof>,
    pub upgrade: Option<UpgradeProof>,
}

/// Which blocks an update touched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitfieldUpdate {
    pub drop: bool,
    pub start: u64,
    pub length: u64,
}
