//! Verifiable append-only log
//!
//! A single-writer log whose blocks are committed to by a Merkle tree laid
//! out over flat-tree indices. Every state of the log is signed, so a reader
//! can check blocks received from any peer against the writer's key. Tree
//! and header mutations are made crash-safe by a write-ahead oplog.

pub mod flat;
mod crypto;
mod types;
mod storage;
mod nodestore;
mod tree;
mod proof;
mod reorg;
mod oplog;
mod header;
mod signer;
mod mutex;
mod config;
mod engine;

pub use types::{
    BitfieldUpdate, BlockProof, BlockRequest, Hash32, HashProof, HashRequest, Node, Proof,
    ProofRequest, SeekProof, SeekRequest, UpgradeProof, UpgradeRequest,
};
pub use crypto::{
    hash_leaf, hash_parent, hash_roots, replicate_capability, tree_signable, tree_signable_legacy,
};
pub use storage::{BlockStore, FileStorage, InMemoryBlockStore, MemoryStorage, RandomAccess};
pub use nodestore::{FlatNodeStore, InMemoryNodeStore, NodeStore};
pub use tree::{Batch, MerkleTree};
pub use reorg::{ReorgBatch, ReorgWant};
pub use oplog::{Oplog, OplogState, HEADER_SLOT_SIZE, ENTRY_FRAME_SIZE};
pub use header::{Header, ReorgHint, SignableFormat, TreeHeader, UserDataEntry};
pub use signer::{Ed25519Signer, KeyPair, Signer};
pub use mutex::{Mutex, MutexGuard};
pub use config::CoreOptions;
pub use engine::{Core, CoreStorage, Phase, Update, UpdateHandler, UpdateStatus};

use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupted storage: {0}")]
    Corruption(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Insufficient proof: {0}")]
    InsufficientProof(String),

    #[error("Hash mismatch at node {index}")]
    HashMismatch { index: u64 },

    #[error("Missing tree node {0}")]
    MissingNode(u64),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Core is closed")]
    Closed,

    #[error("Mutex was destroyed")]
    Destroyed,
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
