//! Domain-separated hashing for the tree, signables and session capabilities

use crate::{Hash32, Node};

const DOMAIN_LEAF: u8 = 0x00;
const DOMAIN_PARENT: u8 = 0x01;
const DOMAIN_ROOT: u8 = 0x02;

const NAMESPACE_TREE: &str = "vlog 2024-05-01 tree";
const NAMESPACE_REPLICATE_INITIATOR: &str = "vlog 2024-05-01 replicate initiator";
const NAMESPACE_REPLICATE_RESPONDER: &str = "vlog 2024-05-01 replicate responder";

/// Byte length of the current signable
pub const SIGNABLE_LEN: usize = 80;
/// Byte length of the legacy signable (no namespace)
pub const SIGNABLE_LEGACY_LEN: usize = 48;

/// leaf = H(0x00 || size || data)
pub fn hash_leaf(data: &[u8]) -> Hash32 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[DOMAIN_LEAF]);
    hasher.update(&(data.len() as u64).to_le_bytes());
    hasher.update(data);
    hasher.finalize().into()
}

/// parent = H(0x01 || left.hash || left.size || right.hash || right.size)
pub fn hash_parent(left: &Node, right: &Node) -> Hash32 {
    let (left, right) = if left.index <= right.index { (left, right) } else { (right, left) };

    let mut hasher = blake3::Hasher::new();
    hasher.update(&[DOMAIN_PARENT]);
    hasher.update(&left.hash);
    hasher.update(&left.size.to_le_bytes());
    hasher.update(&right.hash);
    hasher.update(&right.size.to_le_bytes());
    hasher.finalize().into()
}

/// Commitment over an ordered list of roots.
pub fn hash_roots(roots: &[Node]) -> Hash32 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[DOMAIN_ROOT]);
    for root in roots {
        hasher.update(&root.hash);
        hasher.update(&root.index.to_le_bytes());
        hasher.update(&root.size.to_le_bytes());
    }
    hasher.finalize().into()
}

pub fn leaf_node(index: u64, data: &[u8]) -> Node {
    Node::new(index, data.len() as u64, hash_leaf(data))
}

pub fn parent_node(index: u64, a: &Node, b: &Node) -> Node {
    Node::new(index, a.size.saturating_add(b.size), hash_parent(a, b))
}

fn namespace(label: &str) -> Hash32 {
    blake3::derive_key(label, b"")
}

/// namespace || tree hash || length || fork
pub fn tree_signable(hash: &Hash32, length: u64, fork: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(SIGNABLE_LEN);
    out.extend_from_slice(&namespace(NAMESPACE_TREE));
    out.extend_from_slice(hash);
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(&fork.to_le_bytes());
    out
}

/// tree hash || length || fork
pub fn tree_signable_legacy(hash: &Hash32, length: u64, fork: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(SIGNABLE_LEGACY_LEN);
    out.extend_from_slice(hash);
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(&fork.to_le_bytes());
    out
}

/// Per-session capability binding a core's public key to a transport
/// handshake. Both sides derive the other side's value to authenticate it.
pub fn replicate_capability(is_initiator: bool, key: &[u8], handshake_hash: &Hash32) -> Hash32 {
    let label = if is_initiator {
        NAMESPACE_REPLICATE_INITIATOR
    } else {
        NAMESPACE_REPLICATE_RESPONDER
    };

    let mut hasher = blake3::Hasher::new_keyed(handshake_hash);
    hasher.update(&namespace(label));
    hasher.update(key);
    hasher.finalize().into()
}
