use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::flat;
use crate::storage::RandomAccess;
use crate::{Error, Node, Result};

/// Persistent tree nodes, keyed by flat index.
pub trait NodeStore: Send + Sync {
    fn get(&self, index: u64) -> Result<Option<Node>>;
    fn put(&mut self, nodes: &[Node]) -> Result<()>;
    /// Drop every node that covers leaf `length` or anything after it.
    fn truncate(&mut self, length: u64) -> Result<()>;
    fn clear(&mut self) -> Result<()>;
}

/// Simple in-memory store. Clones share the same nodes.
#[derive(Default, Clone)]
pub struct InMemoryNodeStore {
    nodes: Arc<RwLock<BTreeMap<u64, Node>>>,
}

impl InMemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only for tests / debugging
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

impl NodeStore for InMemoryNodeStore {
    fn get(&self, index: u64) -> Result<Option<Node>> {
        Ok(self.nodes.read().get(&index).cloned())
    }

    fn put(&mut self, nodes: &[Node]) -> Result<()> {
        let mut map = self.nodes.write();
        for node in nodes {
            map.insert(node.index, node.clone());
        }
        Ok(())
    }

    fn truncate(&mut self, length: u64) -> Result<()> {
        let head = 2 * length;
        self.nodes.write().retain(|index, _| flat::right_span(*index) < head);
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.nodes.write().clear();
        Ok(())
    }
}

const NODE_RECORD_SIZE: u64 = 40;

fn record_offset(index: u64) -> Result<u64> {
    index
        .checked_mul(NODE_RECORD_SIZE)
        .ok_or_else(|| Error::Storage(format!("node {index} is past the end of the store")))
}

/// Nodes stored as fixed 40-byte records (hash, then little-endian size) at
/// `index * 40` in a byte storage. An all-zero record is an absent node.
pub struct FlatNodeStore<S: RandomAccess> {
    storage: S,
}

impl<S: RandomAccess> FlatNodeStore<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn into_inner(self) -> S {
        self.storage
    }

    fn blank(&mut self, index: u64) -> Result<()> {
        self.storage
            .write(record_offset(index)?, &[0u8; NODE_RECORD_SIZE as usize])
    }
}

impl<S: RandomAccess> NodeStore for FlatNodeStore<S> {
    fn get(&self, index: u64) -> Result<Option<Node>> {
        let buf = self.storage.read(record_offset(index)?, NODE_RECORD_SIZE)?;
        if buf.len() < NODE_RECORD_SIZE as usize || buf.iter().all(|b| *b == 0) {
            return Ok(None);
        }

        let mut hash = [0u8; 32];
        hash.copy_from_slice(&buf[..32]);
        let mut size = [0u8; 8];
        size.copy_from_slice(&buf[32..]);

        Ok(Some(Node::new(index, u64::from_le_bytes(size), hash)))
    }

    fn put(&mut self, nodes: &[Node]) -> Result<()> {
        for node in nodes {
            let mut record = [0u8; NODE_RECORD_SIZE as usize];
            record[..32].copy_from_slice(&node.hash);
            record[32..].copy_from_slice(&node.size.to_le_bytes());
            self.storage.write(record_offset(node.index)?, &record)?;
        }
        Ok(())
    }

    fn truncate(&mut self, length: u64) -> Result<()> {
        let head = 2 * length;

        if length > 0 {
            // Parents of the last kept leaf may still span past the head.
            let mut ite = flat::FlatIterator::new(head - 2);
            loop {
                if ite.index < head && ite.right_span() >= head {
                    self.blank(ite.index)?;
                }
                // Nodes at this depth and above all sit at index >= head.
                if ite.factor / 2 > head {
                    break;
                }
                ite.parent();
            }
        }

        let end = record_offset(head)?;
        if self.storage.len()? > end {
            self.storage.truncate(end)?;
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.storage.truncate(0)
    }
}
