//! Merkle tree over flat-tree indices
//!
//! The committed state is a forest of perfect subtrees ("roots") whose
//! leaves partition `[0, length)`. All mutation goes through a [`Batch`],
//! which stages new roots and nodes and only touches the tree on
//! [`Batch::commit`].

use std::collections::BTreeMap;

use crate::crypto;
use crate::flat::{self, FlatIterator};
use crate::nodestore::NodeStore;
use crate::{Error, Hash32, Node, Result};

pub struct MerkleTree<N: NodeStore> {
    store: N,
    pub(crate) roots: Vec<Node>,
    pub(crate) length: u64,
    pub(crate) byte_length: u64,
    pub(crate) fork: u64,
    pub(crate) signature: Option<Vec<u8>>,
    /// Committed nodes not yet written to the store
    unflushed: BTreeMap<u64, Node>,
    truncated: bool,
    truncate_to: u64,
}

impl<N: NodeStore> MerkleTree<N> {
    /// An empty tree over `store`.
    pub fn new(store: N) -> Self {
        Self {
            store,
            roots: Vec::new(),
            length: 0,
            byte_length: 0,
            fork: 0,
            signature: None,
            unflushed: BTreeMap::new(),
            truncated: false,
            truncate_to: 0,
        }
    }

    /// Rebuild the tree at a previously committed `length` from its stored
    /// roots.
    pub fn open(store: N, length: u64, fork: u64, signature: Option<Vec<u8>>) -> Result<Self> {
        let mut roots = Vec::new();
        for index in flat::full_roots(2 * length) {
            match store.get(index)? {
                Some(node) => roots.push(node),
                None => {
                    return Err(Error::Corruption(format!(
                        "tree root {index} missing for length {length}"
                    )))
                }
            }
        }

        let byte_length = roots.iter().map(|r| r.size).sum();

        Ok(Self {
            store,
            roots,
            length,
            byte_length,
            fork,
            signature,
            unflushed: BTreeMap::new(),
            truncated: false,
            truncate_to: 0,
        })
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn byte_length(&self) -> u64 {
        self.byte_length
    }

    pub fn fork(&self) -> u64 {
        self.fork
    }

    pub fn roots(&self) -> &[Node] {
        &self.roots
    }

    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    pub fn store(&self) -> &N {
        &self.store
    }

    pub fn batch(&self) -> Batch {
        Batch::new(self)
    }

    pub fn hash(&self) -> Hash32 {
        crypto::hash_roots(&self.roots)
    }

    pub fn signable(&self) -> Vec<u8> {
        crypto::tree_signable(&self.hash(), self.length, self.fork)
    }

    pub fn signable_legacy(&self) -> Vec<u8> {
        crypto::tree_signable_legacy(&self.hash(), self.length, self.fork)
    }

    /// Node at `index`, failing with [`Error::MissingNode`] when absent.
    pub fn get(&self, index: u64) -> Result<Node> {
        self.get_optional(index)?.ok_or(Error::MissingNode(index))
    }

    pub fn get_optional(&self, index: u64) -> Result<Option<Node>> {
        if let Some(node) = self.unflushed.get(&index) {
            return Ok(Some(node.clone()));
        }
        if self.truncated && flat::right_span(index) >= 2 * self.truncate_to {
            return Ok(None);
        }
        self.store.get(index)
    }

    /// Stage a truncation to `length` on a new batch.
    pub fn truncate(&self, length: u64, fork: u64) -> Result<Batch> {
        let mut batch = self.batch();
        batch.truncate(self, length, fork)?;
        Ok(batch)
    }

    /// Roots the tree had at an earlier `length`.
    pub fn get_roots(&self, length: u64) -> Result<Vec<Node>> {
        flat::full_roots(2 * length)
            .into_iter()
            .map(|index| self.get(index))
            .collect()
    }

    /// Whether every root of `length` is held locally, i.e. whether this tree
    /// can prove it once had exactly `length` blocks.
    pub fn upgradeable(&self, length: u64) -> Result<bool> {
        if length > self.length {
            return Ok(false);
        }
        for index in flat::full_roots(2 * length) {
            if self.get_optional(index)?.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// How many levels above `index` are missing locally, stopping at the
    /// first node that is held or that reaches past the head.
    pub fn missing_nodes(&self, index: u64) -> Result<u64> {
        let head = 2 * self.length;
        let mut ite = FlatIterator::new(index);

        if ite.right_span() >= head {
            return Ok(0);
        }

        let mut count = 0;
        while !ite.contains(head) && self.get_optional(ite.index)?.is_none() {
            count += 1;
            ite.parent();
        }

        Ok(count)
    }

    /// Byte offset of block `seq`.
    pub fn byte_offset(&self, seq: u64) -> Result<u64> {
        if seq > self.length {
            return Err(Error::InvalidOperation(format!("block {seq} is out of bounds")));
        }
        self.flat_byte_offset(flat::index_of(seq))
    }

    /// Byte offset and size of block `seq`.
    pub fn byte_range(&self, seq: u64) -> Result<(u64, u64)> {
        if seq >= self.length {
            return Err(Error::InvalidOperation(format!("block {seq} is out of bounds")));
        }
        let index = flat::index_of(seq);
        Ok((self.flat_byte_offset(index)?, self.get(index)?.size))
    }

    pub(crate) fn flat_byte_offset(&self, index: u64) -> Result<u64> {
        if index == 2 * self.length {
            return Ok(self.byte_length);
        }
        let index = flat::left_span(index);

        let mut head = 0;
        let mut offset = 0;

        for root in &self.roots {
            head += 2 * (root.index - head + 1);

            if index >= head {
                offset += root.size;
                continue;
            }

            let mut ite = FlatIterator::new(root.index);
            while ite.index != index {
                if index < ite.index {
                    ite.left_child();
                } else {
                    let left = ite.left_child();
                    offset += self.get(left)?.size;
                    ite.sibling();
                }
            }

            return Ok(offset);
        }

        Err(Error::InvalidOperation(format!("no byte offset for node {index}")))
    }

    /// Find the block containing byte `bytes`: `(block, offset within block)`.
    /// A position on a block boundary resolves to the start of the next block.
    pub fn seek(&self, bytes: u64) -> Result<(u64, u64)> {
        if bytes == 0 {
            return Ok((0, 0));
        }

        let mut bytes = bytes;

        for root in &self.roots {
            if bytes == root.size {
                return Ok(((flat::right_span(root.index) + 2) / 2, 0));
            }
            if bytes > root.size {
                bytes -= root.size;
                continue;
            }

            let mut ite = FlatIterator::new(root.index);
            while !ite.is_leaf() {
                let left_index = ite.left_child();
                let left = self.get_optional(left_index)?.ok_or(Error::MissingNode(left_index))?;

                if left.size == bytes {
                    return Ok(((ite.right_span() + 2) / 2, 0));
                }
                if left.size > bytes {
                    continue;
                }
                bytes -= left.size;
                ite.sibling();
            }

            return Ok((ite.index / 2, bytes));
        }

        Err(Error::InvalidOperation("seek is out of bounds".into()))
    }

    /// Write committed nodes and pending truncations to the node store.
    pub fn flush(&mut self) -> Result<()> {
        if self.truncated {
            self.store.truncate(self.truncate_to)?;
        }
        let nodes: Vec<Node> = self.unflushed.values().cloned().collect();
        self.store.put(&nodes)?;

        self.unflushed.clear();
        self.truncated = false;
        self.truncate_to = 0;
        Ok(())
    }

    /// Drop every node and reset to the empty tree.
    pub fn clear(&mut self) -> Result<()> {
        self.roots.clear();
        self.length = 0;
        self.byte_length = 0;
        self.signature = None;
        self.unflushed.clear();
        self.truncated = false;
        self.truncate_to = 0;
        self.store.clear()
    }

    /// Stage a committed node (used when replaying the oplog).
    pub(crate) fn add_node(&mut self, node: Node) {
        self.unflushed.insert(node.index, node);
    }

    fn truncate_nodes(&mut self, length: u64) {
        self.truncate_to = if self.truncated {
            self.truncate_to.min(length)
        } else {
            length
        };
        self.truncated = true;

        let head = 2 * length;
        self.unflushed.retain(|index, _| flat::right_span(*index) < head);
    }
}

/// Staged, uncommitted view of a tree.
#[derive(Clone, Debug)]
pub struct Batch {
    pub(crate) fork: u64,
    pub(crate) roots: Vec<Node>,
    pub(crate) length: u64,
    /// Length of the prefix shared with the tree this batch was made from
    pub(crate) ancestors: u64,
    pub(crate) byte_length: u64,
    pub(crate) signature: Option<Vec<u8>>,
    pub(crate) nodes: Vec<Node>,
    pub(crate) upgraded: bool,
    tree_length: u64,
    tree_fork: u64,
}

impl Batch {
    fn new<N: NodeStore>(tree: &MerkleTree<N>) -> Self {
        Self {
            fork: tree.fork,
            roots: tree.roots.clone(),
            length: tree.length,
            ancestors: tree.length,
            byte_length: tree.byte_length,
            signature: None,
            nodes: Vec::new(),
            upgraded: false,
            tree_length: tree.length,
            tree_fork: tree.fork,
        }
    }

    /// A batch that starts from nothing, used to rebuild a remote tree.
    pub(crate) fn detached<N: NodeStore>(tree: &MerkleTree<N>) -> Self {
        let mut batch = Self::new(tree);
        batch.roots.clear();
        batch.length = 0;
        batch.ancestors = 0;
        batch.byte_length = 0;
        batch.upgraded = true;
        batch
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn byte_length(&self) -> u64 {
        self.byte_length
    }

    pub fn fork(&self) -> u64 {
        self.fork
    }

    pub fn ancestors(&self) -> u64 {
        self.ancestors
    }

    pub fn roots(&self) -> &[Node] {
        &self.roots
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    pub fn set_signature(&mut self, signature: Vec<u8>) {
        self.signature = Some(signature);
    }

    pub fn is_upgraded(&self) -> bool {
        self.upgraded
    }

    /// Length of the tree this batch was staged against.
    pub fn tree_length(&self) -> u64 {
        self.tree_length
    }

    pub fn hash(&self) -> Hash32 {
        crypto::hash_roots(&self.roots)
    }

    pub fn signable(&self) -> Vec<u8> {
        crypto::tree_signable(&self.hash(), self.length, self.fork)
    }

    pub fn signable_legacy(&self) -> Vec<u8> {
        crypto::tree_signable_legacy(&self.hash(), self.length, self.fork)
    }

    pub fn append(&mut self, data: &[u8]) {
        let head = 2 * self.length;
        let mut ite = FlatIterator::new(head);
        let node = crypto::leaf_node(head, data);
        self.append_root(node, &mut ite);
    }

    /// Push `node` (the subtree under `ite`) as the new rightmost root and
    /// merge equal-depth siblings. Leaves `ite` on the last root.
    pub(crate) fn append_root(&mut self, node: Node, ite: &mut FlatIterator) {
        self.upgraded = true;
        self.length += ite.factor / 2;
        self.byte_length = self.byte_length.saturating_add(node.size);
        self.roots.push(node.clone());
        self.nodes.push(node);

        while self.roots.len() > 1 {
            let a = &self.roots[self.roots.len() - 1];
            let b = &self.roots[self.roots.len() - 2];

            if ite.sibling() != b.index {
                ite.sibling();
                break;
            }

            let parent = crypto::parent_node(ite.parent(), a, b);
            self.nodes.push(parent.clone());
            self.roots.pop();
            self.roots.pop();
            self.roots.push(parent);
        }
    }

    /// Cut the staged state back to `length` blocks and move it to `fork`.
    pub fn truncate<N: NodeStore>(&mut self, tree: &MerkleTree<N>, length: u64, fork: u64) -> Result<()> {
        if length > self.length {
            return Err(Error::InvalidOperation(format!(
                "cannot truncate {} blocks to {length}",
                self.length
            )));
        }

        let head = 2 * length;
        self.nodes.retain(|node| flat::right_span(node.index) < head);
        self.restore_roots(tree, length)?;

        self.fork = fork;
        self.ancestors = self.ancestors.min(length);
        self.upgraded = true;
        Ok(())
    }

    /// Point the staged roots at `length`. Each root comes from the staged
    /// nodes if present, else from the current roots, else from the tree.
    pub(crate) fn restore_roots<N: NodeStore>(&mut self, tree: &MerkleTree<N>, length: u64) -> Result<()> {
        let mut roots = Vec::new();

        for index in flat::full_roots(2 * length) {
            let staged = self.nodes.iter().rev().find(|n| n.index == index);
            let current = self.roots.iter().find(|n| n.index == index);
            let node = match staged.or(current) {
                Some(node) => node.clone(),
                None => tree.get(index)?,
            };
            roots.push(node);
        }
        self.roots = roots;

        self.length = length;
        self.byte_length = self.roots.iter().map(|r| r.size).sum();
        Ok(())
    }

    /// Whether the tree is still in the state this batch was staged on.
    pub fn commitable<N: NodeStore>(&self, tree: &MerkleTree<N>) -> bool {
        self.tree_fork == tree.fork
            && if self.upgraded {
                self.tree_length == tree.length
            } else {
                self.tree_length <= tree.length
            }
    }

    pub fn commit<N: NodeStore>(self, tree: &mut MerkleTree<N>) -> Result<()> {
        if !self.commitable(tree) {
            return Err(Error::InvalidOperation(
                "tree was modified during batch, refusing to commit".into(),
            ));
        }

        let Batch {
            fork,
            roots,
            length,
            ancestors,
            byte_length,
            signature,
            nodes,
            upgraded,
            tree_length,
            ..
        } = self;

        if upgraded {
            if ancestors < tree_length {
                tree.truncate_nodes(ancestors);
            }
            tree.roots = roots;
            tree.length = length;
            tree.byte_length = byte_length;
            tree.fork = fork;
            tree.signature = signature;
        }

        for node in nodes {
            tree.unflushed.insert(node.index, node);
        }

        Ok(())
    }
}
