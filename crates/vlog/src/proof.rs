//! Proof generation and verification
//!
//! A proof answers up to four questions at once: the nodes needed to hash a
//! block (or an inner node) up to a root, the path to the block holding a
//! byte offset, and the roots needed to move a verifier from one signed
//! length to a longer one.

use crate::crypto;
use crate::flat::{self, FlatIterator};
use crate::nodestore::NodeStore;
use crate::tree::{Batch, MerkleTree};
use crate::{
    BlockProof, BlockRequest, Error, HashProof, HashRequest, Node, Proof, ProofRequest, Result,
    SeekProof, UpgradeProof,
};

/// A block or hash request in flat-tree terms.
#[derive(Clone, Copy, Debug)]
struct Indexed {
    /// Verifier hashes the leaf from the block value itself
    value: bool,
    index: u64,
    nodes: u64,
    last_index: u64,
}

fn normalize_indexed(block: Option<BlockRequest>, hash: Option<HashRequest>) -> Option<Indexed> {
    if let Some(block) = block {
        return Some(Indexed {
            value: true,
            index: flat::index_of(block.index),
            nodes: block.nodes,
            last_index: block.index,
        });
    }
    hash.map(|hash| Indexed {
        value: false,
        index: hash.index,
        nodes: hash.nodes,
        last_index: flat::right_span(hash.index) / 2,
    })
}

#[derive(Default)]
struct ProofBuilder {
    node: Option<Vec<Node>>,
    seek: Option<Vec<Node>>,
    upgrade: Option<Vec<Node>>,
    additional: Option<Vec<Node>>,
}

/// Requests come from peers; refuse positions no tree can hold before any
/// index math runs on them.
fn check_request(request: &ProofRequest) -> Result<()> {
    if let Some(block) = request.block {
        if flat::checked_index_of(block.index).is_none() {
            return Err(Error::InvalidOperation(format!(
                "block {} is out of bounds",
                block.index
            )));
        }
    }
    if let Some(hash) = request.hash {
        if !flat::in_range(hash.index) {
            return Err(Error::InvalidOperation(format!(
                "node {} is out of bounds",
                hash.index
            )));
        }
    }
    if let Some(upgrade) = request.upgrade {
        let end = upgrade.start.checked_add(upgrade.length);
        if end.and_then(flat::checked_index_of).is_none() {
            return Err(Error::InvalidOperation(format!(
                "upgrade of {} blocks from {} is out of bounds",
                upgrade.length, upgrade.start
            )));
        }
    }
    Ok(())
}

/// Same for proofs: every index must be one a tree can hold.
fn check_proof(proof: &Proof) -> Result<()> {
    fn nodes_in_range(nodes: &[Node]) -> Result<()> {
        match nodes.iter().find(|n| !flat::in_range(n.index)) {
            Some(n) => Err(Error::InsufficientProof(format!(
                "node {} is out of range",
                n.index
            ))),
            None => Ok(()),
        }
    }

    if let Some(block) = &proof.block {
        if flat::checked_index_of(block.index).is_none() {
            return Err(Error::InsufficientProof(format!(
                "block {} is out of range",
                block.index
            )));
        }
        nodes_in_range(&block.nodes)?;
    }
    if let Some(hash) = &proof.hash {
        if !flat::in_range(hash.index) {
            return Err(Error::InsufficientProof(format!(
                "node {} is out of range",
                hash.index
            )));
        }
        nodes_in_range(&hash.nodes)?;
    }
    if let Some(seek) = &proof.seek {
        nodes_in_range(&seek.nodes)?;
    }
    if let Some(upgrade) = &proof.upgrade {
        let end = upgrade.start.checked_add(upgrade.length);
        if end.and_then(flat::checked_index_of).is_none() {
            return Err(Error::InsufficientProof(format!(
                "upgrade of {} blocks from {} is out of range",
                upgrade.length, upgrade.start
            )));
        }
        nodes_in_range(&upgrade.nodes)?;
        nodes_in_range(&upgrade.additional_nodes)?;
    }
    Ok(())
}

/// Climb `nodes` levels above `index`, refusing to cross `head`.
fn nodes_to_root(index: u64, nodes: u64, head: u64) -> Result<u64> {
    let mut ite = FlatIterator::new(index);
    for _ in 0..nodes {
        ite.parent();
        if ite.contains(head) {
            return Err(Error::InvalidOperation(format!(
                "nodes to root of {index} reach past the head"
            )));
        }
    }
    Ok(ite.index)
}

impl<N: NodeStore> MerkleTree<N> {
    /// Build a proof answering `request` from the committed tree.
    ///
    /// Block values are never inlined here; the caller fills
    /// [`BlockProof::value`] from its block store.
    pub fn proof(&self, request: &ProofRequest) -> Result<Proof> {
        check_request(request)?;

        let head = 2 * self.length;
        let (from, to) = match request.upgrade {
            Some(u) => (2 * u.start, 2 * (u.start + u.length)),
            None => (0, head),
        };
        let node = normalize_indexed(request.block, request.hash);

        if to > head || (request.upgrade.is_some() && from >= to) {
            return Err(Error::InvalidOperation(format!(
                "cannot prove upgrade to {} of a tree of length {}",
                to / 2,
                self.length
            )));
        }
        if let Some(n) = node {
            if n.last_index >= self.length {
                return Err(Error::InvalidOperation(format!(
                    "node {} is out of bounds",
                    n.index
                )));
            }
            if request.seek.is_some() && request.upgrade.is_some() && n.index >= from {
                return Err(Error::InvalidOperation(
                    "cannot both do a seek and block request when upgrading".into(),
                ));
            }
        }

        let seek = request.seek.is_some();
        let mut sub_tree = head;
        let mut p = ProofBuilder::default();

        let below_upgrade = |n: &Indexed| request.upgrade.map_or(true, |u| n.last_index < u.start);

        if let Some(n) = node.filter(below_upgrade) {
            sub_tree = nodes_to_root(n.index, n.nodes, to)?;
            let seek_root = match request.seek {
                Some(s) => self.seek_untrusted_tree(sub_tree, s.bytes)?,
                None => head,
            };
            self.block_and_seek_proof(Some(n), seek, seek_root, sub_tree, &mut p)?;
        } else if request.upgrade.is_some() {
            if let Some(s) = request.seek {
                sub_tree = self.seek_from_head(to, s.bytes)?;
            } else if let Some(n) = node {
                if flat::right_span(n.index) >= to {
                    return Err(Error::InvalidOperation(format!(
                        "node {} is not covered by the upgrade",
                        n.index
                    )));
                }
                sub_tree = n.index;
            }
        }

        if request.upgrade.is_some() {
            self.upgrade_proof(node, seek, from, to, sub_tree, &mut p)?;
            if head > to {
                self.additional_upgrade_proof(to, head, &mut p)?;
            }
        }

        let nodes = p.node.unwrap_or_default();

        Ok(Proof {
            fork: self.fork,
            block: request.block.map(|b| BlockProof {
                index: b.index,
                value: None,
                nodes: nodes.clone(),
            }),
            hash: match (request.block, request.hash) {
                (None, Some(h)) => Some(HashProof { index: h.index, nodes }),
                _ => None,
            },
            seek: match (request.seek, p.seek) {
                (Some(s), Some(nodes)) => Some(SeekProof { bytes: s.bytes, nodes }),
                _ => None,
            },
            upgrade: request.upgrade.map(|u| UpgradeProof {
                start: u.start,
                length: u.length,
                nodes: p.upgrade.unwrap_or_default(),
                additional_nodes: p.additional.unwrap_or_default(),
                signature: self.signature.clone(),
            }),
        })
    }

    fn block_and_seek_proof(
        &self,
        node: Option<Indexed>,
        seek: bool,
        seek_root: u64,
        root: u64,
        p: &mut ProofBuilder,
    ) -> Result<()> {
        let Some(node) = node else {
            return self.seek_proof(seek_root, root, p);
        };

        let mut ite = FlatIterator::new(root);
        if !ite.contains(node.index) {
            return Err(Error::InvalidOperation(format!(
                "node {} is not below {root}",
                node.index
            )));
        }
        ite.seek(node.index);

        let mut nodes = Vec::new();
        if !node.value {
            nodes.push(self.get(ite.index)?);
        }

        while ite.index != root {
            ite.sibling();

            if seek && ite.contains(seek_root) && ite.index != seek_root {
                self.seek_proof(seek_root, ite.index, p)?;
            } else {
                nodes.push(self.get(ite.index)?);
            }

            ite.parent();
        }

        p.node = Some(nodes);
        Ok(())
    }

    fn seek_proof(&self, seek_root: u64, root: u64, p: &mut ProofBuilder) -> Result<()> {
        let mut ite = FlatIterator::new(root);
        if !ite.contains(seek_root) {
            return Err(Error::InvalidOperation(format!(
                "seek root {seek_root} is not below {root}"
            )));
        }
        ite.seek(seek_root);

        let mut nodes = vec![self.get(ite.index)?];
        while ite.index != root {
            ite.sibling();
            nodes.push(self.get(ite.index)?);
            ite.parent();
        }

        p.seek = Some(nodes);
        Ok(())
    }

    fn upgrade_proof(
        &self,
        node: Option<Indexed>,
        seek: bool,
        from: u64,
        to: u64,
        sub_tree: u64,
        p: &mut ProofBuilder,
    ) -> Result<()> {
        if from == 0 {
            p.upgrade = Some(Vec::new());
        }

        let mut ite = FlatIterator::new(0);
        while ite.full_root(to) {
            // Verifier already has this whole root.
            if ite.index + ite.factor / 2 < from {
                ite.next_tree();
                continue;
            }

            // Connect the verifier's last root to this one.
            if p.upgrade.is_none() && from >= 2 && ite.contains(from - 2) {
                p.upgrade = Some(Vec::new());

                let root = ite.index;
                let target = from - 2;

                ite.seek(target);
                while ite.index != root {
                    ite.sibling();
                    if ite.index > target {
                        if p.node.is_none() && p.seek.is_none() && ite.contains(sub_tree) {
                            self.block_and_seek_proof(node, seek, sub_tree, ite.index, p)?;
                        } else {
                            let n = self.get(ite.index)?;
                            p.upgrade.get_or_insert_with(Vec::new).push(n);
                        }
                    }
                    ite.parent();
                }

                ite.next_tree();
                continue;
            }

            if p.upgrade.is_none() {
                p.upgrade = Some(Vec::new());
            }

            // Block or seek path stands in for this root.
            if p.node.is_none() && p.seek.is_none() && ite.contains(sub_tree) {
                self.block_and_seek_proof(node, seek, sub_tree, ite.index, p)?;
                ite.next_tree();
                continue;
            }

            let n = self.get(ite.index)?;
            p.upgrade.get_or_insert_with(Vec::new).push(n);
            ite.next_tree();
        }

        Ok(())
    }

    fn additional_upgrade_proof(&self, from: u64, to: u64, p: &mut ProofBuilder) -> Result<()> {
        let mut additional = Vec::new();
        let mut connected = from == 0;

        let mut ite = FlatIterator::new(0);
        while ite.full_root(to) {
            if ite.index + ite.factor / 2 < from {
                ite.next_tree();
                continue;
            }

            if !connected && ite.contains(from - 2) {
                connected = true;

                let root = ite.index;
                let target = from - 2;

                ite.seek(target);
                while ite.index != root {
                    ite.sibling();
                    if ite.index > target {
                        additional.push(self.get(ite.index)?);
                    }
                    ite.parent();
                }

                ite.next_tree();
                continue;
            }

            connected = true;
            additional.push(self.get(ite.index)?);
            ite.next_tree();
        }

        p.additional = Some(additional);
        Ok(())
    }

    /// Walk the roots of `head` to the node whose subtree holds `bytes`.
    fn seek_from_head(&self, head: u64, bytes: u64) -> Result<u64> {
        let mut bytes = bytes;

        for root in flat::full_roots(head) {
            let node = self.get(root)?;
            if bytes == node.size {
                return Ok(root);
            }
            if bytes > node.size {
                bytes -= node.size;
                continue;
            }
            return self.seek_trusted_tree(root, bytes);
        }

        Ok(head)
    }

    fn seek_trusted_tree(&self, root: u64, bytes: u64) -> Result<u64> {
        if bytes == 0 {
            return Ok(root);
        }

        let mut bytes = bytes;
        let mut ite = FlatIterator::new(root);

        while !ite.is_leaf() {
            let left_index = ite.left_child();
            match self.get_optional(left_index)? {
                Some(left) => {
                    if left.size == bytes {
                        return Ok(ite.index);
                    }
                    if left.size > bytes {
                        continue;
                    }
                    bytes -= left.size;
                    ite.sibling();
                }
                None => {
                    ite.parent();
                    return Ok(ite.index);
                }
            }
        }

        Ok(ite.index)
    }

    fn seek_untrusted_tree(&self, root: u64, bytes: u64) -> Result<u64> {
        let offset = self.flat_byte_offset(root)?;

        if offset > bytes {
            return Err(Error::InvalidOperation(format!("cannot seek to {bytes} below {root}")));
        }
        if offset == bytes {
            return Ok(root);
        }

        let bytes = bytes - offset;
        let node = self.get(root)?;
        if node.size <= bytes {
            return Err(Error::InvalidOperation(format!("cannot seek to {bytes} below {root}")));
        }

        self.seek_trusted_tree(root, bytes)
    }

    /// Check `proof` against this tree and stage what it proves.
    ///
    /// The returned batch upgrades the tree when the proof carries an
    /// upgrade; otherwise it only adds nodes. Signature checks are left to
    /// the caller, which knows the writer's key.
    pub fn verify(&self, proof: &Proof) -> Result<Batch> {
        let mut batch = self.batch();

        if proof.fork != self.fork && proof.upgrade.is_none() {
            return Err(Error::InvalidOperation(format!(
                "proof is for fork {} but the tree is at fork {}",
                proof.fork, self.fork
            )));
        }

        let mut nodes = Vec::new();
        let unverified_root = verify_tree(proof, &mut nodes)?;
        batch.nodes = nodes;

        let mut unverified = unverified_root;
        if let Some(upgrade) = &proof.upgrade {
            if verify_upgrade(proof.fork, upgrade, unverified.clone(), &mut batch)? {
                unverified = None;
            }
        }

        if let Some(root) = unverified {
            match self.get_optional(root.index)? {
                None => {
                    return Err(Error::InsufficientProof(format!(
                        "node {} is not held locally",
                        root.index
                    )))
                }
                Some(local) if local.hash != root.hash => {
                    return Err(Error::HashMismatch { index: root.index })
                }
                Some(_) => {}
            }
        }

        Ok(batch)
    }
}

/// Nodes of a proof consumed in order, with one out-of-band node (a block
/// or seek root) that may be claimed at any point.
struct NodeQueue {
    nodes: Vec<Node>,
    i: usize,
    extra: Option<Node>,
}

impl NodeQueue {
    fn new(nodes: Vec<Node>, extra: Option<Node>) -> Self {
        Self { nodes, i: 0, extra }
    }

    fn len(&self) -> usize {
        self.nodes.len() - self.i + usize::from(self.extra.is_some())
    }

    fn shift(&mut self, index: u64) -> Result<Node> {
        if self.extra.as_ref().map_or(false, |n| n.index == index) {
            if let Some(node) = self.extra.take() {
                return Ok(node);
            }
        }

        let node = self
            .nodes
            .get(self.i)
            .ok_or_else(|| Error::InsufficientProof(format!("expected node {index}, got none")))?;
        if node.index != index {
            return Err(Error::InsufficientProof(format!(
                "expected node {index}, got node {}",
                node.index
            )));
        }

        self.i += 1;
        Ok(node.clone())
    }
}

/// Hash up from the seek path and the block (or hash) path, recording every
/// node computed on the way. Returns the root reached, which is not yet
/// trusted.
pub(crate) fn verify_tree(proof: &Proof, nodes: &mut Vec<Node>) -> Result<Option<Node>> {
    check_proof(proof)?;

    let untrusted = if let Some(block) = &proof.block {
        let value = block
            .value
            .as_deref()
            .ok_or_else(|| Error::InsufficientProof("block proof is missing its value".into()))?;
        let index = flat::checked_index_of(block.index)
            .ok_or_else(|| Error::InsufficientProof(format!("block {} is out of range", block.index)))?;
        Some((index, Some(value), block.nodes.as_slice()))
    } else {
        proof
            .hash
            .as_ref()
            .map(|hash| (hash.index, None, hash.nodes.as_slice()))
    };

    let seek_nodes = proof
        .seek
        .as_ref()
        .map(|s| s.nodes.as_slice())
        .filter(|n| !n.is_empty());

    let mut root = None;

    if let Some(seek_nodes) = seek_nodes {
        let first = seek_nodes[0].index;
        let mut q = NodeQueue::new(seek_nodes.to_vec(), None);
        root = Some(hash_path(FlatIterator::new(first), q.shift(first)?, &mut q, nodes)?);
    }

    let Some((index, value, uncles)) = untrusted else {
        return Ok(root);
    };

    let mut q = NodeQueue::new(uncles.to_vec(), root);
    let current = match value {
        Some(value) => crypto::leaf_node(index, value),
        None => q.shift(index)?,
    };

    hash_path(FlatIterator::new(index), current, &mut q, nodes).map(Some)
}

fn hash_path(
    mut ite: FlatIterator,
    mut current: Node,
    q: &mut NodeQueue,
    nodes: &mut Vec<Node>,
) -> Result<Node> {
    nodes.push(current.clone());

    while q.len() > 0 {
        let sibling = q.shift(ite.sibling())?;
        let parent = crypto::parent_node(ite.parent(), &current, &sibling);
        nodes.push(sibling);
        nodes.push(parent.clone());
        current = parent;
    }

    Ok(current)
}

/// Extend `batch` by the roots in `upgrade`. `block_root` may stand in for
/// one of the upgrade nodes; returns whether it did.
pub(crate) fn verify_upgrade(
    fork: u64,
    upgrade: &UpgradeProof,
    block_root: Option<Node>,
    batch: &mut Batch,
) -> Result<bool> {
    if upgrade.length == 0 {
        return Err(Error::InsufficientProof("upgrade of zero blocks".into()));
    }
    if upgrade.start != batch.length {
        return Err(Error::InsufficientProof(format!(
            "upgrade starts at {} but the tree has {} blocks",
            upgrade.start, batch.length
        )));
    }

    let mut q = NodeQueue::new(upgrade.nodes.clone(), block_root);
    let mut grow = !batch.roots.is_empty();
    let mut i = 0;

    let to = 2 * (upgrade.start + upgrade.length);
    let mut ite = FlatIterator::new(0);

    while ite.full_root(to) {
        if i < batch.roots.len() && batch.roots[i].index == ite.index {
            i += 1;
            ite.next_tree();
            continue;
        }

        if grow {
            grow = false;
            let root = ite.index;
            if i < batch.roots.len() {
                let last = batch.roots[batch.roots.len() - 1].index;
                ite.seek(last);
                while ite.index != root {
                    let node = q.shift(ite.sibling())?;
                    batch.append_root(node, &mut ite);
                }
                ite.next_tree();
                continue;
            }
        }

        let node = q.shift(ite.index)?;
        batch.append_root(node, &mut ite);
        ite.next_tree();
    }

    if q.i < q.nodes.len() {
        return Err(Error::InsufficientProof(format!(
            "{} unused upgrade nodes",
            q.nodes.len() - q.i
        )));
    }

    let extra = &upgrade.additional_nodes;
    if !extra.is_empty() {
        let last = batch
            .roots
            .last()
            .ok_or_else(|| Error::InsufficientProof("additional nodes without roots".into()))?
            .index;
        ite.seek(last);

        let mut i = 0;
        while i < extra.len() && extra[i].index == ite.sibling() {
            batch.append_root(extra[i].clone(), &mut ite);
            i += 1;
        }

        while i < extra.len() {
            let node = extra[i].clone();
            i += 1;

            while node.index != ite.index {
                if ite.is_leaf() {
                    return Err(Error::InsufficientProof(format!(
                        "unexpected additional node {}",
                        node.index
                    )));
                }
                ite.left_child();
            }

            batch.append_root(node, &mut ite);
            ite.sibling();
        }
    }

    batch.signature = upgrade.signature.clone();
    batch.fork = fork;

    Ok(q.extra.is_none())
}
