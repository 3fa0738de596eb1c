//! Adopting a remote fork
//!
//! A reorg starts from a verified upgrade of the remote tree and walks down
//! from the first root that differs locally until the last shared block is
//! pinned. Each step may need more remote nodes; [`ReorgBatch::request`]
//! names them.

use std::collections::HashMap;

use crate::flat;
use crate::nodestore::NodeStore;
use crate::proof::{verify_tree, verify_upgrade};
use crate::tree::{Batch, MerkleTree};
use crate::{Error, Node, Proof, ProofRequest, Result};

/// Remote nodes still needed to find the fork point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReorgWant {
    /// Levels above the last leaf of the range
    pub nodes: u64,
    pub start: u64,
    pub end: u64,
}

impl ReorgWant {
    pub fn request(&self) -> ProofRequest {
        ProofRequest::hash(flat::index_of(self.end - 1), self.nodes)
    }
}

/// A staged remote tree plus the search state for its fork point.
#[derive(Debug)]
pub struct ReorgBatch {
    batch: Batch,
    diff: Option<Node>,
    want: Option<ReorgWant>,
    tree_length: u64,
}

impl ReorgBatch {
    pub fn finished(&self) -> bool {
        self.want.is_none()
    }

    pub fn want(&self) -> Option<ReorgWant> {
        self.want
    }

    /// Next proof to ask the remote for, if any.
    pub fn request(&self) -> Option<ProofRequest> {
        self.want.map(|w| w.request())
    }

    /// Blocks shared with the local tree, as far as is known so far.
    pub fn ancestors(&self) -> u64 {
        self.batch.ancestors
    }

    pub fn length(&self) -> u64 {
        self.batch.length
    }

    pub fn fork(&self) -> u64 {
        self.batch.fork
    }

    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    pub fn into_batch(self) -> Batch {
        self.batch
    }

    /// Feed a hash proof answering [`ReorgBatch::request`]. Returns whether
    /// the fork point is now known.
    pub fn update<N: NodeStore>(&mut self, tree: &MerkleTree<N>, proof: &Proof) -> Result<bool> {
        let diff = self
            .diff
            .clone()
            .ok_or_else(|| Error::InvalidOperation("reorg is already resolved".into()))?;

        let mut nodes = Vec::new();
        let root = verify_tree(proof, &mut nodes)?
            .ok_or_else(|| Error::InsufficientProof("reorg update without nodes".into()))?;

        if root.index != diff.index || root.hash != diff.hash {
            return Err(Error::HashMismatch { index: diff.index });
        }

        self.batch.nodes.extend(nodes);

        let before = self.want;
        let finished = self.descend(tree)?;
        if !finished && self.want == before {
            return Err(Error::InsufficientProof(format!(
                "update did not narrow the fork below node {}",
                diff.index
            )));
        }
        Ok(finished)
    }

    pub fn commit<N: NodeStore>(self, tree: &mut MerkleTree<N>) -> Result<()> {
        if !self.finished() {
            return Err(Error::InvalidOperation("reorg is still missing nodes".into()));
        }
        self.batch.commit(tree)
    }

    fn update_diff_root(&mut self, diff: Node) -> bool {
        let start = flat::left_span(diff.index) / 2;
        let end = (flat::right_span(diff.index) / 2 + 1).min(self.tree_length);

        self.batch.ancestors = start;

        let leaf = diff.index & 1 == 0;
        let nodes = u64::from(flat::depth(diff.index));
        self.diff = Some(diff);

        if leaf || start >= self.tree_length || end <= start {
            self.want = None;
            return true;
        }

        self.want = Some(ReorgWant { nodes, start, end });
        false
    }

    /// Walk down from the current diff while the staged nodes allow it.
    fn descend<N: NodeStore>(&mut self, tree: &MerkleTree<N>) -> Result<bool> {
        let Some(start) = self.diff.as_ref().map(|d| d.index) else {
            return Ok(true);
        };

        let known: HashMap<u64, &Node> = self.batch.nodes.iter().map(|n| (n.index, n)).collect();
        let mut ite = flat::FlatIterator::new(start);
        let mut next = None;

        while !ite.is_leaf() {
            let left_index = ite.left_child();
            let Some(left) = known.get(&left_index) else { break };

            let differs = match tree.get_optional(left_index)? {
                Some(local) => local.hash != left.hash,
                None => true,
            };
            if differs {
                next = Some((*left).clone());
                continue;
            }

            let right_index = ite.sibling();
            match known.get(&right_index) {
                Some(right) => next = Some((*right).clone()),
                None => break,
            }
        }

        Ok(match next {
            Some(diff) => self.update_diff_root(diff),
            None => self.finished(),
        })
    }
}

impl<N: NodeStore> MerkleTree<N> {
    /// Verify an upgrade proof from a remote on another fork and start
    /// looking for the last block both trees share.
    pub fn reorg(&self, proof: &Proof) -> Result<ReorgBatch> {
        let upgrade = proof
            .upgrade
            .as_ref()
            .ok_or_else(|| Error::InsufficientProof("reorg proof has no upgrade".into()))?;

        let mut batch = Batch::detached(self);
        let mut nodes = Vec::new();
        let unverified = verify_tree(proof, &mut nodes)?;
        batch.nodes = nodes;

        if !verify_upgrade(proof.fork, upgrade, unverified, &mut batch)? {
            return Err(Error::InsufficientProof("fork proof is not verifiable".into()));
        }

        let mut reorg = ReorgBatch {
            batch,
            diff: None,
            want: None,
            tree_length: self.length,
        };

        let roots = reorg.batch.roots.clone();
        for root in roots {
            if let Some(local) = self.get_optional(root.index)? {
                if local.hash == root.hash {
                    continue;
                }
            }
            reorg.update_diff_root(root);
            break;
        }

        if reorg.diff.is_some() {
            reorg.descend(self)?;
        } else {
            reorg.want = None;
            reorg.batch.ancestors = reorg.batch.length.min(self.length);
        }

        Ok(reorg)
    }
}
