use serde::{Deserialize, Serialize};

use crate::signer::KeyPair;
use crate::{BitfieldUpdate, Hash32, Node, Result};

/// Which signable layout the writer signs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignableFormat {
    #[default]
    Current,
    /// Hash, length and fork with no namespace prefix
    Legacy,
}

/// Signed summary of the tree.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeHeader {
    pub fork: u64,
    pub length: u64,
    pub byte_length: u64,
    pub root_hash: Hash32,
    pub signature: Option<Vec<u8>>,
}

/// A past truncation: the log moved from fork `from` to fork `to`, keeping
/// the first `ancestors` blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgHint {
    pub from: u64,
    pub to: u64,
    pub ancestors: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDataEntry {
    pub key: String,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub signer: KeyPair,
    pub tree: TreeHeader,
    /// Most recent last
    pub reorg_hints: Vec<ReorgHint>,
    /// Unique keys in insertion order
    pub user_data: Vec<UserDataEntry>,
    pub signable_format: SignableFormat,
}

impl Header {
    pub fn new(signer: KeyPair, signable_format: SignableFormat) -> Self {
        Self {
            signer,
            tree: TreeHeader::default(),
            reorg_hints: Vec::new(),
            user_data: Vec::new(),
            signable_format,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(buf)?)
    }

    pub fn user_data(&self, key: &str) -> Option<&[u8]> {
        self.user_data
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.as_slice())
    }

    /// Set or (with `None` or an empty value) delete `key`. Returns whether
    /// anything changed.
    pub fn set_user_data(&mut self, key: &str, value: Option<&[u8]>) -> bool {
        let value = value.filter(|v| !v.is_empty());
        let pos = self.user_data.iter().position(|e| e.key == key);

        match (pos, value) {
            (Some(i), None) => {
                self.user_data.remove(i);
                true
            }
            (Some(i), Some(v)) => {
                if self.user_data[i].value == v {
                    return false;
                }
                self.user_data[i].value = v.to_vec();
                true
            }
            (None, Some(v)) => {
                self.user_data.push(UserDataEntry {
                    key: key.to_string(),
                    value: v.to_vec(),
                });
                true
            }
            (None, None) => false,
        }
    }

    /// Record a move from the current fork to `fork`. Hints that kept more
    /// blocks than this truncation are superseded, and only the newest
    /// `max` are retained.
    pub fn add_reorg_hint(&mut self, fork: u64, ancestors: u64, max: usize) {
        if self.tree.length == 0 || self.tree.fork == fork {
            return;
        }

        while self
            .reorg_hints
            .last()
            .map_or(false, |h| h.ancestors > ancestors)
        {
            self.reorg_hints.pop();
        }

        self.reorg_hints.push(ReorgHint {
            from: self.tree.fork,
            to: fork,
            ancestors,
        });

        if self.reorg_hints.len() > max {
            let overflow = self.reorg_hints.len() - max;
            self.reorg_hints.drain(0..overflow);
        }
    }
}

/// New tree state recorded by an oplog entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TreeUpgrade {
    pub fork: u64,
    pub ancestors: u64,
    pub length: u64,
    pub signature: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct UserDataUpdate {
    pub key: String,
    pub value: Option<Vec<u8>>,
}

/// One durable mutation, as journaled in the oplog.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Entry {
    pub user_data: Option<UserDataUpdate>,
    pub tree_nodes: Vec<Node>,
    pub tree_upgrade: Option<TreeUpgrade>,
    pub bitfield: Option<BitfieldUpdate>,
}

impl Entry {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Header {
        let mut header = Header::new(
            KeyPair {
                public_key: [1u8; 32],
                secret_key: None,
            },
            SignableFormat::Current,
        );
        header.tree.length = 10;
        header
    }

    #[test]
    fn user_data_keeps_insertion_order() {
        let mut h = header();
        assert!(h.set_user_data("a", Some(b"1")));
        assert!(h.set_user_data("b", Some(b"2")));
        assert!(h.set_user_data("a", Some(b"3")));
        assert!(!h.set_user_data("a", Some(b"3")));
        assert!(!h.set_user_data("missing", None));

        let keys: Vec<&str> = h.user_data.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(h.user_data("a"), Some(&b"3"[..]));

        assert!(h.set_user_data("a", Some(b"")));
        assert_eq!(h.user_data("a"), None);
    }

    #[test]
    fn reorg_hints_are_bounded() {
        let mut h = header();
        for fork in 1..=6 {
            h.add_reorg_hint(fork, 10, 4);
            h.tree.fork = fork;
        }
        assert_eq!(h.reorg_hints.len(), 4);
        assert_eq!(h.reorg_hints[0].to, 3);
        assert_eq!(h.reorg_hints[3].to, 6);
    }

    #[test]
    fn deeper_truncation_supersedes_hints() {
        let mut h = header();
        h.add_reorg_hint(1, 8, 4);
        h.tree.fork = 1;
        h.add_reorg_hint(2, 5, 4);

        assert_eq!(
            h.reorg_hints,
            vec![ReorgHint {
                from: 1,
                to: 2,
                ancestors: 5
            }]
        );
    }

    #[test]
    fn same_fork_is_not_a_reorg() {
        let mut h = header();
        h.add_reorg_hint(0, 3, 4);
        assert!(h.reorg_hints.is_empty());
    }
}
