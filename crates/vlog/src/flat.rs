//! Flat-tree addressing
//!
//! Every node of an implicit binary tree over a sequence of leaves gets a
//! distinct integer slot. Leaves sit at even indices (`2 * i`), parents at
//! odd ones. The depth of a node is the number of trailing one-bits of its
//! index.
//!
//! ```text
//! 0─┐
//!   1─┐
//! 2─┘ │
//!     3
//! 4─┐ │
//!   5─┘
//! 6─┘
//! ```

/// Indices at or above this are out of reach of any tree: their spans,
/// parents and byte offsets would not fit a `u64`.
pub const MAX_INDEX: u64 = 1 << 62;

/// Flat index of the leaf at sequence position `seq`.
pub fn index_of(seq: u64) -> u64 {
    2 * seq
}

/// [`index_of`] for untrusted positions, `None` past [`MAX_INDEX`].
pub fn checked_index_of(seq: u64) -> Option<u64> {
    seq.checked_mul(2).filter(|index| *index < MAX_INDEX)
}

/// Whether a node at `index` can exist in a tree.
pub fn in_range(index: u64) -> bool {
    index < MAX_INDEX
}

/// Flat index of the node at `depth` and `offset` (position within its row).
pub fn index(depth: u32, offset: u64) -> u64 {
    (1 + 2 * offset) * (1u64 << depth) - 1
}

/// Depth of a node, leaves are depth 0.
pub fn depth(index: u64) -> u32 {
    (!index).trailing_zeros()
}

/// Position of a node within its row.
pub fn offset(index: u64) -> u64 {
    if index & 1 == 0 {
        return index / 2;
    }
    index.checked_shr(depth(index) + 1).unwrap_or(0)
}

pub fn parent(index: u64) -> u64 {
    let d = depth(index);
    self::index(d + 1, offset(index) >> 1)
}

pub fn sibling(index: u64) -> u64 {
    let d = depth(index);
    self::index(d, offset(index) ^ 1)
}

/// Left and right child, `None` for leaves.
pub fn children(index: u64) -> Option<(u64, u64)> {
    if index & 1 == 0 {
        return None;
    }
    let half = 1u64 << (depth(index) - 1);
    Some((index - half, index + half))
}

/// Leftmost leaf covered by the node.
pub fn left_span(index: u64) -> u64 {
    if index & 1 == 0 {
        return index;
    }
    offset(index) * (1u64 << (depth(index) + 1))
}

/// Rightmost leaf covered by the node.
pub fn right_span(index: u64) -> u64 {
    if index & 1 == 0 {
        return index;
    }
    (offset(index) + 1) * (1u64 << (depth(index) + 1)) - 2
}

pub fn spans(index: u64) -> (u64, u64) {
    (left_span(index), right_span(index))
}

pub fn count_leaves(index: u64) -> u64 {
    1u64 << depth(index)
}

/// Roots of the perfect subtrees that exactly partition the leaves below
/// `head`, left to right. `head` is a leaf-aligned flat index (`2 * length`).
pub fn full_roots(head: u64) -> Vec<u64> {
    debug_assert!(head & 1 == 0, "full roots are only defined for leaf indices");

    let mut roots = Vec::new();
    let mut remaining = head / 2;
    let mut offset = 0u64;

    while remaining > 0 {
        let factor = 1u64 << (63 - remaining.leading_zeros());
        roots.push(offset + factor - 1);
        offset += 2 * factor;
        remaining -= factor;
    }

    roots
}

/// Cursor over the flat tree. `factor` is twice the number of leaves below
/// the current node, so `index ± factor / 2` reaches just past its spans.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlatIterator {
    pub index: u64,
    pub offset: u64,
    pub factor: u64,
}

impl FlatIterator {
    pub fn new(index: u64) -> Self {
        let mut ite = Self { index: 0, offset: 0, factor: 0 };
        ite.seek(index);
        ite
    }

    pub fn seek(&mut self, index: u64) {
        self.index = index;
        if index & 1 == 1 {
            self.offset = offset(index);
            self.factor = 1u64 << (depth(index) + 1);
        } else {
            self.offset = index / 2;
            self.factor = 2;
        }
    }

    pub fn is_left(&self) -> bool {
        self.offset & 1 == 0
    }

    pub fn is_right(&self) -> bool {
        !self.is_left()
    }

    pub fn is_leaf(&self) -> bool {
        self.factor == 2
    }

    /// Whether `index` lies inside the subtree rooted at the current node.
    pub fn contains(&self, index: u64) -> bool {
        let half = self.factor / 2;
        if index > self.index {
            index < self.index + half
        } else if index < self.index {
            index + half > self.index
        } else {
            true
        }
    }

    pub fn count_leaves(&self) -> u64 {
        self.factor / 2
    }

    pub fn left_span(&self) -> u64 {
        self.index + 1 - self.factor / 2
    }

    pub fn right_span(&self) -> u64 {
        self.index + self.factor / 2 - 1
    }

    pub fn next(&mut self) -> u64 {
        self.offset += 1;
        self.index += self.factor;
        self.index
    }

    pub fn prev(&mut self) -> u64 {
        if self.offset == 0 {
            return self.index;
        }
        self.offset -= 1;
        self.index -= self.factor;
        self.index
    }

    pub fn sibling(&mut self) -> u64 {
        if self.is_left() {
            self.next()
        } else {
            self.prev()
        }
    }

    pub fn parent(&mut self) -> u64 {
        if self.offset & 1 == 1 {
            self.index -= self.factor / 2;
            self.offset = (self.offset - 1) / 2;
        } else {
            self.index += self.factor / 2;
            self.offset /= 2;
        }
        self.factor *= 2;
        self.index
    }

    pub fn left_child(&mut self) -> u64 {
        if self.factor == 2 {
            return self.index;
        }
        self.factor /= 2;
        self.index -= self.factor / 2;
        self.offset *= 2;
        self.index
    }

    pub fn right_child(&mut self) -> u64 {
        if self.factor == 2 {
            return self.index;
        }
        self.factor /= 2;
        self.index += self.factor / 2;
        self.offset = 2 * self.offset + 1;
        self.index
    }

    /// Starting at a leaf-aligned position, grow to the largest perfect
    /// subtree that still ends before `head`. Returns false once the cursor
    /// has reached `head`.
    pub fn full_root(&mut self, head: u64) -> bool {
        if head <= self.index || self.index & 1 == 1 {
            return false;
        }
        while head > self.index + self.factor + self.factor / 2 {
            self.index += self.factor / 2;
            self.factor *= 2;
            self.offset /= 2;
        }
        true
    }

    /// Jump to the first leaf after the current subtree.
    pub fn next_tree(&mut self) -> u64 {
        self.index = self.index + self.factor / 2 + 1;
        self.offset = self.index / 2;
        self.factor = 2;
        self.index
    }
}
