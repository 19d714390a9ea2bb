//! Block store: numbered, immutable line sequences.
//!
//! Block 0 ("orig") holds committed, unlocked content and is never
//! collected. Every other block is the working copy of a lock, or a leftover
//! of one waiting for [`BlockStore::garbage_collect`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Small integer address of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u32);

impl BlockId {
    /// The committed-content block.
    pub const ORIG: BlockId = BlockId(0);
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered line storage. Lines keep their own terminators.
#[derive(Debug, Clone)]
pub struct BlockStore {
    blocks: BTreeMap<BlockId, Vec<String>>,
    next_id: u32,
}

impl BlockStore {
    /// Create a store whose block 0 holds `orig`.
    pub fn new(orig: Vec<String>) -> Self {
        let mut blocks = BTreeMap::new();
        blocks.insert(BlockId::ORIG, orig);
        Self { blocks, next_id: 1 }
    }

    /// Store `lines` under the next unused id.
    pub fn insert_block(&mut self, lines: Vec<String>) -> BlockId {
        let id = BlockId(self.next_id);
        self.next_id += 1;
        self.blocks.insert(id, lines);
        id
    }

    /// Replace a block's content wholesale. Returns `false` if it does not exist.
    pub fn replace(&mut self, id: BlockId, lines: Vec<String>) -> bool {
        match self.blocks.get_mut(&id) {
            Some(block) => {
                *block = lines;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: BlockId) -> Option<&[String]> {
        self.blocks.get(&id).map(Vec::as_slice)
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.blocks.contains_key(&id)
    }

    /// Number of live blocks (including block 0).
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &[String])> + '_ {
        self.blocks.iter().map(|(id, lines)| (*id, lines.as_slice()))
    }

    /// Drop every block not in `referenced`, keeping block 0.
    ///
    /// Returns the removed ids in ascending order.
    pub fn garbage_collect(&mut self, referenced: &BTreeSet<BlockId>) -> Vec<BlockId> {
        let removed: Vec<BlockId> = self
            .blocks
            .keys()
            .copied()
            .filter(|id| *id != BlockId::ORIG && !referenced.contains(id))
            .collect();
        for id in &removed {
            self.blocks.remove(id);
        }
        removed
    }
}
