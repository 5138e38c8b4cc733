//! Pending blocks whose parent is not known yet.
//!
//! Entries are keyed by the missing parent id. When that parent is accepted
//! its waiting children are drained and processed again. The set is bounded;
//! once full, new orphans are refused rather than evicting older ones.

use horizon_core::{Block, BlockId};
use std::collections::{HashMap, HashSet};

#[derive(Debug)]
pub struct PendingBlocks {
    /// parent id -> blocks waiting for it
    by_parent: HashMap<BlockId, Vec<Block>>,
    ids: HashSet<BlockId>,
    max_size: usize,
}

impl PendingBlocks {
    pub fn new(max_size: usize) -> Self {
        Self {
            by_parent: HashMap::new(),
            ids: HashSet::new(),
            max_size,
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.ids.contains(&id)
    }

    /// Holds `block` until `parent` arrives.
    ///
    /// Returns `true` if the block is held (or already was), `false` if the
    /// set is full.
    pub fn insert(&mut self, parent: BlockId, block: Block) -> bool {
        let id = block.id();
        if self.ids.contains(&id) {
            return true;
        }
        if self.ids.len() >= self.max_size {
            return false;
        }
        self.ids.insert(id);
        self.by_parent.entry(parent).or_default().push(block);
        true
    }

    /// Removes and returns every block waiting for `parent`
    pub fn take_children(&mut self, parent: BlockId) -> Vec<Block> {
        let children = self.by_parent.remove(&parent).unwrap_or_default();
        for child in &children {
            self.ids.remove(&child.id());
        }
        children
    }

    /// Drops pending blocks at or below `height`; they could only attach
    /// deeper than a reorganization may reach
    pub fn prune_at_or_below(&mut self, height: u32) -> usize {
        let mut pruned = 0;
        let ids = &mut self.ids;
        self.by_parent.retain(|_, blocks| {
            blocks.retain(|block| {
                let keep = block.height > height;
                if !keep {
                    ids.remove(&block.id());
                    pruned += 1;
                }
                keep
            });
            !blocks.is_empty()
        });
        pruned
    }
}
