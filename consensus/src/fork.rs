//! Fork resolution
//!
//! When a side branch outweighs the canonical chain the node walks back
//! from the branch tip to the canonical chain, undoes the canonical blocks
//! above that common ancestor (newest first) and applies the branch (oldest
//! first) with full validation. Both walks use explicit stacks bounded by
//! the maximum reorganization depth.
//!
//! Readers never see an intermediate state: the whole switch runs under
//! the chain write lock. If any branch block fails, the old chain is
//! restored and the branch from the failing block on is marked invalid.

use crate::chain::Blockchain;
use crate::error::BlockError;
use horizon_core::{Block, BlockId, StorageError, Transaction, TransactionValidator, ValidationContext};
use std::collections::HashSet;
use std::time::Instant;

/// What a completed reorganization did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgSummary {
    /// Height of the last block both chains share
    pub ancestor_height: u32,
    /// Canonical blocks undone
    pub depth: u32,
    /// Branch blocks applied
    pub applied: u32,
    /// Transactions from undone blocks returned to the pool
    pub reinstated: usize,
    /// Transactions from undone blocks that no longer validate
    pub discarded: usize,
}

/// Blocks to apply to move the canonical tip onto a branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgPlan {
    pub ancestor: BlockId,
    pub ancestor_height: u32,
    /// Branch blocks from the ancestor's child up to the new tip
    pub branch: Vec<Block>,
}

/// Finds the common ancestor of a branch and the canonical chain
#[derive(Debug, Clone, Copy)]
pub struct ForkResolver {
    max_depth: u32,
}

impl ForkResolver {
    pub fn new(max_depth: u32) -> Self {
        Self { max_depth }
    }

    /// Walks back from `new_tip` until a block satisfying `is_canonical`,
    /// refusing ancestors more than `max_depth` below `tip_height`
    pub fn plan<F, C>(
        &self,
        tip_height: u32,
        new_tip: Block,
        mut lookup: F,
        is_canonical: C,
    ) -> Result<ReorgPlan, BlockError>
    where
        F: FnMut(BlockId) -> Result<Option<Block>, StorageError>,
        C: Fn(&Block) -> bool,
    {
        let floor = tip_height.saturating_sub(self.max_depth);
        let mut branch = Vec::new();
        let mut current = new_tip;

        while !is_canonical(&current) {
            if current.height <= floor {
                return Err(BlockError::ReorgTooDeep {
                    depth: tip_height - current.height.saturating_sub(1),
                    max: self.max_depth,
                });
            }
            let parent_id = current.previous_block_id.ok_or_else(|| {
                BlockError::InvariantViolation("branch does not descend from the genesis block".to_string())
            })?;
            let parent = lookup(parent_id)?.ok_or(BlockError::UnknownParent(parent_id))?;
            branch.push(current);
            current = parent;
        }

        let depth = tip_height.saturating_sub(current.height);
        if depth > self.max_depth {
            return Err(BlockError::ReorgTooDeep {
                depth,
                max: self.max_depth,
            });
        }
        branch.reverse();
        Ok(ReorgPlan {
            ancestor: current.id(),
            ancestor_height: current.height,
            branch,
        })
    }
}

impl Blockchain {
    /// Makes the known block `new_tip` the canonical tip
    pub(crate) fn reorganize(
        &mut self,
        new_tip: BlockId,
        now: u32,
        deadline: Option<Instant>,
    ) -> Result<ReorgSummary, BlockError> {
        let target = self
            .blocks
            .get(&new_tip)
            .cloned()
            .ok_or_else(|| BlockError::InvariantViolation(format!("reorganization target {} is unknown", new_tip)))?;

        let resolver = ForkResolver::new(self.params.max_reorg_depth);
        let plan = resolver.plan(self.tip.height, target, |id| self.block(id), |block| self.is_canonical(block))?;
        if let Some(bad) = plan.branch.iter().map(Block::id).find(|id| self.invalid.contains(id)) {
            return Err(BlockError::InvalidBranch(bad));
        }

        let depth = self.tip.height - plan.ancestor_height;
        log::info!(
            "Reorganizing: undoing {} blocks to common ancestor at height {}, applying {}",
            depth,
            plan.ancestor_height,
            plan.branch.len()
        );

        self.suspend_pool()?;
        let popped = match self.switch_branch(&plan, deadline) {
            Ok(popped) => popped,
            Err(err) => {
                self.resume_pool(now);
                return Err(err);
            }
        };

        let confirmed: Vec<_> = plan.branch.iter().flat_map(Block::transaction_ids).collect();
        self.pool.remove_confirmed(&confirmed);
        self.resume_pool(now);

        // oldest popped block first, in block order
        let returned: Vec<Transaction> = popped
            .iter()
            .rev()
            .flat_map(|block| block.transactions.iter())
            .filter(|tx| !self.ledger.is_confirmed(tx.id()))
            .cloned()
            .collect();
        let ctx = ValidationContext::for_pool(now, self.tip.height + 1, self.params.allowed_clock_skew);
        let validator = TransactionValidator::new(&self.registry);
        let report = self.pool.reinstate_after_reorg(returned, &mut self.ledger, &validator, &ctx);

        log::info!(
            "Reorganized to {} at height {}: {} transactions reinstated, {} discarded",
            self.tip_id,
            self.tip.height,
            report.reinstated.len(),
            report.discarded.len()
        );
        Ok(ReorgSummary {
            ancestor_height: plan.ancestor_height,
            depth,
            applied: plan.branch.len() as u32,
            reinstated: report.reinstated.len(),
            discarded: report.discarded.len(),
        })
    }

    /// Undoes the canonical chain down to the ancestor and applies the
    /// branch. Returns the undone blocks, newest first. On failure the old
    /// chain is back in place.
    fn switch_branch(&mut self, plan: &ReorgPlan, deadline: Option<Instant>) -> Result<Vec<Block>, BlockError> {
        // the store first: if it fails nothing has changed yet
        self.store.undo_to_height(plan.ancestor_height)?;
        let mut popped = Vec::new();
        while self.tip.height > plan.ancestor_height {
            popped.push(self.disconnect()?);
        }

        for (index, block) in plan.branch.iter().enumerate() {
            if let Err(err) = self.connect(block, deadline, true) {
                log::warn!(
                    "Branch block {} at height {} failed, restoring the previous chain: {}",
                    block.id(),
                    block.height,
                    err
                );
                self.restore(plan.ancestor_height, &popped)?;
                if err.is_permanent() {
                    self.mark_invalid(&plan.branch[index..]);
                }
                return Err(err);
            }
        }
        Ok(popped)
    }

    /// Rolls back to `ancestor_height` and re-applies `popped` (newest first).
    /// Any failure halts the chain.
    fn restore(&mut self, ancestor_height: u32, popped: &[Block]) -> Result<(), BlockError> {
        self.reapply(ancestor_height, popped).map_err(|err| {
            let reason = format!("failed to restore the previous chain: {}", err);
            log::error!("{}, halting", reason);
            self.halted = Some(reason.clone());
            BlockError::InvariantViolation(reason)
        })
    }

    fn reapply(&mut self, ancestor_height: u32, popped: &[Block]) -> Result<(), BlockError> {
        self.store.undo_to_height(ancestor_height)?;
        while self.tip.height > ancestor_height {
            self.disconnect()?;
        }
        for block in popped.iter().rev() {
            self.connect(block, None, true)?;
        }
        Ok(())
    }

    fn mark_invalid(&mut self, blocks: &[Block]) {
        let ids: HashSet<BlockId> = blocks.iter().map(Block::id).collect();
        self.blocks.retain(|id, _| !ids.contains(id));
        self.invalid.extend(ids);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use horizon_core::{GenesisConfig, KeyPair};
    use std::collections::HashMap;

    /// Chain of `len` empty blocks on top of `parent`, distinguished by `salt`
    fn chain_from(parent: &Block, len: usize, salt: u32) -> Vec<Block> {
        let keys = KeyPair::from_secret_phrase("fork-forger").unwrap();
        let mut blocks = Vec::new();
        let mut current = parent.clone();
        for _ in 0..len {
            let next = Block::unsigned(
                &current,
                current.timestamp + 60 + salt,
                Vec::new(),
                keys.public_key(),
                [0; 32],
                100,
            )
            .sign(&keys);
            blocks.push(next.clone());
            current = next;
        }
        blocks
    }

    struct Tree {
        blocks: HashMap<BlockId, Block>,
        canonical: HashSet<BlockId>,
    }

    impl Tree {
        fn new(genesis: &Block, canonical: &[Block], side: &[Block]) -> Self {
            let mut blocks = HashMap::new();
            for block in std::iter::once(genesis).chain(canonical).chain(side) {
                blocks.insert(block.id(), block.clone());
            }
            let canonical = std::iter::once(genesis).chain(canonical).map(Block::id).collect();
            Self { blocks, canonical }
        }

        fn plan(&self, resolver: ForkResolver, tip_height: u32, new_tip: &Block) -> Result<ReorgPlan, BlockError> {
            resolver.plan(
                tip_height,
                new_tip.clone(),
                |id| Ok(self.blocks.get(&id).cloned()),
                |block| self.canonical.contains(&block.id()),
            )
        }
    }

    #[test]
    fn test_plan_finds_common_ancestor() {
        let genesis = GenesisConfig::new(0).block();
        let main = chain_from(&genesis, 3, 0);
        let side = chain_from(&main[0], 3, 1);
        let tree = Tree::new(&genesis, &main, &side);

        let plan = tree.plan(ForkResolver::new(10), 3, &side[2]).unwrap();
        assert_eq!(plan.ancestor, main[0].id());
        assert_eq!(plan.ancestor_height, 1);
        assert_eq!(plan.branch, side);
    }

    #[test]
    fn test_plan_respects_max_depth() {
        let genesis = GenesisConfig::new(0).block();
        let main = chain_from(&genesis, 5, 0);
        let side = chain_from(&genesis, 6, 1);
        let tree = Tree::new(&genesis, &main, &side);

        let err = tree.plan(ForkResolver::new(3), 5, &side[5]).unwrap_err();
        assert!(matches!(err, BlockError::ReorgTooDeep { max: 3, .. }));

        let plan = tree.plan(ForkResolver::new(5), 5, &side[5]).unwrap();
        assert_eq!(plan.ancestor_height, 0);
        assert_eq!(plan.branch.len(), 6);
    }

    #[test]
    fn test_plan_reports_missing_parent() {
        let genesis = GenesisConfig::new(0).block();
        let main = chain_from(&genesis, 2, 0);
        let side = chain_from(&main[0], 2, 1);
        // the first side block is unknown
        let tree = Tree::new(&genesis, &main, &side[1..]);

        let err = tree.plan(ForkResolver::new(10), 2, &side[1]).unwrap_err();
        assert_eq!(err, BlockError::UnknownParent(side[0].id()));
    }
}
