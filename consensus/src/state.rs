//! Chain state snapshots for concurrent readers

use horizon_core::BlockId;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

/// Summary of the canonical chain after the last committed change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSnapshot {
    /// Canonical tip height
    pub height: u32,
    /// Canonical tip id
    pub tip_id: BlockId,
    pub tip_timestamp: u32,
    /// Base target of the tip
    pub base_target: u64,
    /// Fork-choice weight of the canonical chain
    pub cumulative_difficulty: u128,
    /// Transactions waiting in the pool
    pub unconfirmed_transactions: usize,
    /// Orphan blocks waiting for their parent
    pub pending_blocks: usize,
}

/// Publishes snapshots written by the chain writer
#[derive(Debug, Clone)]
pub struct StateManager {
    /// Current state
    state: Arc<RwLock<ChainSnapshot>>,
    /// Recent canonical tips, oldest first
    history: Arc<RwLock<VecDeque<ChainSnapshot>>>,
    /// Maximum history to keep
    max_history: usize,
}

impl StateManager {
    /// Create new state manager with initial state
    pub fn new(initial_state: ChainSnapshot, max_history: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(initial_state)),
            history: Arc::new(RwLock::new(VecDeque::new())),
            max_history,
        }
    }

    /// Get current state snapshot
    pub fn get_state(&self) -> Result<ChainSnapshot, StateError> {
        Ok(self.state.read().map_err(|_| StateError::LockPoisoned)?.clone())
    }

    /// Replaces the current snapshot. Snapshots at or above the new height
    /// are dropped from history since a reorganization made them stale.
    pub fn publish(&self, snapshot: ChainSnapshot) -> Result<(), StateError> {
        let mut state = self.state.write().map_err(|_| StateError::LockPoisoned)?;
        if *state == snapshot {
            return Ok(());
        }
        {
            let mut history = self.history.write().map_err(|_| StateError::LockPoisoned)?;
            history.retain(|old| old.height < snapshot.height);
            if state.height < snapshot.height {
                history.push_back(state.clone());
            }
            while history.len() > self.max_history {
                history.pop_front();
            }
        }
        *state = snapshot;
        Ok(())
    }

    /// Canonical snapshot recorded at `height`, if still in history
    pub fn get_state_at_height(&self, height: u32) -> Option<ChainSnapshot> {
        let current = self.state.read().ok()?;
        if current.height == height {
            return Some(current.clone());
        }
        let history = self.history.read().ok()?;
        history.iter().rev().find(|state| state.height == height).cloned()
    }
}

/// State errors
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("State lock poisoned")]
    LockPoisoned,
}
