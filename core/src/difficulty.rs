//! Base target adjustment and cumulative difficulty
//!
//! Consensus critical: integer arithmetic only, truncating division, and
//! the clamping order below must never change.

use crate::block::Block;
use crate::ErrorCategory;

/// Base target manager
#[derive(Debug, Clone)]
pub struct DifficultyAdjuster {
    /// Target time per block in seconds (default: 60)
    target_block_time: u64,
    /// Upper bound of the base target
    max_base_target: u64,
}

/// Result of one base target computation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseTargetAdjustment {
    /// Base target of the parent block
    pub current: u64,
    /// Base target required for the child block
    pub new: u64,
    /// Seconds between parent and child
    pub elapsed: u32,
}

impl Default for DifficultyAdjuster {
    fn default() -> Self {
        Self::new()
    }
}

impl DifficultyAdjuster {
    pub fn new() -> Self {
        Self {
            target_block_time: crate::TARGET_BLOCK_TIME,
            max_base_target: crate::MAX_BASE_TARGET,
        }
    }

    /// Base target of a child of `parent` stamped at `timestamp`.
    ///
    /// `cur * elapsed / 60`, clamped to the maximum, then to at least half
    /// and at most twice the parent value, never zero.
    pub fn next_base_target(&self, parent: &Block, timestamp: u32) -> Result<BaseTargetAdjustment, DifficultyError> {
        let elapsed = timestamp
            .checked_sub(parent.timestamp)
            .ok_or(DifficultyError::TimestampBeforeParent {
                timestamp,
                parent: parent.timestamp,
            })?;
        let current = parent.base_target;

        let scaled = u128::from(current) * u128::from(elapsed) / u128::from(self.target_block_time);
        let mut new = if scaled > u128::from(self.max_base_target) {
            self.max_base_target
        } else {
            scaled as u64
        };
        if new < current / 2 {
            new = current / 2;
        }
        if new == 0 {
            new = 1;
        }
        let twofold = current.checked_mul(2).unwrap_or(self.max_base_target);
        if new > twofold {
            new = twofold;
        }

        Ok(BaseTargetAdjustment { current, new, elapsed })
    }

    /// Recomputes base target and cumulative difficulty of `block` from its
    /// parent and compares them with the claimed values
    pub fn verify(&self, parent: &Block, block: &Block) -> Result<(), DifficultyError> {
        let adjustment = self.next_base_target(parent, block.timestamp)?;
        if adjustment.new != block.base_target {
            return Err(DifficultyError::BaseTargetMismatch {
                expected: adjustment.new,
                claimed: block.base_target,
            });
        }
        let expected = checked_cumulative_difficulty(parent.cumulative_difficulty, block.base_target)?;
        if expected != block.cumulative_difficulty {
            return Err(DifficultyError::CumulativeMismatch {
                expected,
                claimed: block.cumulative_difficulty,
            });
        }
        if block.cumulative_difficulty <= parent.cumulative_difficulty {
            return Err(DifficultyError::NotIncreasing);
        }
        Ok(())
    }
}

/// Weight one block adds to its chain: 2^64 / base_target, at least 1
pub fn difficulty_contribution(base_target: u64) -> u128 {
    ((1u128 << 64) / u128::from(base_target.max(1))).max(1)
}

/// Parent cumulative difficulty plus the contribution of `base_target`,
/// saturating at `u128::MAX`
pub fn cumulative_difficulty(parent: u128, base_target: u64) -> u128 {
    parent.saturating_add(difficulty_contribution(base_target))
}

fn checked_cumulative_difficulty(parent: u128, base_target: u64) -> Result<u128, DifficultyError> {
    parent
        .checked_add(difficulty_contribution(base_target))
        .ok_or(DifficultyError::Overflow)
}

/// Difficulty errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DifficultyError {
    #[error("Timestamp {timestamp} precedes parent timestamp {parent}")]
    TimestampBeforeParent { timestamp: u32, parent: u32 },

    #[error("Base target mismatch: expected {expected}, claimed {claimed}")]
    BaseTargetMismatch { expected: u64, claimed: u64 },

    #[error("Cumulative difficulty mismatch: expected {expected}, claimed {claimed}")]
    CumulativeMismatch { expected: u128, claimed: u128 },

    #[error("Cumulative difficulty did not increase")]
    NotIncreasing,

    #[error("Cumulative difficulty overflow")]
    Overflow,
}

impl DifficultyError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            DifficultyError::NotIncreasing | DifficultyError::Overflow => ErrorCategory::InternalInvariant,
            _ => ErrorCategory::Consistency,
        }
    }
}

impl BaseTargetAdjustment {
    /// Human readable summary for logs
    pub fn format_adjustment(&self) -> String {
        if self.new == self.current {
            return "Base target unchanged".to_string();
        }
        // a lower base target means a harder lottery
        let direction = if self.new < self.current { "increased" } else { "decreased" };
        let factor = self.new as f64 / self.current as f64;
        format!(
            "Difficulty {} after {}s (base target {} -> {}, factor: {:.4})",
            direction, self.elapsed, self.current, self.new, factor
        )
    }

    pub fn is_increase(&self) -> bool {
        self.new < self.current
    }

    pub fn is_decrease(&self) -> bool {
        self.new > self.current
    }
}
