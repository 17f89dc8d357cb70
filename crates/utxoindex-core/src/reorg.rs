//! Reorg planning.
//!
//! The tracker gathers the branches involved in a reorganization and this
//! module turns them into flag updates. Keeping it pure makes every
//! tie-break testable without a store or a node.
//!
//! Inputs, relative to the fork point (the newest block both branches share):
//! - `linked`: headers of the new branch not yet stored, newest first;
//! - `revived`: stored blocks of the new branch that an earlier reorg had
//!   dropped, newest first;
//! - `superseded`: active blocks after the fork point, oldest first.

use serde::Serialize;

use crate::types::{BlockFlags, BlockRecord, ProcessStatus};

/// Describes an applied chain reorganization.
#[derive(Debug, Clone, Serialize)]
pub struct ReorgEvent {
    pub fork_hash: String,
    pub fork_height: u64,
    /// Blocks that left the active chain, oldest first.
    pub dropped: Vec<String>,
    /// Blocks that joined the active chain, oldest first.
    pub adopted: Vec<String>,
    /// The new chain tip.
    pub new_tip: String,
    /// Number of blocks rolled back.
    pub depth: u64,
}

/// Everything the tracker must write to apply a reorg.
#[derive(Debug, Clone)]
pub struct ReorgPlan {
    /// Flag updates for already stored blocks.
    pub flags: Vec<BlockFlags>,
    /// New headers to insert, oldest first.
    pub new_blocks: Vec<BlockRecord>,
    pub event: ReorgEvent,
}

impl ReorgPlan {
    /// Hashes of stored blocks returning to the active chain.
    pub fn revived_hashes(&self) -> Vec<String> {
        let new: std::collections::HashSet<&str> =
            self.new_blocks.iter().map(|b| b.hash.as_str()).collect();
        self.event
            .adopted
            .iter()
            .filter(|h| !new.contains(h.as_str()))
            .cloned()
            .collect()
    }
}

/// Build the plan. The deepest adopted block becomes the tip; when nothing
/// is adopted the fork point itself becomes the tip.
pub fn plan_reorg(
    fork: &BlockRecord,
    linked: Vec<BlockRecord>,
    revived: Vec<BlockRecord>,
    superseded: Vec<BlockRecord>,
) -> ReorgPlan {
    let mut flags = Vec::with_capacity(superseded.len() + revived.len() + 1);

    for block in &superseded {
        flags.push(BlockFlags {
            hash: block.hash.clone(),
            is_chaintips: false,
            is_tail: false,
            is_reorg: true,
            reset_status: true,
        });
    }

    let new_tip = linked
        .first()
        .or_else(|| revived.first())
        .unwrap_or(fork)
        .hash
        .clone();

    for block in &revived {
        flags.push(BlockFlags {
            hash: block.hash.clone(),
            is_chaintips: block.hash == new_tip,
            is_tail: block.is_tail,
            is_reorg: false,
            reset_status: true,
        });
    }

    if fork.hash == new_tip || fork.is_chaintips {
        flags.push(BlockFlags {
            hash: fork.hash.clone(),
            is_chaintips: fork.hash == new_tip,
            is_tail: fork.is_tail,
            is_reorg: false,
            reset_status: false,
        });
    }

    let new_blocks: Vec<BlockRecord> = linked
        .into_iter()
        .rev()
        .map(|mut b| {
            b.is_chaintips = b.hash == new_tip;
            b.is_tail = false;
            b.is_reorg = false;
            b.process_status = ProcessStatus::NoStart;
            b.process_count = 0;
            b
        })
        .collect();

    let adopted = revived
        .iter()
        .rev()
        .map(|b| b.hash.clone())
        .chain(new_blocks.iter().map(|b| b.hash.clone()))
        .collect();

    let event = ReorgEvent {
        fork_hash: fork.hash.clone(),
        fork_height: fork.height,
        dropped: superseded.iter().map(|b| b.hash.clone()).collect(),
        adopted,
        new_tip,
        depth: superseded.len() as u64,
    };

    ReorgPlan {
        flags,
        new_blocks,
        event,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockHeader;

    fn block(hash: &str, height: u64, prev: &str) -> BlockRecord {
        BlockRecord::from_header(&BlockHeader {
            hash: hash.into(),
            height,
            size: None,
            version_hex: String::new(),
            merkle_root: String::new(),
            num_tx: 1,
            time: 0,
            median_time: 0,
            nonce: 0,
            bits: String::new(),
            difficulty: 0.0,
            chainwork: String::new(),
            previous_block_hash: Some(prev.into()),
        })
    }

    #[test]
    fn competing_tip_at_same_height() {
        let fork = block("f", 10, "e");
        let mut old_tip = block("a11", 11, "f");
        old_tip.is_chaintips = true;
        old_tip.process_status = ProcessStatus::Completed;
        let new_tip = block("b11", 11, "f");

        let plan = plan_reorg(&fork, vec![new_tip], vec![], vec![old_tip]);

        assert_eq!(plan.event.new_tip, "b11");
        assert_eq!(plan.event.depth, 1);
        assert_eq!(plan.event.dropped, vec!["a11".to_string()]);
        let dropped = &plan.flags[0];
        assert!(dropped.is_reorg && !dropped.is_chaintips && dropped.reset_status);
        assert_eq!(plan.new_blocks.len(), 1);
        assert!(plan.new_blocks[0].is_chaintips);
        assert!(!plan.new_blocks[0].is_reorg);
        assert!(plan.revived_hashes().is_empty());
    }

    #[test]
    fn deepest_linked_header_is_tip() {
        let fork = block("f", 10, "e");
        let superseded = vec![block("a11", 11, "f"), block("a12", 12, "a11")];
        // newest first
        let linked = vec![block("b13", 13, "b12"), block("b12", 12, "b11"), block("b11", 11, "f")];

        let plan = plan_reorg(&fork, linked, vec![], superseded);

        let hashes: Vec<_> = plan.new_blocks.iter().map(|b| b.hash.as_str()).collect();
        assert_eq!(hashes, ["b11", "b12", "b13"]);
        let tips: Vec<_> = plan.new_blocks.iter().filter(|b| b.is_chaintips).collect();
        assert_eq!(tips.len(), 1);
        assert_eq!(tips[0].hash, "b13");
        assert_eq!(plan.event.adopted, vec!["b11", "b12", "b13"]);
        assert_eq!(plan.event.depth, 2);
    }

    #[test]
    fn revived_branch_becomes_active_again() {
        let fork = block("f", 10, "e");
        let mut old = block("a11", 11, "f");
        old.is_reorg = true;
        let mut current = block("b11", 11, "f");
        current.is_chaintips = true;

        let plan = plan_reorg(&fork, vec![block("a12", 12, "a11")], vec![old], vec![current]);

        let revived = plan.flags.iter().find(|f| f.hash == "a11").unwrap();
        assert!(!revived.is_reorg && revived.reset_status && !revived.is_chaintips);
        assert_eq!(plan.revived_hashes(), vec!["a11".to_string()]);
        assert_eq!(plan.event.adopted, vec!["a11", "a12"]);
        assert_eq!(plan.event.new_tip, "a12");
    }

    #[test]
    fn rollback_to_fork_point() {
        let mut fork = block("f", 10, "e");
        fork.process_status = ProcessStatus::DoubleCheck;
        let mut tip = block("a11", 11, "f");
        tip.is_chaintips = true;

        let plan = plan_reorg(&fork, vec![], vec![], vec![tip]);

        assert_eq!(plan.event.new_tip, "f");
        let fork_flags = plan.flags.iter().find(|f| f.hash == "f").unwrap();
        assert!(fork_flags.is_chaintips && !fork_flags.reset_status);
        assert!(plan.new_blocks.is_empty());
    }
}
