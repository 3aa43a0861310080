use super::{
    storage::{BatchOp, BlockStore, StorageError, StoreBatch},
    tip::{Tip, TipGuard},
    verify::ValidationError,
};
use crate::{
    blockcfg::{Block, BlockDate, Blund, GenesisBlock, HeaderHash, Undo},
    intercom::{
        DelegationService, LeaderElection, LeadershipError, Services, SlotClock, SscService,
        TxService,
    },
    settings::ConsensusSettings,
};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("expected tip {expected}, found {actual}")]
    TipMismatch {
        expected: HeaderHash,
        actual: HeaderHash,
    },

    #[error(transparent)]
    Leadership(#[from] LeadershipError),

    #[error("mempool transaction graph cannot be ordered")]
    BrokenTopology,

    #[error("cannot create a block for slot {slot}: tip is at {tip}")]
    SlotOutOfRange {
        slot: crate::blockcfg::SlotId,
        tip: BlockDate,
    },

    #[error("empty block sequence")]
    EmptyBlockSequence,

    #[error("block0 already exists in the storage")]
    Block0AlreadyInStorage,

    #[error("block0 is not yet in the storage")]
    Block0NotInStorage,
}

pub type Result<T> = core::result::Result<T, Error>;

/// The ledger core: fork choice over candidate chains and the
/// transactional apply/rollback state machine over the single tip.
///
/// The object is cheap to clone and safe to share: queries run lock
/// free against the storage collaborator, while every mutation first
/// acquires the exclusive [`Tip`] token.
#[derive(Clone)]
pub struct Blockchain {
    pub(super) storage: Arc<dyn BlockStore>,
    pub(super) clock: Arc<dyn SlotClock>,
    pub(super) leader_election: Arc<dyn LeaderElection>,
    pub(super) ssc: Arc<dyn SscService>,
    pub(super) transactions: Arc<dyn TxService>,
    pub(super) delegation: Arc<dyn DelegationService>,
    pub(super) settings: ConsensusSettings,
    pub(super) tip: Tip,
}

impl Blockchain {
    /// Write the hardcoded block0 into an empty store and wire the
    /// core around it.
    pub fn initialize(
        storage: Arc<dyn BlockStore>,
        services: Services,
        settings: ConsensusSettings,
        block0: GenesisBlock,
    ) -> Result<Self> {
        match storage.tip() {
            Ok(_) => return Err(Error::Block0AlreadyInStorage),
            Err(StorageError::BlockNotFound) => {}
            Err(error) => return Err(error.into()),
        }
        let hash = block0.hash();
        storage.commit(StoreBatch {
            ops: vec![BatchOp::Apply(Blund {
                block: Block::Genesis(block0),
                undo: Undo::empty(),
            })],
            new_tip: hash,
        })?;
        tracing::info!("storage initialized with block0 {}", hash);
        Ok(Self::wire(storage, services, settings, hash))
    }

    /// Wire the core around an already populated store, seeding the tip
    /// token from the stored tip.
    pub fn load(
        storage: Arc<dyn BlockStore>,
        services: Services,
        settings: ConsensusSettings,
    ) -> Result<Self> {
        let tip = match storage.tip() {
            Ok(tip) => tip,
            Err(StorageError::BlockNotFound) => return Err(Error::Block0NotInStorage),
            Err(error) => return Err(error.into()),
        };
        Ok(Self::wire(storage, services, settings, tip))
    }

    fn wire(
        storage: Arc<dyn BlockStore>,
        services: Services,
        settings: ConsensusSettings,
        tip: HeaderHash,
    ) -> Self {
        Blockchain {
            storage,
            clock: services.clock,
            leader_election: services.leader_election,
            ssc: services.ssc,
            transactions: services.transactions,
            delegation: services.delegation,
            settings,
            tip: Tip::new(tip),
        }
    }

    pub fn storage(&self) -> &Arc<dyn BlockStore> {
        &self.storage
    }

    pub fn settings(&self) -> &ConsensusSettings {
        &self.settings
    }

    pub fn tip(&self) -> &Tip {
        &self.tip
    }

    /// Verify and apply an oldest-first block sequence on top of the
    /// current tip.
    ///
    /// The sequence is split into epoch runs; each run is verified as a
    /// whole and committed as one atomic batch, and applying a genesis
    /// block triggers leader election for the epoch it opens before any
    /// later block is verified.
    ///
    /// With `rollback_on_failure`, a verification failure undoes every
    /// run this call already applied and restores the pre-call tip.
    /// Without it, the failing run degrades to applying single blocks
    /// until the first failure and the tip reached is returned; when
    /// nothing at all could be applied the original verification error
    /// surfaces instead.
    pub async fn verify_and_apply_blocks(
        &self,
        rollback_on_failure: bool,
        blocks: &[Block],
    ) -> Result<HeaderHash> {
        if blocks.is_empty() {
            return Err(Error::EmptyBlockSequence);
        }
        let mut tip = self.tip.lock().await;
        self.verify_and_apply_under(&mut tip, rollback_on_failure, blocks)
    }

    /// Apply a sequence of blunds already verified upstream. No
    /// verification and no rollback path; the epoch-boundary
    /// leader-election trigger still runs when `compute_leaders` is
    /// set.
    pub async fn apply_blocks(&self, compute_leaders: bool, blunds: &[Blund]) -> Result<HeaderHash> {
        if blunds.is_empty() {
            return Err(Error::EmptyBlockSequence);
        }
        let mut tip = self.tip.lock().await;
        self.apply_blunds_under(&mut tip, compute_leaders, blunds)
    }

    /// Roll back a newest-first sequence of blunds ending at the
    /// current tip, restoring the tip to the parent of the oldest.
    pub async fn rollback_blocks(&self, blunds: &[Blund]) -> Result<HeaderHash> {
        if blunds.is_empty() {
            return Err(Error::EmptyBlockSequence);
        }
        let mut tip = self.tip.lock().await;
        self.rollback_under(&mut tip, blunds)
    }

    /// Compensating composition: roll `to_rollback` off the chain, then
    /// verify-and-apply `to_apply` with full rollback on failure. If
    /// the apply leg fails, `to_rollback` is re-applied so the original
    /// chain is restored before the error surfaces. The tip is checked
    /// before and after every sub-step.
    pub async fn apply_with_rollback(
        &self,
        to_rollback: &[Blund],
        to_apply: &[Block],
    ) -> Result<HeaderHash> {
        if to_rollback.is_empty() || to_apply.is_empty() {
            return Err(Error::EmptyBlockSequence);
        }
        let mut tip = self.tip.lock().await;
        let original_tip = tip.hash();

        self.rollback_under(&mut tip, to_rollback)?;

        let expected = to_apply[0].parent();
        if tip.hash() != expected {
            let rolled_back_to = tip.hash();
            self.restore(&mut tip, to_rollback, original_tip)?;
            return Err(Error::TipMismatch {
                expected,
                actual: rolled_back_to,
            });
        }

        match self.verify_and_apply_under(&mut tip, true, to_apply) {
            Ok(new_tip) => Ok(new_tip),
            Err(error) => {
                self.restore(&mut tip, to_rollback, original_tip)?;
                Err(error)
            }
        }
    }

    fn restore(
        &self,
        tip: &mut TipGuard<'_>,
        rolled_back: &[Blund],
        original_tip: HeaderHash,
    ) -> Result<()> {
        let oldest_first: Vec<Blund> = rolled_back.iter().rev().cloned().collect();
        self.apply_blunds_under(tip, true, &oldest_first)?;
        if tip.hash() != original_tip {
            return Err(Error::TipMismatch {
                expected: original_tip,
                actual: tip.hash(),
            });
        }
        Ok(())
    }

    fn verify_and_apply_under(
        &self,
        tip: &mut TipGuard<'_>,
        rollback_on_failure: bool,
        blocks: &[Block],
    ) -> Result<HeaderHash> {
        let old_tip = tip.hash();
        if blocks[0].parent() != old_tip {
            return Err(Error::TipMismatch {
                expected: blocks[0].parent(),
                actual: old_tip,
            });
        }

        let mut parent = self
            .storage
            .get_header(&old_tip)?
            .ok_or(StorageError::BlockNotFound)?;
        let mut applied: Vec<Blund> = Vec::new();

        for run in epoch_runs(blocks, Block::date) {
            match self.verify_blocks_against(&parent, run, true) {
                Ok(undos) => {
                    let blunds: Vec<Blund> = run
                        .iter()
                        .cloned()
                        .zip(undos)
                        .map(|(block, undo)| Blund { block, undo })
                        .collect();
                    self.apply_run(tip, &blunds)?;
                    self.trigger_boundary_leader_election(run)?;
                    parent = run
                        .last()
                        .expect("epoch runs are never empty")
                        .header();
                    applied.extend(blunds);
                }
                Err(error) => {
                    return if rollback_on_failure {
                        if !applied.is_empty() {
                            let newest_first: Vec<Blund> =
                                applied.into_iter().rev().collect();
                            self.rollback_under(tip, &newest_first)?;
                        }
                        tracing::debug!(
                            "verification failed, tip restored to {}: {}",
                            old_tip,
                            error
                        );
                        Err(error.into())
                    } else {
                        self.apply_as_much_as_possible(
                            tip,
                            &parent,
                            run,
                            !applied.is_empty(),
                            error,
                        )
                    };
                }
            }
        }
        Ok(tip.hash())
    }

    /// Degraded mode of `verify_and_apply_blocks` without rollback:
    /// verify and apply the failing run one block at a time until the
    /// first failure, then stop. With zero total progress the original
    /// run-level verification error surfaces unchanged.
    fn apply_as_much_as_possible(
        &self,
        tip: &mut TipGuard<'_>,
        parent: &crate::blockcfg::BlockHeader,
        run: &[Block],
        mut made_progress: bool,
        original_error: ValidationError,
    ) -> Result<HeaderHash> {
        let mut parent = parent.clone();
        for block in run {
            match self.verify_blocks_against(&parent, std::slice::from_ref(block), true) {
                Ok(mut undos) => {
                    let blund = Blund {
                        block: block.clone(),
                        undo: undos.pop().expect("one undo per verified block"),
                    };
                    self.apply_run(tip, std::slice::from_ref(&blund))?;
                    self.trigger_boundary_leader_election(std::slice::from_ref(block))?;
                    parent = block.header();
                    made_progress = true;
                }
                Err(error) => {
                    tracing::warn!(
                        "block {} rejected while applying as much as possible: {}",
                        block.header().description(),
                        error
                    );
                    break;
                }
            }
        }
        if made_progress {
            Ok(tip.hash())
        } else {
            Err(original_error.into())
        }
    }

    pub(super) fn apply_blunds_under(
        &self,
        tip: &mut TipGuard<'_>,
        compute_leaders: bool,
        blunds: &[Blund],
    ) -> Result<HeaderHash> {
        let old_tip = tip.hash();
        if blunds[0].block.parent() != old_tip {
            return Err(Error::TipMismatch {
                expected: blunds[0].block.parent(),
                actual: old_tip,
            });
        }
        for run in epoch_runs(blunds, |blund| blund.block.date()) {
            self.apply_run(tip, run)?;
            if compute_leaders {
                if let Some(Blund {
                    block: Block::Genesis(genesis),
                    ..
                }) = run.last()
                {
                    self.leader_election
                        .compute_leaders(genesis.header.epoch)?;
                }
            }
        }
        Ok(tip.hash())
    }

    /// Commit one epoch run as a single atomic batch and advance the
    /// tip token.
    fn apply_run(&self, tip: &mut TipGuard<'_>, blunds: &[Blund]) -> Result<()> {
        let new_tip = blunds
            .last()
            .expect("epoch runs are never empty")
            .hash();
        self.storage.commit(StoreBatch {
            ops: blunds.iter().cloned().map(BatchOp::Apply).collect(),
            new_tip,
        })?;
        tip.set(new_tip);
        tracing::info!("applied {} block(s), tip moved to {}", blunds.len(), new_tip);
        Ok(())
    }

    fn trigger_boundary_leader_election(&self, run: &[Block]) -> Result<()> {
        if let Some(Block::Genesis(genesis)) = run.last() {
            self.leader_election
                .compute_leaders(genesis.header.epoch)?;
        }
        Ok(())
    }

    pub(super) fn rollback_under(
        &self,
        tip: &mut TipGuard<'_>,
        blunds: &[Blund],
    ) -> Result<HeaderHash> {
        let old_tip = tip.hash();
        let newest = blunds[0].hash();
        if newest != old_tip {
            return Err(Error::TipMismatch {
                expected: newest,
                actual: old_tip,
            });
        }
        let new_tip = blunds
            .last()
            .expect("blund sequences are never empty")
            .block
            .parent();
        self.storage.commit(StoreBatch {
            ops: blunds.iter().map(|blund| BatchOp::Rollback(blund.hash())).collect(),
            new_tip,
        })?;
        tip.set(new_tip);
        tracing::info!(
            "rolled back {} block(s), tip restored to {}",
            blunds.len(),
            new_tip
        );
        Ok(new_tip)
    }
}

/// Split a sequence into maximal epoch-homogeneous runs. A genesis
/// block changes the epoch, so it always forms a run of its own.
fn epoch_runs<T>(items: &[T], date_of: impl Fn(&T) -> BlockDate) -> Vec<&[T]> {
    let mut runs = Vec::new();
    if items.is_empty() {
        return runs;
    }
    let mut start = 0;
    for i in 1..items.len() {
        let head = date_of(&items[start]);
        let here = date_of(&items[i]);
        if here.is_genesis() || head.is_genesis() || here.epoch() != head.epoch() {
            runs.push(&items[start..i]);
            start = i;
        }
    }
    runs.push(&items[start..]);
    runs
}

#[cfg(test)]
mod tests {
    use super::{epoch_runs, Error};
    use crate::blockcfg::{Block, BlockDate, SlotId};
    use crate::blockchain::BlockStore;
    use crate::testing::TestChain;

    fn main_date(epoch: u32, slot: u32) -> BlockDate {
        BlockDate::Main(SlotId::new(epoch, slot))
    }

    #[test]
    fn epoch_runs_split_on_genesis_and_epoch_change() {
        let dates = vec![
            main_date(0, 7),
            main_date(0, 8),
            BlockDate::Genesis(1),
            main_date(1, 0),
            main_date(1, 1),
        ];
        let runs = epoch_runs(&dates, |date| *date);
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].len(), 2);
        assert_eq!(runs[1], &[BlockDate::Genesis(1)]);
        assert_eq!(runs[2].len(), 2);
    }

    #[test]
    fn epoch_runs_keep_single_epoch_together() {
        let dates = vec![main_date(2, 0), main_date(2, 1), main_date(2, 2)];
        let runs = epoch_runs(&dates, |date| *date);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].len(), 3);
    }

    /// Candidate spanning an epoch boundary: the genesis block of
    /// epoch 1 followed by two main blocks of epoch 1. The fixture
    /// chain is first extended to the end of epoch 0.
    async fn boundary_candidate(harness: &TestChain) -> Vec<Block> {
        harness.extend_to_epoch_end().await;
        let tip = harness.tip_header();
        let genesis = harness.make_genesis_block(&tip, 1);
        let m0 = harness.make_main_block(&genesis.header(), SlotId::new(1, 0));
        let m1 = harness.make_main_block(&m0.header(), SlotId::new(1, 1));
        harness.clock.set(SlotId::new(1, 1));
        vec![genesis, m0, m1]
    }

    #[tokio::test]
    async fn applying_then_rolling_back_restores_the_tip() {
        let harness = TestChain::new();
        harness.extend(2).await;
        let tip_before = harness.chain.tip().snapshot().await;

        let blocks = harness.extend(3).await;
        let blunds = harness.blunds_newest_first(&blocks);
        let restored = harness.chain.rollback_blocks(&blunds).await.unwrap();

        assert_eq!(restored, tip_before);
        assert_eq!(harness.chain.tip().snapshot().await, tip_before);
        assert_eq!(harness.store.tip().unwrap(), tip_before);
    }

    #[tokio::test]
    async fn failed_apply_with_rollback_leaves_the_tip_unchanged() {
        let harness = TestChain::new();
        let candidate = boundary_candidate(&harness).await;
        let tip_before = harness.chain.tip().snapshot().await;
        harness.txs.reject(candidate[2].hash());

        let result = harness
            .chain
            .verify_and_apply_blocks(true, &candidate)
            .await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(harness.chain.tip().snapshot().await, tip_before);
        assert_eq!(harness.store.tip().unwrap(), tip_before);
    }

    #[tokio::test]
    async fn failed_apply_without_rollback_keeps_partial_progress() {
        let harness = TestChain::new();
        let candidate = boundary_candidate(&harness).await;
        harness.txs.reject(candidate[2].hash());

        let new_tip = harness
            .chain
            .verify_and_apply_blocks(false, &candidate)
            .await
            .unwrap();

        // everything before the failing block made it in
        assert_eq!(new_tip, candidate[1].hash());
        assert_eq!(harness.store.tip().unwrap(), candidate[1].hash());
    }

    #[tokio::test]
    async fn zero_progress_surfaces_the_original_error() {
        let harness = TestChain::new();
        harness.extend(2).await;
        let tip_before = harness.chain.tip().snapshot().await;

        let block = harness.make_main_block(&harness.tip_header(), SlotId::new(0, 2));
        harness.clock.set(SlotId::new(0, 2));
        harness.txs.reject(block.hash());

        let result = harness
            .chain
            .verify_and_apply_blocks(false, &[block])
            .await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(harness.chain.tip().snapshot().await, tip_before);
    }

    #[tokio::test]
    async fn boundary_triggers_leader_election_before_the_next_block() {
        let harness = TestChain::new();
        let candidate = boundary_candidate(&harness).await;
        harness.leaders.forget(1);
        assert!(harness.leaders.computed().is_empty());

        // the epoch-1 main blocks can only verify if leader election
        // for epoch 1 ran right after the genesis block was applied
        harness
            .chain
            .verify_and_apply_blocks(true, &candidate)
            .await
            .unwrap();

        assert_eq!(harness.leaders.computed(), vec![1]);
        assert_eq!(harness.store.tip().unwrap(), candidate[2].hash());
    }

    #[tokio::test]
    async fn mismatched_parent_is_rejected_without_mutation() {
        let harness = TestChain::new();
        let blocks = harness.extend(3).await;
        let tip_before = harness.chain.tip().snapshot().await;

        // built against an outdated tip
        let stale = harness.make_main_block(&blocks[0].header(), SlotId::new(0, 5));
        harness.clock.set(SlotId::new(0, 5));

        let result = harness.chain.verify_and_apply_blocks(true, &[stale]).await;
        assert!(matches!(result, Err(Error::TipMismatch { .. })));
        assert_eq!(harness.chain.tip().snapshot().await, tip_before);
    }

    #[tokio::test]
    async fn rollback_requires_the_newest_blund_to_be_the_tip() {
        let harness = TestChain::new();
        let blocks = harness.extend(3).await;
        let tip_before = harness.chain.tip().snapshot().await;

        // stop one short of the tip: the newest rolled-back block must
        // be the tip itself
        let blunds = harness.blunds_newest_first(&blocks[..2]);
        let result = harness.chain.rollback_blocks(&blunds).await;

        assert!(matches!(result, Err(Error::TipMismatch { .. })));
        assert_eq!(harness.chain.tip().snapshot().await, tip_before);
        assert_eq!(harness.store.tip().unwrap(), tip_before);
    }

    #[tokio::test]
    async fn apply_blocks_skips_verification_but_not_the_tip_check() {
        let harness = TestChain::new();
        harness.extend(1).await;

        let parent = harness.tip_header();
        let block = harness.make_main_block(&parent, SlotId::new(0, 1));
        let blund = crate::blockcfg::Blund {
            block: block.clone(),
            undo: crate::blockcfg::Undo::empty(),
        };
        let new_tip = harness.chain.apply_blocks(true, &[blund]).await.unwrap();
        assert_eq!(new_tip, block.hash());

        // reapplying the same blund no longer matches the tip
        let blund = crate::blockcfg::Blund {
            block,
            undo: crate::blockcfg::Undo::empty(),
        };
        let result = harness.chain.apply_blocks(true, &[blund]).await;
        assert!(matches!(result, Err(Error::TipMismatch { .. })));
    }

    #[tokio::test]
    async fn switching_branches_applies_the_fork() {
        let harness = TestChain::new();
        harness.extend(2).await;
        let fork_point = harness.tip_header();

        let ours = harness.extend(2).await;
        let our_blunds = harness.blunds_newest_first(&ours);

        let theirs = harness.make_main_chain(&fork_point, SlotId::new(0, 6), 3);
        harness.clock.set(SlotId::new(0, 8));

        let new_tip = harness
            .chain
            .apply_with_rollback(&our_blunds, &theirs)
            .await
            .unwrap();

        assert_eq!(new_tip, theirs.last().unwrap().hash());
        assert_eq!(harness.store.tip().unwrap(), new_tip);
        assert!(harness
            .store
            .is_in_main_chain(&theirs[0].hash())
            .unwrap());
        assert!(!harness.store.is_in_main_chain(&ours[0].hash()).unwrap());
    }

    #[tokio::test]
    async fn failed_branch_switch_restores_the_original_chain() {
        let harness = TestChain::new();
        harness.extend(2).await;
        let fork_point = harness.tip_header();

        let ours = harness.extend(2).await;
        let our_tip = harness.chain.tip().snapshot().await;
        let our_blunds = harness.blunds_newest_first(&ours);

        let theirs = harness.make_main_chain(&fork_point, SlotId::new(0, 6), 3);
        harness.clock.set(SlotId::new(0, 8));
        harness.txs.reject(theirs[1].hash());

        let result = harness
            .chain
            .apply_with_rollback(&our_blunds, &theirs)
            .await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(harness.chain.tip().snapshot().await, our_tip);
        assert_eq!(harness.store.tip().unwrap(), our_tip);
        assert!(harness.store.is_in_main_chain(&ours[1].hash()).unwrap());
    }

    #[tokio::test]
    async fn branch_switch_checks_where_the_fork_lands() {
        let harness = TestChain::new();
        harness.extend(2).await;

        let ours = harness.extend(2).await;
        let our_tip = harness.chain.tip().snapshot().await;
        let our_blunds = harness.blunds_newest_first(&ours);

        // fork built on a parent that is not where the rollback lands
        let theirs = harness.make_main_chain(&ours[0].header(), SlotId::new(0, 6), 2);
        harness.clock.set(SlotId::new(0, 7));

        let result = harness
            .chain
            .apply_with_rollback(&our_blunds, &theirs)
            .await;

        assert!(matches!(result, Err(Error::TipMismatch { .. })));
        assert_eq!(harness.chain.tip().snapshot().await, our_tip);
        assert_eq!(harness.store.tip().unwrap(), our_tip);
    }
}
