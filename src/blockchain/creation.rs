use super::{
    chain::{Blockchain, Error, Result},
    storage::StorageError,
};
use crate::blockcfg::{
    Block, BlockDate, BlockHeader, BlockVersion, Blund, DelegationUndo, EpochIndex, GenesisBlock,
    HeaderHash, MainBlock, MainBody, SlotId, SoftwareVersion, StakeholderId, TxUndo, Undo,
};
use crate::intercom::{LeadershipError, PooledTx};

impl Blockchain {
    /// Create and apply the genesis block opening `epoch`, when the
    /// chain is ready for it.
    ///
    /// Epoch 0 is hardcoded and never constructed. For a later epoch
    /// the tip must already be deep enough into the previous epoch that
    /// the boundary is unlikely to be reorganized away. Ineligibility
    /// and missing leader data are ordinary skips, not errors: the
    /// caller simply gets `(None, tip)` back.
    pub async fn create_genesis_block(
        &self,
        epoch: EpochIndex,
    ) -> Result<(Option<GenesisBlock>, HeaderHash)> {
        let mut tip = self.tip.lock().await;
        let tip_header = self
            .storage
            .get_header(&tip.hash())?
            .ok_or(StorageError::BlockNotFound)?;

        if !self.genesis_eligible(epoch, &tip_header) {
            return Ok((None, tip.hash()));
        }

        let leaders = match self.leader_election.leaders(epoch) {
            Ok(leaders) => leaders,
            Err(LeadershipError::Unknown(_)) => {
                tracing::warn!(
                    "slot leaders for epoch {} are not ready, skipping genesis block",
                    epoch
                );
                return Ok((None, tip.hash()));
            }
            Err(error) => return Err(error.into()),
        };

        let block = GenesisBlock::new(&tip_header, epoch, leaders);
        let blund = Blund {
            block: Block::Genesis(block.clone()),
            undo: Undo::empty(),
        };
        self.apply_blunds_under(&mut tip, true, std::slice::from_ref(&blund))?;
        tracing::info!("created genesis block {} for epoch {}", blund.hash(), epoch);
        Ok((Some(block), tip.hash()))
    }

    fn genesis_eligible(&self, epoch: EpochIndex, tip_header: &BlockHeader) -> bool {
        if epoch == 0 {
            return false;
        }
        match tip_header.date() {
            BlockDate::Main(slot) => {
                slot.epoch + 1 == epoch
                    && slot.slot
                        >= self
                            .settings
                            .slots_per_epoch
                            .saturating_sub(self.settings.slot_security_param)
            }
            // a boundary block cannot be followed by another one
            BlockDate::Genesis(_) => false,
        }
    }

    /// Create and apply a main block for `slot`, led by `leader`.
    ///
    /// The slot must be strictly after the tip and no more than the
    /// slot security bound ahead; mempool transactions are ordered by
    /// dependency and filtered to those resident long enough to be
    /// uncontested; the block is applied unconditionally once built.
    pub async fn create_main_block(
        &self,
        slot: SlotId,
        leader: StakeholderId,
    ) -> Result<MainBlock> {
        let mut tip = self.tip.lock().await;
        let tip_header = self
            .storage
            .get_header(&tip.hash())?
            .ok_or(StorageError::BlockNotFound)?;

        let slots_per_epoch = self.settings.slots_per_epoch;
        let tip_position = tip_header.date().position(slots_per_epoch);
        let slot_position = BlockDate::Main(slot).position(slots_per_epoch);
        if slot_position <= tip_position
            || slot_position > tip_position + self.settings.slot_security_param as u64
        {
            return Err(Error::SlotOutOfRange {
                slot,
                tip: tip_header.date(),
            });
        }

        let (pooled, undo_map) = self.transactions.local_txs_and_undo();
        let ordered = self
            .transactions
            .topological_sort(pooled)
            .ok_or(Error::BrokenTopology)?;
        let delay = self.settings.tx_inclusion_delay as u64;
        let included: Vec<PooledTx> = ordered
            .into_iter()
            .filter(|pooled| {
                BlockDate::Main(pooled.received).position(slots_per_epoch) + delay <= slot_position
            })
            .collect();

        let ssc = self.ssc.local_payload(slot).unwrap_or_else(|| {
            tracing::warn!("no local consensus payload for slot {}, using an empty one", slot);
            Default::default()
        });
        let delegation = self.delegation.pending_certificates();

        let tx_undo = TxUndo(
            included
                .iter()
                .map(|pooled| {
                    let id = pooled.tx.id();
                    undo_map.get(&id).cloned().unwrap_or_else(|| {
                        panic!("no undo recorded for mempool transaction {}", id)
                    })
                })
                .collect(),
        );
        let undo = Undo {
            tx: tx_undo,
            delegation: DelegationUndo {
                revoked: delegation.clone(),
            },
        };

        let body = MainBody {
            txs: included.into_iter().map(|pooled| pooled.tx).collect(),
            ssc,
            delegation,
        };
        let block = MainBlock::new(
            &tip_header,
            slot,
            leader,
            BlockVersion::CURRENT,
            SoftwareVersion::current(),
            body,
        );

        if self.settings.assert_created_blocks {
            // diagnostic only: a failure here is reported, never enforced
            let as_block = Block::Main(block.clone());
            if let Err(error) =
                self.verify_blocks_against(&tip_header, std::slice::from_ref(&as_block), false)
            {
                tracing::error!(
                    "freshly created block {} failed self-verification: {}",
                    as_block.header().description(),
                    error
                );
            }
        }

        let blund = Blund {
            block: Block::Main(block.clone()),
            undo,
        };
        self.apply_blunds_under(&mut tip, true, std::slice::from_ref(&blund))?;
        tracing::info!(
            "created block {} for slot {}",
            blund.block.header().description(),
            slot
        );
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockcfg::{Tx, TxAux, TxIn, TxOut, TxWitness};
    use crate::blockchain::BlockStore;
    use crate::testing::TestChain;

    #[tokio::test]
    async fn genesis_block_created_at_epoch_end() {
        let harness = TestChain::new();
        harness.extend_to_epoch_end().await;
        harness.leaders.insert(1);
        let tip_before = harness.chain.tip().snapshot().await;

        let (block, new_tip) = harness.chain.create_genesis_block(1).await.unwrap();

        let block = block.expect("genesis block should be created");
        assert_eq!(block.header.epoch, 1);
        assert_eq!(block.header.parent, tip_before);
        assert_eq!(new_tip, block.hash());
        assert_eq!(harness.store.tip().unwrap(), new_tip);
    }

    #[tokio::test]
    async fn genesis_block_skipped_too_early_in_epoch() {
        let harness = TestChain::new();
        harness.extend(3).await;
        let tip_before = harness.chain.tip().snapshot().await;

        let (block, new_tip) = harness.chain.create_genesis_block(1).await.unwrap();

        assert!(block.is_none());
        assert_eq!(new_tip, tip_before);
    }

    #[tokio::test]
    async fn genesis_block_never_created_for_epoch_zero() {
        let harness = TestChain::new();
        harness.extend_to_epoch_end().await;

        let (block, _) = harness.chain.create_genesis_block(0).await.unwrap();
        assert!(block.is_none());
    }

    #[tokio::test]
    async fn genesis_block_skipped_without_leader_data() {
        let harness = TestChain::new();
        harness.extend_to_epoch_end().await;
        harness.leaders.forget(1);
        let tip_before = harness.chain.tip().snapshot().await;

        let (block, new_tip) = harness.chain.create_genesis_block(1).await.unwrap();

        assert!(block.is_none());
        assert_eq!(new_tip, tip_before);
    }

    #[tokio::test]
    async fn main_block_rejects_slots_at_or_before_the_tip() {
        let harness = TestChain::new();
        harness.extend(3).await;
        let tip_slot = crate::blockcfg::SlotId::new(0, 2);

        let result = harness
            .chain
            .create_main_block(tip_slot, harness.leader)
            .await;
        assert!(matches!(result, Err(Error::SlotOutOfRange { .. })));
    }

    #[tokio::test]
    async fn main_block_rejects_slots_too_far_ahead() {
        let harness = TestChain::new();
        harness.extend(3).await;
        let far = crate::blockcfg::SlotId::new(
            0,
            2 + harness.chain.settings().slot_security_param + 1,
        );

        let result = harness.chain.create_main_block(far, harness.leader).await;
        assert!(matches!(result, Err(Error::SlotOutOfRange { .. })));
    }

    #[tokio::test]
    async fn main_block_includes_matured_transactions_with_their_undo() {
        let harness = TestChain::new();
        harness.extend(3).await;

        let matured = tx_paying(1);
        let fresh = tx_paying(2);
        let consumed = vec![TxOut {
            to: harness.leader,
            value: 9,
        }];
        harness
            .txs
            .add_pooled(matured.clone(), SlotId::new(0, 0), consumed.clone());
        harness.txs.add_pooled(fresh.clone(), SlotId::new(0, 3), vec![]);

        let slot = SlotId::new(0, 4);
        harness.clock.set(slot);
        let block = harness
            .chain
            .create_main_block(slot, harness.leader)
            .await
            .unwrap();

        assert_eq!(block.body.txs, vec![matured]);
        let undo = harness
            .store
            .get_undo(&harness.store.tip().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(undo.tx.0, vec![consumed]);
    }

    #[tokio::test]
    async fn main_block_fails_on_broken_topology() {
        let harness = TestChain::new();
        harness.extend(3).await;
        let tip_before = harness.chain.tip().snapshot().await;

        harness
            .txs
            .add_pooled(tx_paying(1), SlotId::new(0, 0), vec![]);
        harness.txs.set_broken_topology(true);

        let result = harness
            .chain
            .create_main_block(SlotId::new(0, 3), harness.leader)
            .await;

        assert!(matches!(result, Err(Error::BrokenTopology)));
        assert_eq!(harness.chain.tip().snapshot().await, tip_before);
        assert_eq!(harness.store.tip().unwrap(), tip_before);
    }

    #[tokio::test]
    async fn created_main_block_advances_the_tip() {
        let harness = TestChain::new();
        harness.extend(2).await;

        let slot = SlotId::new(0, 3);
        harness.clock.set(slot);
        let block = harness
            .chain
            .create_main_block(slot, harness.leader)
            .await
            .unwrap();

        assert_eq!(harness.chain.tip().snapshot().await, block.hash());
        assert_eq!(harness.store.tip().unwrap(), block.hash());
    }

    use crate::blockcfg::SlotId;

    fn tx_paying(value: u64) -> TxAux {
        TxAux {
            tx: Tx {
                inputs: vec![TxIn {
                    tx: crate::blockcfg::Hash::digest(&value.to_be_bytes()),
                    index: 0,
                }],
                outputs: vec![TxOut {
                    to: crate::blockcfg::StakeholderId([3; 32]),
                    value,
                }],
            },
            witness: TxWitness::default(),
        }
    }
}
