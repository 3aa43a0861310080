use super::chain::Blockchain;
use crate::blockcfg::{
    Block, BlockDate, BlockHeader, ChainDifficulty, EpochIndex, HeaderHash, SlotId, SlotLeaders,
    StakeholderId, Undo,
};
use crate::intercom::Rejection;
use thiserror::Error;

/// Structural or semantic rejection of a header or block. Recoverable:
/// nothing has been mutated and the caller may retry with other input.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("header parent {found} does not link to {expected}")]
    BadParent {
        expected: HeaderHash,
        found: HeaderHash,
    },
    #[error("block date {child} is not after parent date {parent}")]
    NonIncreasingDate { parent: BlockDate, child: BlockDate },
    #[error("chain difficulty {child} does not follow parent difficulty {parent}")]
    DifficultyMismatch {
        parent: ChainDifficulty,
        child: ChainDifficulty,
    },
    #[error("genesis block for epoch {child} does not open the epoch after {parent}")]
    EpochMismatch {
        parent: EpochIndex,
        child: EpochIndex,
    },
    #[error("block date {date} is ahead of the current slot {current}")]
    FromFuture { date: BlockDate, current: SlotId },
    #[error("header content hash does not match the block body")]
    ContentHashMismatch,
    #[error("slot leaders for epoch {0} are not available")]
    LeadersUnavailable(EpochIndex),
    #[error("block leader {found} is not the scheduled leader {expected}")]
    WrongLeader {
        expected: StakeholderId,
        found: StakeholderId,
    },
    #[error("slot leader schedule has {found} entries, expected {expected}")]
    MalformedLeaders { expected: usize, found: usize },
    #[error("consensus payload rejected: {0}")]
    Payload(Rejection),
    #[error("transactions rejected: {0}")]
    Transactions(Rejection),
    #[error("delegation certificates rejected: {0}")]
    Delegation(Rejection),
}

/// Verify one header against the header of its parent.
///
/// The `parent` must have been looked up by, or otherwise matched to,
/// the parent hash of `header`; a mismatch is reported, not assumed.
/// When the leader schedule of the header's epoch is known it is
/// checked as well; classification paths pass `None` since a schedule
/// that is not computed yet must not reject an otherwise plausible
/// header there.
pub fn verify_header_link(
    parent: &BlockHeader,
    header: &BlockHeader,
    slots_per_epoch: u32,
    current_slot: SlotId,
    leaders: Option<&SlotLeaders>,
) -> Result<(), ValidationError> {
    let parent_hash = parent.hash();
    if header.parent() != parent_hash {
        return Err(ValidationError::BadParent {
            expected: parent_hash,
            found: header.parent(),
        });
    }

    let parent_date = parent.date();
    let date = header.date();
    if date.position(slots_per_epoch) <= parent_date.position(slots_per_epoch) {
        return Err(ValidationError::NonIncreasingDate {
            parent: parent_date,
            child: date,
        });
    }
    if date.position(slots_per_epoch) > BlockDate::Main(current_slot).position(slots_per_epoch) {
        return Err(ValidationError::FromFuture {
            date,
            current: current_slot,
        });
    }

    match header {
        BlockHeader::Genesis(genesis) => {
            // difficulty is carried unchanged across the boundary
            if genesis.difficulty != parent.difficulty() {
                return Err(ValidationError::DifficultyMismatch {
                    parent: parent.difficulty(),
                    child: genesis.difficulty,
                });
            }
            if genesis.epoch != parent_date.epoch() + 1 {
                return Err(ValidationError::EpochMismatch {
                    parent: parent_date.epoch(),
                    child: genesis.epoch,
                });
            }
        }
        BlockHeader::Main(main) => {
            if main.difficulty != parent.difficulty().next() {
                return Err(ValidationError::DifficultyMismatch {
                    parent: parent.difficulty(),
                    child: main.difficulty,
                });
            }
            if let Some(leaders) = leaders {
                match leaders.leader_of(main.slot.slot) {
                    None => {
                        return Err(ValidationError::MalformedLeaders {
                            expected: slots_per_epoch as usize,
                            found: leaders.len(),
                        })
                    }
                    Some(leader) if *leader != main.leader => {
                        return Err(ValidationError::WrongLeader {
                            expected: *leader,
                            found: main.leader,
                        })
                    }
                    Some(_) => {}
                }
            }
        }
    }
    Ok(())
}

impl Blockchain {
    /// Verify a contiguous, oldest-first candidate block sequence
    /// against the current tip, producing one [`Undo`] per block.
    ///
    /// The current tip block is prepended as parent context so the
    /// first link is checked across the boundary too.
    pub fn verify_blocks(&self, blocks: &[Block]) -> Result<Vec<Undo>, super::chain::Error> {
        if blocks.is_empty() {
            return Err(super::chain::Error::EmptyBlockSequence);
        }
        let parent = self.storage.get_tip_block()?.header();
        self.verify_blocks_against(&parent, blocks, true)
            .map_err(Into::into)
    }

    /// Run the three independent checks of one block sequence: header
    /// and body structure, consensus payload, transactions plus
    /// delegation. The first failing check wins.
    pub(super) fn verify_blocks_against(
        &self,
        parent: &BlockHeader,
        blocks: &[Block],
        strict: bool,
    ) -> Result<Vec<Undo>, ValidationError> {
        let current_slot = self.clock.current_slot();
        let slots_per_epoch = self.settings.slots_per_epoch;

        let mut prev = parent.clone();
        for block in blocks {
            let header = block.header();
            let leaders = match &header {
                BlockHeader::Main(main) => match self.leader_election.leaders(main.slot.epoch) {
                    Ok(leaders) => Some(leaders),
                    Err(_) => {
                        return Err(ValidationError::LeadersUnavailable(main.slot.epoch));
                    }
                },
                BlockHeader::Genesis(_) => None,
            };
            verify_header_link(
                &prev,
                &header,
                slots_per_epoch,
                current_slot,
                leaders.as_ref(),
            )?;
            if !block.content_hash_matches() {
                return Err(ValidationError::ContentHashMismatch);
            }
            if let Block::Genesis(genesis) = block {
                if genesis.body.leaders.len() != slots_per_epoch as usize {
                    return Err(ValidationError::MalformedLeaders {
                        expected: slots_per_epoch as usize,
                        found: genesis.body.leaders.len(),
                    });
                }
            }
            prev = header;
        }

        self.ssc
            .verify_payload(strict, blocks)
            .map_err(ValidationError::Payload)?;
        let tx_undos = self
            .transactions
            .verify_blocks(blocks)
            .map_err(ValidationError::Transactions)?;
        let delegation_undos = self
            .delegation
            .verify_blocks(blocks)
            .map_err(ValidationError::Delegation)?;

        if tx_undos.len() != blocks.len() || delegation_undos.len() != blocks.len() {
            panic!(
                "collaborators returned {} transaction and {} delegation undos for {} blocks",
                tx_undos.len(),
                delegation_undos.len(),
                blocks.len()
            );
        }

        Ok(tx_undos
            .into_iter()
            .zip(delegation_undos)
            .map(|(tx, delegation)| Undo { tx, delegation })
            .collect())
    }
}
