use super::{
    chain::{Blockchain, Error, Result},
    storage::StorageError,
    verify::verify_header_link,
};
use crate::blockcfg::{BlockDate, BlockHeader, HeaderHash};

/// Verdict on one externally received header, judged against the
/// current tip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClassifyHeaderResult {
    /// The header directly extends the current tip.
    Continues,
    /// The header belongs to a fork heavier than our chain and is worth
    /// fetching.
    Alternative,
    /// Nothing wrong with the header, but it is of no use to us.
    Useless(String),
    Invalid(String),
}

/// Verdict on a candidate header chain, newest first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClassifyHeadersResult {
    /// The chain forks off our main chain acceptably; the embedded
    /// header is the first one past the common ancestor.
    Valid(BlockHeader),
    Useless(String),
    Invalid(String),
}

impl Blockchain {
    /// Classify one header received from a peer. Advisory: runs against
    /// a tip snapshot that may be stale by the time the verdict is
    /// acted upon, so appliers re-validate under the tip token.
    pub fn classify_new_header(&self, header: &BlockHeader) -> Result<ClassifyHeaderResult> {
        let current_slot = self.clock.current_slot();

        let slot = match header.date() {
            // genesis blocks are derived locally by every node, peers
            // never need to announce them
            BlockDate::Genesis(_) => {
                return Ok(ClassifyHeaderResult::Useless(
                    "genesis headers are not relayed".to_owned(),
                ))
            }
            BlockDate::Main(slot) => slot,
        };
        if slot != current_slot {
            return Ok(ClassifyHeaderResult::Useless(format!(
                "header slot {} is not the current slot {}",
                slot, current_slot
            )));
        }

        let tip_hash = self.storage.tip()?;
        if header.parent() == tip_hash {
            let tip_header = self
                .storage
                .get_header(&tip_hash)?
                .ok_or(StorageError::BlockNotFound)?;
            let leaders = self.leader_election.leaders(slot.epoch).ok();
            return Ok(
                match verify_header_link(
                    &tip_header,
                    header,
                    self.settings.slots_per_epoch,
                    current_slot,
                    leaders.as_ref(),
                ) {
                    Ok(()) => ClassifyHeaderResult::Continues,
                    Err(error) => ClassifyHeaderResult::Invalid(error.to_string()),
                },
            );
        }

        let tip_block = self.storage.get_tip_block()?;
        if header.difficulty() > tip_block.difficulty() {
            Ok(ClassifyHeaderResult::Alternative)
        } else {
            Ok(ClassifyHeaderResult::Useless(
                "difficulty does not exceed the current tip".to_owned(),
            ))
        }
    }

    /// Most recent hash shared between the candidate chain (newest
    /// first) and the local main chain, if any.
    ///
    /// The candidate list is every header's own hash, newest to oldest,
    /// followed by the parent of the oldest header; scanning it in that
    /// order makes the first main-chain member the most recent shared
    /// ancestor.
    pub fn lca(&self, headers: &[BlockHeader]) -> Result<Option<HeaderHash>> {
        let oldest = match headers.last() {
            Some(header) => header,
            None => return Ok(None),
        };
        let candidates = headers
            .iter()
            .map(BlockHeader::hash)
            .chain(std::iter::once(oldest.parent()));
        for hash in candidates {
            if self.storage.is_in_main_chain(&hash)? {
                return Ok(Some(hash));
            }
        }
        Ok(None)
    }

    /// Classify a candidate header chain, newest first: does it extend
    /// or acceptably fork from our main chain, or must it be rejected?
    pub fn classify_headers(&self, headers: &[BlockHeader]) -> Result<ClassifyHeadersResult> {
        if headers.is_empty() {
            return Err(Error::EmptyBlockSequence);
        }

        if let Err(reason) = chain_is_well_formed(headers) {
            return Ok(ClassifyHeadersResult::Invalid(reason));
        }

        let oldest = headers.last().expect("checked non-empty");
        if self.storage.get_header(&oldest.hash())?.is_none() {
            return Ok(ClassifyHeadersResult::Invalid(
                "oldest header of the candidate chain is not known locally".to_owned(),
            ));
        }

        let tip_hash = self.storage.tip()?;
        let newest_hash = headers[0].hash();
        if newest_hash == tip_hash {
            return Ok(ClassifyHeadersResult::Useless(
                "the candidate chain is already adopted".to_owned(),
            ));
        }

        let lca_hash = match self.lca(headers)? {
            Some(hash) => hash,
            None => {
                return Ok(ClassifyHeadersResult::Useless(
                    "no common ancestor with the main chain".to_owned(),
                ))
            }
        };

        let tip_header = self
            .storage
            .get_header(&tip_hash)?
            .ok_or(StorageError::BlockNotFound)?;
        let lca_header = self
            .storage
            .get_header(&lca_hash)?
            .ok_or(StorageError::BlockNotFound)?;
        let depth_diff = tip_header
            .difficulty()
            .0
            .checked_sub(lca_header.difficulty().0)
            .unwrap_or_else(|| {
                panic!(
                    "difficulty of main-chain block {} exceeds the tip difficulty: \
                     chain state is corrupted",
                    lca_hash
                )
            });

        let child = headers
            .iter()
            .rev()
            .find(|header| header.parent() == lca_hash);
        let child = match child {
            Some(header) => header.clone(),
            None => {
                return Ok(ClassifyHeadersResult::Useless(
                    "the candidate chain is already part of the main chain".to_owned(),
                ))
            }
        };

        if lca_hash == tip_hash {
            return Ok(ClassifyHeadersResult::Valid(child));
        }
        if depth_diff > self.settings.blk_security_param {
            return Ok(ClassifyHeadersResult::Useless(format!(
                "fork is {} blocks deep, too deep to reconsider",
                depth_diff
            )));
        }
        Ok(ClassifyHeadersResult::Valid(child))
    }
}

/// Structural check of a newest-first candidate chain: every header
/// links to the next and difficulties follow the chain rules.
fn chain_is_well_formed(headers: &[BlockHeader]) -> core::result::Result<(), String> {
    for window in headers.windows(2) {
        let (newer, older) = (&window[0], &window[1]);
        if newer.parent() != older.hash() {
            return Err(format!(
                "header {} does not link to {}",
                newer.description(),
                older.description()
            ));
        }
        let expected = if newer.is_genesis() {
            older.difficulty()
        } else {
            older.difficulty().next()
        };
        if newer.difficulty() != expected {
            return Err(format!(
                "difficulty of header {} does not follow its parent",
                newer.description()
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockcfg::SlotId;
    use crate::blockchain::BlockStore;
    use crate::testing::TestChain;

    #[tokio::test]
    async fn header_extending_tip_continues() {
        let harness = TestChain::new();
        harness.extend(3).await;

        let tip_header = harness.tip_header();
        let next_slot = harness.next_slot();
        let block = harness.make_main_block(&tip_header, next_slot);
        harness.clock.set(next_slot);

        assert_eq!(
            harness.chain.classify_new_header(&block.header()).unwrap(),
            ClassifyHeaderResult::Continues
        );
    }

    #[tokio::test]
    async fn header_for_another_slot_is_useless() {
        let harness = TestChain::new();
        harness.extend(2).await;

        let tip_header = harness.tip_header();
        let next_slot = harness.next_slot();
        let block = harness.make_main_block(&tip_header, next_slot);
        // ambient clock is one slot further
        harness.clock.set(SlotId::new(next_slot.epoch, next_slot.slot + 1));

        assert!(matches!(
            harness.chain.classify_new_header(&block.header()).unwrap(),
            ClassifyHeaderResult::Useless(_)
        ));
    }

    #[tokio::test]
    async fn genesis_header_is_useless() {
        let harness = TestChain::new();
        harness.extend_to_epoch_end().await;

        let tip_header = harness.tip_header();
        let block = harness.make_genesis_block(&tip_header, 1);

        assert!(matches!(
            harness.chain.classify_new_header(&block.header()).unwrap(),
            ClassifyHeaderResult::Useless(_)
        ));
    }

    #[tokio::test]
    async fn heavier_fork_header_is_alternative() {
        let harness = TestChain::new();
        let blocks = harness.extend(3).await;

        // build a sibling chain from two blocks behind the tip, one
        // block longer than ours
        let fork_parent = blocks[0].header();
        let mut parent = fork_parent;
        let mut fork_tip = None;
        for i in 0..3 {
            let slot = SlotId::new(0, 10 + i);
            let block = harness.make_main_block(&parent, slot);
            parent = block.header();
            fork_tip = Some(block);
        }
        let header = fork_tip.unwrap().header();
        harness.clock.set(SlotId::new(0, 12));

        assert_eq!(
            harness.chain.classify_new_header(&header).unwrap(),
            ClassifyHeaderResult::Alternative
        );
    }

    #[tokio::test]
    async fn lighter_fork_header_is_useless() {
        let harness = TestChain::new();
        let blocks = harness.extend(3).await;

        let fork_parent = blocks[0].header();
        let slot = SlotId::new(0, 10);
        let block = harness.make_main_block(&fork_parent, slot);
        harness.clock.set(slot);

        assert!(matches!(
            harness.chain.classify_new_header(&block.header()).unwrap(),
            ClassifyHeaderResult::Useless(_)
        ));
    }

    #[tokio::test]
    async fn bad_link_is_invalid() {
        let harness = TestChain::new();
        harness.extend(2).await;

        let tip_header = harness.tip_header();
        let next_slot = harness.next_slot();
        let mut block = harness.make_main_block(&tip_header, next_slot);
        if let crate::blockcfg::Block::Main(ref mut main) = block {
            // difficulty jump breaks the increment rule
            main.header.difficulty = crate::blockcfg::ChainDifficulty(99);
        }
        harness.clock.set(next_slot);

        assert!(matches!(
            harness.chain.classify_new_header(&block.header()).unwrap(),
            ClassifyHeaderResult::Invalid(_)
        ));
    }

    #[tokio::test]
    async fn lca_result_is_on_the_main_chain() {
        let harness = TestChain::new();
        let blocks = harness.extend(4).await;

        // candidate forking off after the second block
        let mut parent = blocks[1].header();
        let mut candidate = Vec::new();
        for i in 0..2 {
            let block = harness.make_main_block(&parent, SlotId::new(0, 20 + i));
            parent = block.header();
            candidate.push(block.header());
        }
        candidate.reverse();

        let lca = harness.chain.lca(&candidate).unwrap().unwrap();
        assert!(harness.store.is_in_main_chain(&lca).unwrap());
        assert_eq!(lca, blocks[1].hash());
    }

    #[tokio::test]
    async fn acceptable_fork_is_valid_with_lca_child() {
        let harness = TestChain::new();
        let blocks = harness.extend(4).await;

        // LCA two blocks behind the tip, candidate three headers long
        let mut parent = blocks[1].header();
        let mut candidate = Vec::new();
        for i in 0..3 {
            let block = harness.make_main_block(&parent, SlotId::new(0, 20 + i));
            parent = block.header();
            candidate.push(block.header());
        }
        candidate.reverse();

        match harness.chain.classify_headers(&candidate).unwrap() {
            ClassifyHeadersResult::Valid(child) => {
                assert_eq!(child.parent(), blocks[1].hash());
            }
            other => panic!("expected Valid, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn too_deep_fork_is_useless() {
        let mut settings = TestChain::small_settings();
        settings.blk_security_param = 1;
        let harness = TestChain::with_settings(settings);
        let blocks = harness.extend(4).await;

        // fork point is two blocks behind the tip, beyond the bound
        let mut parent = blocks[1].header();
        let mut candidate = Vec::new();
        for i in 0..3 {
            let block = harness.make_main_block(&parent, SlotId::new(0, 20 + i));
            parent = block.header();
            candidate.push(block.header());
        }
        candidate.reverse();

        assert!(matches!(
            harness.chain.classify_headers(&candidate).unwrap(),
            ClassifyHeadersResult::Useless(_)
        ));
    }

    #[tokio::test]
    async fn chain_extending_tip_is_valid() {
        let harness = TestChain::new();
        harness.extend(2).await;

        let mut parent = harness.tip_header();
        let tip_hash = parent.hash();
        let mut candidate = Vec::new();
        for i in 0..2 {
            let block = harness.make_main_block(&parent, SlotId::new(0, 5 + i));
            parent = block.header();
            candidate.push(block.header());
        }
        candidate.reverse();

        match harness.chain.classify_headers(&candidate).unwrap() {
            ClassifyHeadersResult::Valid(child) => assert_eq!(child.parent(), tip_hash),
            other => panic!("expected Valid, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn already_adopted_chain_is_useless() {
        let harness = TestChain::new();
        let blocks = harness.extend(3).await;

        let candidate: Vec<_> = blocks.iter().rev().map(|block| block.header()).collect();
        assert!(matches!(
            harness.chain.classify_headers(&candidate).unwrap(),
            ClassifyHeadersResult::Useless(_)
        ));
    }

    #[tokio::test]
    async fn unknown_oldest_header_is_invalid() {
        let harness = TestChain::new();
        harness.extend(2).await;

        // a chain whose oldest header we have never stored
        let phantom = harness.make_main_block(&harness.tip_header(), SlotId::new(0, 30));
        let child = harness.make_main_block(&phantom.header(), SlotId::new(0, 31));
        let candidate = vec![child.header(), phantom.header()];

        assert!(matches!(
            harness.chain.classify_headers(&candidate).unwrap(),
            ClassifyHeadersResult::Invalid(_)
        ));
    }

    #[tokio::test]
    async fn broken_links_are_invalid() {
        let harness = TestChain::new();
        let blocks = harness.extend(3).await;

        // shuffled headers do not form a chain
        let candidate = vec![blocks[0].header(), blocks[2].header()];
        assert!(matches!(
            harness.chain.classify_headers(&candidate).unwrap(),
            ClassifyHeadersResult::Invalid(_)
        ));
    }
}
