//! Fixtures shared by the unit tests: an in-memory chain wired with
//! scriptable collaborators.

use crate::blockcfg::{
    Block, BlockDate, BlockHeader, BlockVersion, Blund, DelegationCert, DelegationUndo,
    EpochIndex, GenesisBlock, HeaderHash, MainBlock, MainBody, SlotId, SlotLeaders,
    SoftwareVersion, SscPayload, StakeholderId, TxAux, TxId, TxOut, TxUndo,
};
use crate::blockchain::{Blockchain, BlockStore, MemoryBlockStore};
use crate::intercom::{
    DelegationService, LeaderElection, LeadershipError, PooledTx, Rejection, Services, SlotClock,
    SscService, TxService,
};
use crate::settings::ConsensusSettings;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaChaRng;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

pub struct TestClock {
    slot: Mutex<SlotId>,
}

impl TestClock {
    pub fn set(&self, slot: SlotId) {
        *self.slot.lock().unwrap() = slot;
    }
}

impl SlotClock for TestClock {
    fn current_slot(&self) -> SlotId {
        *self.slot.lock().unwrap()
    }
}

pub struct TestLeaderElection {
    schedule: SlotLeaders,
    known: Mutex<HashMap<EpochIndex, SlotLeaders>>,
    computed: Mutex<Vec<EpochIndex>>,
}

impl TestLeaderElection {
    fn new(schedule: SlotLeaders) -> Self {
        let mut known = HashMap::new();
        known.insert(0, schedule.clone());
        TestLeaderElection {
            schedule,
            known: Mutex::new(known),
            computed: Mutex::new(Vec::new()),
        }
    }

    pub fn insert(&self, epoch: EpochIndex) {
        self.known
            .lock()
            .unwrap()
            .insert(epoch, self.schedule.clone());
    }

    pub fn forget(&self, epoch: EpochIndex) {
        self.known.lock().unwrap().remove(&epoch);
    }

    /// Epochs `compute_leaders` was called for, in call order.
    pub fn computed(&self) -> Vec<EpochIndex> {
        self.computed.lock().unwrap().clone()
    }
}

impl LeaderElection for TestLeaderElection {
    fn compute_leaders(&self, epoch: EpochIndex) -> Result<(), LeadershipError> {
        self.computed.lock().unwrap().push(epoch);
        self.known
            .lock()
            .unwrap()
            .entry(epoch)
            .or_insert_with(|| self.schedule.clone());
        Ok(())
    }

    fn leaders(&self, epoch: EpochIndex) -> Result<SlotLeaders, LeadershipError> {
        self.known
            .lock()
            .unwrap()
            .get(&epoch)
            .cloned()
            .ok_or(LeadershipError::Unknown(epoch))
    }
}

#[derive(Default)]
pub struct TestSsc {
    pub payload: Mutex<Option<SscPayload>>,
}

impl SscService for TestSsc {
    fn verify_payload(&self, _strict: bool, _blocks: &[Block]) -> Result<(), Rejection> {
        Ok(())
    }

    fn local_payload(&self, _slot: SlotId) -> Option<SscPayload> {
        self.payload.lock().unwrap().clone()
    }
}

#[derive(Default)]
pub struct TestTxService {
    reject: Mutex<HashSet<HeaderHash>>,
    pool: Mutex<Vec<PooledTx>>,
    undo: Mutex<HashMap<TxId, Vec<TxOut>>>,
    broken_topology: Mutex<bool>,
}

impl TestTxService {
    /// Mark a block so any sequence containing it fails transaction
    /// verification.
    pub fn reject(&self, hash: HeaderHash) {
        self.reject.lock().unwrap().insert(hash);
    }

    pub fn add_pooled(&self, tx: TxAux, received: SlotId, consumed: Vec<TxOut>) {
        self.undo.lock().unwrap().insert(tx.id(), consumed);
        self.pool.lock().unwrap().push(PooledTx { tx, received });
    }

    pub fn set_broken_topology(&self, broken: bool) {
        *self.broken_topology.lock().unwrap() = broken;
    }
}

impl TxService for TestTxService {
    fn verify_blocks(&self, blocks: &[Block]) -> Result<Vec<TxUndo>, Rejection> {
        let reject = self.reject.lock().unwrap();
        for block in blocks {
            if reject.contains(&block.hash()) {
                return Err(Rejection("transaction set rejected".to_owned()));
            }
        }
        Ok(blocks
            .iter()
            .map(|block| match block {
                Block::Main(main) => TxUndo(vec![Vec::new(); main.body.txs.len()]),
                Block::Genesis(_) => TxUndo::default(),
            })
            .collect())
    }

    fn local_txs_and_undo(&self) -> (Vec<PooledTx>, HashMap<TxId, Vec<TxOut>>) {
        (
            self.pool.lock().unwrap().clone(),
            self.undo.lock().unwrap().clone(),
        )
    }

    fn topological_sort(&self, txs: Vec<PooledTx>) -> Option<Vec<PooledTx>> {
        if *self.broken_topology.lock().unwrap() {
            None
        } else {
            Some(txs)
        }
    }
}

#[derive(Default)]
pub struct TestDelegation {
    pub pending: Mutex<Vec<DelegationCert>>,
}

impl DelegationService for TestDelegation {
    fn verify_blocks(&self, blocks: &[Block]) -> Result<Vec<DelegationUndo>, Rejection> {
        Ok(blocks.iter().map(|_| DelegationUndo::default()).collect())
    }

    fn pending_certificates(&self) -> Vec<DelegationCert> {
        self.pending.lock().unwrap().clone()
    }
}

/// A chain over the in-memory store with scriptable collaborators and a
/// single stakeholder leading every slot.
pub struct TestChain {
    pub chain: Blockchain,
    pub store: Arc<MemoryBlockStore>,
    pub clock: Arc<TestClock>,
    pub leaders: Arc<TestLeaderElection>,
    pub ssc: Arc<TestSsc>,
    pub txs: Arc<TestTxService>,
    pub delegation: Arc<TestDelegation>,
    pub leader: StakeholderId,
    block0: HeaderHash,
}

impl TestChain {
    pub fn small_settings() -> ConsensusSettings {
        ConsensusSettings {
            slots_per_epoch: 10,
            blk_security_param: 8,
            slot_security_param: 2,
            recovery_headers_message: 2200,
            tx_inclusion_delay: 2,
            assert_created_blocks: false,
        }
    }

    pub fn new() -> Self {
        Self::with_settings(Self::small_settings())
    }

    pub fn with_settings(settings: ConsensusSettings) -> Self {
        let mut rng = ChaChaRng::from_seed([42; 32]);
        let mut id = [0u8; 32];
        rng.fill_bytes(&mut id);
        let leader = StakeholderId(id);
        let schedule = SlotLeaders::new(vec![leader; settings.slots_per_epoch as usize]);

        let store = Arc::new(MemoryBlockStore::new());
        let clock = Arc::new(TestClock {
            slot: Mutex::new(SlotId::new(0, 0)),
        });
        let leaders = Arc::new(TestLeaderElection::new(schedule.clone()));
        let ssc = Arc::new(TestSsc::default());
        let txs = Arc::new(TestTxService::default());
        let delegation = Arc::new(TestDelegation::default());

        let block0 = GenesisBlock::block0(schedule);
        let block0_hash = block0.hash();
        let storage: Arc<dyn BlockStore> = store.clone();
        let chain = Blockchain::initialize(
            storage,
            Services {
                clock: clock.clone(),
                leader_election: leaders.clone(),
                ssc: ssc.clone(),
                transactions: txs.clone(),
                delegation: delegation.clone(),
            },
            settings,
            block0,
        )
        .expect("fresh store accepts block0");

        TestChain {
            chain,
            store,
            clock,
            leaders,
            ssc,
            txs,
            delegation,
            leader,
            block0: block0_hash,
        }
    }

    pub fn block0_hash(&self) -> HeaderHash {
        self.block0
    }

    pub fn tip_header(&self) -> BlockHeader {
        let tip = self.store.tip().unwrap();
        self.store.get_header(&tip).unwrap().unwrap()
    }

    /// The first slot after the tip's date.
    pub fn next_slot(&self) -> SlotId {
        match self.tip_header().date() {
            BlockDate::Genesis(epoch) => SlotId::new(epoch, 0),
            BlockDate::Main(slot) => SlotId::new(slot.epoch, slot.slot + 1),
        }
    }

    pub fn make_main_block(&self, parent: &BlockHeader, slot: SlotId) -> Block {
        let body = MainBody {
            txs: Vec::new(),
            ssc: SscPayload::default(),
            delegation: Vec::new(),
        };
        Block::Main(MainBlock::new(
            parent,
            slot,
            self.leader,
            BlockVersion::CURRENT,
            SoftwareVersion::current(),
            body,
        ))
    }

    pub fn make_genesis_block(&self, parent: &BlockHeader, epoch: EpochIndex) -> Block {
        let leaders = SlotLeaders::new(vec![
            self.leader;
            self.chain.settings().slots_per_epoch as usize
        ]);
        Block::Genesis(GenesisBlock::new(parent, epoch, leaders))
    }

    /// A chain of empty main blocks in consecutive slots, starting at
    /// `first_slot`, not applied.
    pub fn make_main_chain(
        &self,
        parent: &BlockHeader,
        first_slot: SlotId,
        n: u32,
    ) -> Vec<Block> {
        let mut parent = parent.clone();
        let mut blocks = Vec::new();
        for i in 0..n {
            let slot = SlotId::new(first_slot.epoch, first_slot.slot + i);
            let block = self.make_main_block(&parent, slot);
            parent = block.header();
            blocks.push(block);
        }
        blocks
    }

    /// Extend the chain with `n` empty main blocks in consecutive
    /// slots, advancing the clock accordingly.
    pub async fn extend(&self, n: u32) -> Vec<Block> {
        if n == 0 {
            return Vec::new();
        }
        let parent = self.tip_header();
        let first_slot = self.next_slot();
        let blocks = self.make_main_chain(&parent, first_slot, n);
        let last_slot = blocks
            .last()
            .map(|block| match block.date() {
                BlockDate::Main(slot) => slot,
                BlockDate::Genesis(_) => unreachable!(),
            })
            .unwrap_or(first_slot);
        self.clock.set(last_slot);
        self.chain
            .verify_and_apply_blocks(true, &blocks)
            .await
            .expect("fixture blocks verify");
        blocks
    }

    /// Extend until the tip sits in the last slot of its epoch.
    pub async fn extend_to_epoch_end(&self) -> Vec<Block> {
        let slots_per_epoch = self.chain.settings().slots_per_epoch;
        let needed = match self.tip_header().date() {
            BlockDate::Genesis(_) => slots_per_epoch,
            BlockDate::Main(slot) => slots_per_epoch - 1 - slot.slot,
        };
        self.extend(needed).await
    }

    /// Pair applied blocks with their stored undo, newest first, ready
    /// for rollback.
    pub fn blunds_newest_first(&self, blocks: &[Block]) -> Vec<Blund> {
        let mut blunds: Vec<Blund> = blocks
            .iter()
            .map(|block| Blund {
                block: block.clone(),
                undo: self
                    .store
                    .get_undo(&block.hash())
                    .unwrap()
                    .expect("applied block has an undo"),
            })
            .collect();
        blunds.reverse();
        blunds
    }
}
