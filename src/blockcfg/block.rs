use super::{
    BlockDate, BlockHeader, BlockVersion, ChainDifficulty, EpochIndex, GenesisHeader, Hash,
    HeaderHash, MainHeader, SlotId, SlotLeaders, SoftwareVersion, StakeholderId, TxId,
};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct TxIn {
    pub tx: TxId,
    pub index: u32,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TxOut {
    pub to: StakeholderId,
    pub value: u64,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Tx {
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
}

impl Tx {
    pub fn id(&self) -> TxId {
        Hash::hash_of(self)
    }
}

/// Witness data authenticating a transaction. Opaque to the core;
/// signature verification belongs to the transaction collaborator.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct TxWitness(pub Vec<u8>);

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TxAux {
    pub tx: Tx,
    pub witness: TxWitness,
}

impl TxAux {
    pub fn id(&self) -> TxId {
        self.tx.id()
    }
}

/// Consensus payload carried by main blocks. Opaque to the core; its
/// semantics live entirely behind the consensus-payload collaborator.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct SscPayload(pub Vec<u8>);

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct DelegationCert {
    pub issuer: StakeholderId,
    pub delegate: StakeholderId,
    pub epoch: EpochIndex,
    pub signature: Vec<u8>,
}

/// Body of a genesis block: only the slot-leader schedule for the epoch
/// the block opens.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct GenesisBody {
    pub leaders: SlotLeaders,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct MainBody {
    pub txs: Vec<TxAux>,
    pub ssc: SscPayload,
    pub delegation: Vec<DelegationCert>,
}

impl GenesisBody {
    pub fn hash(&self) -> Hash {
        Hash::hash_of(self)
    }
}

impl MainBody {
    pub fn hash(&self) -> Hash {
        Hash::hash_of(self)
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct GenesisBlock {
    pub header: GenesisHeader,
    pub body: GenesisBody,
}

impl GenesisBlock {
    /// Build the genesis block opening `epoch` on top of `parent`.
    /// Difficulty is carried over unchanged and the content hash is
    /// computed from the body, so invariants hold by construction.
    pub fn new(parent: &BlockHeader, epoch: EpochIndex, leaders: SlotLeaders) -> Self {
        let body = GenesisBody { leaders };
        let header = GenesisHeader {
            parent: parent.hash(),
            epoch,
            difficulty: parent.difficulty(),
            content_hash: body.hash(),
        };
        GenesisBlock { header, body }
    }

    /// The hardcoded block opening epoch 0; the only block whose parent
    /// is the zero hash.
    pub fn block0(leaders: SlotLeaders) -> Self {
        let body = GenesisBody { leaders };
        let header = GenesisHeader {
            parent: Hash::zero(),
            epoch: 0,
            difficulty: ChainDifficulty(0),
            content_hash: body.hash(),
        };
        GenesisBlock { header, body }
    }

    pub fn hash(&self) -> HeaderHash {
        BlockHeader::Genesis(self.header.clone()).hash()
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct MainBlock {
    pub header: MainHeader,
    pub body: MainBody,
}

impl MainBlock {
    pub fn new(
        parent: &BlockHeader,
        slot: SlotId,
        leader: StakeholderId,
        block_version: BlockVersion,
        software_version: SoftwareVersion,
        body: MainBody,
    ) -> Self {
        let header = MainHeader {
            parent: parent.hash(),
            slot,
            difficulty: parent.difficulty().next(),
            leader,
            block_version,
            software_version,
            content_hash: body.hash(),
        };
        MainBlock { header, body }
    }

    pub fn hash(&self) -> HeaderHash {
        BlockHeader::Main(self.header.clone()).hash()
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Block {
    Genesis(GenesisBlock),
    Main(MainBlock),
}

impl Block {
    pub fn header(&self) -> BlockHeader {
        match self {
            Block::Genesis(block) => BlockHeader::Genesis(block.header.clone()),
            Block::Main(block) => BlockHeader::Main(block.header.clone()),
        }
    }

    pub fn hash(&self) -> HeaderHash {
        self.header().hash()
    }

    pub fn parent(&self) -> HeaderHash {
        match self {
            Block::Genesis(block) => block.header.parent,
            Block::Main(block) => block.header.parent,
        }
    }

    pub fn date(&self) -> BlockDate {
        match self {
            Block::Genesis(block) => BlockDate::Genesis(block.header.epoch),
            Block::Main(block) => BlockDate::Main(block.header.slot),
        }
    }

    pub fn difficulty(&self) -> ChainDifficulty {
        match self {
            Block::Genesis(block) => block.header.difficulty,
            Block::Main(block) => block.header.difficulty,
        }
    }

    pub fn is_genesis(&self) -> bool {
        matches!(self, Block::Genesis(_))
    }

    pub fn content_hash_matches(&self) -> bool {
        match self {
            Block::Genesis(block) => block.body.hash() == block.header.content_hash,
            Block::Main(block) => block.body.hash() == block.header.content_hash,
        }
    }
}

/// Outputs consumed by each transaction of one block, in block order.
/// Restoring them reverses the block's effect on the UTXO set.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct TxUndo(pub Vec<Vec<TxOut>>);

#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct DelegationUndo {
    pub revoked: Vec<DelegationCert>,
}

/// The minimal data needed to reverse one block's storage effects.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Undo {
    pub tx: TxUndo,
    pub delegation: DelegationUndo,
}

impl Undo {
    pub fn empty() -> Self {
        Undo {
            tx: TxUndo::default(),
            delegation: DelegationUndo::default(),
        }
    }
}

/// A block paired with its undo data; the unit of apply and rollback.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Blund {
    pub block: Block,
    pub undo: Undo,
}

impl Blund {
    pub fn hash(&self) -> HeaderHash {
        self.block.hash()
    }
}
