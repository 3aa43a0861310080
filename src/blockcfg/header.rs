use super::{
    BlockDate, BlockVersion, ChainDifficulty, EpochIndex, Hash, HeaderHash, SlotId, SoftwareVersion,
    StakeholderId,
};
use serde::{Deserialize, Serialize};

/// Header of a block, the unit exchanged with peers during chain
/// comparison. Immutable once constructed; `hash()` is its content
/// address.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum BlockHeader {
    Genesis(GenesisHeader),
    Main(MainHeader),
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct GenesisHeader {
    pub parent: HeaderHash,
    pub epoch: EpochIndex,
    pub difficulty: ChainDifficulty,
    pub content_hash: Hash,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct MainHeader {
    pub parent: HeaderHash,
    pub slot: SlotId,
    pub difficulty: ChainDifficulty,
    pub leader: StakeholderId,
    pub block_version: BlockVersion,
    pub software_version: SoftwareVersion,
    pub content_hash: Hash,
}

impl BlockHeader {
    pub fn hash(&self) -> HeaderHash {
        Hash::hash_of(self)
    }

    pub fn parent(&self) -> HeaderHash {
        match self {
            BlockHeader::Genesis(header) => header.parent,
            BlockHeader::Main(header) => header.parent,
        }
    }

    pub fn difficulty(&self) -> ChainDifficulty {
        match self {
            BlockHeader::Genesis(header) => header.difficulty,
            BlockHeader::Main(header) => header.difficulty,
        }
    }

    pub fn date(&self) -> BlockDate {
        match self {
            BlockHeader::Genesis(header) => BlockDate::Genesis(header.epoch),
            BlockHeader::Main(header) => BlockDate::Main(header.slot),
        }
    }

    pub fn content_hash(&self) -> Hash {
        match self {
            BlockHeader::Genesis(header) => header.content_hash,
            BlockHeader::Main(header) => header.content_hash,
        }
    }

    pub fn is_genesis(&self) -> bool {
        matches!(self, BlockHeader::Genesis(_))
    }

    /// Short rendering for the logs.
    pub fn description(&self) -> String {
        let hash = self.hash().to_string();
        format!("{}.. ({})", &hash[..8], self.date())
    }
}

impl From<GenesisHeader> for BlockHeader {
    fn from(header: GenesisHeader) -> Self {
        BlockHeader::Genesis(header)
    }
}

impl From<MainHeader> for BlockHeader {
    fn from(header: MainHeader) -> Self {
        BlockHeader::Main(header)
    }
}
