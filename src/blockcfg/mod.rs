//! The block data model of the chain: identifiers, dates, difficulties,
//! headers and blocks with their undo data.
//!
//! Everything here is immutable once constructed and content-addressed:
//! a [`Hash`] is the SHA-256 digest of the canonical binary encoding of
//! the value it names, and blocks reference their parent by hash only.

mod block;
mod header;

pub use self::block::{
    Block, Blund, DelegationCert, DelegationUndo, GenesisBlock, GenesisBody, MainBlock, MainBody,
    SscPayload, Tx, TxAux, TxIn, TxOut, TxUndo, TxWitness, Undo,
};
pub use self::header::{BlockHeader, GenesisHeader, MainHeader};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

pub type EpochIndex = u32;

/// Content address of a header, block body or transaction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash([u8; 32]);

pub type HeaderHash = Hash;
pub type TxId = Hash;

impl Hash {
    pub fn new(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }

    /// The all-zero hash, used as the parent of the hardcoded block0.
    pub fn zero() -> Self {
        Hash([0; 32])
    }

    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }

    /// Content address of any encodable value.
    pub fn hash_of<T: Serialize>(value: &T) -> Self {
        let bytes = bincode::serialize(value).expect("in-memory value failed to encode");
        Self::digest(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Identity of a stakeholder eligible to lead slots.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StakeholderId(pub [u8; 32]);

impl fmt::Display for StakeholderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for StakeholderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct SlotId {
    pub epoch: EpochIndex,
    pub slot: u32,
}

impl SlotId {
    pub fn new(epoch: EpochIndex, slot: u32) -> Self {
        SlotId { epoch, slot }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.epoch, self.slot)
    }
}

/// Date of a block: genesis blocks sit on the epoch boundary, strictly
/// between the last slot of the previous epoch and slot 0 of their own.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum BlockDate {
    Genesis(EpochIndex),
    Main(SlotId),
}

impl BlockDate {
    pub fn epoch(&self) -> EpochIndex {
        match self {
            BlockDate::Genesis(epoch) => *epoch,
            BlockDate::Main(slot) => slot.epoch,
        }
    }

    pub fn is_genesis(&self) -> bool {
        matches!(self, BlockDate::Genesis(_))
    }

    /// Position on a single timeline where each epoch holds
    /// `slots_per_epoch` slots preceded by one boundary position.
    /// Strictly increasing along any valid chain.
    pub fn position(&self, slots_per_epoch: u32) -> u64 {
        let era = slots_per_epoch as u64 + 1;
        match self {
            BlockDate::Genesis(epoch) => *epoch as u64 * era,
            BlockDate::Main(slot) => slot.epoch as u64 * era + slot.slot as u64 + 1,
        }
    }
}

impl fmt::Display for BlockDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockDate::Genesis(epoch) => write!(f, "{}.genesis", epoch),
            BlockDate::Main(slot) => write!(f, "{}", slot),
        }
    }
}

/// Accumulated chain weight: the number of main blocks on the chain.
/// Grows by exactly one per applied main block and is carried unchanged
/// into genesis blocks.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Default, Serialize, Deserialize,
)]
pub struct ChainDifficulty(pub u64);

impl ChainDifficulty {
    pub fn next(self) -> Self {
        ChainDifficulty(self.0 + 1)
    }
}

impl fmt::Display for ChainDifficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ChainDifficulty {
    fn from(value: u64) -> Self {
        ChainDifficulty(value)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct BlockVersion {
    pub major: u16,
    pub minor: u16,
    pub alt: u8,
}

impl BlockVersion {
    pub const CURRENT: BlockVersion = BlockVersion {
        major: 0,
        minor: 1,
        alt: 0,
    };
}

impl fmt::Display for BlockVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.alt)
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct SoftwareVersion {
    pub name: String,
    pub number: u32,
}

impl SoftwareVersion {
    pub fn current() -> Self {
        SoftwareVersion {
            name: "midgard".to_owned(),
            number: 1,
        }
    }
}

/// Per-epoch assignment of stakeholders to slot offsets. A well-formed
/// schedule has exactly `slots_per_epoch` entries.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct SlotLeaders(Vec<StakeholderId>);

impl SlotLeaders {
    pub fn new(leaders: Vec<StakeholderId>) -> Self {
        SlotLeaders(leaders)
    }

    pub fn leader_of(&self, slot: u32) -> Option<&StakeholderId> {
        self.0.get(slot as usize)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StakeholderId> {
        self.0.iter()
    }
}
