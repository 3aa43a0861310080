//! Seams between the ledger core and the components it collaborates
//! with: the slot clock, leader election, the consensus-payload
//! algorithm, the transaction layer and the delegation layer.
//!
//! All of them are injected as trait objects so the core stays
//! independent of any concrete implementation.

use crate::blockcfg::{
    Block, DelegationCert, DelegationUndo, EpochIndex, SlotId, SlotLeaders, SscPayload, TxAux,
    TxId, TxOut, TxUndo,
};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LeadershipError {
    #[error("slot leaders for epoch {0} are not computed yet")]
    Unknown(EpochIndex),
    #[error("leader election failed: {0}")]
    Computation(String),
}

/// A collaborator's reason for rejecting a block sequence.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct Rejection(pub String);

/// Source of the ambient current slot. Classification and verification
/// read it without holding any lock, so the value may already be stale
/// when it is used.
pub trait SlotClock: Send + Sync {
    fn current_slot(&self) -> SlotId;
}

pub trait LeaderElection: Send + Sync {
    /// Compute and persist the slot-leader schedule for `epoch`.
    /// Idempotent: recomputing an already known epoch is a no-op.
    fn compute_leaders(&self, epoch: EpochIndex) -> Result<(), LeadershipError>;

    fn leaders(&self, epoch: EpochIndex) -> Result<SlotLeaders, LeadershipError>;
}

pub trait SscService: Send + Sync {
    fn verify_payload(&self, strict: bool, blocks: &[Block]) -> Result<(), Rejection>;

    /// The payload this node would put into a block for `slot`, if any.
    fn local_payload(&self, slot: SlotId) -> Option<SscPayload>;
}

/// A mempool transaction together with the slot at which it was first
/// seen locally.
#[derive(Clone, Debug)]
pub struct PooledTx {
    pub tx: TxAux,
    pub received: SlotId,
}

pub trait TxService: Send + Sync {
    /// Verify the transactions of every block in the sequence, yielding
    /// one undo per block.
    fn verify_blocks(&self, blocks: &[Block]) -> Result<Vec<TxUndo>, Rejection>;

    /// Mempool transactions along with the undo recorded for each when
    /// it was admitted.
    fn local_txs_and_undo(&self) -> (Vec<PooledTx>, HashMap<TxId, Vec<TxOut>>);

    /// Order transactions so every input is satisfied by an earlier
    /// output. `None` when the dependency graph cannot be sorted.
    fn topological_sort(&self, txs: Vec<PooledTx>) -> Option<Vec<PooledTx>>;
}

pub trait DelegationService: Send + Sync {
    fn verify_blocks(&self, blocks: &[Block]) -> Result<Vec<DelegationUndo>, Rejection>;

    fn pending_certificates(&self) -> Vec<DelegationCert>;
}

/// The full set of collaborators a [`Blockchain`] is wired with.
///
/// [`Blockchain`]: crate::blockchain::Blockchain
#[derive(Clone)]
pub struct Services {
    pub clock: Arc<dyn SlotClock>,
    pub leader_election: Arc<dyn LeaderElection>,
    pub ssc: Arc<dyn SscService>,
    pub transactions: Arc<dyn TxService>,
    pub delegation: Arc<dyn DelegationService>,
}
