use crate::blockcfg::{Block, BlockHeader, Blund, Hash, HeaderHash, Undo};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("block not found in the storage")]
    BlockNotFound,
    #[error("cannot iterate between the two blocks")]
    CannotIterate,
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// One step of an atomic storage mutation.
#[derive(Clone, Debug)]
pub enum BatchOp {
    /// Store the blund and append it to the main chain.
    Apply(Blund),
    /// Remove the block from the main chain and drop its undo. The
    /// block itself stays known so its header can still be served.
    Rollback(HeaderHash),
}

/// All writes of one apply or rollback operation. Committed as a single
/// atomic unit so a crash cannot leave a half-applied run visible.
#[derive(Clone, Debug)]
pub struct StoreBatch {
    pub ops: Vec<BatchOp>,
    pub new_tip: HeaderHash,
}

/// Interface to the persistent block storage.
///
/// Reads may run concurrently with a write and observe the chain as of
/// before or after it, but never in between: `commit` applies a whole
/// batch atomically.
pub trait BlockStore: Send + Sync {
    /// Hash of the last block committed to the main chain.
    fn tip(&self) -> Result<HeaderHash, StorageError>;

    fn get_header(&self, hash: &HeaderHash) -> Result<Option<BlockHeader>, StorageError>;

    fn get_block(&self, hash: &HeaderHash) -> Result<Option<Block>, StorageError>;

    fn get_undo(&self, hash: &HeaderHash) -> Result<Option<Undo>, StorageError>;

    fn get_tip_block(&self) -> Result<Block, StorageError>;

    fn is_in_main_chain(&self, hash: &HeaderHash) -> Result<bool, StorageError>;

    /// Walk backward from `from` (inclusive) along parent links, newest
    /// first, collecting at most `n` headers.
    fn headers_by_depth(&self, from: &HeaderHash, n: u64)
        -> Result<Vec<BlockHeader>, StorageError>;

    /// Like [`headers_by_depth`], but stop as soon as `pred` rejects a
    /// header (the rejected header is not collected).
    ///
    /// [`headers_by_depth`]: Self::headers_by_depth
    fn headers_by_depth_while(
        &self,
        from: &HeaderHash,
        n: u64,
        pred: &dyn Fn(&BlockHeader) -> bool,
    ) -> Result<Vec<BlockHeader>, StorageError>;

    /// Walk forward along the main chain from `from` (inclusive),
    /// oldest first, while `pred` accepts the header and its distance
    /// from `from`.
    fn headers_up_while(
        &self,
        from: &HeaderHash,
        pred: &dyn Fn(&BlockHeader, u64) -> bool,
    ) -> Result<Vec<BlockHeader>, StorageError>;

    fn commit(&self, batch: StoreBatch) -> Result<(), StorageError>;
}

struct StoredBlock {
    block: Block,
    undo: Option<Undo>,
}

#[derive(Default)]
struct Inner {
    blocks: HashMap<HeaderHash, StoredBlock>,
    /// Main chain, oldest first; the last entry is the tip.
    main_chain: Vec<HeaderHash>,
    chain_index: HashMap<HeaderHash, usize>,
}

/// Reference in-memory implementation of [`BlockStore`]; the test suite
/// runs on it and embedders can use it for ephemeral nodes.
pub struct MemoryBlockStore {
    inner: RwLock<Inner>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        MemoryBlockStore {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemoryBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn head(&self) -> Option<HeaderHash> {
        self.main_chain.last().copied()
    }
}

impl BlockStore for MemoryBlockStore {
    fn tip(&self) -> Result<HeaderHash, StorageError> {
        let inner = self.inner.read().expect("storage lock poisoned");
        inner.head().ok_or(StorageError::BlockNotFound)
    }

    fn get_header(&self, hash: &HeaderHash) -> Result<Option<BlockHeader>, StorageError> {
        let inner = self.inner.read().expect("storage lock poisoned");
        Ok(inner.blocks.get(hash).map(|stored| stored.block.header()))
    }

    fn get_block(&self, hash: &HeaderHash) -> Result<Option<Block>, StorageError> {
        let inner = self.inner.read().expect("storage lock poisoned");
        Ok(inner.blocks.get(hash).map(|stored| stored.block.clone()))
    }

    fn get_undo(&self, hash: &HeaderHash) -> Result<Option<Undo>, StorageError> {
        let inner = self.inner.read().expect("storage lock poisoned");
        Ok(inner
            .blocks
            .get(hash)
            .and_then(|stored| stored.undo.clone()))
    }

    fn get_tip_block(&self) -> Result<Block, StorageError> {
        let inner = self.inner.read().expect("storage lock poisoned");
        let tip = inner.head().ok_or(StorageError::BlockNotFound)?;
        Ok(inner.blocks[&tip].block.clone())
    }

    fn is_in_main_chain(&self, hash: &HeaderHash) -> Result<bool, StorageError> {
        let inner = self.inner.read().expect("storage lock poisoned");
        Ok(inner.chain_index.contains_key(hash))
    }

    fn headers_by_depth(
        &self,
        from: &HeaderHash,
        n: u64,
    ) -> Result<Vec<BlockHeader>, StorageError> {
        self.headers_by_depth_while(from, n, &|_| true)
    }

    fn headers_by_depth_while(
        &self,
        from: &HeaderHash,
        n: u64,
        pred: &dyn Fn(&BlockHeader) -> bool,
    ) -> Result<Vec<BlockHeader>, StorageError> {
        let inner = self.inner.read().expect("storage lock poisoned");
        let mut headers = Vec::new();
        let mut cursor = *from;
        while (headers.len() as u64) < n {
            let stored = match inner.blocks.get(&cursor) {
                Some(stored) => stored,
                None => break,
            };
            let header = stored.block.header();
            if !pred(&header) {
                break;
            }
            cursor = header.parent();
            headers.push(header);
            if cursor == Hash::zero() {
                break;
            }
        }
        Ok(headers)
    }

    fn headers_up_while(
        &self,
        from: &HeaderHash,
        pred: &dyn Fn(&BlockHeader, u64) -> bool,
    ) -> Result<Vec<BlockHeader>, StorageError> {
        let inner = self.inner.read().expect("storage lock poisoned");
        let start = *inner
            .chain_index
            .get(from)
            .ok_or(StorageError::CannotIterate)?;
        let mut headers = Vec::new();
        for (distance, hash) in inner.main_chain[start..].iter().enumerate() {
            let header = inner.blocks[hash].block.header();
            if !pred(&header, distance as u64) {
                break;
            }
            headers.push(header);
        }
        Ok(headers)
    }

    fn commit(&self, batch: StoreBatch) -> Result<(), StorageError> {
        let mut inner = self.inner.write().expect("storage lock poisoned");

        // Dry-run the batch against the current head so a bad batch is
        // rejected without partial effects.
        let mut head = inner.head();
        for op in &batch.ops {
            match op {
                BatchOp::Apply(blund) => {
                    let expected = head.unwrap_or_else(Hash::zero);
                    if blund.block.parent() != expected {
                        return Err(StorageError::Backend(format!(
                            "block {} does not extend the chain head {}",
                            blund.hash(),
                            expected
                        )));
                    }
                    head = Some(blund.hash());
                }
                BatchOp::Rollback(hash) => {
                    if head != Some(*hash) {
                        return Err(StorageError::Backend(format!(
                            "cannot roll back {}: not the chain head",
                            hash
                        )));
                    }
                    let stored = inner.blocks.get(hash).ok_or(StorageError::BlockNotFound)?;
                    let parent = stored.block.parent();
                    head = if parent == Hash::zero() {
                        None
                    } else {
                        Some(parent)
                    };
                }
            }
        }
        if head != Some(batch.new_tip) {
            return Err(StorageError::Backend(
                "batch tip does not match the resulting chain head".to_owned(),
            ));
        }

        for op in batch.ops {
            match op {
                BatchOp::Apply(blund) => {
                    let hash = blund.hash();
                    inner.blocks.insert(
                        hash,
                        StoredBlock {
                            block: blund.block,
                            undo: Some(blund.undo),
                        },
                    );
                    let position = inner.main_chain.len();
                    inner.main_chain.push(hash);
                    inner.chain_index.insert(hash, position);
                }
                BatchOp::Rollback(hash) => {
                    inner.main_chain.pop();
                    inner.chain_index.remove(&hash);
                    if let Some(stored) = inner.blocks.get_mut(&hash) {
                        stored.undo = None;
                    }
                }
            }
        }
        Ok(())
    }
}
