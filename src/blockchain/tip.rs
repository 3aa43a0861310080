use crate::blockcfg::HeaderHash;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Exclusive token over the hash of the most recently applied block.
///
/// Every tip-mutating operation (apply, rollback, block creation) must
/// acquire the token first, which serializes them globally. The guard
/// releases the token when dropped, on every exit path, so a failing
/// operation can never leave the tip locked or undefined: the stored
/// hash only moves through explicit [`TipGuard::set`] calls.
#[derive(Clone)]
pub struct Tip {
    inner: Arc<Mutex<HeaderHash>>,
}

impl Tip {
    pub fn new(hash: HeaderHash) -> Self {
        Tip {
            inner: Arc::new(Mutex::new(hash)),
        }
    }

    pub async fn lock(&self) -> TipGuard<'_> {
        TipGuard {
            guard: self.inner.lock().await,
        }
    }

    /// Advisory read of the current tip. The value may be stale as soon
    /// as it is returned; callers intending to mutate must re-validate
    /// under the token.
    pub async fn snapshot(&self) -> HeaderHash {
        *self.inner.lock().await
    }
}

pub struct TipGuard<'a> {
    guard: MutexGuard<'a, HeaderHash>,
}

impl<'a> TipGuard<'a> {
    pub fn hash(&self) -> HeaderHash {
        *self.guard
    }

    pub fn set(&mut self, hash: HeaderHash) {
        *self.guard = hash;
    }
}
