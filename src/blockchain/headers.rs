use super::{chain::Blockchain, storage::StorageError};
use crate::blockcfg::{BlockHeader, Hash, HeaderHash};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HeadersError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("none of the checkpoints intersects the main chain")]
    NoIntersection,
    #[error("the requested range is not a valid chain path")]
    BadRange,
    #[error("the requested range exceeds the allowed size")]
    BoundExceeded,
}

impl Blockchain {
    /// Serve a header range to a peer, newest first.
    ///
    /// Walks backward from `start` (the tip when absent) until the
    /// child of one of the peer's checkpoints is reached. When the peer
    /// is too far behind for that to fit in one message, falls back to
    /// recovery listing: the headers directly above the newest
    /// checkpoint still on our main chain, bounded the same way, so the
    /// peer always receives a usable batch.
    pub fn get_headers_from_many_to(
        &self,
        checkpoints: &[HeaderHash],
        start: Option<HeaderHash>,
    ) -> Result<Vec<BlockHeader>, HeadersError> {
        let limit = self.settings.recovery_headers_message;
        let checkpoint_set: HashSet<HeaderHash> = checkpoints.iter().copied().collect();
        let start = match start {
            Some(hash) => hash,
            None => self.storage.tip()?,
        };

        let collected = self.storage.headers_by_depth_while(
            &start,
            limit as u64 + 1,
            &|header| !checkpoint_set.contains(&header.hash()),
        )?;

        if collected.is_empty() {
            // the start itself is one of the peer's checkpoints
            let header = self
                .storage
                .get_header(&start)?
                .ok_or(StorageError::BlockNotFound)?;
            return Ok(vec![header]);
        }
        if collected.len() <= limit {
            let reached_checkpoint = collected
                .last()
                .map(|oldest| checkpoint_set.contains(&oldest.parent()))
                .unwrap_or(false);
            if reached_checkpoint {
                return Ok(collected);
            }
        }

        self.recovery_listing(&checkpoint_set, limit)
    }

    fn recovery_listing(
        &self,
        checkpoints: &HashSet<HeaderHash>,
        limit: usize,
    ) -> Result<Vec<BlockHeader>, HeadersError> {
        let mut best: Option<BlockHeader> = None;
        for checkpoint in checkpoints {
            if !self.storage.is_in_main_chain(checkpoint)? {
                continue;
            }
            let header = self
                .storage
                .get_header(checkpoint)?
                .ok_or(StorageError::BlockNotFound)?;
            let newer = match &best {
                Some(best) => header.difficulty() > best.difficulty(),
                None => true,
            };
            if newer {
                best = Some(header);
            }
        }
        let best = best.ok_or(HeadersError::NoIntersection)?;

        let forward = self
            .storage
            .headers_up_while(&best.hash(), &|_, distance| distance <= limit as u64)?;
        let mut above: Vec<BlockHeader> = forward.into_iter().skip(1).take(limit).collect();
        if above.is_empty() {
            // the best checkpoint already is our tip
            return Ok(vec![best]);
        }
        above.reverse();
        Ok(above)
    }

    /// Exponentially spaced ancestor hashes, newest first: offsets
    /// 0, 1, 2, 4, 8, … from `from` (the tip when absent), bounded by
    /// the security parameter. The oldest loaded ancestor is always
    /// included so two peers comparing chains can at least agree on the
    /// far end.
    pub fn get_headers_older_exp(
        &self,
        from: Option<HeaderHash>,
    ) -> Result<Vec<HeaderHash>, HeadersError> {
        let from = match from {
            Some(hash) => hash,
            None => self.storage.tip()?,
        };
        let headers = self
            .storage
            .headers_by_depth(&from, self.settings.blk_security_param + 1)?;
        if headers.is_empty() {
            return Err(StorageError::BlockNotFound.into());
        }

        let mut hashes = Vec::new();
        let mut offset: usize = 0;
        while offset < headers.len() {
            hashes.push(headers[offset].hash());
            offset = if offset == 0 { 1 } else { offset * 2 };
        }
        let oldest = headers[headers.len() - 1].hash();
        if hashes.last() != Some(&oldest) {
            hashes.push(oldest);
        }
        Ok(hashes)
    }

    /// Inclusive hash range between two known, ordered hashes, oldest
    /// first. Refused when `newer` does not descend from `older` or the
    /// range exceeds the message bound.
    pub fn get_headers_range(
        &self,
        older: HeaderHash,
        newer: HeaderHash,
    ) -> Result<Vec<HeaderHash>, HeadersError> {
        let limit = self.settings.recovery_headers_message;
        let mut hashes = Vec::new();
        let mut cursor = newer;
        loop {
            hashes.push(cursor);
            if cursor == older {
                break;
            }
            if hashes.len() >= limit {
                return Err(HeadersError::BoundExceeded);
            }
            let header = self
                .storage
                .get_header(&cursor)?
                .ok_or(HeadersError::BadRange)?;
            cursor = header.parent();
            if cursor == Hash::zero() {
                return Err(HeadersError::BadRange);
            }
        }
        hashes.reverse();
        Ok(hashes)
    }
}
