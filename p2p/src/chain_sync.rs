//! The header-sync chain: a checkpoint-gated, forward-linked progress list
//! used only during initial headers-first sync. Built incrementally as
//! `headers` batches from the loader are verified and appended; abandoned
//! (by switching to ordinary `getblocks` sync) once the final checkpoint is
//! reached.
use peerpool_common::{BlockHash, Height};
use thiserror::Error;

/// Failures that can occur while extending the header-sync chain.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    /// A header didn't connect to the chain's current tail.
    #[error("header at height {height} does not connect to the chain tail")]
    Disconnected {
        /// The height the header claimed.
        height: Height,
    },
    /// A header's `prev_blockhash` doesn't match the chain's current tail
    /// hash, even though its height is contiguous.
    #[error("header at height {height} does not link to the chain tail's hash")]
    PrevBlockMismatch {
        /// The height the header claimed.
        height: Height,
    },
    /// A header at a checkpoint height didn't match the hard-coded hash.
    #[error("header at checkpoint height {height} does not match the configured hash")]
    CheckpointMismatch {
        /// The checkpoint height that mismatched.
        height: Height,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Node {
    hash: BlockHash,
    height: Height,
}

/// A forward-only list of `(hash, height)` nodes from the chain's tip at
/// the start of sync to the next (and, eventually, final) checkpoint.
#[derive(Debug)]
pub struct HeaderSyncChain {
    nodes: Vec<Node>,
    checkpoints: Vec<(Height, BlockHash)>,
    next_checkpoint: usize,
    next_unrequested: usize,
}

impl HeaderSyncChain {
    /// Start a new header-sync chain at the given tip, targeting the
    /// network's checkpoint list. Returns `None` if there are no
    /// checkpoints ahead of the tip (checkpoint-gated sync has nothing to
    /// do).
    pub fn new(tip_hash: BlockHash, tip_height: Height, checkpoints: &[(Height, BlockHash)]) -> Option<Self> {
        let next_checkpoint = checkpoints.iter().position(|(h, _)| *h > tip_height)?;
        Some(Self {
            nodes: vec![Node { hash: tip_hash, height: tip_height }],
            checkpoints: checkpoints.to_vec(),
            next_checkpoint,
            next_unrequested: 0,
        })
    }

    /// The current tail of the chain: the most recently verified header.
    pub fn tail(&self) -> (BlockHash, Height) {
        let last = self.nodes.last().expect("chain always has at least the starting tip");
        (last.hash, last.height)
    }

    /// The next checkpoint this chain is working towards, if any remain.
    pub fn next_checkpoint(&self) -> Option<(Height, BlockHash)> {
        self.checkpoints.get(self.next_checkpoint).copied()
    }

    /// Whether the chain has reached its final configured checkpoint.
    pub fn is_complete(&self) -> bool {
        self.next_checkpoint >= self.checkpoints.len()
    }

    /// Append a newly verified header. `height` must be exactly one past
    /// the current tail, and `prev_blockhash` must equal the tail's hash;
    /// if the height lands on a checkpoint, `hash` must match that
    /// checkpoint's hash.
    pub fn push(&mut self, prev_blockhash: BlockHash, hash: BlockHash, height: Height) -> Result<(), SyncError> {
        let (tail_hash, tail_height) = self.tail();
        if height != tail_height + 1 {
            return Err(SyncError::Disconnected { height });
        }
        if prev_blockhash != tail_hash {
            return Err(SyncError::PrevBlockMismatch { height });
        }
        if let Some((checkpoint_height, checkpoint_hash)) = self.next_checkpoint() {
            if height == checkpoint_height {
                if hash != checkpoint_hash {
                    return Err(SyncError::CheckpointMismatch { height });
                }
                self.next_checkpoint += 1;
            }
        }
        self.nodes.push(Node { hash, height });
        Ok(())
    }

    /// Hand out the next batch of up to `max` unrequested hashes, in
    /// order, advancing the internal cursor so subsequent calls don't
    /// re-hand out the same hashes.
    pub fn next_batch(&mut self, max: usize) -> Vec<BlockHash> {
        let end = (self.next_unrequested + max).min(self.nodes.len());
        let batch = self.nodes[self.next_unrequested..end].iter().map(|n| n.hash).collect();
        self.next_unrequested = end;
        batch
    }

    /// Total nodes appended so far, including the starting tip.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether nothing has been appended beyond the starting tip.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(b: u8) -> BlockHash {
        BlockHash::from_bytes([b; 32])
    }

    #[test]
    fn returns_none_when_tip_is_past_every_checkpoint() {
        let checkpoints = [(100, hash(1))];
        assert!(HeaderSyncChain::new(hash(0), 200, &checkpoints).is_none());
    }

    #[test]
    fn rejects_non_contiguous_heights() {
        let checkpoints = [(10, hash(9))];
        let mut chain = HeaderSyncChain::new(hash(0), 0, &checkpoints).unwrap();
        assert_eq!(chain.push(hash(0), hash(5), 5), Err(SyncError::Disconnected { height: 5 }));
    }

    #[test]
    fn rejects_linkage_mismatch_even_with_contiguous_height() {
        let checkpoints = [(10, hash(9))];
        let mut chain = HeaderSyncChain::new(hash(0), 0, &checkpoints).unwrap();
        let err = chain.push(hash(0xee), hash(1), 1).unwrap_err();
        assert_eq!(err, SyncError::PrevBlockMismatch { height: 1 });
    }

    #[test]
    fn rejects_checkpoint_hash_mismatch() {
        let checkpoints = [(2, hash(9))];
        let mut chain = HeaderSyncChain::new(hash(0), 0, &checkpoints).unwrap();
        chain.push(hash(0), hash(1), 1).unwrap();
        let err = chain.push(hash(1), hash(0xff), 2).unwrap_err();
        assert_eq!(err, SyncError::CheckpointMismatch { height: 2 });
    }

    #[test]
    fn completes_after_the_final_checkpoint() {
        let checkpoints = [(1, hash(1)), (2, hash(2))];
        let mut chain = HeaderSyncChain::new(hash(0), 0, &checkpoints).unwrap();
        assert!(!chain.is_complete());
        chain.push(hash(0), hash(1), 1).unwrap();
        assert!(!chain.is_complete());
        chain.push(hash(1), hash(2), 2).unwrap();
        assert!(chain.is_complete());
    }

    #[test]
    fn next_batch_does_not_repeat_hashes() {
        let checkpoints = [(5, hash(5))];
        let mut chain = HeaderSyncChain::new(hash(0), 0, &checkpoints).unwrap();
        let mut prev = hash(0);
        for h in 1..=5u8 {
            chain.push(prev, hash(h), h as Height).unwrap();
            prev = hash(h);
        }
        let first = chain.next_batch(3);
        assert_eq!(first.len(), 3);
        let second = chain.next_batch(10);
        assert_eq!(second.len(), 3);
    }
}
