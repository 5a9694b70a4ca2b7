//! Commit vote sets.
//!
//! Vote construction and signature checking belong to consensus; the
//! block manager only transports vote sets, hashes them, and asks them
//! to verify themselves against the validator list in force.

use crate::{BlockError, BlockHash, ValidatorList, VotesHash};
use std::sync::Arc;

/// The commit votes embedded in a block, attesting its parent.
pub trait CommitVoteSet: Send + Sync + std::fmt::Debug {
    /// Wire bytes of the vote set.
    fn bytes(&self) -> Vec<u8>;

    /// Identity: digest of the wire bytes.
    fn hash(&self) -> VotesHash {
        VotesHash::digest(&self.bytes())
    }

    /// The vote round timestamp, used as the child block's timestamp.
    fn timestamp(&self) -> i64;

    /// Verify the votes against the block they attest and the validator
    /// list in force for it. `validators` is absent when the voted block
    /// is the genesis child's parent (genesis has no voters).
    fn verify(
        &self,
        voted_id: &BlockHash,
        voted_height: u64,
        validators: Option<&ValidatorList>,
    ) -> Result<(), BlockError>;
}

/// Decodes a vote set from wire bytes. Empty input decodes to the empty
/// vote set used at genesis.
pub type VoteSetDecoder =
    Arc<dyn Fn(&[u8]) -> Result<Arc<dyn CommitVoteSet>, BlockError> + Send + Sync>;

/// The vote set of the genesis block: no votes, zero timestamp.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyVoteSet;

impl CommitVoteSet for EmptyVoteSet {
    fn bytes(&self) -> Vec<u8> {
        Vec::new()
    }

    fn timestamp(&self) -> i64 {
        0
    }

    fn verify(
        &self,
        _voted_id: &BlockHash,
        _voted_height: u64,
        validators: Option<&ValidatorList>,
    ) -> Result<(), BlockError> {
        match validators {
            None => Ok(()),
            Some(_) => Err(BlockError::Engine("empty vote set with validators".into())),
        }
    }
}
