//! Error types for block manager operations.

use crate::BlockHash;

/// Section of the block wire format whose declared hash failed
/// re-verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashSection {
    PatchTransactions,
    NormalTransactions,
    Votes,
}

impl std::fmt::Display for HashSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HashSection::PatchTransactions => f.write_str("patch transactions"),
            HashSection::NormalTransactions => f.write_str("normal transactions"),
            HashSection::Votes => f.write_str("votes"),
        }
    }
}

/// Errors raised or forwarded by the block manager.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BlockError {
    /// A block or transaction is not present.
    #[error("not found")]
    NotFound,

    /// An imported block references an unknown parent.
    #[error("invalid previous id: {id}")]
    InvalidPreviousId { id: BlockHash },

    /// A proposal references an unknown parent.
    #[error("no parent block: {id}")]
    NoParentBlock { id: BlockHash },

    /// Finalize was called on a block that is not a direct child of the
    /// finalized block.
    #[error("invalid status for block {id}")]
    InvalidStatus { id: BlockHash },

    /// An invariant the persistent state was expected to hold does not.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The persisted chain belongs to a different network.
    #[error("invalid network: database {stored:#x}, configured {configured:#x}")]
    InvalidNetwork { stored: u32, configured: u32 },

    /// A declared hash in the wire format does not match the recomputed
    /// hash of the materialized section.
    #[error("bad {section} hash")]
    BadHash { section: HashSection },

    /// Execution produced a result that disagrees with the block's
    /// declared result.
    #[error("mismatched result for block {id}")]
    MismatchedResult { id: BlockHash },

    /// The task was aborted before producing a candidate.
    #[error("canceled")]
    Canceled,

    /// The block holding the receipts of this transaction is not
    /// finalized yet.
    #[error("result not finalized")]
    ResultNotFinalized,

    /// Failure reported by the execution engine.
    #[error("engine: {0}")]
    Engine(String),

    /// Failure in the persistent store.
    #[error("storage: {0}")]
    Storage(String),

    /// Failure while encoding or decoding the wire format.
    #[error("codec: {0}")]
    Codec(String),
}

impl BlockError {
    /// True for the kinds that mean "no such entry" rather than failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BlockError::NotFound)
    }
}
