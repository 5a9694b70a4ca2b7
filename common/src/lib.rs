//! Common type definitions for Telamon.

pub mod address;
pub mod block_info;
pub mod error;
pub mod hash;
pub mod logs_bloom;
pub mod transaction;
pub mod validators;
pub mod votes;

pub use address::Address;
pub use block_info::BlockInfo;
pub use error::{BlockError, HashSection};
pub use hash::Hash;
pub use logs_bloom::LogsBloom;
pub use transaction::{Transaction, TransactionGroup, TransactionList};
pub use validators::ValidatorList;
pub use votes::{CommitVoteSet, EmptyVoteSet, VoteSetDecoder};

/// Identity of a block: the digest of its header encoding.
pub type BlockHash = Hash;

/// Identity of a transaction: the digest of its raw bytes.
pub type TxHash = Hash;

/// Identity of an ordered transaction list.
pub type TxListHash = Hash;

/// Identity of a commit vote set.
pub type VotesHash = Hash;

/// Identity of a validator list.
pub type ValidatorsHash = Hash;
