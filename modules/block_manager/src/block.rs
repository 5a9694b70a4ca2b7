//! Block record and its two-part wire format.
//!
//! A block is encoded as a header record followed by a body record. The
//! header carries the hashes of the body sections; identity is the hash
//! of the header encoding. Decoding re-verifies every declared hash
//! against the recomputed hash of the materialized section.

use minicbor::bytes::ByteVec;
use std::sync::{Arc, OnceLock};
use telamon_common::{
    Address, BlockError, BlockHash, CommitVoteSet, HashSection, LogsBloom, TransactionList,
    ValidatorList, ValidatorsHash, VoteSetDecoder,
};

/// Header record: everything needed to identify a block and check the
/// body against it.
#[derive(Debug, Clone, minicbor::Encode, minicbor::Decode)]
pub(crate) struct BlockHeaderFormat {
    #[n(0)]
    pub height: u64,
    #[n(1)]
    pub timestamp: i64,
    #[n(2)]
    pub proposer: Option<Address>,
    #[n(3)]
    pub prev_id: Option<BlockHash>,
    #[n(4)]
    pub patch_transactions_hash: telamon_common::TxListHash,
    #[n(5)]
    pub normal_transactions_hash: telamon_common::TxListHash,
    #[n(6)]
    pub next_validators_hash: ValidatorsHash,
    #[n(7)]
    pub logs_bloom: LogsBloom,
    #[cbor(n(8), with = "minicbor::bytes")]
    pub result: Vec<u8>,
    #[n(9)]
    pub votes_hash: telamon_common::VotesHash,
}

/// Body record: the payloads whose hashes the header declares.
#[derive(Debug, Clone, minicbor::Encode, minicbor::Decode)]
pub(crate) struct BlockBodyFormat {
    #[n(0)]
    pub patch_transactions: Vec<ByteVec>,
    #[n(1)]
    pub normal_transactions: Vec<ByteVec>,
    #[cbor(n(2), with = "minicbor::bytes")]
    pub votes: Vec<u8>,
}

/// Constructor parameters for [`Block`].
pub struct BlockParams {
    pub height: u64,
    pub timestamp: i64,
    pub proposer: Option<Address>,
    pub prev_id: Option<BlockHash>,
    pub logs_bloom: LogsBloom,
    pub result: Vec<u8>,
    pub patch_transactions: TransactionList,
    pub normal_transactions: TransactionList,
    pub next_validators_hash: ValidatorsHash,
    pub next_validators: Option<ValidatorList>,
    pub votes: Arc<dyn CommitVoteSet>,
}

/// An immutable block record.
///
/// A freshly decoded block is unvalidated data; it becomes a candidate
/// only after the import pipeline has executed and verified it. The
/// validator list may be absent until then.
#[derive(Clone)]
pub struct Block {
    height: u64,
    timestamp: i64,
    proposer: Option<Address>,
    prev_id: Option<BlockHash>,
    logs_bloom: LogsBloom,
    result: Vec<u8>,
    patch_transactions: TransactionList,
    normal_transactions: TransactionList,
    next_validators_hash: ValidatorsHash,
    next_validators: Option<ValidatorList>,
    votes: Arc<dyn CommitVoteSet>,
    id: OnceLock<BlockHash>,
}

impl Block {
    pub fn new(params: BlockParams) -> Self {
        Self {
            height: params.height,
            timestamp: params.timestamp,
            proposer: params.proposer,
            prev_id: params.prev_id,
            logs_bloom: params.logs_bloom,
            result: params.result,
            patch_transactions: params.patch_transactions,
            normal_transactions: params.normal_transactions,
            next_validators_hash: params.next_validators_hash,
            next_validators: params.next_validators,
            votes: params.votes,
            id: OnceLock::new(),
        }
    }

    /// Identity: the hash of the header encoding. Computed once.
    pub fn id(&self) -> BlockHash {
        *self.id.get_or_init(|| BlockHash::digest(&self.marshal_header()))
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn proposer(&self) -> Option<&Address> {
        self.proposer.as_ref()
    }

    pub fn prev_id(&self) -> Option<BlockHash> {
        self.prev_id
    }

    pub fn logs_bloom(&self) -> &LogsBloom {
        &self.logs_bloom
    }

    pub fn result(&self) -> &[u8] {
        &self.result
    }

    pub fn patch_transactions(&self) -> &TransactionList {
        &self.patch_transactions
    }

    pub fn normal_transactions(&self) -> &TransactionList {
        &self.normal_transactions
    }

    pub fn next_validators_hash(&self) -> ValidatorsHash {
        self.next_validators_hash
    }

    /// The validator set effective for votes on the block after this
    /// one. Absent until the block has been executed or loaded from
    /// finalized storage.
    pub fn next_validators(&self) -> Option<&ValidatorList> {
        self.next_validators.as_ref()
    }

    pub fn votes(&self) -> &Arc<dyn CommitVoteSet> {
        &self.votes
    }

    /// What the engine sees of this block.
    pub fn block_info(&self) -> telamon_common::BlockInfo {
        telamon_common::BlockInfo::new(self.height, self.timestamp)
    }

    /// Copy with the validator list filled in from execution. The header
    /// (and therefore the id) is unchanged; the list must match the
    /// declared hash.
    pub(crate) fn with_next_validators(&self, validators: ValidatorList) -> Self {
        let mut block = self.clone();
        block.next_validators = Some(validators);
        block
    }

    pub(crate) fn header_format(&self) -> BlockHeaderFormat {
        BlockHeaderFormat {
            height: self.height,
            timestamp: self.timestamp,
            proposer: self.proposer,
            prev_id: self.prev_id,
            patch_transactions_hash: self.patch_transactions.hash(),
            normal_transactions_hash: self.normal_transactions.hash(),
            next_validators_hash: self.next_validators_hash,
            logs_bloom: self.logs_bloom,
            result: self.result.clone(),
            votes_hash: self.votes.hash(),
        }
    }

    fn body_format(&self) -> BlockBodyFormat {
        BlockBodyFormat {
            patch_transactions: self
                .patch_transactions
                .to_raw()
                .into_iter()
                .map(ByteVec::from)
                .collect(),
            normal_transactions: self
                .normal_transactions
                .to_raw()
                .into_iter()
                .map(ByteVec::from)
                .collect(),
            votes: self.votes.bytes(),
        }
    }

    /// Encode the header record.
    pub fn marshal_header(&self) -> Vec<u8> {
        minicbor::to_vec(self.header_format()).expect("vec encoding cannot fail")
    }

    /// Encode the body record.
    pub fn marshal_body(&self) -> Vec<u8> {
        minicbor::to_vec(self.body_format()).expect("vec encoding cannot fail")
    }

    /// Encode header followed by body.
    pub fn marshal(&self) -> Vec<u8> {
        let mut bytes = self.marshal_header();
        bytes.extend_from_slice(&self.marshal_body());
        bytes
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id())
            .field("height", &self.height)
            .field("prev_id", &self.prev_id)
            .finish()
    }
}

/// Materialize a block from decoded header and body records, verifying
/// each hash the header declares against the recomputed hash of the
/// corresponding section.
pub(crate) fn block_from_formats(
    header: BlockHeaderFormat,
    body: BlockBodyFormat,
    votes_decoder: &VoteSetDecoder,
    next_validators: Option<ValidatorList>,
) -> Result<Block, BlockError> {
    let patch_transactions =
        TransactionList::from_raw(body.patch_transactions.into_iter().map(Vec::from).collect());
    if patch_transactions.hash() != header.patch_transactions_hash {
        return Err(BlockError::BadHash { section: HashSection::PatchTransactions });
    }
    let normal_transactions =
        TransactionList::from_raw(body.normal_transactions.into_iter().map(Vec::from).collect());
    if normal_transactions.hash() != header.normal_transactions_hash {
        return Err(BlockError::BadHash { section: HashSection::NormalTransactions });
    }
    let votes = votes_decoder(&body.votes)?;
    if votes.hash() != header.votes_hash {
        return Err(BlockError::BadHash { section: HashSection::Votes });
    }
    Ok(Block::new(BlockParams {
        height: header.height,
        timestamp: header.timestamp,
        proposer: header.proposer,
        prev_id: header.prev_id,
        logs_bloom: header.logs_bloom,
        result: header.result,
        patch_transactions,
        normal_transactions,
        next_validators_hash: header.next_validators_hash,
        next_validators,
        votes,
    }))
}

/// Decode a header-and-body stream into an unvalidated block. The
/// validator list is resolved from the declared hash via `lookup` and
/// may legitimately be unknown until the block executes.
pub(crate) fn decode_block_data(
    bytes: &[u8],
    votes_decoder: &VoteSetDecoder,
    lookup: impl FnOnce(&ValidatorsHash) -> Option<ValidatorList>,
) -> Result<Block, BlockError> {
    let mut decoder = minicbor::Decoder::new(bytes);
    let header: BlockHeaderFormat =
        decoder.decode().map_err(|e| BlockError::Codec(e.to_string()))?;
    let body: BlockBodyFormat =
        decoder.decode().map_err(|e| BlockError::Codec(e.to_string()))?;
    let next_validators = lookup(&header.next_validators_hash);
    block_from_formats(header, body, votes_decoder, next_validators)
}

/// Structural and vote checks for an unvalidated block against its
/// resolved parent. `validators` is the voted block's validator list in
/// force, absent for the genesis child.
pub fn verify_block(
    block: &Block,
    parent: &Block,
    validators: Option<&ValidatorList>,
) -> Result<(), BlockError> {
    if block.height() != parent.height() + 1 {
        return Err(BlockError::InvalidState(format!(
            "block height {} does not follow parent height {}",
            block.height(),
            parent.height()
        )));
    }
    if block.prev_id() != Some(parent.id()) {
        return Err(BlockError::InvalidState(format!(
            "block prev id {:?} does not match parent id {}",
            block.prev_id(),
            parent.id()
        )));
    }
    block.votes().verify(&parent.id(), parent.height(), validators)
}
