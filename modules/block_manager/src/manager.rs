//! The block manager: owns the candidate tree, the finalized pointer,
//! the cache, and the persistent buckets, and is the entry point for
//! every public operation.

use crate::block::{self, Block, BlockHeaderFormat, BlockParams};
use crate::cache::BlockCache;
use crate::config::BlockManagerConfig;
use crate::store::{BlockStore, TransactionLocator};
use crate::syncer::Syncer;
use crate::tasks::{Canceler, ImportFlags, Task, TaskId};
use crate::transition::{
    ExecutionEngine, FinalizeFlags, Transition, TransitionCallback,
};
use crate::tree::{BlockNode, BlockTree};
use std::collections::HashMap;
use std::io::Read;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, Weak};
use telamon_common::{
    Address, BlockError, BlockHash, CommitVoteSet, Transaction, TransactionGroup, TxHash,
    VoteSetDecoder,
};
use tracing::{debug, info};

/// Receives the outcome of an import or propose: a fresh candidate
/// handle, or the error that stopped the task. Runs outside the
/// manager's critical section.
pub type CandidateCallback = Box<dyn FnOnce(Result<BlockCandidate, BlockError>) + Send>;

/// Chain-level identity and collaborators the manager needs.
pub struct ChainContext {
    /// Network id this replica is configured for.
    pub network_id: u32,
    /// Genesis transaction bytes.
    pub genesis: Vec<u8>,
    /// Local wallet address, used as proposer of proposed blocks.
    pub wallet: Address,
    /// Decoder for commit vote sets; empty input decodes to the
    /// genesis vote set.
    pub votes_decoder: VoteSetDecoder,
}

/// Optional override for proposed block timestamps.
pub trait Timestamper: Send + Sync {
    fn block_timestamp(&self, height: u64, votes_timestamp: i64) -> i64;
}

pub(crate) struct ManagerState {
    pub tree: BlockTree,
    pub finalized: Option<BlockHash>,
    pub cache: BlockCache,
    pub tasks: HashMap<TaskId, Task>,
    next_task_id: TaskId,
    finalization_cbs: Vec<Box<dyn FnMut(&Arc<Block>) -> bool + Send>>,
    pub running: bool,
}

impl ManagerState {
    fn new(cache_capacity: usize) -> Self {
        Self {
            tree: BlockTree::default(),
            finalized: None,
            cache: BlockCache::new(cache_capacity),
            tasks: HashMap::new(),
            next_task_id: 0,
            finalization_cbs: Vec::new(),
            running: true,
        }
    }

    pub fn alloc_task_id(&mut self) -> TaskId {
        let id = self.next_task_id;
        self.next_task_id += 1;
        id
    }
}

pub(crate) struct ManagerShared {
    pub chain: ChainContext,
    pub engine: Arc<dyn ExecutionEngine>,
    pub store: BlockStore,
    pub timestamper: Option<Arc<dyn Timestamper>>,
    pub syncer: Syncer<ManagerState>,
}

/// The block manager. Cheap to share; all state is behind one logical
/// critical section.
pub struct BlockManager {
    shared: Arc<ManagerShared>,
}

impl std::fmt::Debug for BlockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockManager").finish_non_exhaustive()
    }
}

/// An externally owned reference to a validated block; it keeps the
/// corresponding tree node alive. Copying must go through [`dup`];
/// dropping the handle releases the reference.
///
/// [`dup`]: BlockCandidate::dup
pub struct BlockCandidate {
    block: Arc<Block>,
    manager: Weak<ManagerShared>,
}

impl BlockCandidate {
    pub fn block(&self) -> &Arc<Block> {
        &self.block
    }

    pub fn id(&self) -> BlockHash {
        self.block.id()
    }

    pub fn height(&self) -> u64 {
        self.block.height()
    }

    /// Another handle to the same node, taking one more reference.
    pub fn dup(&self) -> BlockCandidate {
        if let Some(manager) = self.manager.upgrade() {
            let mut state = manager.syncer.begin();
            state.tree.ref_node(&self.block.id());
        }
        BlockCandidate { block: self.block.clone(), manager: self.manager.clone() }
    }

    /// Release the handle. Equivalent to dropping it.
    pub fn dispose(self) {}
}

impl Drop for BlockCandidate {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            let mut state = manager.syncer.begin();
            let id = self.block.id();
            if state.tree.contains(&id) {
                state.tree.unref(&id);
            }
        }
    }
}

impl std::fmt::Debug for BlockCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BlockCandidate").field(&self.block.id()).finish()
    }
}

/// Where a transaction landed and, once the next block is finalized,
/// its receipt.
pub struct TransactionInfo {
    engine: Arc<dyn ExecutionEngine>,
    block: Arc<Block>,
    index: usize,
    group: TransactionGroup,
    transaction: Transaction,
    result_block: Option<Arc<Block>>,
}

impl TransactionInfo {
    pub fn block(&self) -> &Arc<Block> {
        &self.block
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn group(&self) -> TransactionGroup {
        self.group
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    /// The receipt for this transaction. For normal transactions the
    /// receipts live in the result of the *next* block; until that
    /// block is finalized this is `ResultNotFinalized`.
    pub fn receipt(&self) -> Result<Vec<u8>, BlockError> {
        match &self.result_block {
            Some(result_block) => {
                self.engine.receipt(result_block.result(), self.group, self.index)
            }
            None => Err(BlockError::ResultNotFinalized),
        }
    }
}

/// Signals the two genesis pipeline phases into a blocking channel, so
/// the constructor can wait for them.
struct ChannelingCb {
    sender: Mutex<mpsc::Sender<Result<(), BlockError>>>,
}

impl TransitionCallback for ChannelingCb {
    fn on_validate(&self, result: Result<(), BlockError>) {
        let _ = self.sender.lock().unwrap().send(result);
    }

    fn on_execute(&self, result: Result<(), BlockError>) {
        let _ = self.sender.lock().unwrap().send(result);
    }
}

impl BlockManager {
    /// Open the store and bootstrap: create and finalize genesis on an
    /// empty database, or load the last finalized block and rebuild the
    /// tree root from its result.
    pub fn new(
        config: BlockManagerConfig,
        chain: ChainContext,
        engine: Arc<dyn ExecutionEngine>,
        timestamper: Option<Arc<dyn Timestamper>>,
    ) -> Result<Self, BlockError> {
        let store = BlockStore::open(&config.db_path)?;
        let shared = Arc::new(ManagerShared {
            chain,
            engine,
            store,
            timestamper,
            syncer: Syncer::new(ManagerState::new(config.cache_capacity)),
        });
        match shared.store.last_height()? {
            None | Some(0) => {
                info!("empty chain, finalizing genesis");
                shared.finalize_genesis_block()?;
            }
            Some(height) => {
                info!(height, "resuming from last finalized block");
                shared.bootstrap_from(height)?;
            }
        }
        Ok(Self { shared })
    }

    /// The finalized block at `id`, from cache or storage.
    pub fn get_block(&self, id: &BlockHash) -> Result<Arc<Block>, BlockError> {
        let mut state = self.shared.syncer.begin();
        self.shared.block_by_id(&mut state, id)
    }

    /// The finalized block at `height`, from cache or storage.
    pub fn get_block_by_height(&self, height: u64) -> Result<Arc<Block>, BlockError> {
        let mut state = self.shared.syncer.begin();
        self.shared.block_by_height(&mut state, height)
    }

    /// The last finalized block.
    pub fn get_last_block(&self) -> Result<Arc<Block>, BlockError> {
        let state = self.shared.syncer.begin();
        let finalized = state
            .finalized
            .ok_or_else(|| BlockError::InvalidState("no finalized block".into()))?;
        Ok(state.tree.get(&finalized).expect("finalized node in tree").block.clone())
    }

    /// Decode an unvalidated block from its wire encoding, verifying
    /// the declared section hashes. The result must go through
    /// [`import_block`] before it can be finalized.
    ///
    /// [`import_block`]: BlockManager::import_block
    pub fn new_block_data_from_reader(&self, mut r: impl Read) -> Result<Block, BlockError> {
        let mut bytes = Vec::new();
        r.read_to_end(&mut bytes).map_err(|e| BlockError::Codec(e.to_string()))?;
        let _state = self.shared.syncer.begin();
        block::decode_block_data(&bytes, &self.shared.chain.votes_decoder, |hash| {
            self.shared.engine.validator_list_from_hash(hash)
        })
    }

    /// Decode a block from `r` and import it. See [`import_block`].
    ///
    /// [`import_block`]: BlockManager::import_block
    pub fn import(
        &self,
        mut r: impl Read,
        flags: ImportFlags,
        cb: CandidateCallback,
    ) -> Result<Canceler, BlockError> {
        let mut bytes = Vec::new();
        r.read_to_end(&mut bytes).map_err(|e| BlockError::Codec(e.to_string()))?;
        let mut state = self.shared.syncer.begin();
        self.check_running(&state)?;
        let block = block::decode_block_data(&bytes, &self.shared.chain.votes_decoder, |hash| {
            self.shared.engine.validator_list_from_hash(hash)
        })?;
        debug!(id = %block.id(), height = block.height(), "import");
        self.shared.start_import(&mut state, Arc::new(block), flags, cb)
    }

    /// Drive `block` through verification and the execution pipeline.
    /// On success the callback delivers a candidate handle; with
    /// [`ImportFlags::Force`] a result divergence is recovered by
    /// forced state sync instead of failing.
    pub fn import_block(
        &self,
        block: Block,
        flags: ImportFlags,
        cb: CandidateCallback,
    ) -> Result<Canceler, BlockError> {
        let mut state = self.shared.syncer.begin();
        self.check_running(&state)?;
        debug!(id = %block.id(), height = block.height(), "import block");
        self.shared.start_import(&mut state, Arc::new(block), flags, cb)
    }

    /// Propose a block on top of `parent_id` carrying `votes`. The
    /// callback delivers a candidate handle for the assembled block.
    pub fn propose(
        &self,
        parent_id: BlockHash,
        votes: Arc<dyn CommitVoteSet>,
        cb: CandidateCallback,
    ) -> Result<Canceler, BlockError> {
        let mut state = self.shared.syncer.begin();
        self.check_running(&state)?;
        debug!(parent = %parent_id, "propose");
        self.shared.start_propose(&mut state, parent_id, votes, cb)
    }

    /// Durably commit the candidate's block, prune all competing
    /// branches, and promote it to finalized. The candidate's node must
    /// be a direct child of the current finalized node.
    pub fn finalize(&self, candidate: &BlockCandidate) -> Result<(), BlockError> {
        let mut state = self.shared.syncer.begin();
        self.check_running(&state)?;
        let id = candidate.id();
        let parent = state.tree.get(&id).and_then(|node| node.parent);
        if parent.is_none() || parent != state.finalized {
            return Err(BlockError::InvalidStatus { id });
        }
        self.shared.finalize_locked(&mut state, &id)
    }

    /// Reserved hook for two-phase finalization; currently a no-op.
    pub fn commit(&self, _candidate: &BlockCandidate) -> Result<(), BlockError> {
        Ok(())
    }

    /// A channel that delivers the block at `height`: immediately when
    /// already finalized, otherwise at the finalization that reaches
    /// it.
    pub fn wait_for_block(&self, height: u64) -> Result<mpsc::Receiver<Arc<Block>>, BlockError> {
        let mut state = self.shared.syncer.begin();
        let (sender, receiver) = mpsc::channel();
        match self.shared.block_by_height(&mut state, height) {
            Ok(block) => {
                let _ = sender.send(block);
                return Ok(receiver);
            }
            Err(BlockError::NotFound) => {}
            Err(e) => return Err(e),
        }
        state.finalization_cbs.push(Box::new(move |block| {
            if block.height() == height {
                let _ = sender.send(block.clone());
                true
            } else {
                false
            }
        }));
        Ok(receiver)
    }

    /// Ask the engine to call `cb` when a transaction becomes available
    /// on top of `parent_id`'s transition. Returns false (and drops
    /// `cb`) when one is available now or the parent is unknown.
    pub fn wait_for_transaction(
        &self,
        parent_id: &BlockHash,
        cb: Box<dyn FnOnce() + Send>,
    ) -> bool {
        let state = self.shared.syncer.begin();
        let Some(node) = state.tree.get(parent_id) else {
            return false;
        };
        self.shared.engine.wait_for_transaction(node.in_tr.mtr(), node.block.block_info(), cb)
    }

    /// Locate a finalized transaction by hash.
    pub fn get_transaction_info(&self, tx: &TxHash) -> Result<TransactionInfo, BlockError> {
        let mut state = self.shared.syncer.begin();
        let locator = self.shared.store.locator(tx)?.ok_or(BlockError::NotFound)?;
        let block =
            self.shared.block_by_height(&mut state, locator.block_height).map_err(|e| {
                BlockError::InvalidState(format!(
                    "block h={} not found: {e}",
                    locator.block_height
                ))
            })?;
        let transactions = match locator.group {
            TransactionGroup::Patch => block.patch_transactions(),
            TransactionGroup::Normal => block.normal_transactions(),
        };
        let transaction = transactions
            .get(locator.index_in_group as usize)
            .cloned()
            .ok_or_else(|| {
                BlockError::InvalidState(format!(
                    "transaction {:?} i={} not in block h={}",
                    locator.group, locator.index_in_group, locator.block_height
                ))
            })?;
        let result_block = match locator.group {
            TransactionGroup::Patch => Some(block.clone()),
            TransactionGroup::Normal => {
                let finalized_height = state
                    .finalized
                    .and_then(|id| state.tree.get(&id))
                    .map(|node| node.block.height())
                    .ok_or_else(|| BlockError::InvalidState("no finalized block".into()))?;
                if finalized_height < locator.block_height + 1 {
                    None
                } else {
                    Some(self.shared.block_by_height(&mut state, locator.block_height + 1)?)
                }
            }
        };
        Ok(TransactionInfo {
            engine: self.shared.engine.clone(),
            block,
            index: locator.index_in_group as usize,
            group: locator.group,
            transaction,
            result_block,
        })
    }

    /// Stop accepting operations and dispose the whole tree.
    pub fn term(&self) {
        let mut state = self.shared.syncer.begin();
        debug!("terminating block manager");
        if let Some(finalized) = state.finalized.take() {
            state.tree.remove_node(&finalized);
        }
        state.running = false;
    }

    /// Number of live nodes in the candidate tree.
    pub fn tree_len(&self) -> usize {
        self.shared.syncer.begin().tree.len()
    }

    /// Reference count of the node for `id`, if one exists.
    pub fn node_ref_count(&self, id: &BlockHash) -> Option<u32> {
        self.shared.syncer.begin().tree.ref_count(id)
    }

    fn check_running(&self, state: &ManagerState) -> Result<(), BlockError> {
        if state.running {
            Ok(())
        } else {
            Err(BlockError::InvalidState("block manager terminated".into()))
        }
    }
}

impl ManagerShared {
    /// Cache-through block lookup by id.
    pub(crate) fn block_by_id(
        self: &Arc<Self>,
        state: &mut ManagerState,
        id: &BlockHash,
    ) -> Result<Arc<Block>, BlockError> {
        if let Some(block) = state.cache.get(id) {
            return Ok(block);
        }
        let header_bytes = self.store.bytes_by_hash(id)?.ok_or(BlockError::NotFound)?;
        let block = Arc::new(self.block_from_header_bytes(&header_bytes)?);
        state.cache.put(block.clone());
        Ok(block)
    }

    /// Cache-through block lookup by height.
    pub(crate) fn block_by_height(
        self: &Arc<Self>,
        state: &mut ManagerState,
        height: u64,
    ) -> Result<Arc<Block>, BlockError> {
        if let Some(block) = state.cache.get_by_height(height) {
            return Ok(block);
        }
        let id = self.store.header_hash_at(height)?.ok_or(BlockError::NotFound)?;
        self.block_by_id(state, &id).map_err(|e| match e {
            // The height index pointed at it, so absence is corruption.
            BlockError::NotFound => {
                BlockError::InvalidState(format!("block h={height} by hash={id} not found"))
            }
            other => other,
        })
    }

    /// Rebuild a block from stored header bytes. Transaction lists and
    /// the validator list are resolved from the engine by hash, votes
    /// from the byte bucket.
    fn block_from_header_bytes(self: &Arc<Self>, bytes: &[u8]) -> Result<Block, BlockError> {
        let header: BlockHeaderFormat =
            minicbor::decode(bytes).map_err(|e| BlockError::Codec(e.to_string()))?;
        let patch_transactions = self
            .engine
            .transaction_list_from_hash(&header.patch_transactions_hash)
            .ok_or_else(|| {
                BlockError::InvalidState(format!(
                    "no transaction list for {}",
                    header.patch_transactions_hash
                ))
            })?;
        let normal_transactions = self
            .engine
            .transaction_list_from_hash(&header.normal_transactions_hash)
            .ok_or_else(|| {
                BlockError::InvalidState(format!(
                    "no transaction list for {}",
                    header.normal_transactions_hash
                ))
            })?;
        let next_validators = self
            .engine
            .validator_list_from_hash(&header.next_validators_hash)
            .ok_or_else(|| {
                BlockError::InvalidState(format!(
                    "no validator list for {}",
                    header.next_validators_hash
                ))
            })?;
        let votes_bytes = self
            .store
            .bytes_by_hash(&header.votes_hash)?
            .ok_or_else(|| BlockError::InvalidState("missing vote set bytes".into()))?;
        let votes = (self.chain.votes_decoder)(&votes_bytes)?;
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
            next_validators: Some(next_validators),
            votes,
        }))
    }

    /// Create genesis from the configured genesis transactions: execute
    /// them synchronously through a blocking channel, then finalize the
    /// assembled block.
    fn finalize_genesis_block(self: &Arc<Self>) -> Result<(), BlockError> {
        {
            let state = self.syncer.begin();
            if state.finalized.is_some() {
                return Err(BlockError::InvalidState("genesis with finalized block".into()));
            }
        }
        let mtr = self.engine.initial_transition(None, None)?;
        let in_tr = Transition::initial(self.engine.clone(), mtr.clone());
        let genesis_txs =
            self.engine.genesis_transactions(&self.chain.genesis, self.chain.network_id)?;
        let (sender, receiver) = mpsc::channel();
        let cb: Arc<dyn TransitionCallback> =
            Arc::new(ChannelingCb { sender: Mutex::new(sender) });

        let genesis_tr = {
            let _state = self.syncer.begin();
            in_tr.transit(genesis_txs, telamon_common::BlockInfo::new(0, 0), Some(cb))?
        };

        // Wait for the genesis transition: one validate, one execute.
        for _ in 0..2 {
            receiver
                .recv()
                .map_err(|_| BlockError::InvalidState("genesis execution aborted".into()))??;
        }

        let votes = (self.chain.votes_decoder)(&[])?;
        let next_validators = genesis_tr.mtr().next_validators().ok_or_else(|| {
            BlockError::InvalidState("genesis transition has no validator list".into())
        })?;
        let block = Arc::new(Block::new(BlockParams {
            height: 0,
            timestamp: 0,
            proposer: None,
            prev_id: None,
            logs_bloom: mtr.logs_bloom(),
            result: mtr.result(),
            patch_transactions: genesis_tr.mtr().patch_transactions(),
            normal_transactions: genesis_tr.mtr().normal_transactions(),
            next_validators_hash: next_validators.hash(),
            next_validators: Some(next_validators),
            votes,
        }));
        info!(id = %block.id(), "genesis block assembled");

        let genesis_mtr = genesis_tr.mtr().clone();
        let node = BlockNode::new(block, in_tr, genesis_tr);
        {
            let mut state = self.syncer.begin();
            let id = state.tree.insert_detached(node);
            self.finalize_locked(&mut state, &id)?;
        }
        self.engine.finalize(&genesis_mtr, FinalizeFlags::all())?;
        Ok(())
    }

    /// Rebuild the tree root from the last finalized block: verify the
    /// network id, seed an initial transition with the stored result,
    /// and pre-execute its normal transactions for children.
    fn bootstrap_from(self: &Arc<Self>, height: u64) -> Result<(), BlockError> {
        let mut state = self.syncer.begin();
        let block = self.block_by_height(&mut state, height)?;
        let network_id = self.engine.network_id(block.result())?;
        if network_id != self.chain.network_id {
            return Err(BlockError::InvalidNetwork {
                stored: network_id,
                configured: self.chain.network_id,
            });
        }
        let mtr = self.engine.initial_transition(
            Some(block.result().to_vec()),
            block.next_validators().cloned(),
        )?;
        let in_tr = Transition::initial(self.engine.clone(), mtr);
        let preexe =
            in_tr.transit(block.normal_transactions().clone(), block.block_info(), None)?;
        let node = BlockNode::new(block, in_tr, preexe);
        let id = state.tree.insert_detached(node);
        state.finalized = Some(id);
        state.tree.ref_node(&id);
        Ok(())
    }

    /// Persist the node's block, finalize its transitions engine-side,
    /// then prune its siblings and promote it. Persistence and engine
    /// failures both abort before the tree is touched, so the finalized
    /// pointer and the tree stay consistent and the call can be
    /// retried.
    pub(crate) fn finalize_locked(
        self: &Arc<Self>,
        state: &mut ManagerState,
        id: &BlockHash,
    ) -> Result<(), BlockError> {
        let node = state
            .tree
            .get(id)
            .ok_or_else(|| BlockError::InvalidState("finalizing unknown node".into()))?;
        let block = node.block.clone();
        let in_mtr = node.in_tr.mtr().clone();
        let preexe_mtr = node.preexe.mtr().clone();

        self.store.put_bytes(&block.id(), &block.marshal_header())?;
        self.store.put_bytes(&block.votes().hash(), &block.votes().bytes())?;
        for (index, tx) in block.patch_transactions().iter().enumerate() {
            let locator = TransactionLocator {
                block_height: block.height(),
                group: TransactionGroup::Patch,
                index_in_group: index as u32,
            };
            self.store.put_locator(&tx.id(), &locator)?;
        }
        for (index, tx) in block.normal_transactions().iter().enumerate() {
            let locator = TransactionLocator {
                block_height: block.height(),
                group: TransactionGroup::Normal,
                index_in_group: index as u32,
            };
            self.store.put_locator(&tx.id(), &locator)?;
        }
        self.store.put_header_hash(block.height(), &block.id())?;
        self.store.put_last_height(block.height())?;
        self.store.persist()?;

        if state.finalized.is_some() {
            self.engine
                .finalize(&in_mtr, FinalizeFlags::PatchTransactions | FinalizeFlags::Result)?;
        }
        self.engine.finalize(&preexe_mtr, FinalizeFlags::NormalTransactions)?;

        if let Some(finalized) = state.finalized {
            state.tree.remove_node_except(&finalized, id);
        }
        state.finalized = Some(*id);
        state.tree.ref_node(id);
        debug!(id = %id, height = block.height(), "finalized block");

        let mut at = 0;
        while at < state.finalization_cbs.len() {
            if (state.finalization_cbs[at])(&block) {
                state.finalization_cbs.swap_remove(at);
            } else {
                at += 1;
            }
        }
        Ok(())
    }

    /// A fresh candidate handle for the node at `id`, taking one
    /// reference.
    pub(crate) fn new_candidate(
        self: &Arc<Self>,
        state: &mut ManagerState,
        id: &BlockHash,
    ) -> BlockCandidate {
        state.tree.ref_node(id);
        let block = state.tree.get(id).expect("candidate node in tree").block.clone();
        BlockCandidate { block, manager: Arc::downgrade(self) }
    }
}
