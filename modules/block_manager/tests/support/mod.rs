//! Test support: a deterministic in-process execution engine and vote
//! sets for driving the manager end to end.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use telamon_common::{
    Address, BlockError, BlockHash, BlockInfo, CommitVoteSet, EmptyVoteSet, LogsBloom,
    Transaction, TransactionGroup, TransactionList, TxListHash, ValidatorList, ValidatorsHash,
    VoteSetDecoder, VotesHash,
};
use telamon_module_block_manager::{
    BlockCandidate, BlockManager, BlockManagerConfig, CandidateCallback, ChainContext,
    EngineTransition, ExecutionEngine, FinalizeFlags, TransitionCallback,
};

pub const NETWORK_ID: u32 = 7;
pub const GENESIS_TX: &[u8] = b"genesis-tx";

/// Vote set that always verifies; bytes round-trip through the decoder.
#[derive(Debug)]
pub struct TestVotes {
    raw: Vec<u8>,
    timestamp: i64,
}

impl TestVotes {
    pub fn new(round: u64) -> Arc<dyn CommitVoteSet> {
        Arc::new(Self { raw: format!("votes-{round}").into_bytes(), timestamp: 1_000 + round as i64 })
    }
}

impl CommitVoteSet for TestVotes {
    fn bytes(&self) -> Vec<u8> {
        self.raw.clone()
    }

    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn verify(
        &self,
        _voted_id: &BlockHash,
        _voted_height: u64,
        _validators: Option<&ValidatorList>,
    ) -> Result<(), BlockError> {
        Ok(())
    }
}

pub fn votes_decoder() -> VoteSetDecoder {
    Arc::new(|bytes| {
        if bytes.is_empty() {
            Ok(Arc::new(EmptyVoteSet) as Arc<dyn CommitVoteSet>)
        } else {
            Ok(Arc::new(TestVotes { raw: bytes.to_vec(), timestamp: 1_000 })
                as Arc<dyn CommitVoteSet>)
        }
    })
}

pub fn chain_context(network_id: u32) -> ChainContext {
    ChainContext {
        network_id,
        genesis: GENESIS_TX.to_vec(),
        wallet: Address::new([0xAA; 20]),
        votes_decoder: votes_decoder(),
    }
}

struct PendingExec {
    cb: Arc<dyn TransitionCallback>,
    canceled: Arc<AtomicBool>,
}

/// Shared between the engine and its transitions: execution scheduling
/// and observation counters.
#[derive(Default)]
pub struct EngineCore {
    /// When set, transitions notify inline from `execute`; otherwise
    /// they wait for [`FakeEngine::release_pending`].
    auto: AtomicBool,
    /// When set, `finalize` refuses with an engine error.
    fail_finalize: AtomicBool,
    pending: Mutex<Vec<PendingExec>>,
    pub cancel_count: AtomicUsize,
    pub sync_count: AtomicUsize,
    pub finalize_count: AtomicUsize,
}

struct FakeTransition {
    core: Arc<EngineCore>,
    result: Vec<u8>,
    next_validators: ValidatorList,
    patch: TransactionList,
    normal: TransactionList,
}

impl EngineTransition for FakeTransition {
    fn execute(
        &self,
        cb: Arc<dyn TransitionCallback>,
    ) -> Result<Box<dyn FnOnce() -> bool + Send>, BlockError> {
        let canceled = Arc::new(AtomicBool::new(false));
        if self.core.auto.load(Ordering::SeqCst) {
            cb.on_validate(Ok(()));
            cb.on_execute(Ok(()));
        } else {
            self.core.pending.lock().unwrap().push(PendingExec { cb, canceled: canceled.clone() });
        }
        let core = self.core.clone();
        Ok(Box::new(move || {
            core.cancel_count.fetch_add(1, Ordering::SeqCst);
            canceled.store(true, Ordering::SeqCst);
            true
        }))
    }

    fn result(&self) -> Vec<u8> {
        self.result.clone()
    }

    fn next_validators(&self) -> Option<ValidatorList> {
        Some(self.next_validators.clone())
    }

    fn logs_bloom(&self) -> LogsBloom {
        LogsBloom::default()
    }

    fn patch_transactions(&self) -> TransactionList {
        self.patch.clone()
    }

    fn normal_transactions(&self) -> TransactionList {
        self.normal.clone()
    }
}

pub struct FakeEngine {
    pub core: Arc<EngineCore>,
    network_id: u32,
    validators: ValidatorList,
    /// Normal transactions the next propose picks up.
    pending_txs: Mutex<TransactionList>,
    /// Patch transactions reported as applicable.
    pending_patches: Mutex<TransactionList>,
    tx_lists: Mutex<HashMap<TxListHash, TransactionList>>,
    validator_lists: Mutex<HashMap<ValidatorsHash, ValidatorList>>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        let validators =
            ValidatorList::new(vec![Address::new([0x01; 20]), Address::new([0x02; 20])]);
        let engine = Self {
            core: Arc::new(EngineCore { auto: AtomicBool::new(true), ..Default::default() }),
            network_id: NETWORK_ID,
            validators: validators.clone(),
            pending_txs: Mutex::new(TransactionList::default()),
            pending_patches: Mutex::new(TransactionList::default()),
            tx_lists: Mutex::new(HashMap::new()),
            validator_lists: Mutex::new(HashMap::new()),
        };
        engine.register_list(&TransactionList::default());
        engine.validator_lists.lock().unwrap().insert(validators.hash(), validators);
        Arc::new(engine)
    }

    /// Switch to manual execution: notifications wait for
    /// [`release_pending`](FakeEngine::release_pending).
    pub fn set_manual(&self) {
        self.core.auto.store(false, Ordering::SeqCst);
    }

    /// Make subsequent `finalize` calls fail (or succeed again).
    pub fn set_finalize_failure(&self, fail: bool) {
        self.core.fail_finalize.store(fail, Ordering::SeqCst);
    }

    /// Fire the notifications of every pending execution that was not
    /// canceled.
    pub fn release_pending(&self) {
        let pending: Vec<PendingExec> = self.core.pending.lock().unwrap().drain(..).collect();
        for exec in pending {
            if !exec.canceled.load(Ordering::SeqCst) {
                exec.cb.on_validate(Ok(()));
                exec.cb.on_execute(Ok(()));
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.core.pending.lock().unwrap().len()
    }

    /// Stage the normal transactions for the next proposal.
    pub fn stage_transactions(&self, payloads: &[&[u8]]) {
        *self.pending_txs.lock().unwrap() =
            TransactionList::new(payloads.iter().map(|p| Transaction::new(p.to_vec())).collect());
    }

    /// Stage the applicable patch transactions.
    pub fn stage_patches(&self, payloads: &[&[u8]]) {
        *self.pending_patches.lock().unwrap() =
            TransactionList::new(payloads.iter().map(|p| Transaction::new(p.to_vec())).collect());
    }

    fn register_list(&self, list: &TransactionList) {
        self.tx_lists.lock().unwrap().insert(list.hash(), list.clone());
    }

    fn transition(
        &self,
        result: Vec<u8>,
        patch: TransactionList,
        normal: TransactionList,
    ) -> Arc<dyn EngineTransition> {
        self.register_list(&patch);
        self.register_list(&normal);
        Arc::new(FakeTransition {
            core: self.core.clone(),
            result,
            next_validators: self.validators.clone(),
            patch,
            normal,
        })
    }

    fn derive_result(parent_result: &[u8], txs: &TransactionList) -> Vec<u8> {
        let mut bytes = parent_result.to_vec();
        bytes.extend_from_slice(txs.hash().as_ref());
        BlockHash::digest(&bytes).to_vec()
    }
}

impl ExecutionEngine for FakeEngine {
    fn initial_transition(
        &self,
        result: Option<Vec<u8>>,
        next_validators: Option<ValidatorList>,
    ) -> Result<Arc<dyn EngineTransition>, BlockError> {
        let result = result.unwrap_or_else(|| b"genesis-state".to_vec());
        let validators = next_validators.unwrap_or_else(|| self.validators.clone());
        self.validator_lists.lock().unwrap().insert(validators.hash(), validators.clone());
        Ok(Arc::new(FakeTransition {
            core: self.core.clone(),
            result,
            next_validators: validators,
            patch: TransactionList::default(),
            normal: TransactionList::default(),
        }))
    }

    fn patch_transition(
        &self,
        parent: &Arc<dyn EngineTransition>,
        patches: TransactionList,
        _target: Option<BlockInfo>,
    ) -> Result<Arc<dyn EngineTransition>, BlockError> {
        // Patches re-apply on the pre-executed state; the result is
        // whatever the parent produced.
        Ok(self.transition(parent.result(), patches, TransactionList::default()))
    }

    fn transit(
        &self,
        parent: &Arc<dyn EngineTransition>,
        transactions: TransactionList,
        _target: BlockInfo,
    ) -> Result<Arc<dyn EngineTransition>, BlockError> {
        let result = Self::derive_result(&parent.result(), &transactions);
        Ok(self.transition(result, parent.patch_transactions(), transactions))
    }

    fn propose_transition(
        &self,
        parent: &Arc<dyn EngineTransition>,
        _target: BlockInfo,
    ) -> Result<Arc<dyn EngineTransition>, BlockError> {
        let transactions = self.pending_txs.lock().unwrap().clone();
        let result = Self::derive_result(&parent.result(), &transactions);
        Ok(self.transition(result, parent.patch_transactions(), transactions))
    }

    fn sync_transition(
        &self,
        _current: &Arc<dyn EngineTransition>,
        result: &[u8],
        next_validators_hash: &ValidatorsHash,
    ) -> Result<Arc<dyn EngineTransition>, BlockError> {
        self.core.sync_count.fetch_add(1, Ordering::SeqCst);
        let validators = self
            .validator_lists
            .lock()
            .unwrap()
            .get(next_validators_hash)
            .cloned()
            .ok_or_else(|| BlockError::Engine("unknown validator list for sync".into()))?;
        Ok(Arc::new(FakeTransition {
            core: self.core.clone(),
            result: result.to_vec(),
            next_validators: validators,
            patch: TransactionList::default(),
            normal: TransactionList::default(),
        }))
    }

    fn finalize(
        &self,
        _transition: &Arc<dyn EngineTransition>,
        _flags: FinalizeFlags,
    ) -> Result<(), BlockError> {
        if self.core.fail_finalize.load(Ordering::SeqCst) {
            return Err(BlockError::Engine("finalize refused".into()));
        }
        self.core.finalize_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get_patches(
        &self,
        _transition: &Arc<dyn EngineTransition>,
        _target: BlockInfo,
    ) -> TransactionList {
        self.pending_patches.lock().unwrap().clone()
    }

    fn network_id(&self, _result: &[u8]) -> Result<u32, BlockError> {
        Ok(self.network_id)
    }

    fn genesis_transactions(
        &self,
        genesis: &[u8],
        network_id: u32,
    ) -> Result<TransactionList, BlockError> {
        if network_id != self.network_id {
            return Err(BlockError::InvalidNetwork {
                stored: self.network_id,
                configured: network_id,
            });
        }
        let list = TransactionList::new(vec![Transaction::new(genesis.to_vec())]);
        self.register_list(&list);
        Ok(list)
    }

    fn transaction_list_from_hash(&self, hash: &TxListHash) -> Option<TransactionList> {
        self.tx_lists.lock().unwrap().get(hash).cloned()
    }

    fn validator_list_from_hash(&self, hash: &ValidatorsHash) -> Option<ValidatorList> {
        self.validator_lists.lock().unwrap().get(hash).cloned()
    }

    fn receipt(
        &self,
        result: &[u8],
        group: TransactionGroup,
        index: usize,
    ) -> Result<Vec<u8>, BlockError> {
        let mut bytes = result.to_vec();
        bytes.push(match group {
            TransactionGroup::Patch => 0,
            TransactionGroup::Normal => 1,
        });
        bytes.push(index as u8);
        Ok(bytes)
    }

    fn wait_for_transaction(
        &self,
        _parent: &Arc<dyn EngineTransition>,
        _target: BlockInfo,
        _cb: Box<dyn FnOnce() + Send>,
    ) -> bool {
        false
    }
}

/// A callback that stores its outcome for later assertion.
pub type Outcome = Arc<Mutex<Option<Result<BlockCandidate, BlockError>>>>;

pub fn capture() -> (CandidateCallback, Outcome) {
    let outcome: Outcome = Arc::new(Mutex::new(None));
    let slot = outcome.clone();
    (Box::new(move |result| *slot.lock().unwrap() = Some(result)), outcome)
}

pub fn take(outcome: &Outcome) -> Result<BlockCandidate, BlockError> {
    outcome.lock().unwrap().take().expect("callback delivered")
}

pub fn new_manager(dir: &std::path::Path, engine: Arc<FakeEngine>) -> BlockManager {
    BlockManager::new(
        BlockManagerConfig::new(dir),
        chain_context(NETWORK_ID),
        engine,
        None,
    )
    .expect("manager bootstraps")
}

/// Unused-vote-set silence for EmptyVoteSet import in helpers.
#[allow(dead_code)]
pub fn empty_votes() -> Arc<dyn CommitVoteSet> {
    Arc::new(EmptyVoteSet)
}

#[allow(dead_code)]
pub fn votes_hash_of(bytes: &[u8]) -> VotesHash {
    VotesHash::digest(bytes)
}
