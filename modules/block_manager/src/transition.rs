//! The contract against the external execution engine, and the
//! ref-counted transition handle the tree and tasks hold.
//!
//! A transition is an engine-side computation that, applied to a prior
//! state, yields the next state, result, and receipts. The engine runs
//! validation and execution on its own threads and reports through
//! [`TransitionCallback`]; the manager never blocks on engine work.

use crate::block::Block;
use bitmask_enum::bitmask;
use std::sync::{Arc, Mutex, Weak};
use telamon_common::{
    BlockError, BlockInfo, LogsBloom, TransactionGroup, TransactionList, TxListHash,
    ValidatorList, ValidatorsHash,
};

/// Which parts of a transition to make durable.
#[bitmask(u8)]
pub enum FinalizeFlags {
    PatchTransactions,
    NormalTransactions,
    Result,
}

/// Progress notifications for one transition execution.
///
/// `on_validate` reports the validation phase, `on_execute` the
/// execution phase. Both may arrive from engine-owned threads.
pub trait TransitionCallback: Send + Sync {
    fn on_validate(&self, result: Result<(), BlockError>);
    fn on_execute(&self, result: Result<(), BlockError>);
}

/// A cancel function returned by [`EngineTransition::execute`]. Returns
/// true when the execution was stopped before completion.
pub type ExecutionCanceler = Box<dyn FnOnce() -> bool + Send>;

/// An engine-side transition: state, result and transaction accessors
/// over one computation.
pub trait EngineTransition: Send + Sync {
    /// Start validation and execution. Notifications go to `cb`; the
    /// returned canceler stops the computation.
    fn execute(&self, cb: Arc<dyn TransitionCallback>) -> Result<ExecutionCanceler, BlockError>;

    /// The execution result bytes. Meaningful after `on_execute(Ok)`.
    fn result(&self) -> Vec<u8>;

    /// The validator set produced by execution, if known.
    fn next_validators(&self) -> Option<ValidatorList>;

    /// Bloom over the logs of this execution.
    fn logs_bloom(&self) -> LogsBloom;

    fn patch_transactions(&self) -> TransactionList;

    fn normal_transactions(&self) -> TransactionList;
}

/// The external execution engine (transaction validation, execution,
/// state, receipts). The manager consumes it as an opaque capability.
pub trait ExecutionEngine: Send + Sync {
    /// A transition representing an already-computed state: genesis
    /// (no result) or the last finalized block's result.
    fn initial_transition(
        &self,
        result: Option<Vec<u8>>,
        next_validators: Option<ValidatorList>,
    ) -> Result<Arc<dyn EngineTransition>, BlockError>;

    /// Successor that re-applies patch transactions on top of `parent`.
    fn patch_transition(
        &self,
        parent: &Arc<dyn EngineTransition>,
        patches: TransactionList,
        target: Option<BlockInfo>,
    ) -> Result<Arc<dyn EngineTransition>, BlockError>;

    /// Successor that applies normal transactions on top of `parent`.
    fn transit(
        &self,
        parent: &Arc<dyn EngineTransition>,
        transactions: TransactionList,
        target: BlockInfo,
    ) -> Result<Arc<dyn EngineTransition>, BlockError>;

    /// Successor for the proposer path; the engine chooses the
    /// transactions.
    fn propose_transition(
        &self,
        parent: &Arc<dyn EngineTransition>,
        target: BlockInfo,
    ) -> Result<Arc<dyn EngineTransition>, BlockError>;

    /// Forced state-sync branch: adopt `result` instead of recomputing.
    fn sync_transition(
        &self,
        current: &Arc<dyn EngineTransition>,
        result: &[u8],
        next_validators_hash: &ValidatorsHash,
    ) -> Result<Arc<dyn EngineTransition>, BlockError>;

    /// Make the selected parts of a transition durable.
    fn finalize(
        &self,
        transition: &Arc<dyn EngineTransition>,
        flags: FinalizeFlags,
    ) -> Result<(), BlockError>;

    /// Patch transactions applicable on top of `transition` for the
    /// given target block.
    fn get_patches(&self, transition: &Arc<dyn EngineTransition>, target: BlockInfo)
        -> TransactionList;

    /// Network id recorded in a result.
    fn network_id(&self, result: &[u8]) -> Result<u32, BlockError>;

    /// Parse the genesis transactions and check they belong to
    /// `network_id`.
    fn genesis_transactions(
        &self,
        genesis: &[u8],
        network_id: u32,
    ) -> Result<TransactionList, BlockError>;

    /// Transaction list content-addressed by its hash, if the engine
    /// has it.
    fn transaction_list_from_hash(&self, hash: &TxListHash) -> Option<TransactionList>;

    /// Validator list content-addressed by its hash, if the engine has
    /// it.
    fn validator_list_from_hash(&self, hash: &ValidatorsHash) -> Option<ValidatorList>;

    /// Receipt of the transaction at `index` of `group` in the given
    /// finalized result.
    fn receipt(
        &self,
        result: &[u8],
        group: TransactionGroup,
        index: usize,
    ) -> Result<Vec<u8>, BlockError>;

    /// Register `cb` to fire when a transaction becomes available on
    /// top of `parent`. Returns false (without keeping `cb`) when one
    /// is available already.
    fn wait_for_transaction(
        &self,
        parent: &Arc<dyn EngineTransition>,
        target: BlockInfo,
        cb: Box<dyn FnOnce() + Send>,
    ) -> bool;
}

struct TransitionInner {
    observers: Vec<(u64, Arc<dyn TransitionCallback>)>,
    next_slot: u64,
    n_ref: u32,
    canceler: Option<ExecutionCanceler>,
    validated: Option<Result<(), BlockError>>,
    executed: Option<Result<(), BlockError>>,
}

struct TransitionShared {
    engine: Arc<dyn ExecutionEngine>,
    mtr: Arc<dyn EngineTransition>,
    inner: Mutex<TransitionInner>,
}

/// Fans engine notifications out to the handles' observers and records
/// them so a later handle can be attached to an execution in flight.
struct Dispatch {
    shared: Weak<TransitionShared>,
}

impl Dispatch {
    fn notify(&self, validate: bool, result: Result<(), BlockError>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let observers: Vec<Arc<dyn TransitionCallback>> = {
            let mut inner = shared.inner.lock().unwrap();
            if validate {
                inner.validated = Some(result.clone());
            } else {
                inner.executed = Some(result.clone());
            }
            inner.observers.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for cb in observers {
            if validate {
                cb.on_validate(result.clone());
            } else {
                cb.on_execute(result.clone());
            }
        }
    }
}

impl TransitionCallback for Dispatch {
    fn on_validate(&self, result: Result<(), BlockError>) {
        self.notify(true, result);
    }

    fn on_execute(&self, result: Result<(), BlockError>) {
        self.notify(false, result);
    }
}

/// A handle on one engine transition.
///
/// The underlying computation stays alive while any handle does;
/// dropping the last handle cancels it. The tree keeps observer-less
/// handles in its nodes while a task drives another handle on the same
/// computation.
pub(crate) struct Transition {
    shared: Arc<TransitionShared>,
    slot: Option<u64>,
}

impl Transition {
    /// Wrap an already-computed transition; nothing is executed and no
    /// notifications will fire.
    pub fn initial(engine: Arc<dyn ExecutionEngine>, mtr: Arc<dyn EngineTransition>) -> Self {
        Self::wrap(engine, mtr, None)
    }

    fn wrap(
        engine: Arc<dyn ExecutionEngine>,
        mtr: Arc<dyn EngineTransition>,
        observer: Option<Arc<dyn TransitionCallback>>,
    ) -> Self {
        let mut observers = Vec::new();
        let mut next_slot = 0u64;
        let slot = observer.map(|cb| {
            let slot = next_slot;
            next_slot += 1;
            observers.push((slot, cb));
            slot
        });
        let shared = Arc::new(TransitionShared {
            engine,
            mtr,
            inner: Mutex::new(TransitionInner {
                observers,
                next_slot,
                n_ref: 1,
                canceler: None,
                validated: None,
                executed: None,
            }),
        });
        Self { shared, slot }
    }

    fn start(
        engine: Arc<dyn ExecutionEngine>,
        mtr: Arc<dyn EngineTransition>,
        observer: Option<Arc<dyn TransitionCallback>>,
    ) -> Result<Self, BlockError> {
        let handle = Self::wrap(engine, mtr, observer);
        let canceler = handle.shared.mtr.execute(Arc::new(Dispatch {
            shared: Arc::downgrade(&handle.shared),
        }))?;
        handle.shared.inner.lock().unwrap().canceler = Some(canceler);
        Ok(handle)
    }

    /// Successor that re-applies `patches` on top of this transition.
    pub fn patch(
        &self,
        patches: TransactionList,
        target: Option<BlockInfo>,
        observer: Option<Arc<dyn TransitionCallback>>,
    ) -> Result<Transition, BlockError> {
        let mtr = self.shared.engine.patch_transition(&self.shared.mtr, patches, target)?;
        Self::start(self.shared.engine.clone(), mtr, observer)
    }

    /// Successor that applies `transactions` on top of this transition.
    pub fn transit(
        &self,
        transactions: TransactionList,
        target: BlockInfo,
        observer: Option<Arc<dyn TransitionCallback>>,
    ) -> Result<Transition, BlockError> {
        let mtr = self.shared.engine.transit(&self.shared.mtr, transactions, target)?;
        Self::start(self.shared.engine.clone(), mtr, observer)
    }

    /// Proposer successor; the engine chooses the transactions.
    pub fn propose(
        &self,
        target: BlockInfo,
        observer: Option<Arc<dyn TransitionCallback>>,
    ) -> Result<Transition, BlockError> {
        let mtr = self.shared.engine.propose_transition(&self.shared.mtr, target)?;
        Self::start(self.shared.engine.clone(), mtr, observer)
    }

    /// Forced state-sync successor adopting the declared result.
    pub fn sync(
        &self,
        result: &[u8],
        next_validators_hash: &ValidatorsHash,
        observer: Option<Arc<dyn TransitionCallback>>,
    ) -> Result<Transition, BlockError> {
        let mtr =
            self.shared.engine.sync_transition(&self.shared.mtr, result, next_validators_hash)?;
        Self::start(self.shared.engine.clone(), mtr, observer)
    }

    /// Compare the computed result against the block's declared result
    /// and next-validators hash.
    pub fn verify_result(&self, block: &Block) -> Result<(), BlockError> {
        if self.shared.mtr.result() != block.result() {
            return Err(BlockError::MismatchedResult { id: block.id() });
        }
        let next_validators_hash = self
            .shared
            .mtr
            .next_validators()
            .map(|vl| vl.hash())
            .unwrap_or_default();
        if next_validators_hash != block.next_validators_hash() {
            return Err(BlockError::MismatchedResult { id: block.id() });
        }
        Ok(())
    }

    /// Another handle on the same computation. Notifications already
    /// delivered are replayed to `observer`.
    pub fn new_handle(&self, observer: Option<Arc<dyn TransitionCallback>>) -> Transition {
        let (slot, replay) = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.n_ref += 1;
            match observer {
                Some(cb) => {
                    let slot = inner.next_slot;
                    inner.next_slot += 1;
                    inner.observers.push((slot, cb.clone()));
                    (Some(slot), Some((cb, inner.validated.clone(), inner.executed.clone())))
                }
                None => (None, None),
            }
        };
        if let Some((cb, validated, executed)) = replay {
            if let Some(result) = validated {
                cb.on_validate(result);
            }
            if let Some(result) = executed {
                cb.on_execute(result);
            }
        }
        Transition { shared: self.shared.clone(), slot }
    }

    /// The engine-side materialized transition.
    pub fn mtr(&self) -> &Arc<dyn EngineTransition> {
        &self.shared.mtr
    }
}

impl Drop for Transition {
    fn drop(&mut self) {
        let canceler = {
            let mut inner = self.shared.inner.lock().unwrap();
            if let Some(slot) = self.slot {
                inner.observers.retain(|(s, _)| *s != slot);
            }
            inner.n_ref -= 1;
            if inner.n_ref == 0 {
                inner.canceler.take()
            } else {
                None
            }
        };
        if let Some(cancel) = canceler {
            cancel();
        }
    }
}
