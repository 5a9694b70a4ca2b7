//! Import and propose tasks.
//!
//! A task drives one candidate through the engine pipeline: a prior
//! transition (`in`) and, for imports, a successor transition (`out`).
//! Engine notifications re-enter the manager's critical section through
//! the syncer; a task that reaches its terminal state attaches a tree
//! node and delivers a candidate handle through the user callback,
//! which always runs outside the critical section.

use crate::block::{verify_block, Block, BlockParams};
use crate::manager::{CandidateCallback, ManagerShared, ManagerState};
use crate::transition::{Transition, TransitionCallback};
use crate::tree::BlockNode;
use bitmask_enum::bitmask;
use std::sync::{Arc, Weak};
use telamon_common::{BlockError, BlockHash, BlockInfo, CommitVoteSet, ValidatorList};
use tracing::debug;

/// Import behavior flags.
#[bitmask(u8)]
pub enum ImportFlags {
    /// Adopt the block's declared result through a forced state sync
    /// when execution diverges from it.
    Force,
}

pub(crate) type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ImportState {
    ExecutingIn,
    ValidatingOut,
}

pub(crate) struct ImportTask {
    pub cb: Option<CandidateCallback>,
    pub state: ImportState,
    pub in_tr: Option<Transition>,
    pub out_tr: Option<Transition>,
    pub block: Arc<Block>,
    pub flags: ImportFlags,
}

pub(crate) struct ProposeTask {
    pub cb: Option<CandidateCallback>,
    pub in_tr: Option<Transition>,
    pub parent_block: Arc<Block>,
    pub votes: Arc<dyn CommitVoteSet>,
}

/// A task in flight. Terminal states are not represented: a task that
/// stops, fails, or delivers its candidate leaves the table, disposing
/// the transitions it still holds.
pub(crate) enum Task {
    Import(ImportTask),
    Propose(ProposeTask),
}

impl Task {
    fn take_cb(&mut self) -> Option<CandidateCallback> {
        match self {
            Task::Import(task) => task.cb.take(),
            Task::Propose(task) => task.cb.take(),
        }
    }
}

/// Cancels an import or propose in flight. Returns true only when a
/// cancellable task was actually stopped; after that the user callback
/// will not fire.
pub struct Canceler {
    manager: Weak<ManagerShared>,
    id: TaskId,
}

impl Canceler {
    pub fn cancel(&self) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut state = manager.syncer.begin();
        match state.tasks.remove(&self.id) {
            Some(_) => {
                debug!(task = self.id, "cancel: ok");
                true
            }
            None => {
                debug!(task = self.id, "cancel: ignored");
                false
            }
        }
    }
}

/// Routes engine notifications for one task back into the critical
/// section. A late notification for a task that already left the table
/// finds nothing and returns.
struct TaskObserver {
    manager: Weak<ManagerShared>,
    id: TaskId,
}

impl TransitionCallback for TaskObserver {
    fn on_validate(&self, result: Result<(), BlockError>) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let id = self.id;
        let inner = manager.clone();
        manager.syncer.call_later_in_lock(move |state| inner.task_on_validate(state, id, result));
    }

    fn on_execute(&self, result: Result<(), BlockError>) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let id = self.id;
        let inner = manager.clone();
        manager.syncer.call_later_in_lock(move |state| inner.task_on_execute(state, id, result));
    }
}

impl ManagerShared {
    fn observer(self: &Arc<Self>, id: TaskId) -> Arc<dyn TransitionCallback> {
        Arc::new(TaskObserver { manager: Arc::downgrade(self), id })
    }

    fn canceler(self: &Arc<Self>, id: TaskId) -> Canceler {
        Canceler { manager: Arc::downgrade(self), id }
    }

    /// Remove a task and deliver `err` through its callback.
    fn fail_task(self: &Arc<Self>, state: &mut ManagerState, id: TaskId, err: BlockError) {
        let Some(mut task) = state.tasks.remove(&id) else {
            return;
        };
        debug!(task = id, %err, "task failed");
        if let Some(cb) = task.take_cb() {
            self.syncer.call_later(move || cb(Err(err)));
        }
    }

    /// Remove a terminal task and deliver a fresh candidate for
    /// `node_id` through its callback.
    fn complete_task(self: &Arc<Self>, state: &mut ManagerState, mut task: Task, node_id: &BlockHash) {
        let candidate = self.new_candidate(state, node_id);
        if let Some(cb) = task.take_cb() {
            self.syncer.call_later(move || cb(Ok(candidate)));
        }
    }

    /// Start an import: resolve the parent, verify structure and votes,
    /// and hand the patch transition to the engine.
    pub(crate) fn start_import(
        self: &Arc<Self>,
        state: &mut ManagerState,
        block: Arc<Block>,
        flags: ImportFlags,
        cb: CandidateCallback,
    ) -> Result<Canceler, BlockError> {
        let parent_id = block
            .prev_id()
            .ok_or(BlockError::InvalidPreviousId { id: Default::default() })?;
        let parent_block = state
            .tree
            .get(&parent_id)
            .map(|node| node.block.clone())
            .ok_or(BlockError::InvalidPreviousId { id: parent_id })?;
        let validators = if block.height() == 1 {
            None
        } else {
            Some(self.voted_validators(state, &parent_block)?)
        };
        verify_block(&block, &parent_block, validators.as_ref())?;

        let id = state.alloc_task_id();
        let observer = self.observer(id);
        let parent = state.tree.get(&parent_id).expect("parent node in tree");
        let in_tr = parent.preexe.patch(
            block.patch_transactions().clone(),
            Some(block.block_info()),
            Some(observer),
        )?;
        state.tasks.insert(
            id,
            Task::Import(ImportTask {
                cb: Some(cb),
                state: ImportState::ExecutingIn,
                in_tr: Some(in_tr),
                out_tr: None,
                block,
                flags,
            }),
        );
        debug!(task = id, "import started");
        Ok(self.canceler(id))
    }

    /// Start a proposal: resolve the parent, verify the votes, collect
    /// applicable patches and hand the patch transition to the engine.
    pub(crate) fn start_propose(
        self: &Arc<Self>,
        state: &mut ManagerState,
        parent_id: BlockHash,
        votes: Arc<dyn CommitVoteSet>,
        cb: CandidateCallback,
    ) -> Result<Canceler, BlockError> {
        let parent_block = state
            .tree
            .get(&parent_id)
            .map(|node| node.block.clone())
            .ok_or(BlockError::NoParentBlock { id: parent_id })?;
        let validators = if parent_block.height() == 0 {
            None
        } else {
            Some(self.voted_validators(state, &parent_block)?)
        };
        votes.verify(&parent_block.id(), parent_block.height(), validators.as_ref())?;

        let id = state.alloc_task_id();
        let observer = self.observer(id);
        let target = BlockInfo::new(parent_block.height() + 1, votes.timestamp());
        let parent = state.tree.get(&parent_id).expect("parent node in tree");
        let patches = self.engine.get_patches(parent.in_tr.mtr(), target);
        let in_tr = parent.preexe.patch(patches, None, Some(observer))?;
        state.tasks.insert(
            id,
            Task::Propose(ProposeTask { cb: Some(cb), in_tr: Some(in_tr), parent_block, votes }),
        );
        debug!(task = id, "propose started");
        Ok(self.canceler(id))
    }

    /// The validator list in force for votes on `parent`: the
    /// next-validators of the block before it.
    fn voted_validators(
        self: &Arc<Self>,
        state: &mut ManagerState,
        parent_block: &Arc<Block>,
    ) -> Result<ValidatorList, BlockError> {
        let prev_id = parent_block.prev_id().ok_or_else(|| {
            BlockError::InvalidState("parent above genesis has no prev id".into())
        })?;
        let prev = self.block_by_id(state, &prev_id).map_err(|e| {
            BlockError::InvalidState(format!("cannot get prev block {prev_id}: {e}"))
        })?;
        prev.next_validators().cloned().ok_or_else(|| {
            BlockError::InvalidState(format!("block {prev_id} has no validator list"))
        })
    }

    pub(crate) fn task_on_validate(
        self: &Arc<Self>,
        state: &mut ManagerState,
        id: TaskId,
        result: Result<(), BlockError>,
    ) {
        match state.tasks.get(&id) {
            Some(Task::Import(_)) => self.import_on_validate(state, id, result),
            Some(Task::Propose(_)) => self.propose_on_validate(state, id, result),
            None => {}
        }
    }

    pub(crate) fn task_on_execute(
        self: &Arc<Self>,
        state: &mut ManagerState,
        id: TaskId,
        result: Result<(), BlockError>,
    ) {
        match state.tasks.get(&id) {
            Some(Task::Import(_)) => self.import_on_execute(state, id, result),
            Some(Task::Propose(_)) => self.propose_on_execute(state, id, result),
            None => {}
        }
    }

    fn import_on_validate(
        self: &Arc<Self>,
        state: &mut ManagerState,
        id: TaskId,
        result: Result<(), BlockError>,
    ) {
        let task_state = match state.tasks.get(&id) {
            Some(Task::Import(task)) => task.state,
            _ => return,
        };
        match task_state {
            ImportState::ExecutingIn => {
                // Validation success is implicit in the later execute
                // notification.
                if let Err(e) = result {
                    self.fail_task(state, id, e);
                }
            }
            ImportState::ValidatingOut => {
                if let Err(e) = result {
                    self.fail_task(state, id, e);
                    return;
                }
                let Some(Task::Import(mut task)) = state.tasks.remove(&id) else {
                    return;
                };
                let block = task.block.clone();
                let block_id = block.id();
                let node_id = if state.tree.contains(&block_id) {
                    // Re-import of a known block: reuse the node.
                    block_id
                } else {
                    let parent_id = block.prev_id().unwrap_or_default();
                    if !state.tree.contains(&parent_id) {
                        // The parent was pruned by a finalization while
                        // this block executed.
                        debug!(task = id, "import parent pruned; canceling");
                        if let Some(cb) = task.cb.take() {
                            self.syncer.call_later(move || cb(Err(BlockError::Canceled)));
                        }
                        return;
                    }
                    let in_tr = task.in_tr.take().expect("import in transition");
                    let out_tr = task.out_tr.take().expect("import out transition");
                    let validated = match in_tr.mtr().next_validators() {
                        Some(validators) => block.with_next_validators(validators),
                        None => (*block).clone(),
                    };
                    let node = BlockNode::new(
                        Arc::new(validated),
                        in_tr.new_handle(None),
                        out_tr.new_handle(None),
                    );
                    state.tree.add_node(&parent_id, node)
                };
                debug!(task = id, block = %node_id, "import validated");
                self.complete_task(state, Task::Import(task), &node_id);
            }
        }
    }

    fn import_on_execute(
        self: &Arc<Self>,
        state: &mut ManagerState,
        id: TaskId,
        result: Result<(), BlockError>,
    ) {
        let Some(Task::Import(task)) = state.tasks.get_mut(&id) else {
            return;
        };
        if task.state != ImportState::ExecutingIn {
            return;
        }
        let block = task.block.clone();
        let force = task.flags.contains(ImportFlags::Force);
        let in_tr = task.in_tr.as_ref().expect("import in transition");

        let err = match result {
            Err(e) => Some(e),
            Ok(()) => in_tr.verify_result(&block).err(),
        };
        match err {
            None => {
                let observer = self.observer(id);
                match in_tr.transit(
                    block.normal_transactions().clone(),
                    block.block_info(),
                    Some(observer),
                ) {
                    Ok(out_tr) => {
                        task.out_tr = Some(out_tr);
                        task.state = ImportState::ValidatingOut;
                    }
                    Err(e) => self.fail_task(state, id, e),
                }
            }
            Some(err) => {
                if force {
                    // Forced sync: adopt the declared result and keep
                    // waiting for the sync transition in this state.
                    let observer = self.observer(id);
                    match in_tr.sync(block.result(), &block.next_validators_hash(), Some(observer))
                    {
                        Ok(sync_tr) => {
                            debug!(task = id, "forced sync started");
                            task.in_tr = Some(sync_tr);
                        }
                        Err(sync_err) => self.fail_task(state, id, sync_err),
                    }
                } else {
                    self.fail_task(state, id, err);
                }
            }
        }
    }

    fn propose_on_validate(
        self: &Arc<Self>,
        state: &mut ManagerState,
        id: TaskId,
        result: Result<(), BlockError>,
    ) {
        if let Err(e) = result {
            self.fail_task(state, id, e);
        }
    }

    fn propose_on_execute(
        self: &Arc<Self>,
        state: &mut ManagerState,
        id: TaskId,
        result: Result<(), BlockError>,
    ) {
        if let Err(e) = result {
            self.fail_task(state, id, e);
            return;
        }
        let Some(Task::Propose(task)) = state.tasks.get(&id) else {
            return;
        };
        let parent_block = task.parent_block.clone();
        let votes = task.votes.clone();
        let height = parent_block.height() + 1;
        let mut timestamp = votes.timestamp();
        if let Some(timestamper) = &self.timestamper {
            timestamp = timestamper.block_timestamp(height, timestamp);
        }
        let in_tr = task.in_tr.as_ref().expect("propose in transition");
        let tr = match in_tr.propose(BlockInfo::new(height, timestamp), None) {
            Ok(tr) => tr,
            Err(e) => {
                self.fail_task(state, id, e);
                return;
            }
        };
        let pmtr = in_tr.mtr().clone();
        let next_validators = match pmtr.next_validators() {
            Some(validators) => validators,
            None => {
                self.fail_task(
                    state,
                    id,
                    BlockError::InvalidState("executed transition has no validator list".into()),
                );
                return;
            }
        };
        let block = Arc::new(Block::new(BlockParams {
            height,
            timestamp,
            proposer: Some(self.chain.wallet),
            prev_id: Some(parent_block.id()),
            logs_bloom: pmtr.logs_bloom(),
            result: pmtr.result(),
            patch_transactions: pmtr.patch_transactions(),
            normal_transactions: tr.mtr().normal_transactions(),
            next_validators_hash: next_validators.hash(),
            next_validators: Some(next_validators),
            votes,
        }));
        let block_id = block.id();

        let Some(Task::Propose(mut task)) = state.tasks.remove(&id) else {
            return;
        };
        let node_id = if state.tree.contains(&block_id) {
            // An identical proposal already produced this node; the
            // speculative transition is surplus.
            drop(tr);
            block_id
        } else {
            if !state.tree.contains(&parent_block.id()) {
                debug!(task = id, "propose parent pruned; canceling");
                if let Some(cb) = task.cb.take() {
                    self.syncer.call_later(move || cb(Err(BlockError::Canceled)));
                }
                return;
            }
            let in_handle = task.in_tr.take().expect("propose in transition").new_handle(None);
            let node = BlockNode::new(block, in_handle, tr);
            state.tree.add_node(&parent_block.id(), node)
        };
        debug!(task = id, block = %node_id, "proposal assembled");
        self.complete_task(state, Task::Propose(task), &node_id);
    }
}
