//! Bounded LRU over recently touched finalized blocks, with a height
//! index alongside. The cache is advisory; every miss falls through to
//! the store.

use crate::block::Block;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use telamon_common::BlockHash;

pub(crate) struct BlockCache {
    capacity: usize,
    /// Least recently used at the front.
    order: VecDeque<BlockHash>,
    by_id: HashMap<BlockHash, Arc<Block>>,
    by_height: HashMap<u64, BlockHash>,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            by_id: HashMap::with_capacity(capacity),
            by_height: HashMap::with_capacity(capacity),
        }
    }

    pub fn get(&mut self, id: &BlockHash) -> Option<Arc<Block>> {
        let block = self.by_id.get(id)?.clone();
        self.touch(id);
        Some(block)
    }

    pub fn get_by_height(&mut self, height: u64) -> Option<Arc<Block>> {
        let id = *self.by_height.get(&height)?;
        self.get(&id)
    }

    pub fn put(&mut self, block: Arc<Block>) {
        let id = block.id();
        if self.by_id.insert(id, block.clone()).is_some() {
            self.touch(&id);
            return;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                if let Some(old) = self.by_id.remove(&evicted) {
                    self.by_height.remove(&old.height());
                }
            }
        }
        self.order.push_back(id);
        self.by_height.insert(block.height(), id);
    }

    fn touch(&mut self, id: &BlockHash) {
        if let Some(at) = self.order.iter().position(|x| x == id) {
            self.order.remove(at);
            self.order.push_back(*id);
        }
    }
}
