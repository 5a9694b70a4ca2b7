//! The candidate block tree.
//!
//! Nodes are kept in a map keyed by block id; parent and child links are
//! ids into that map. A node's reference count is exactly: one if it is
//! the finalized node, plus one per child node, plus one per outstanding
//! external candidate handle. A node whose count reaches zero is
//! disposed together with its subtree; dropping a node releases its two
//! transition handles.

use crate::block::Block;
use crate::transition::Transition;
use std::collections::HashMap;
use std::sync::Arc;
use telamon_common::BlockHash;
use tracing::trace;

pub(crate) struct BlockNode {
    pub block: Arc<Block>,
    pub parent: Option<BlockHash>,
    pub children: Vec<BlockHash>,
    /// The transition that ends at this block; its result matches
    /// `block.result()`.
    pub in_tr: Transition,
    /// Speculative transition that has pre-executed the normal
    /// transactions, so children can patch on top of it.
    pub preexe: Transition,
    pub n_ref: u32,
}

impl BlockNode {
    pub fn new(block: Arc<Block>, in_tr: Transition, preexe: Transition) -> Self {
        Self { block, parent: None, children: Vec::new(), in_tr, preexe, n_ref: 0 }
    }
}

#[derive(Default)]
pub(crate) struct BlockTree {
    nodes: HashMap<BlockHash, BlockNode>,
}

impl BlockTree {
    pub fn get(&self, id: &BlockHash) -> Option<&BlockNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &BlockHash) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn ref_count(&self, id: &BlockHash) -> Option<u32> {
        self.nodes.get(id).map(|n| n.n_ref)
    }

    /// Insert a parentless node (tree root or a node about to be
    /// finalized at bootstrap).
    pub fn insert_detached(&mut self, node: BlockNode) -> BlockHash {
        let id = node.block.id();
        self.nodes.insert(id, node);
        id
    }

    /// Attach `node` as a child of `parent_id`, taking one reference on
    /// the parent.
    pub fn add_node(&mut self, parent_id: &BlockHash, mut node: BlockNode) -> BlockHash {
        let id = node.block.id();
        node.parent = Some(*parent_id);
        let parent = self.nodes.get_mut(parent_id).expect("parent node in tree");
        parent.children.push(id);
        parent.n_ref += 1;
        self.nodes.insert(id, node);
        id
    }

    /// Take one reference on a node (finalized pointer or candidate
    /// handle).
    pub fn ref_node(&mut self, id: &BlockHash) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.n_ref += 1;
        }
    }

    /// Release one reference; a node reaching zero is disposed with its
    /// subtree, which in turn releases its parent link.
    pub fn unref(&mut self, id: &BlockHash) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        node.n_ref -= 1;
        if node.n_ref > 0 {
            return;
        }
        let parent = node.parent;
        self.remove_node(id);
        if let Some(parent_id) = parent {
            if let Some(parent) = self.nodes.get_mut(&parent_id) {
                if let Some(at) = parent.children.iter().position(|c| c == id) {
                    parent.children.swap_remove(at);
                }
            }
        }
    }

    /// Dispose a node and its whole subtree, releasing the parent link.
    /// The parent's children list is patched by the caller (`unref`) or
    /// irrelevant (the parent is being disposed too).
    pub fn remove_node(&mut self, id: &BlockHash) {
        let Some(node) = self.nodes.get(id) else {
            return;
        };
        for child in node.children.clone() {
            self.remove_subtree(&child);
        }
        let node = self.nodes.remove(id).expect("node in tree");
        trace!(id = %id, "disposed block node");
        if let Some(parent_id) = node.parent {
            self.unref(&parent_id);
        }
    }

    /// Dispose a node and its subtree without touching the parent link.
    fn remove_subtree(&mut self, id: &BlockHash) {
        let Some(node) = self.nodes.get(id) else {
            return;
        };
        for child in node.children.clone() {
            self.remove_subtree(&child);
        }
        self.nodes.remove(id);
        trace!(id = %id, "disposed block node");
    }

    /// Dispose a node and every child subtree except `keep`, whose
    /// parent link is detached so it becomes the new root. This is the
    /// finalization primitive.
    pub fn remove_node_except(&mut self, id: &BlockHash, keep: &BlockHash) {
        let Some(node) = self.nodes.get(id) else {
            return;
        };
        for child in node.children.clone() {
            if child == *keep {
                if let Some(kept) = self.nodes.get_mut(&child) {
                    kept.parent = None;
                }
            } else {
                self.remove_subtree(&child);
            }
        }
        let node = self.nodes.remove(id).expect("node in tree");
        trace!(id = %id, keep = %keep, "disposed block node, kept one child");
        if let Some(parent_id) = node.parent {
            self.unref(&parent_id);
        }
    }
}
