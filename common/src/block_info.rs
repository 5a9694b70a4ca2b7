//! What the execution engine sees of the block a transition targets.

use serde::{Deserialize, Serialize};

/// Height and timestamp of the block a transition is executed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub height: u64,
    pub timestamp: i64,
}

impl BlockInfo {
    pub fn new(height: u64, timestamp: i64) -> Self {
        Self { height, timestamp }
    }
}
