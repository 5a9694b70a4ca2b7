//! Durable storage for the finalized chain.
//!
//! One fjall partition per logical bucket: raw bytes by hash (headers
//! and vote sets), transaction locators by transaction hash, header hash
//! by height, and chain properties. Only the finalized branch is ever
//! persisted; the candidate tree lives in memory.

use fjall::{Keyspace, Partition, PartitionCreateOptions, PersistMode};
use std::path::Path;
use telamon_common::{BlockError, BlockHash, Hash, TransactionGroup, TxHash};

const BYTES_BY_HASH: &str = "bytes_by_hash";
const TX_LOCATOR_BY_HASH: &str = "tx_locator_by_hash";
const HEADER_HASH_BY_HEIGHT: &str = "header_hash_by_height";
const CHAIN_PROPERTY: &str = "chain_property";

const KEY_LAST_HEIGHT: &str = "block.lastHeight";

/// Where a transaction sits in the finalized chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct TransactionLocator {
    #[n(0)]
    pub block_height: u64,
    #[n(1)]
    pub group: TransactionGroup,
    #[n(2)]
    pub index_in_group: u32,
}

pub(crate) struct BlockStore {
    keyspace: Keyspace,
    bytes_by_hash: Partition,
    tx_locator_by_hash: Partition,
    header_hash_by_height: Partition,
    chain_property: Partition,
}

fn storage_err(e: fjall::Error) -> BlockError {
    BlockError::Storage(e.to_string())
}

fn codec_err(e: impl std::fmt::Display) -> BlockError {
    BlockError::Codec(e.to_string())
}

impl BlockStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, BlockError> {
        let keyspace = fjall::Config::new(path).open().map_err(storage_err)?;
        let partition = |name| {
            keyspace.open_partition(name, PartitionCreateOptions::default()).map_err(storage_err)
        };
        Ok(Self {
            bytes_by_hash: partition(BYTES_BY_HASH)?,
            tx_locator_by_hash: partition(TX_LOCATOR_BY_HASH)?,
            header_hash_by_height: partition(HEADER_HASH_BY_HEIGHT)?,
            chain_property: partition(CHAIN_PROPERTY)?,
            keyspace,
        })
    }

    /// Raw bytes stored under a content hash (block headers, vote sets).
    pub fn bytes_by_hash(&self, hash: &Hash) -> Result<Option<Vec<u8>>, BlockError> {
        Ok(self
            .bytes_by_hash
            .get(hash.as_ref())
            .map_err(storage_err)?
            .map(|slice| slice.to_vec()))
    }

    pub fn put_bytes(&self, hash: &Hash, bytes: &[u8]) -> Result<(), BlockError> {
        self.bytes_by_hash.insert(hash.as_ref(), bytes).map_err(storage_err)
    }

    pub fn locator(&self, tx: &TxHash) -> Result<Option<TransactionLocator>, BlockError> {
        match self.tx_locator_by_hash.get(tx.as_ref()).map_err(storage_err)? {
            Some(slice) => Ok(Some(minicbor::decode(&slice).map_err(codec_err)?)),
            None => Ok(None),
        }
    }

    pub fn put_locator(&self, tx: &TxHash, locator: &TransactionLocator) -> Result<(), BlockError> {
        let bytes = minicbor::to_vec(locator).map_err(codec_err)?;
        self.tx_locator_by_hash.insert(tx.as_ref(), bytes).map_err(storage_err)
    }

    pub fn header_hash_at(&self, height: u64) -> Result<Option<BlockHash>, BlockError> {
        match self.header_hash_by_height.get(height.to_be_bytes()).map_err(storage_err)? {
            Some(slice) => {
                let hash = BlockHash::try_from(slice.as_ref())
                    .map_err(|_| BlockError::InvalidState("malformed header hash".into()))?;
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    pub fn put_header_hash(&self, height: u64, id: &BlockHash) -> Result<(), BlockError> {
        self.header_hash_by_height
            .insert(height.to_be_bytes(), id.as_ref())
            .map_err(storage_err)
    }

    pub fn last_height(&self) -> Result<Option<u64>, BlockError> {
        match self.chain_property.get(KEY_LAST_HEIGHT).map_err(storage_err)? {
            Some(slice) => Ok(Some(minicbor::decode(&slice).map_err(codec_err)?)),
            None => Ok(None),
        }
    }

    pub fn put_last_height(&self, height: u64) -> Result<(), BlockError> {
        let bytes = minicbor::to_vec(height).map_err(codec_err)?;
        self.chain_property.insert(KEY_LAST_HEIGHT, bytes).map_err(storage_err)
    }

    /// Flush all buckets to disk. Called once per finalization.
    pub fn persist(&self) -> Result<(), BlockError> {
        self.keyspace.persist(PersistMode::SyncAll).map_err(storage_err)
    }
}
