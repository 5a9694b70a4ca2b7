//! Transactions as the block manager sees them: opaque byte payloads
//! with a digest identity. Interpretation and validation belong to the
//! execution engine.

use crate::{TxHash, TxListHash};
use serde::{Deserialize, Serialize};

/// Which list of a block a transaction belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(minicbor::Encode, minicbor::Decode)]
#[cbor(index_only)]
pub enum TransactionGroup {
    #[n(0)]
    Patch,
    #[n(1)]
    Normal,
}

/// An opaque transaction payload. Identity is the digest of the raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    bytes: Vec<u8>,
    id: TxHash,
}

impl Transaction {
    pub fn new(bytes: Vec<u8>) -> Self {
        let id = TxHash::digest(&bytes);
        Self { bytes, id }
    }

    pub fn id(&self) -> TxHash {
        self.id
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl From<Vec<u8>> for Transaction {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

/// An ordered list of transactions.
///
/// The list hash is the digest of the CBOR array of raw payloads, so a
/// list materialized from wire bytes can be checked against the hash its
/// block header declares.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransactionList {
    txs: Vec<Transaction>,
}

impl TransactionList {
    pub fn new(txs: Vec<Transaction>) -> Self {
        Self { txs }
    }

    /// Materialize a list from raw payloads.
    pub fn from_raw(raw: Vec<Vec<u8>>) -> Self {
        Self::new(raw.into_iter().map(Transaction::new).collect())
    }

    pub fn hash(&self) -> TxListHash {
        let raw: Vec<&[u8]> = self.txs.iter().map(|tx| tx.bytes()).collect();
        let encoded = minicbor::to_vec(&RawList(raw)).expect("vec encoding cannot fail");
        TxListHash::digest(&encoded)
    }

    pub fn get(&self, index: usize) -> Option<&Transaction> {
        self.txs.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.txs.iter()
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    /// The raw payloads, in order (wire body encoding).
    pub fn to_raw(&self) -> Vec<Vec<u8>> {
        self.txs.iter().map(|tx| tx.bytes.clone()).collect()
    }
}

struct RawList<'a>(Vec<&'a [u8]>);

impl<C> minicbor::Encode<C> for RawList<'_> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.array(self.0.len() as u64)?;
        for bytes in &self.0 {
            e.bytes(bytes)?;
        }
        Ok(())
    }
}
