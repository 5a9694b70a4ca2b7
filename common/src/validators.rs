//! Validator lists.

use crate::{Address, ValidatorsHash};
use serde::{Deserialize, Serialize};

/// The ordered set of validators effective for votes on the block after
/// the one that carries it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(minicbor::Encode, minicbor::Decode)]
#[cbor(transparent)]
pub struct ValidatorList(#[n(0)] Vec<Address>);

impl ValidatorList {
    pub fn new(addresses: Vec<Address>) -> Self {
        Self(addresses)
    }

    pub fn hash(&self) -> ValidatorsHash {
        let encoded = minicbor::to_vec(self).expect("vec encoding cannot fail");
        ValidatorsHash::digest(&encoded)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.0.contains(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Address> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        Address::new([n; 20])
    }

    #[test]
    fn hash_is_order_sensitive() {
        let a = ValidatorList::new(vec![addr(1), addr(2)]);
        let b = ValidatorList::new(vec![addr(2), addr(1)]);
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn cbor_round_trip_preserves_hash() {
        let vl = ValidatorList::new(vec![addr(1), addr(2), addr(3)]);
        let bytes = minicbor::to_vec(&vl).unwrap();
        let back: ValidatorList = minicbor::decode(&bytes).unwrap();
        assert_eq!(vl, back);
        assert_eq!(vl.hash(), back.hash());
    }
}
