//! Digest identities.
//!
//! Every identity in Telamon — block, transaction, transaction list,
//! vote set, validator list — is the 32-byte Blake2b digest of some
//! canonical encoding. One concrete type covers them all; the aliases
//! in the crate root name which encoding a value stands for.

use blake2::{digest::consts::U32, Blake2b, Digest};
use std::{fmt, str::FromStr};

/// Length of a digest in bytes.
pub const HASH_LEN: usize = 32;

/// A 32-byte Blake2b digest.
///
/// The zero digest (`Hash::default()`) never collides with a real
/// digest in practice and doubles as the "no id" placeholder in error
/// values.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash([u8; HASH_LEN]);

impl Hash {
    #[inline]
    pub const fn new(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// The digest of `bytes`. This is the one hash function of the
    /// whole system; identities computed anywhere else must agree with
    /// it.
    pub fn digest(bytes: &[u8]) -> Self {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    #[inline]
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    #[inline]
    pub fn into_inner(self) -> [u8; HASH_LEN] {
        self.0
    }
}

impl From<[u8; HASH_LEN]> for Hash {
    #[inline]
    fn from(bytes: [u8; HASH_LEN]) -> Self {
        Self::new(bytes)
    }
}

impl TryFrom<&[u8]> for Hash {
    type Error = std::array::TryFromSliceError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Ok(Self::new(value.try_into()?))
    }
}

impl AsRef<[u8]> for Hash {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hash").field(&hex::encode(self.0)).finish()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for Hash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; HASH_LEN];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self::new(bytes))
    }
}

impl<C> minicbor::Encode<C> for Hash {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.bytes(&self.0)?.ok()
    }
}

impl<'a, C> minicbor::Decode<'a, C> for Hash {
    fn decode(
        d: &mut minicbor::Decoder<'a>,
        _ctx: &mut C,
    ) -> Result<Self, minicbor::decode::Error> {
        let bytes = d.bytes()?;
        Hash::try_from(bytes).map_err(|_| minicbor::decode::Error::message("Invalid hash size"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable() {
        let a = Hash::digest(b"telamon");
        let b = Hash::digest(b"telamon");
        assert_eq!(a, b);
        assert_ne!(a, Hash::digest(b"telamon2"));
        assert_ne!(a, Hash::default());
    }

    #[test]
    fn hex_round_trip() {
        let hash = Hash::digest(b"display me");
        let parsed: Hash = hash.to_string().parse().unwrap();
        assert_eq!(parsed, hash);
    }

    #[test]
    fn rejects_short_hex() {
        assert!("0d8d00cdd465".parse::<Hash>().is_err());
    }

    #[test]
    fn try_from_slice_checks_length() {
        let bytes = vec![7u8; HASH_LEN];
        let hash = Hash::try_from(bytes.as_slice()).unwrap();
        assert_eq!(hash.as_ref(), bytes.as_slice());
        assert!(Hash::try_from(&bytes[1..]).is_err());
    }

    #[test]
    fn cbor_round_trip() {
        let hash = Hash::digest(b"round trip");
        let bytes = minicbor::to_vec(hash).unwrap();
        let back: Hash = minicbor::decode(&bytes).unwrap();
        assert_eq!(hash, back);
    }

    #[test]
    fn cbor_rejects_wrong_length() {
        let mut encoder = minicbor::Encoder::new(Vec::new());
        encoder.bytes(&[0u8; 16]).unwrap();
        let bytes = encoder.into_writer();
        assert!(minicbor::decode::<Hash>(&bytes).is_err());
    }
}
