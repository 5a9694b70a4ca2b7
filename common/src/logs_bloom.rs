//! Logs bloom filter carried by blocks.

use std::fmt;

/// Size of the bloom filter in bytes (2048 bits).
pub const LOGS_BLOOM_LEN: usize = 256;

/// A 2048-bit bloom over the event logs of a block's execution.
///
/// The manager only transports it; membership hashing is engine-side.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LogsBloom([u8; LOGS_BLOOM_LEN]);

impl LogsBloom {
    pub const fn new(bytes: [u8; LOGS_BLOOM_LEN]) -> Self {
        Self(bytes)
    }

    /// Merge another bloom into this one.
    pub fn merge(&mut self, other: &LogsBloom) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a |= b;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn as_inner(&self) -> &[u8; LOGS_BLOOM_LEN] {
        &self.0
    }
}

impl Default for LogsBloom {
    fn default() -> Self {
        Self([0u8; LOGS_BLOOM_LEN])
    }
}

impl TryFrom<&[u8]> for LogsBloom {
    type Error = std::array::TryFromSliceError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Ok(Self(value.try_into()?))
    }
}

impl fmt::Debug for LogsBloom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LogsBloom").field(&hex::encode(self.0)).finish()
    }
}

impl<C> minicbor::Encode<C> for LogsBloom {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.bytes(&self.0)?.ok()
    }
}

impl<'a, C> minicbor::Decode<'a, C> for LogsBloom {
    fn decode(
        d: &mut minicbor::Decoder<'a>,
        _ctx: &mut C,
    ) -> Result<Self, minicbor::decode::Error> {
        let bytes = d.bytes()?;
        LogsBloom::try_from(bytes)
            .map_err(|_| minicbor::decode::Error::message("Invalid logs bloom size"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_bitwise_or() {
        let mut a = [0u8; LOGS_BLOOM_LEN];
        a[0] = 0b0001;
        let mut b = [0u8; LOGS_BLOOM_LEN];
        b[0] = 0b0100;
        let mut bloom = LogsBloom::new(a);
        bloom.merge(&LogsBloom::new(b));
        assert_eq!(bloom.as_inner()[0], 0b0101);
    }

    #[test]
    fn default_is_empty() {
        assert!(LogsBloom::default().is_empty());
    }

    #[test]
    fn cbor_round_trip() {
        let mut bytes = [0u8; LOGS_BLOOM_LEN];
        bytes[17] = 0xff;
        let bloom = LogsBloom::new(bytes);
        let encoded = minicbor::to_vec(bloom).unwrap();
        let back: LogsBloom = minicbor::decode(&encoded).unwrap();
        assert_eq!(bloom, back);
    }
}
