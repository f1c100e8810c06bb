use const_hex::ToHexExt;
use hashes::sha1;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Debug, Display, Error, Formatter},
    str::FromStr,
};

use crate::{KEY_LEN, N_BUCKETS};

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("randomness source unavailable: {0}")]
    RandomnessUnavailable(#[from] rand::Error),
    #[error("hex string must be {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("invalid hex character {c:?} at position {index}")]
    InvalidEncoding { c: char, index: usize },
}

/// Identifier of a node or a stored value in the overlay.
#[derive(Hash, Ord, PartialOrd, Eq, PartialEq, Clone, Copy, Deserialize, Serialize)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    /// Returns a random key drawn from the operating system's entropy source.
    pub fn random() -> Result<Key, KeyError> {
        Key::random_with(&mut OsRng)
    }

    /// Returns a random key drawn from `rng`.
    ///
    /// A failing source is reported as [KeyError::RandomnessUnavailable].
    pub fn random_with<R: RngCore + ?Sized>(rng: &mut R) -> Result<Key, KeyError> {
        let mut key = [0u8; KEY_LEN];
        rng.try_fill_bytes(&mut key)?;
        Ok(Key(key))
    }

    /// Returns the hashed Key of data.
    pub fn hash(data: &[u8]) -> Key {
        let hash = sha1::hash(data);
        Key::from_bytes(&hash.into_bytes()[..])
    }

    /// Fits arbitrary bytes into a key: shorter input is zero padded on the
    /// right, longer input is truncated.
    pub fn from_bytes(bytes: &[u8]) -> Key {
        let mut key = [0u8; KEY_LEN];
        let len = bytes.len().min(KEY_LEN);
        key[..len].copy_from_slice(&bytes[..len]);
        Key(key)
    }

    /// Decodes a key from exactly `KEY_LEN * 2` hex digits, with an optional
    /// `0x` prefix.
    pub fn from_hex(hex: &str) -> Result<Key, KeyError> {
        let digits = hex.strip_prefix("0x").unwrap_or(hex);

        if let Some((index, c)) = digits.char_indices().find(|(_, c)| !c.is_ascii_hexdigit()) {
            return Err(KeyError::InvalidEncoding { c, index });
        }

        if digits.len() != KEY_LEN * 2 {
            return Err(KeyError::InvalidLength {
                expected: KEY_LEN,
                actual: digits.len() / 2,
            });
        }

        let mut key = [0u8; KEY_LEN];
        const_hex::decode_to_slice(digits, &mut key).map_err(|_| KeyError::InvalidLength {
            expected: KEY_LEN,
            actual: digits.len() / 2,
        })?;

        Ok(Key(key))
    }

    pub fn to_hex(&self) -> String {
        self.encode_hex()
    }

    /// XORs two Keys.
    pub fn distance(&self, y: &Key) -> Distance {
        let mut result = [0; KEY_LEN];
        for i in 0usize..KEY_LEN {
            result[i] = self.0[i] ^ y.0[i];
        }

        Distance(result)
    }

    /// Returns keys that share exactly 0, 1, 2, ... leading bits with `self`.
    pub fn prefix_flips(&self) -> PrefixFlips {
        PrefixFlips { base: *self, bit: 0 }
    }
}

impl From<[u8; KEY_LEN]> for Key {
    fn from(value: [u8; KEY_LEN]) -> Self {
        Key(value)
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode_hex())
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut Formatter) -> Result<(), Error> {
        write!(f, "{}", self.encode_hex_with_prefix())
    }
}

impl FromStr for Key {
    type Err = KeyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Key::from_hex(s)
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Iterator returned by [Key::prefix_flips].
///
/// The n-th item is the base key with bit n (counted from the most
/// significant bit) flipped, so it lands in bucket n of a routing table owned
/// by the base key.
pub struct PrefixFlips {
    base: Key,
    bit: usize,
}

impl Iterator for PrefixFlips {
    type Item = Key;

    fn next(&mut self) -> Option<Key> {
        if self.bit >= N_BUCKETS {
            return None;
        }

        let mut key = self.base;
        key.0[self.bit / 8] ^= 0x80 >> (self.bit % 8);
        self.bit += 1;

        Some(key)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = N_BUCKETS.saturating_sub(self.bit);
        (left, Some(left))
    }
}

impl ExactSizeIterator for PrefixFlips {}

/// XOR of two keys, ordered as a big-endian unsigned integer.
#[derive(Hash, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Serialize, Deserialize)]
pub struct Distance([u8; KEY_LEN]);

impl Distance {
    pub const ZERO: Distance = Distance([0; KEY_LEN]);

    /// Number of leading zero bits, i.e. the length of the prefix shared by
    /// the two keys that produced this distance.
    pub fn zeroes_in_prefix(&self) -> usize {
        let mut zeroes_count = 0;

        for n in self.0 {
            if n == 0 {
                zeroes_count += 8;
                continue;
            }

            zeroes_count += n.leading_zeros() as usize;

            break;
        }

        zeroes_count
    }
}

impl Debug for Distance {
    fn fmt(&self, f: &mut Formatter) -> Result<(), Error> {
        for x in self.0.iter() {
            write!(f, "{0:02x}", x)?;
        }
        Ok(())
    }
}

impl AsRef<[u8]> for Distance {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
