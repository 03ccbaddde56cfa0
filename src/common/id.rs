//! Kademlia node Id or a lookup target
use rand::Rng;
use std::{
    convert::TryInto,
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::error::DecodeError;

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
/// The size of node IDs in bits, also the number of buckets in a routing table.
pub const ID_BITS: usize = ID_SIZE * 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Kademlia node Id or a lookup target
///
/// The derived ordering is the big-endian numeric order of the bytes, which
/// makes the result of [Id::xor] directly comparable as an XOR distance.
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id, DecodeError> {
        let bytes = bytes.as_ref();

        let array: [u8; ID_SIZE] = bytes
            .try_into()
            .map_err(|_| DecodeError::InvalidIdSize(bytes.len()))?;

        Ok(Id(array))
    }

    /// Derive the lookup target of an application key (SHA-1 of the key).
    pub fn from_key(key: &[u8]) -> Id {
        let mut hasher = sha1_smol::Sha1::new();
        hasher.update(key);

        Id(hasher.digest().bytes())
    }

    /// XOR distance between this Id and another Id.
    ///
    /// The result is itself an [Id] whose ordering is the ordering of distances.
    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Id(result)
    }

    /// Number of leading zero bits, `ID_BITS` for the zero Id.
    pub fn leading_zeros(&self) -> usize {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }

        ID_BITS
    }

    /// Index of the bucket `other` falls into, relative to `self`.
    ///
    /// It is the index of the most significant differing bit, so bucket `0` holds
    /// the farthest half of the id space and bucket `ID_BITS - 1` the nearest
    /// non-equal id. Returns `None` if both ids are equal.
    pub fn bucket_index(&self, other: &Id) -> Option<usize> {
        let zeros = self.xor(other).leading_zeros();

        if zeros == ID_BITS {
            None
        } else {
            Some(zeros)
        }
    }

    /// Generate a random Id that lands in the bucket `index` relative to `self`.
    ///
    /// The distance to `self` is drawn uniformly from `[2^(B-index-1), 2^(B-index))`:
    /// the first `index` bits are zero, bit `index` is set and the rest are random.
    ///
    /// # Panics
    ///
    /// Panics if `index >= ID_BITS`.
    pub fn random_in_bucket(&self, index: usize) -> Id {
        assert!(index < ID_BITS, "bucket index out of range: {}", index);

        let mut distance: [u8; ID_SIZE] = rand::thread_rng().gen();

        let byte = index / 8;
        let bit = index % 8;

        for b in distance.iter_mut().take(byte) {
            *b = 0;
        }

        // Clear the bits above `bit` in the pivot byte, then set `bit` itself.
        let mask = 0xff_u8 >> bit;
        distance[byte] &= mask;
        distance[byte] |= 0x80 >> bit;

        self.xor(&Id(distance))
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }

        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl FromStr for Id {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Id, DecodeError> {
        if !s.is_ascii() {
            return Err(DecodeError::InvalidHex(s.to_string()));
        }

        if s.len() != ID_SIZE * 2 {
            return Err(DecodeError::InvalidIdSize(s.len() / 2));
        }

        let mut bytes = [0_u8; ID_SIZE];

        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| DecodeError::InvalidHex(s.to_string()))?;
        }

        Ok(Id(bytes))
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn distance_is_symmetric() {
        for _ in 0..100 {
            let a = Id::random();
            let b = Id::random();

            assert_eq!(a.xor(&b), b.xor(&a));
            assert_eq!(a.xor(&a), Id([0; ID_SIZE]));
        }
    }

    #[test]
    #[should_panic(expected = "bucket index out of range: 160")]
    fn random_in_bucket_out_of_range() {
        Id::random().random_in_bucket(ID_BITS);
    }

    #[test]
    fn bucket_index_to_self_is_none() {
        let id = Id::random();

        assert_eq!(id.bucket_index(&id), None);
    }

    #[test]
    fn bucket_index_decreases_with_distance() {
        let id = Id::random();

        let mut previous: Option<(Id, usize)> = None;

        // Ids in lower buckets are strictly farther away.
        for index in (0..ID_BITS).rev() {
            let other = id.random_in_bucket(index);
            let distance = id.xor(&other);

            if let Some((previous_distance, previous_index)) = previous {
                assert!(distance > previous_distance);
                assert!(index < previous_index);
            }

            previous = Some((distance, index));
        }
    }

    #[test]
    fn random_in_bucket_lands_in_bucket() {
        let id = Id::random();

        for index in 0..ID_BITS {
            for _ in 0..5 {
                let random = id.random_in_bucket(index);
                assert_eq!(id.bucket_index(&random), Some(index));
            }
        }
    }

    #[test]
    fn bucket_index_examples() {
        let a = Id::from_str("0000000000000000000000000000000000000000").unwrap();
        let b = Id::from_str("8000000000000000000000000000000000000000").unwrap();
        let c = Id::from_str("0000000000000000000000000000000000000001").unwrap();
        let d = Id::from_str("0000000001000000000000000000000000000000").unwrap();

        assert_eq!(a.bucket_index(&b), Some(0));
        assert_eq!(a.bucket_index(&c), Some(159));
        assert_eq!(a.bucket_index(&d), Some(39));
    }

    #[test]
    fn hex_round_trip() {
        let id = Id::from_str("da23614e00469a0d7c7bd1bdab5c9c474b1904dc").unwrap();

        assert_eq!(id.to_string(), "da23614e00469a0d7c7bd1bdab5c9c474b1904dc");
        assert!(Id::from_str("da23").is_err());
        assert!(Id::from_str("zz23614e00469a0d7c7bd1bdab5c9c474b1904dc").is_err());
    }

    #[test]
    fn from_key_is_sha1() {
        // sha1("abc")
        assert_eq!(
            Id::from_key(b"abc").to_string(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn from_bytes_checks_length() {
        assert!(Id::from_bytes([0_u8; 19]).is_err());
        assert!(Id::from_bytes([0_u8; 20]).is_ok());
    }
}
