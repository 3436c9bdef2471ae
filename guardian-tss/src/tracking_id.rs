//! Deterministic identifier of a signing attempt
//!
//! A [`TrackingId`] is `protocol tag ‖ digest ‖ chain tag ‖ committee bitmap`. Every honest
//! guardian derives exactly the same tracking id for the same (digest, chain, committee) triple,
//! so recipients never trust a received tracking id as an opaque blob: its shape is validated
//! on parsing and its committee is checked against the directory.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::identity::{PartyIndex, MAX_PARTIES};

/// Size of a digest being signed
pub const DIGEST_SIZE: usize = 32;
/// Size of auxiliary data (chain tag)
pub const AUXILIARY_DATA_SIZE: usize = 2;
/// Size of committee bitmap
pub const PARTIES_BITMAP_SIZE: usize = MAX_PARTIES / 8;
/// Size of binary encoded tracking id
pub const TRACKING_ID_SIZE: usize = 1 + DIGEST_SIZE + AUXILIARY_DATA_SIZE + PARTIES_BITMAP_SIZE;
/// Length of hex string representation (includes 3 separators)
pub const TRACKING_ID_HEX_STR_SIZE: usize = 2 * TRACKING_ID_SIZE + 3;

const SEPARATOR: char = '-';

/// Digest of a message being signed
pub type Digest = [u8; DIGEST_SIZE];

/// Chain the signed message originates from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u16);

impl ChainId {
    /// Big-endian encoding, used as tracking id auxiliary data
    pub fn to_bytes(self) -> [u8; AUXILIARY_DATA_SIZE] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Signing protocol the tracking id belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolTag {
    /// Threshold ECDSA
    Ecdsa = 1,
    /// FROST Schnorr signatures
    Frost = 2,
}

impl TryFrom<u8> for ProtocolTag {
    type Error = TrackingIdError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(Self::Ecdsa),
            2 => Ok(Self::Frost),
            _ => Err(TrackingIdError::UnknownProtocol(tag)),
        }
    }
}

/// Identifies a single signing attempt
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackingId {
    protocol: ProtocolTag,
    digest: Digest,
    auxiliary_data: [u8; AUXILIARY_DATA_SIZE],
    parties_bitmap: [u8; PARTIES_BITMAP_SIZE],
}

impl TrackingId {
    /// Constructs tracking id for given digest, chain and committee
    pub fn new(
        protocol: ProtocolTag,
        digest: Digest,
        chain: ChainId,
        committee: &[PartyIndex],
    ) -> Result<Self, TrackingIdError> {
        if committee.is_empty() {
            return Err(TrackingIdError::EmptyCommittee);
        }
        let mut parties_bitmap = [0u8; PARTIES_BITMAP_SIZE];
        for &i in committee {
            let i = usize::from(i);
            if i >= MAX_PARTIES {
                return Err(TrackingIdError::PartyOutOfRange { index: i, n: MAX_PARTIES });
            }
            parties_bitmap[i / 8] |= 1 << (i % 8);
        }
        Ok(Self {
            protocol,
            digest,
            auxiliary_data: chain.to_bytes(),
            parties_bitmap,
        })
    }

    /// Parses binary encoded tracking id
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TrackingIdError> {
        if bytes.len() != TRACKING_ID_SIZE {
            return Err(TrackingIdError::WrongSize {
                expected: TRACKING_ID_SIZE,
                actual: bytes.len(),
            });
        }
        let protocol = ProtocolTag::try_from(bytes[0])?;
        let (digest, rest) = bytes[1..].split_at(DIGEST_SIZE);
        let (auxiliary_data, parties_bitmap) = rest.split_at(AUXILIARY_DATA_SIZE);

        let mut id = Self {
            protocol,
            digest: [0; DIGEST_SIZE],
            auxiliary_data: [0; AUXILIARY_DATA_SIZE],
            parties_bitmap: [0; PARTIES_BITMAP_SIZE],
        };
        id.digest.copy_from_slice(digest);
        id.auxiliary_data.copy_from_slice(auxiliary_data);
        id.parties_bitmap.copy_from_slice(parties_bitmap);
        if id.parties_bitmap.iter().all(|b| *b == 0) {
            return Err(TrackingIdError::EmptyCommittee);
        }
        Ok(id)
    }

    /// Binary encoding
    pub fn to_bytes(&self) -> [u8; TRACKING_ID_SIZE] {
        let mut bytes = [0u8; TRACKING_ID_SIZE];
        bytes[0] = self.protocol as u8;
        bytes[1..1 + DIGEST_SIZE].copy_from_slice(&self.digest);
        bytes[1 + DIGEST_SIZE..1 + DIGEST_SIZE + AUXILIARY_DATA_SIZE]
            .copy_from_slice(&self.auxiliary_data);
        bytes[1 + DIGEST_SIZE + AUXILIARY_DATA_SIZE..].copy_from_slice(&self.parties_bitmap);
        bytes
    }

    /// Signing protocol
    pub fn protocol(&self) -> ProtocolTag {
        self.protocol
    }

    /// Digest being signed
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Chain the digest belongs to
    pub fn chain_id(&self) -> ChainId {
        ChainId(u16::from_be_bytes(self.auxiliary_data))
    }

    /// Checks whether guardian is in the committee
    pub fn contains(&self, index: PartyIndex) -> bool {
        let i = usize::from(index);
        i < MAX_PARTIES && self.parties_bitmap[i / 8] & (1 << (i % 8)) != 0
    }

    /// Committee members in ascending order
    pub fn committee(&self) -> Vec<PartyIndex> {
        (0..MAX_PARTIES)
            .filter(|&i| self.parties_bitmap[i / 8] & (1 << (i % 8)) != 0)
            .map(|i| i as PartyIndex)
            .collect()
    }

    /// Checks that every committee member is one of `n` known guardians
    pub fn ensure_committee_within(&self, n: usize) -> Result<(), TrackingIdError> {
        match self.committee().into_iter().find(|&i| usize::from(i) >= n) {
            Some(i) => Err(TrackingIdError::PartyOutOfRange {
                index: usize::from(i),
                n,
            }),
            None => Ok(()),
        }
    }
}

impl fmt::Display for TrackingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}{sep}{}{sep}{}{sep}{}",
            self.protocol as u8,
            hex::encode(self.digest),
            hex::encode(self.auxiliary_data),
            hex::encode(self.parties_bitmap),
            sep = SEPARATOR,
        )
    }
}

impl fmt::Debug for TrackingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrackingId({self})")
    }
}

impl FromStr for TrackingId {
    type Err = TrackingIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != TRACKING_ID_HEX_STR_SIZE {
            return Err(TrackingIdError::WrongLength {
                expected: TRACKING_ID_HEX_STR_SIZE,
                actual: s.len(),
            });
        }
        let expected_parts = [1, DIGEST_SIZE, AUXILIARY_DATA_SIZE, PARTIES_BITMAP_SIZE];
        let parts = s.split(SEPARATOR).collect::<Vec<_>>();
        if parts.len() != expected_parts.len()
            || parts
                .iter()
                .zip(expected_parts)
                .any(|(part, size)| part.len() != 2 * size)
        {
            return Err(TrackingIdError::MalformedSeparators);
        }

        let mut bytes = Vec::with_capacity(TRACKING_ID_SIZE);
        for part in parts {
            bytes.extend(hex::decode(part).map_err(TrackingIdError::Hex)?);
        }
        Self::from_bytes(&bytes)
    }
}

impl Serialize for TrackingId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TrackingId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Malformed tracking id
#[derive(Debug, Error)]
pub enum TrackingIdError {
    /// Hex string has wrong length
    #[error("tracking id has wrong length: expected {expected}, actual {actual}")]
    WrongLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },
    /// Binary encoding has wrong size
    #[error("tracking id has wrong size: expected {expected} bytes, actual {actual}")]
    WrongSize {
        /// Expected size
        expected: usize,
        /// Actual size
        actual: usize,
    },
    /// Separators are misplaced
    #[error("tracking id separators are misplaced")]
    MalformedSeparators,
    /// Not a hex string
    #[error("tracking id is not hex encoded")]
    Hex(#[source] hex::FromHexError),
    /// Unknown protocol tag
    #[error("unknown protocol tag {0:#04x}")]
    UnknownProtocol(u8),
    /// Committee is empty
    #[error("tracking id committee is empty")]
    EmptyCommittee,
    /// Committee refers to unknown guardian
    #[error("committee member {index} is out of range (n={n})")]
    PartyOutOfRange {
        /// Index of committee member
        index: usize,
        /// Amount of known guardians
        n: usize,
    },
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use matches::assert_matches;

    use super::*;

    const DIGEST: Digest = hex!("7a3b1c5e9f1d2e4a6b8c0d1e2f3a4b5c6d7e8f90a1b2c3d4e5f60718293a4b5c");

    #[test]
    fn hex_string_has_constant_size() {
        let committee: Vec<PartyIndex> = (0..19).collect();
        let id = TrackingId::new(ProtocolTag::Ecdsa, DIGEST, ChainId(1), &committee).unwrap();
        let s = id.to_string();
        assert_eq!(s.len(), TRACKING_ID_HEX_STR_SIZE);
        assert_eq!(s.matches(SEPARATOR).count(), 3);

        let sparse = TrackingId::new(ProtocolTag::Frost, [0; 32], ChainId(u16::MAX), &[255]).unwrap();
        assert_eq!(sparse.to_string().len(), TRACKING_ID_HEX_STR_SIZE);

        assert_eq!(s.parse::<TrackingId>().unwrap(), id);
    }

    #[test]
    fn committee_bitmap() {
        let id = TrackingId::new(ProtocolTag::Ecdsa, DIGEST, ChainId(2), &[0, 3, 9]).unwrap();
        assert_eq!(id.committee(), vec![0, 3, 9]);
        assert!(id.contains(3));
        assert!(!id.contains(4));
        assert_eq!(id.chain_id(), ChainId(2));
        assert_eq!(id.digest(), &DIGEST);

        assert!(id.ensure_committee_within(10).is_ok());
        assert_matches!(
            id.ensure_committee_within(5),
            Err(TrackingIdError::PartyOutOfRange { index: 9, n: 5 })
        );
        assert_matches!(
            TrackingId::new(ProtocolTag::Ecdsa, DIGEST, ChainId(2), &[]),
            Err(TrackingIdError::EmptyCommittee)
        );
    }

    #[test]
    fn rejects_malformed_strings() {
        let id = TrackingId::new(ProtocolTag::Ecdsa, DIGEST, ChainId(1), &[0, 1, 2]).unwrap();
        let s = id.to_string();

        assert_matches!(
            s[1..].parse::<TrackingId>(),
            Err(TrackingIdError::WrongLength { .. })
        );

        let mut shifted = s.clone();
        shifted.replace_range(2..4, "0-");
        assert_matches!(
            shifted.parse::<TrackingId>(),
            Err(TrackingIdError::MalformedSeparators)
        );

        let mut unknown_protocol = s.clone();
        unknown_protocol.replace_range(0..2, "07");
        assert_matches!(
            unknown_protocol.parse::<TrackingId>(),
            Err(TrackingIdError::UnknownProtocol(7))
        );

        let mut not_hex = s;
        not_hex.replace_range(3..5, "zz");
        assert_matches!(not_hex.parse::<TrackingId>(), Err(TrackingIdError::Hex(_)));
    }

    #[test]
    fn binary_encoding_is_checked() {
        assert_matches!(
            TrackingId::from_bytes(&[1; 10]),
            Err(TrackingIdError::WrongSize { expected: TRACKING_ID_SIZE, actual: 10 })
        );
        let mut bytes = [0u8; TRACKING_ID_SIZE];
        bytes[0] = 1;
        assert_matches!(
            TrackingId::from_bytes(&bytes),
            Err(TrackingIdError::EmptyCommittee)
        );
    }
}
