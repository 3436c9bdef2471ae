//! Directory of guardian identities
//!
//! Every guardian is identified by its secp256k1 public key. The directory keeps identities sorted
//! by public key: position in the sorted list is the guardian's [`PartyIndex`], which is also its
//! bit position in committee bitmaps of a [`TrackingId`](crate::tracking_id::TrackingId).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use secp256k1::PublicKey;
use thiserror::Error;

/// Index of a guardian in the sorted directory
pub type PartyIndex = u16;

/// Maximum amount of guardians that fits into a committee bitmap
pub const MAX_PARTIES: usize = 256;

/// Port assumed when identity doesn't specify any
pub const DEFAULT_PORT: u16 = 8998;

/// Resolves guardians by their public key or index
pub trait IdentityResolver {
    /// Returns index of a guardian with given public key
    fn lookup_party_index(&self, party_identity: &PublicKey) -> Option<PartyIndex>;
    /// Returns guardian identity at given index
    fn lookup_party_identity(&self, party_index: PartyIndex) -> Option<&Arc<PartyIdentity>>;
}

/// Identity of a single guardian
///
/// Immutable once the directory is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartyIdentity {
    /// Human readable unique id
    pub id: String,
    /// Key the guardian signs broadcast messages with
    pub public_key: PublicKey,
    /// Position in the sorted directory
    pub index: PartyIndex,
    /// Host the guardian is reachable at
    pub hostname: String,
    /// Port the guardian is reachable at, `0` means [`DEFAULT_PORT`]
    pub port: u16,
}

impl PartyIdentity {
    /// Address in `host:port` form
    pub fn network_name(&self) -> String {
        let port = if self.port == 0 {
            DEFAULT_PORT
        } else {
            self.port
        };
        format!("{}:{}", self.hostname, port)
    }
}

impl fmt::Display for PartyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (#{})", self.id, self.index)
    }
}

/// Guardian description before it's assigned an index
#[derive(Debug, Clone)]
pub struct IdentityEntry {
    /// Unique id
    pub id: String,
    /// Public key
    pub public_key: PublicKey,
    /// Hostname
    pub hostname: String,
    /// Port
    pub port: u16,
}

/// Sorted set of all known guardians, including the local one
#[derive(Debug, Clone)]
pub struct Identities {
    sorted: Vec<Arc<PartyIdentity>>,
    ids: HashMap<String, PartyIndex>,
}

impl Identities {
    /// Builds a directory
    ///
    /// Entries are sorted by public key and indexed by their position. Ids and public keys must
    /// be unique.
    pub fn new(mut entries: Vec<IdentityEntry>) -> Result<Self, IdentityError> {
        if entries.is_empty() {
            return Err(IdentityError::Empty);
        }
        if entries.len() > MAX_PARTIES {
            return Err(IdentityError::TooMany {
                n: entries.len(),
                max: MAX_PARTIES,
            });
        }

        entries.sort_by(|a, b| a.public_key.cmp(&b.public_key));
        if let Some(pair) = entries
            .windows(2)
            .find(|pair| pair[0].public_key == pair[1].public_key)
        {
            return Err(IdentityError::DuplicateKey(pair[1].id.clone()));
        }

        let mut sorted = Vec::with_capacity(entries.len());
        let mut ids = HashMap::with_capacity(entries.len());
        for (i, entry) in entries.into_iter().enumerate() {
            // fits: len <= MAX_PARTIES
            let index = i as PartyIndex;
            if ids.insert(entry.id.clone(), index).is_some() {
                return Err(IdentityError::DuplicateId(entry.id));
            }
            sorted.push(Arc::new(PartyIdentity {
                id: entry.id,
                public_key: entry.public_key,
                index,
                hostname: entry.hostname,
                port: entry.port,
            }))
        }

        Ok(Self { sorted, ids })
    }

    /// Number of guardians
    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    /// Always `false`: empty directories can't be constructed
    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    /// Guardians ordered by index
    pub fn iter(&self) -> impl Iterator<Item = &Arc<PartyIdentity>> {
        self.sorted.iter()
    }

    /// Guardian at given index
    pub fn get(&self, index: PartyIndex) -> Option<&Arc<PartyIdentity>> {
        self.sorted.get(usize::from(index))
    }

    /// Guardian with given id
    pub fn by_id(&self, id: &str) -> Option<&Arc<PartyIdentity>> {
        self.ids.get(id).and_then(|&index| self.get(index))
    }

    /// Resolves an authenticated peer key back to a guardian
    ///
    /// Accepts SEC1 encoded public key, either compressed or not, as found in peer certificates.
    pub fn fetch_party_id(&self, public_key: &[u8]) -> Result<&Arc<PartyIdentity>, IdentityError> {
        let key = PublicKey::from_slice(public_key).map_err(IdentityError::InvalidPublicKey)?;
        self.lookup_party_index(&key)
            .and_then(|index| self.get(index))
            .ok_or(IdentityError::UnknownParty)
    }

    /// Checks that `identity` is exactly the one registered under its index
    pub fn is_known(&self, identity: &PartyIdentity) -> bool {
        self.get(identity.index)
            .map(|known| known.public_key == identity.public_key)
            .unwrap_or(false)
    }
}

impl IdentityResolver for Identities {
    fn lookup_party_index(&self, party_identity: &PublicKey) -> Option<PartyIndex> {
        self.sorted
            .binary_search_by(|p| p.public_key.cmp(party_identity))
            .ok()
            .and_then(|n| PartyIndex::try_from(n).ok())
    }

    fn lookup_party_identity(&self, party_index: PartyIndex) -> Option<&Arc<PartyIdentity>> {
        self.get(party_index)
    }
}

/// Guardian directory error
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Guardian set is empty
    #[error("guardian set is empty")]
    Empty,
    /// Too many guardians
    #[error("too many guardians: {n} > {max}")]
    TooMany {
        /// Amount of guardians provided
        n: usize,
        /// Maximum supported
        max: usize,
    },
    /// Two guardians share an id
    #[error("duplicate guardian id `{0}`")]
    DuplicateId(String),
    /// Two guardians share a public key
    #[error("guardian `{0}` reuses a public key of another guardian")]
    DuplicateKey(String),
    /// Malformed public key
    #[error("invalid public key")]
    InvalidPublicKey(#[source] secp256k1::Error),
    /// Key doesn't belong to any known guardian
    #[error("unknown guardian")]
    UnknownParty,
}

#[cfg(test)]
mod tests {
    use matches::assert_matches;
    use secp256k1::{PublicKey, SecretKey};

    use super::*;

    fn key(seed: u8) -> PublicKey {
        let sk = SecretKey::from_slice(&[seed; 32]).unwrap();
        PublicKey::from_secret_key_global(&sk)
    }

    fn entry(id: &str, seed: u8) -> IdentityEntry {
        IdentityEntry {
            id: id.to_string(),
            public_key: key(seed),
            hostname: format!("{id}.guardians"),
            port: 0,
        }
    }

    #[test]
    fn indexes_follow_key_order() {
        let identities =
            Identities::new(vec![entry("a", 1), entry("b", 2), entry("c", 3), entry("d", 4)])
                .unwrap();

        let mut keys = vec![key(1), key(2), key(3), key(4)];
        keys.sort();
        for (i, k) in keys.iter().enumerate() {
            let party = identities.get(i as u16).unwrap();
            assert_eq!(&party.public_key, k);
            assert_eq!(party.index, i as u16);
            assert_eq!(identities.lookup_party_index(k), Some(i as u16));
        }
    }

    #[test]
    fn rejects_duplicates() {
        let err = Identities::new(vec![entry("a", 1), entry("a", 2)]).unwrap_err();
        assert_matches!(err, IdentityError::DuplicateId(id) if id == "a");

        let err = Identities::new(vec![entry("a", 1), entry("b", 1)]).unwrap_err();
        assert_matches!(err, IdentityError::DuplicateKey(_));

        assert_matches!(Identities::new(vec![]), Err(IdentityError::Empty));
    }

    #[test]
    fn resolves_peer_keys() {
        let identities = Identities::new(vec![entry("a", 1), entry("b", 2)]).unwrap();

        let compressed = key(2).serialize();
        let uncompressed = key(2).serialize_uncompressed();
        let by_compressed = identities.fetch_party_id(&compressed).unwrap();
        let by_uncompressed = identities.fetch_party_id(&uncompressed).unwrap();
        assert_eq!(by_compressed.id, "b");
        assert_eq!(by_compressed, by_uncompressed);
        assert_eq!(identities.by_id("b"), Some(by_compressed));

        assert_matches!(
            identities.fetch_party_id(&key(3).serialize()),
            Err(IdentityError::UnknownParty)
        );
        assert_matches!(
            identities.fetch_party_id(&[1, 2, 3]),
            Err(IdentityError::InvalidPublicKey(_))
        );
    }

    #[test]
    fn default_port_applies() {
        let identities = Identities::new(vec![entry("a", 1)]).unwrap();
        let a = identities.by_id("a").unwrap();
        assert_eq!(a.network_name(), "a.guardians:8998");

        let mut other = (**a).clone();
        other.port = 443;
        assert_eq!(other.network_name(), "a.guardians:443");
        assert!(identities.is_known(&other));
        other.index = 5;
        assert!(!identities.is_known(&other));
    }
}
