//! Guardian storage: keys, guardian set and configuration
//!
//! Storage is loaded once at startup from a JSON file. Any inconsistency is a fatal error.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use secp256k1::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::{Identities, IdentityEntry, IdentityError, IdentityResolver, PartyIdentity};
use crate::quorum::max_broadcast_faults;
use crate::tracking_id::ChainId;

/// Tunables of the engine
///
/// Durations are (de)serialized as milliseconds. Missing fields take default values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configurations {
    /// Maximum amount of signings a guardian can be involved into simultaneously
    pub max_simultaneous_signatures: usize,
    /// Maximum lifetime of a signing attempt
    #[serde(with = "duration_millis")]
    pub max_signer_ttl: Duration,
    /// Maximum amount of signings tracked by fault tracker
    pub max_tracked_signatures: usize,
    /// How long to wait for own approval of a digest others are signing, before reporting a
    /// problem
    #[serde(with = "duration_millis")]
    pub delay_grace_time: Duration,
    /// How long a guardian that reported a problem is excluded from committees
    #[serde(with = "duration_millis")]
    pub guardian_down_time: Duration,
    /// Upper bound of deterministic jitter added to the exclusion
    #[serde(with = "duration_millis")]
    pub max_jitter: Duration,
    /// Problem reports older than that are rejected
    #[serde(with = "duration_millis")]
    pub max_heartbeat_interval: Duration,
    /// Guardians whose exclusion ends within this interval are considered coming back
    #[serde(with = "duration_millis")]
    pub synchronising_interval: Duration,
    /// Chains the local guardian never reports problems for
    pub chains_with_no_self_report: Vec<ChainId>,
    /// First delay of reconnecting to a peer
    #[serde(with = "duration_millis")]
    pub reconnect_base_backoff: Duration,
    /// Maximum delay of reconnecting to a peer
    #[serde(with = "duration_millis")]
    pub reconnect_max_backoff: Duration,
}

impl Default for Configurations {
    fn default() -> Self {
        Self {
            max_simultaneous_signatures: 50,
            max_signer_ttl: Duration::from_secs(5 * 60),
            max_tracked_signatures: 10_000,
            delay_grace_time: Duration::from_secs(10),
            guardian_down_time: Duration::from_secs(60),
            max_jitter: Duration::from_secs(5),
            max_heartbeat_interval: Duration::from_secs(30),
            synchronising_interval: Duration::from_secs(2),
            chains_with_no_self_report: vec![],
            reconnect_base_backoff: Duration::from_secs(1),
            reconnect_max_backoff: Duration::from_secs(60),
        }
    }
}

impl Configurations {
    /// How long received messages and counters are kept
    ///
    /// Twice the signer TTL, so a forgotten message can't be replayed into a live signing
    /// to equivocate, even with clock offsets between guardians.
    pub fn cleanup_ttl(&self) -> Duration {
        self.max_signer_ttl * 2
    }

    /// Replaces zero limits with defaults
    fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.max_simultaneous_signatures == 0 {
            self.max_simultaneous_signatures = defaults.max_simultaneous_signatures;
        }
        if self.max_signer_ttl.is_zero() {
            self.max_signer_ttl = defaults.max_signer_ttl;
        }
        if self.max_tracked_signatures == 0 {
            self.max_tracked_signatures = defaults.max_tracked_signatures;
        }
        self
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Guardian as listed in storage file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Unique id
    pub id: String,
    /// Hex encoded SEC1 public key
    pub public_key: String,
    /// Hostname
    #[serde(default)]
    pub hostname: String,
    /// Port
    #[serde(default)]
    pub port: u16,
}

/// Layout of storage file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageFile {
    /// Hex encoded secret key of the local guardian
    pub secret_key: String,
    /// Non-inclusive signing threshold
    pub threshold: usize,
    /// All guardians, including the local one
    pub guardians: Vec<IdentityConfig>,
    /// Id of the guardian allowed to announce digests
    #[serde(default)]
    pub leader: Option<String>,
    /// Tunables
    #[serde(default)]
    pub config: Configurations,
}

/// Everything a guardian needs to participate in signing
#[derive(Debug, Clone)]
pub struct GuardianStorage {
    /// Tunables
    pub config: Configurations,
    me: Arc<PartyIdentity>,
    signing_key: SecretKey,
    guardians: Arc<Identities>,
    threshold: usize,
    leader: Option<Arc<PartyIdentity>>,
}

impl GuardianStorage {
    /// Constructs storage
    ///
    /// `threshold` is non-inclusive: `threshold + 1` guardians sign.
    pub fn new(
        signing_key: SecretKey,
        guardians: Identities,
        threshold: usize,
        leader: Option<&str>,
        config: Configurations,
    ) -> Result<Self, StorageError> {
        let public_key = PublicKey::from_secret_key_global(&signing_key);
        let me = guardians
            .lookup_party_index(&public_key)
            .and_then(|i| guardians.get(i))
            .cloned()
            .ok_or(StorageError::SelfNotInGuardianSet)?;
        if threshold >= guardians.len() {
            return Err(StorageError::InvalidThreshold {
                threshold,
                n: guardians.len(),
            });
        }
        let leader = leader
            .map(|id| {
                guardians
                    .by_id(id)
                    .cloned()
                    .ok_or_else(|| StorageError::UnknownLeader(id.to_string()))
            })
            .transpose()?;

        Ok(Self {
            config: config.normalized(),
            me,
            signing_key,
            guardians: Arc::new(guardians),
            threshold,
            leader,
        })
    }

    /// Loads storage from JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let bytes = std::fs::read(path.as_ref()).map_err(StorageError::Read)?;
        let file: StorageFile = serde_json::from_slice(&bytes).map_err(StorageError::Parse)?;
        Self::from_file(file)
    }

    /// Constructs storage from parsed storage file
    pub fn from_file(file: StorageFile) -> Result<Self, StorageError> {
        let signing_key = hex::decode(&file.secret_key)
            .map_err(|_| StorageError::MalformedSecretKey)
            .and_then(|bytes| {
                SecretKey::from_slice(&bytes).map_err(StorageError::InvalidSecretKey)
            })?;

        let entries = file
            .guardians
            .into_iter()
            .map(|g| {
                let key = hex::decode(&g.public_key)
                    .map_err(|_| StorageError::InvalidGuardianKey(g.id.clone()))?;
                let public_key = PublicKey::from_slice(&key)
                    .map_err(|_| StorageError::InvalidGuardianKey(g.id.clone()))?;
                Ok(IdentityEntry {
                    id: g.id,
                    public_key,
                    hostname: g.hostname,
                    port: g.port,
                })
            })
            .collect::<Result<Vec<_>, StorageError>>()?;
        let guardians = Identities::new(entries)?;

        Self::new(
            signing_key,
            guardians,
            file.threshold,
            file.leader.as_deref(),
            file.config,
        )
    }

    /// Local guardian
    pub fn me(&self) -> &Arc<PartyIdentity> {
        &self.me
    }

    /// All guardians
    pub fn guardians(&self) -> &Arc<Identities> {
        &self.guardians
    }

    /// Non-inclusive signing threshold
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Maximum amount of faulty guardians tolerated by reliable broadcast
    pub fn max_expected_faults(&self) -> usize {
        max_broadcast_faults(self.threshold)
    }

    /// Guardian allowed to announce digests
    pub fn leader(&self) -> Option<&Arc<PartyIdentity>> {
        self.leader.as_ref()
    }

    /// Whether the local guardian is the leader
    pub fn is_leader(&self) -> bool {
        self.leader
            .as_ref()
            .map(|leader| leader.index == self.me.index)
            .unwrap_or(false)
    }

    /// Signing key of the local guardian
    pub fn signing_key(&self) -> &SecretKey {
        &self.signing_key
    }
}

/// Storage is corrupted
#[derive(Debug, Error)]
pub enum StorageError {
    /// Couldn't read the file
    #[error("couldn't read guardian storage")]
    Read(#[source] std::io::Error),
    /// File is not a valid storage
    #[error("couldn't parse guardian storage")]
    Parse(#[source] serde_json::Error),
    /// Secret key is not hex encoded
    #[error("secret key is not hex encoded")]
    MalformedSecretKey,
    /// Secret key is not a valid scalar
    #[error("invalid secret key")]
    InvalidSecretKey(#[source] secp256k1::Error),
    /// Public key of a guardian is malformed
    #[error("invalid public key of guardian `{0}`")]
    InvalidGuardianKey(String),
    /// Guardian set is invalid
    #[error("invalid guardian set")]
    Identities(
        #[from]
        #[source]
        IdentityError,
    ),
    /// Secret key doesn't belong to any guardian
    #[error("local guardian is not in the guardian set")]
    SelfNotInGuardianSet,
    /// Threshold doesn't fit guardian set
    #[error("threshold {threshold} is too large for {n} guardians")]
    InvalidThreshold {
        /// Threshold
        threshold: usize,
        /// Amount of guardians
        n: usize,
    },
    /// Leader is not in the guardian set
    #[error("leader `{0}` is not in the guardian set")]
    UnknownLeader(String),
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use matches::assert_matches;

    use super::*;

    fn guardian(id: &str, seed: u8) -> IdentityConfig {
        let sk = SecretKey::from_slice(&[seed; 32]).unwrap();
        IdentityConfig {
            id: id.to_string(),
            public_key: hex::encode(PublicKey::from_secret_key_global(&sk).serialize()),
            hostname: format!("{id}.example"),
            port: 0,
        }
    }

    fn storage_file() -> StorageFile {
        StorageFile {
            secret_key: hex::encode([2u8; 32]),
            threshold: 2,
            guardians: vec![guardian("g1", 1), guardian("g2", 2), guardian("g3", 3), guardian("g4", 4)],
            leader: Some("g1".to_string()),
            config: Configurations::default(),
        }
    }

    #[test]
    fn loads_from_file() {
        let json = r#"{
            "secret_key": "SECRET",
            "threshold": 2,
            "guardians": GUARDIANS,
            "leader": "g2",
            "config": { "max_simultaneous_signatures": 7, "max_signer_ttl": 1500, "chains_with_no_self_report": [3] }
        }"#
        .replace("SECRET", &hex::encode([2u8; 32]))
        .replace(
            "GUARDIANS",
            &serde_json::to_string(&storage_file().guardians).unwrap(),
        );
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let storage = GuardianStorage::load(file.path()).unwrap();
        assert_eq!(storage.me().id, "g2");
        assert!(storage.is_leader());
        assert_eq!(storage.threshold(), 2);
        assert_eq!(storage.max_expected_faults(), 1);
        assert_eq!(storage.guardians().len(), 4);
        assert_eq!(storage.config.max_simultaneous_signatures, 7);
        assert_eq!(storage.config.max_signer_ttl, Duration::from_millis(1500));
        assert_eq!(storage.config.cleanup_ttl(), Duration::from_millis(3000));
        assert_eq!(storage.config.chains_with_no_self_report, vec![ChainId(3)]);
        assert_eq!(
            storage.config.guardian_down_time,
            Configurations::default().guardian_down_time
        );
    }

    #[test]
    fn zero_limits_take_defaults() {
        let mut file = storage_file();
        file.config.max_simultaneous_signatures = 0;
        file.config.max_signer_ttl = Duration::ZERO;
        let storage = GuardianStorage::from_file(file).unwrap();
        assert_eq!(storage.config, Configurations::default());
        assert!(!storage.is_leader());
    }

    #[test]
    fn rejects_inconsistent_storage() {
        let mut file = storage_file();
        file.secret_key = hex::encode([9u8; 32]);
        assert_matches!(
            GuardianStorage::from_file(file),
            Err(StorageError::SelfNotInGuardianSet)
        );

        let mut file = storage_file();
        file.threshold = 4;
        assert_matches!(
            GuardianStorage::from_file(file),
            Err(StorageError::InvalidThreshold { threshold: 4, n: 4 })
        );

        let mut file = storage_file();
        file.leader = Some("g9".to_string());
        assert_matches!(
            GuardianStorage::from_file(file),
            Err(StorageError::UnknownLeader(_))
        );

        let mut file = storage_file();
        file.guardians[3].public_key = "02abcd".to_string();
        assert_matches!(
            GuardianStorage::from_file(file),
            Err(StorageError::InvalidGuardianKey(id)) if id == "g4"
        );

        let mut file = storage_file();
        file.guardians[3].id = "g1".to_string();
        assert_matches!(
            GuardianStorage::from_file(file),
            Err(StorageError::Identities(IdentityError::DuplicateId(_)))
        );

        let mut file = storage_file();
        file.secret_key = "not hex".to_string();
        assert_matches!(
            GuardianStorage::from_file(file),
            Err(StorageError::MalformedSecretKey)
        );

        assert_matches!(
            GuardianStorage::load("/definitely/not/here.json"),
            Err(StorageError::Read(_))
        );
    }
}
