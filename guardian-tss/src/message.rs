//! Messages exchanged between guardians
//!
//! Guardians exchange two kinds of messages:
//! * [`Echo`] is a reliably broadcasted [`SignedMessage`]. The guardian that produced the content
//!   signs it; peers re-echo either the content itself or a [`HashEcho`] referring to it
//! * [`Unicast`] is a direct message which is authenticated by the transport only
//!
//! Content is hashed with a domain separated, deterministic encoding of each variant. Signatures
//! cover `uuid ‖ content digest`, so a hash echo can be verified without having the content.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

use crate::identity::{PartyIdentity, PartyIndex};
use crate::rounds::SigningRound;
use crate::tracking_id::{ChainId, Digest, TrackingId};

/// Identifies a broadcast slot: a single message of a single sender
///
/// Two different contents under the same uuid is an equivocation.
pub type Uuid = [u8; 32];

const TSS_CONTENT_DOMAIN: &[u8] = b"guardian-tss/content/tss";
const PROBLEM_DOMAIN: &[u8] = b"guardian-tss/content/problem";
const ANNOUNCEMENT_DOMAIN: &[u8] = b"guardian-tss/content/announcement";
const SIGNED_MESSAGE_DOMAIN: &[u8] = b"guardian-tss/signed-message";

const TSS_UUID_DOMAIN: &[u8] = b"guardian-tss/uuid/tss";
const PROBLEM_UUID_DOMAIN: &[u8] = b"guardian-tss/uuid/problem";
const ANNOUNCEMENT_UUID_DOMAIN: &[u8] = b"guardian-tss/uuid/announcement";

/// Protocol message of the signing engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TssContent {
    /// Serialized protocol message
    pub payload: Vec<u8>,
    /// Sequence number assigned by the sender
    pub msg_serial_number: u64,
}

/// Report of a guardian that it has a problem signing on a chain
///
/// Once delivered, the issuer is excluded from committees of that chain for a while.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Problem {
    /// Chain the issuer can't sign on
    pub chain: ChainId,
    /// Issuing time, milliseconds since unix epoch
    pub issuing_time: u64,
}

impl Problem {
    /// Problem issued at current time
    pub fn issued_now(chain: ChainId) -> Self {
        Self {
            chain,
            issuing_time: unix_millis(SystemTime::now()),
        }
    }

    /// Issuing time
    pub fn issued_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.issuing_time)
    }

    /// Uuid of the problem reported by `issuer`
    pub fn uuid(&self, issuer: PartyIndex) -> Uuid {
        Sha256::new()
            .chain_update(PROBLEM_UUID_DOMAIN)
            .chain_update(issuer.to_be_bytes())
            .chain_update(self.chain.to_bytes())
            .chain_update(self.issuing_time.to_be_bytes())
            .finalize()
            .into()
    }
}

/// Leader announcing a digest every guardian should sign
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    /// Digest to sign
    pub digest: Digest,
    /// Chain the digest belongs to
    pub chain: ChainId,
    /// Consistency level of the observation
    pub consistency_level: u8,
    /// Recoverable leader signature, see [`leader`](crate::leader)
    pub leader_signature: Vec<u8>,
}

impl Announcement {
    /// Uuid of announcement made by `leader`
    pub fn uuid(&self, leader: PartyIndex) -> Uuid {
        Sha256::new()
            .chain_update(ANNOUNCEMENT_UUID_DOMAIN)
            .chain_update(leader.to_be_bytes())
            .chain_update(self.digest)
            .chain_update(self.chain.to_bytes())
            .finalize()
            .into()
    }
}

/// Echo of a message that refers to it by digest instead of carrying it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashEcho {
    /// Uuid of the echoed message
    pub session_uuid: Uuid,
    /// [`Content::digest`] of the echoed message
    pub original_content_digest: Digest,
}

/// Content of a reliably broadcasted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    /// Signing protocol message
    Tss(TssContent),
    /// Problem report
    Problem(Problem),
    /// Leader announcement
    Announcement(Announcement),
    /// Echo by digest
    HashEcho(HashEcho),
}

impl Content {
    /// Domain separated digest of the content
    ///
    /// For [`Content::HashEcho`] it's the digest of referred content.
    pub fn digest(&self) -> Digest {
        match self {
            Content::Tss(tss) => Sha256::new()
                .chain_update(TSS_CONTENT_DOMAIN)
                .chain_update((tss.payload.len() as u64).to_be_bytes())
                .chain_update(&tss.payload)
                .chain_update(tss.msg_serial_number.to_be_bytes())
                .finalize()
                .into(),
            Content::Problem(problem) => Sha256::new()
                .chain_update(PROBLEM_DOMAIN)
                .chain_update(problem.chain.to_bytes())
                .chain_update(problem.issuing_time.to_be_bytes())
                .finalize()
                .into(),
            Content::Announcement(a) => Sha256::new()
                .chain_update(ANNOUNCEMENT_DOMAIN)
                .chain_update(a.digest)
                .chain_update(a.chain.to_bytes())
                .chain_update([a.consistency_level])
                .chain_update((a.leader_signature.len() as u64).to_be_bytes())
                .chain_update(&a.leader_signature)
                .finalize()
                .into(),
            Content::HashEcho(echo) => echo.original_content_digest,
        }
    }

    /// Short name of the variant, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Content::Tss(_) => "tss",
            Content::Problem(_) => "problem",
            Content::Announcement(_) => "announcement",
            Content::HashEcho(_) => "hash-echo",
        }
    }
}

/// Uuid of a signing protocol message
pub fn tss_uuid(tracking_id: &TrackingId, round: SigningRound, from: PartyIndex) -> Uuid {
    Sha256::new()
        .chain_update(TSS_UUID_DOMAIN)
        .chain_update(tracking_id.to_bytes())
        .chain_update([round.number()])
        .chain_update(from.to_be_bytes())
        .finalize()
        .into()
}

/// Content signed by the guardian that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedMessage {
    /// Guardian that produced and signed the content
    pub sender: PartyIndex,
    /// Content
    pub content: Content,
    /// Compact ECDSA signature over [`SignedMessage::signing_digest`]
    pub signature: Vec<u8>,
}

impl SignedMessage {
    /// Digest being signed: `H(domain ‖ uuid ‖ content digest)`
    pub fn signing_digest(uuid: &Uuid, content_digest: &Digest) -> Digest {
        Sha256::new()
            .chain_update(SIGNED_MESSAGE_DOMAIN)
            .chain_update(uuid)
            .chain_update(content_digest)
            .finalize()
            .into()
    }

    /// Signs the content
    pub fn sign(sender: PartyIndex, content: Content, uuid: &Uuid, key: &SecretKey) -> Self {
        let digest = Self::signing_digest(uuid, &content.digest());
        let signature = SECP256K1.sign_ecdsa(&Message::from_digest(digest), key);
        Self {
            sender,
            content,
            signature: signature.serialize_compact().to_vec(),
        }
    }

    /// Verifies signature against sender's public key
    pub fn verify(&self, uuid: &Uuid, sender_key: &PublicKey) -> Result<(), SignatureError> {
        let signature =
            Signature::from_compact(&self.signature).map_err(SignatureError::Malformed)?;
        let digest = Self::signing_digest(uuid, &self.content.digest());
        SECP256K1
            .verify_ecdsa(&Message::from_digest(digest), &signature, sender_key)
            .map_err(SignatureError::Mismatched)
    }

    /// Hash echo of this message
    ///
    /// Keeps the sender and the signature: the echo remains verifiable against the original
    /// sender.
    pub fn to_hash_echo(&self, uuid: Uuid) -> SignedMessage {
        SignedMessage {
            sender: self.sender,
            content: Content::HashEcho(HashEcho {
                session_uuid: uuid,
                original_content_digest: self.content.digest(),
            }),
            signature: self.signature.clone(),
        }
    }
}

/// Signature verification error
#[derive(Debug, Error)]
pub enum SignatureError {
    /// Signature is not a valid compact signature
    #[error("malformed signature")]
    Malformed(#[source] secp256k1::Error),
    /// Signature doesn't match the message
    #[error("signature doesn't match the message")]
    Mismatched(#[source] secp256k1::Error),
}

/// Reliably broadcasted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Echo {
    /// Signed content
    pub message: SignedMessage,
}

/// Direct message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unicast {
    /// Protocol message
    pub content: TssContent,
}

/// Message travelling between guardians
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropagatedMessage {
    /// Broadcast
    Echo(Echo),
    /// Unicast
    Unicast(Unicast),
}

/// Message received from an authenticated peer
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Peer the message was received from
    ///
    /// For echoes, it is the echoer, not necessarily the original sender.
    pub source: Arc<PartyIdentity>,
    /// Received message
    pub message: PropagatedMessage,
}

impl IncomingMessage {
    /// Whether message was broadcasted
    pub fn is_broadcast(&self) -> bool {
        matches!(self.message, PropagatedMessage::Echo(_))
    }

    /// Whether message is unicast
    pub fn is_unicast(&self) -> bool {
        matches!(self.message, PropagatedMessage::Unicast(_))
    }
}

/// Message to be sent by the transport
#[derive(Debug, Clone)]
pub struct Sendable {
    /// Message
    pub message: PropagatedMessage,
    /// Guardians to deliver the message to
    pub recipients: Vec<Arc<PartyIdentity>>,
}

impl Sendable {
    /// Whether message is broadcasted
    pub fn is_broadcast(&self) -> bool {
        matches!(self.message, PropagatedMessage::Echo(_))
    }
}

pub(crate) fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use matches::assert_matches;
    use secp256k1::{PublicKey, SecretKey};

    use super::*;
    use crate::tracking_id::ProtocolTag;

    fn keypair(seed: u8) -> (SecretKey, PublicKey) {
        let sk = SecretKey::from_slice(&[seed; 32]).unwrap();
        (sk, PublicKey::from_secret_key_global(&sk))
    }

    fn tss(payload: &[u8]) -> Content {
        Content::Tss(TssContent {
            payload: payload.to_vec(),
            msg_serial_number: 7,
        })
    }

    #[test]
    fn hash_echo_verifies_without_content() {
        let (sk, pk) = keypair(1);
        let uuid = [5; 32];
        let original = SignedMessage::sign(0, tss(b"round 3 message"), &uuid, &sk);
        original.verify(&uuid, &pk).unwrap();

        let echo = original.to_hash_echo(uuid);
        assert_eq!(echo.content.digest(), original.content.digest());
        echo.verify(&uuid, &pk).unwrap();

        let (_, other_pk) = keypair(2);
        assert_matches!(
            echo.verify(&uuid, &other_pk),
            Err(SignatureError::Mismatched(_))
        );
        assert_matches!(
            original.verify(&[6; 32], &pk),
            Err(SignatureError::Mismatched(_))
        );
    }

    #[test]
    fn tampered_content_fails_verification() {
        let (sk, pk) = keypair(1);
        let uuid = [5; 32];
        let mut msg = SignedMessage::sign(0, tss(b"payload"), &uuid, &sk);
        msg.content = tss(b"payl0ad");
        assert_matches!(msg.verify(&uuid, &pk), Err(SignatureError::Mismatched(_)));

        msg.signature.truncate(10);
        assert_matches!(msg.verify(&uuid, &pk), Err(SignatureError::Malformed(_)));
    }

    #[test]
    fn digests_are_domain_separated() {
        let problem = Content::Problem(Problem {
            chain: ChainId(1),
            issuing_time: 0,
        });
        let tss_with_same_bytes = tss(&[0, 1, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_ne!(problem.digest(), tss_with_same_bytes.digest());
        assert_ne!(tss(b"a").digest(), tss(b"b").digest());
    }

    #[test]
    fn uuid_ignores_message_content() {
        let digest = hex!("1111111111111111111111111111111111111111111111111111111111111111");
        let id = TrackingId::new(ProtocolTag::Ecdsa, digest, ChainId(1), &[0, 1, 2]).unwrap();
        let uuid = tss_uuid(&id, SigningRound::Round4, 1);

        assert_eq!(uuid, tss_uuid(&id, SigningRound::Round4, 1));
        assert_ne!(uuid, tss_uuid(&id, SigningRound::Round5, 1));
        assert_ne!(uuid, tss_uuid(&id, SigningRound::Round4, 2));

        let problem = Problem {
            chain: ChainId(3),
            issuing_time: 1_700_000_000_000,
        };
        assert_ne!(problem.uuid(1), problem.uuid(2));
    }
}
