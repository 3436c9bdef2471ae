//! Digest announcements made by the leader guardian
//!
//! The leader signs announced digests with a recoverable signature. Recipients recover the
//! signer's Ethereum-style address (last 20 bytes of keccak-256 of the uncompressed public key)
//! and compare it with the address of the leader in the current guardian set.

use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use sha3::{Digest as _, Keccak256};
use thiserror::Error;

use crate::message::Announcement;
use crate::tracking_id::{ChainId, Digest};

const ANNOUNCEMENT_PREFIX: &[u8] = b"guardian-tss/leader-announcement";

/// Size of recoverable signature: compact signature followed by recovery id
pub const RECOVERABLE_SIGNATURE_SIZE: usize = 65;

/// Ethereum-style address
pub type EthAddress = [u8; 20];

/// Address of the public key
pub fn eth_address(public_key: &PublicKey) -> EthAddress {
    let hash = Keccak256::digest(&public_key.serialize_uncompressed()[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    address
}

fn announcement_hash(digest: &Digest, chain: ChainId, consistency_level: u8) -> [u8; 32] {
    Keccak256::new()
        .chain_update(ANNOUNCEMENT_PREFIX)
        .chain_update(digest)
        .chain_update(chain.to_bytes())
        .chain_update([consistency_level])
        .finalize()
        .into()
}

/// Announces a digest, signed by leader's key
pub fn sign_announcement(
    digest: Digest,
    chain: ChainId,
    consistency_level: u8,
    leader_key: &SecretKey,
) -> Announcement {
    let hash = announcement_hash(&digest, chain, consistency_level);
    let (recovery_id, signature) = SECP256K1
        .sign_ecdsa_recoverable(&Message::from_digest(hash), leader_key)
        .serialize_compact();

    let mut leader_signature = Vec::with_capacity(RECOVERABLE_SIGNATURE_SIZE);
    leader_signature.extend_from_slice(&signature);
    // recovery id is within 0..=3
    leader_signature.push(recovery_id.to_i32() as u8);

    Announcement {
        digest,
        chain,
        consistency_level,
        leader_signature,
    }
}

/// Recovers address of the guardian that signed the announcement
pub fn recover_signer(announcement: &Announcement) -> Result<EthAddress, LeaderError> {
    let sig = &announcement.leader_signature;
    if sig.len() != RECOVERABLE_SIGNATURE_SIZE {
        return Err(LeaderError::WrongSignatureSize(sig.len()));
    }
    let recovery_id =
        RecoveryId::from_i32(i32::from(sig[64])).map_err(LeaderError::MalformedSignature)?;
    let signature = RecoverableSignature::from_compact(&sig[..64], recovery_id)
        .map_err(LeaderError::MalformedSignature)?;

    let hash = announcement_hash(
        &announcement.digest,
        announcement.chain,
        announcement.consistency_level,
    );
    let public_key = SECP256K1
        .recover_ecdsa(&Message::from_digest(hash), &signature)
        .map_err(LeaderError::Recovery)?;
    Ok(eth_address(&public_key))
}

/// Checks that announcement is signed by the leader
pub fn verify_announcement(
    announcement: &Announcement,
    leader: &PublicKey,
) -> Result<(), LeaderError> {
    let signer = recover_signer(announcement)?;
    let expected = eth_address(leader);
    if signer != expected {
        return Err(LeaderError::NotLeader {
            signer: hex::encode(signer),
            leader: hex::encode(expected),
        });
    }
    Ok(())
}

/// Announcement can't be attributed to the leader
#[derive(Debug, Error)]
pub enum LeaderError {
    /// Guardian set has no leader
    #[error("no leader is configured")]
    NoLeader,
    /// Signature has wrong size
    #[error("leader signature must be {RECOVERABLE_SIGNATURE_SIZE} bytes, got {0}")]
    WrongSignatureSize(usize),
    /// Signature is malformed
    #[error("malformed leader signature")]
    MalformedSignature(#[source] secp256k1::Error),
    /// Public key can't be recovered
    #[error("couldn't recover signer of the announcement")]
    Recovery(#[source] secp256k1::Error),
    /// Announcement is signed by someone else
    #[error("announcement is signed by 0x{signer}, but leader is 0x{leader}")]
    NotLeader {
        /// Recovered address
        signer: String,
        /// Leader address
        leader: String,
    },
    /// Announcement was broadcasted by a guardian other than the leader
    #[error("announcement is broadcasted by guardian #{0} which is not the leader")]
    NotBroadcastedByLeader(u16),
}
