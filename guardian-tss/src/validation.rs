//! Checks performed on received messages before they affect any state
//!
//! Every violated precondition has its own error, so protocol version skew can be diagnosed
//! from logs.

use std::time::{Duration, SystemTime};

use thiserror::Error;

use crate::full_party::{FullPartyError, ParsedMessage};
use crate::identity::{Identities, PartyIdentity, PartyIndex};
use crate::message::{Content, SignedMessage, Unicast};
use crate::rounds::SigningRound;
use crate::tracking_id::{TrackingId, TrackingIdError};

/// Checks fields of a signed message
pub fn validate_signed_message(
    msg: &SignedMessage,
    identities: &Identities,
) -> Result<(), ValidationError> {
    if identities.get(msg.sender).is_none() {
        return Err(ValidationError::UnknownSender(msg.sender));
    }
    if msg.signature.is_empty() {
        return Err(ValidationError::MissingSignature);
    }
    match &msg.content {
        Content::Tss(tss) if tss.payload.is_empty() => Err(ValidationError::EmptyPayload),
        Content::Announcement(a) if a.leader_signature.is_empty() => {
            Err(ValidationError::MissingLeaderSignature)
        }
        Content::Tss(_) | Content::Problem(_) | Content::Announcement(_) | Content::HashEcho(_) => {
            Ok(())
        }
    }
}

/// Checks fields of a unicast message
pub fn validate_unicast(msg: &Unicast) -> Result<(), ValidationError> {
    if msg.content.payload.is_empty() {
        return Err(ValidationError::EmptyPayload);
    }
    Ok(())
}

/// Checks that authenticated transport source is in the directory
pub fn validate_source(
    source: &PartyIdentity,
    identities: &Identities,
) -> Result<(), ValidationError> {
    if !identities.is_known(source) {
        return Err(ValidationError::UnknownSource(source.id.clone()));
    }
    Ok(())
}

/// Checks protocol message that arrived via reliable broadcast signed by `sender`
pub fn validate_broadcast_message(
    parsed: &ParsedMessage,
    sender: PartyIndex,
    n: usize,
) -> Result<(), ValidationError> {
    if !parsed.round.is_broadcast() {
        return Err(ValidationError::WrongRoundForBroadcast(parsed.round));
    }
    if parsed.from != sender {
        return Err(ValidationError::SenderMismatch {
            claimed: parsed.from,
            actual: sender,
        });
    }
    validate_tracking_id(&parsed.tracking_id, parsed.from, n)
}

/// Checks protocol message that arrived via unicast from `source`
pub fn validate_unicast_message(
    parsed: &ParsedMessage,
    source: PartyIndex,
    n: usize,
) -> Result<(), ValidationError> {
    if !parsed.round.is_unicast() {
        return Err(ValidationError::WrongRoundForUnicast(parsed.round));
    }
    if parsed.from != source {
        return Err(ValidationError::SourceMismatch {
            claimed: parsed.from,
            received_from: source,
        });
    }
    validate_tracking_id(&parsed.tracking_id, parsed.from, n)
}

fn validate_tracking_id(
    tracking_id: &TrackingId,
    from: PartyIndex,
    n: usize,
) -> Result<(), ValidationError> {
    tracking_id.ensure_committee_within(n)?;
    if !tracking_id.contains(from) {
        return Err(ValidationError::NotInCommittee(from));
    }
    Ok(())
}

/// Checks that a problem report is neither stale nor from the future
pub fn validate_problem_freshness(
    issued_at: SystemTime,
    now: SystemTime,
    max_age: Duration,
) -> Result<(), ValidationError> {
    match now.duration_since(issued_at) {
        Ok(age) if age > max_age => Err(ValidationError::StaleProblem { age }),
        Ok(_) => Ok(()),
        Err(err) if err.duration() > max_age => Err(ValidationError::ProblemFromFuture {
            ahead: err.duration(),
        }),
        Err(_) => Ok(()),
    }
}

/// Message is malformed
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Sender is not in the directory
    #[error("unknown sender #{0}")]
    UnknownSender(PartyIndex),
    /// Transport source is not in the directory
    #[error("unknown source `{0}`")]
    UnknownSource(String),
    /// Signature is missing
    #[error("signed message is missing signature")]
    MissingSignature,
    /// Announcement misses leader signature
    #[error("announcement is missing leader signature")]
    MissingLeaderSignature,
    /// Payload is empty
    #[error("empty payload")]
    EmptyPayload,
    /// Signing engine couldn't parse the payload
    #[error("couldn't parse protocol message")]
    Parse(#[source] FullPartyError),
    /// Unicast round message arrived via broadcast
    #[error("wrong round for broadcast: {0} messages must be sent via unicast")]
    WrongRoundForBroadcast(SigningRound),
    /// Broadcast round message arrived via unicast
    #[error("wrong round for unicast: {0} messages must be sent via broadcast")]
    WrongRoundForUnicast(SigningRound),
    /// Parsed message claims to be produced by someone else than its signer
    #[error("message claims to be from #{claimed}, but it's signed by #{actual}")]
    SenderMismatch {
        /// Sender claimed by protocol message
        claimed: PartyIndex,
        /// Signer of the message
        actual: PartyIndex,
    },
    /// Parsed unicast claims to be produced by someone else than transport source
    #[error("unicast claims to be from #{claimed}, but it was received from #{received_from}")]
    SourceMismatch {
        /// Sender claimed by protocol message
        claimed: PartyIndex,
        /// Authenticated transport source
        received_from: PartyIndex,
    },
    /// Sender is not in the committee of the tracking id
    #[error("guardian #{0} is not in the committee")]
    NotInCommittee(PartyIndex),
    /// Malformed tracking id
    #[error("invalid tracking id")]
    TrackingId(
        #[from]
        #[source]
        TrackingIdError,
    ),
    /// Problem report is too old
    #[error("problem report is stale: issued {age:?} ago")]
    StaleProblem {
        /// Age of the problem
        age: Duration,
    },
    /// Problem report is issued in the future
    #[error("problem report is issued {ahead:?} in the future")]
    ProblemFromFuture {
        /// How far in the future
        ahead: Duration,
    },
}
