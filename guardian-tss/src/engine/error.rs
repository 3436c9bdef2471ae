use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::broadcast::BroadcastError;
use crate::full_party::FullPartyError;
use crate::identity::{PartyIdentity, PartyIndex};
use crate::leader::LeaderError;
use crate::rounds::SigningRound;
use crate::tracking_id::TrackingId;
use crate::validation::ValidationError;

/// Engine error
#[derive(Debug, Error)]
pub enum EngineError {
    /// Engine was built without signing engine
    #[error("signing engine is not provided")]
    MissingFullParty,
    /// Engine is not started
    #[error("engine is not started")]
    NotStarted,
    /// Engine can be started only once
    #[error("engine is already started")]
    AlreadyStarted,
    /// Engine is shutting down
    #[error("engine is shutting down")]
    ShuttingDown,
    /// Fault tracker task is gone
    #[error("fault tracker is unavailable")]
    TrackerUnavailable,
    /// Network output buffer is full, message is not sent
    #[error("network output buffer is full")]
    OutgoingBufferFull,
    /// Fault tracker command buffer is full
    #[error("fault tracker command buffer is full")]
    TrackerBufferFull,
    /// Digest is not 32 bytes long
    #[error("digest must be 32 bytes long, got {0} bytes")]
    InvalidDigestLength(usize),
    /// Local guardian reached the limit of simultaneous signatures
    #[error("local guardian reached maximum of {max} simultaneous signatures")]
    TooManySimultaneousSignatures {
        /// Limit
        max: usize,
    },
    /// Remote guardian reached the limit of simultaneous signatures
    #[error("guardian #{guardian} reached maximum of {max} simultaneous signatures")]
    GuardianOverloaded {
        /// Guardian
        guardian: PartyIndex,
        /// Limit
        max: usize,
    },
    /// Local guardian is not the leader
    #[error("only the leader can announce digests")]
    NotLeader,
    /// Signing engine failed
    #[error("signing engine error")]
    FullParty(
        #[from]
        #[source]
        FullPartyError,
    ),
    /// Received message is malformed
    #[error("invalid message")]
    Validation(
        #[from]
        #[source]
        ValidationError,
    ),
    /// Reliable broadcast rejected the message
    #[error("reliable broadcast error")]
    Broadcast(
        #[from]
        #[source]
        BroadcastError,
    ),
    /// Announcement is not made by the leader
    #[error("invalid leader announcement")]
    Leader(
        #[from]
        #[source]
        LeaderError,
    ),
}

impl EngineError {
    /// Whether error proves that a guardian is byzantine
    pub fn is_equivocation(&self) -> bool {
        matches!(self, EngineError::Broadcast(err) if err.is_equivocation())
    }

    /// Whether error is caused by exhausted capacity, and can be retried later
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            EngineError::TooManySimultaneousSignatures { .. }
                | EngineError::GuardianOverloaded { .. }
                | EngineError::OutgoingBufferFull
                | EngineError::TrackerBufferFull
        )
    }

    /// Whether error is caused by malformed input
    pub fn is_malformed_input(&self) -> bool {
        match self {
            EngineError::Validation(_) | EngineError::Leader(_) => true,
            EngineError::Broadcast(err) => !err.is_equivocation(),
            _ => false,
        }
    }
}

/// Error of handling a received message, with whatever context was known at the time
#[derive(Debug)]
pub struct IncomingError {
    /// Signing attempt the message belongs to
    pub tracking_id: Option<TrackingId>,
    /// Protocol round of the message
    pub round: Option<SigningRound>,
    /// Guardian that produced the message
    pub sender: Option<PartyIndex>,
    /// Guardian the message was received from
    pub source: Arc<PartyIdentity>,
    /// Cause
    pub error: EngineError,
}

impl fmt::Display for IncomingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "couldn't handle message received from {}", self.source)?;
        if let Some(sender) = self.sender {
            write!(f, " (sender #{sender})")?;
        }
        if let Some(round) = self.round {
            write!(f, ", {round}")?;
        }
        if let Some(tracking_id) = &self.tracking_id {
            write!(f, ", tracking id {tracking_id}")?;
        }
        Ok(())
    }
}

impl std::error::Error for IncomingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
