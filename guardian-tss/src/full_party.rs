//! Interface of the threshold signing engine
//!
//! The engine doing the actual multi-party math is opaque: it consumes protocol messages and
//! signing requests, and produces outgoing protocol messages, signatures and errors through the
//! channels handed to [`FullParty::start`]. This crate only routes its messages and decides which
//! committee should sign.

use std::error::Error;

use tokio::sync::mpsc;

use crate::identity::PartyIndex;
use crate::rounds::SigningRound;
use crate::tracking_id::{ChainId, Digest, TrackingId};

/// Threshold signing engine
///
/// Methods must not block for long: they're called from message handlers.
pub trait FullParty: Send + Sync + 'static {
    /// Starts the engine, outputs are written into provided channels
    fn start(&self, outputs: FullPartyOutputs) -> Result<(), FullPartyError>;
    /// Stops the engine
    fn stop(&self) -> Result<(), FullPartyError>;
    /// Computes committee and tracking id of a signing task without starting it
    ///
    /// Must be deterministic: every guardian computes the same info for the same task.
    fn get_signing_info(&self, task: &SigningTask) -> Result<SigningInfo, FullPartyError>;
    /// Starts signing, if the local guardian is in the committee
    fn async_request_new_signature(&self, task: SigningTask)
        -> Result<SigningInfo, FullPartyError>;
    /// Parses protocol message received from `from`
    fn parse_message(
        &self,
        payload: &[u8],
        from: PartyIndex,
        is_broadcast: bool,
    ) -> Result<ParsedMessage, FullPartyError>;
    /// Feeds parsed message into the engine
    fn update(&self, msg: ParsedMessage) -> Result<(), FullPartyError>;
}

/// Output channels of [`FullParty`]
#[derive(Debug, Clone)]
pub struct FullPartyOutputs {
    /// Outgoing protocol messages
    pub messages: mpsc::Sender<ParsedMessage>,
    /// Produced signatures
    pub signatures: mpsc::Sender<SignatureData>,
    /// Signing errors
    pub errors: mpsc::Sender<TrackableError>,
}

/// Request to sign a digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningTask {
    /// Digest to sign
    pub digest: Digest,
    /// Chain the digest belongs to
    pub chain: ChainId,
    /// Guardians that must not be picked into committee
    pub faulties: Vec<PartyIndex>,
}

/// Committee chosen for a signing task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningInfo {
    /// Guardians expected to sign
    pub committee: Vec<PartyIndex>,
    /// Tracking id of the signing attempt
    pub tracking_id: TrackingId,
    /// Whether local guardian is in the committee
    pub is_signer: bool,
}

/// Recipients of a protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageDestination {
    /// Message is broadcasted to everyone
    AllParties,
    /// Message is sent to specific parties
    Parties(Vec<PartyIndex>),
}

impl MessageDestination {
    /// Returns `true` if it's broadcast message
    pub fn is_broadcast(&self) -> bool {
        matches!(self, MessageDestination::AllParties)
    }
}

/// Protocol message as seen by the signing engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    /// Signing attempt the message belongs to
    pub tracking_id: TrackingId,
    /// Round of the message
    pub round: SigningRound,
    /// Guardian who produced the message
    pub from: PartyIndex,
    /// Recipients
    pub destination: MessageDestination,
    /// Serialized message
    pub payload: Vec<u8>,
}

/// Produced signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureData {
    /// Signing attempt that produced the signature
    pub tracking_id: TrackingId,
    /// Signature bytes
    pub signature: Vec<u8>,
}

/// Error of a particular signing attempt
#[derive(Debug)]
pub struct TrackableError {
    /// Signing attempt that failed, if known
    pub tracking_id: Option<TrackingId>,
    /// Guardians blamed for the failure
    pub culprits: Vec<PartyIndex>,
    /// Cause
    pub error: FullPartyError,
}

/// Signing engine error
#[derive(Debug, thiserror::Error)]
pub enum FullPartyError {
    /// Engine wasn't started
    #[error("signing engine is not started")]
    NotStarted,
    /// Engine was already started
    #[error("signing engine is already started")]
    AlreadyStarted,
    /// Message can't be parsed
    #[error("malformed protocol message")]
    MalformedMessage(#[source] Box<dyn Error + Send + Sync>),
    /// Committee can't be formed
    #[error("not enough guardians to form committee: {available} available, {required} required")]
    NotEnoughGuardians {
        /// Guardians that are not faulty
        available: usize,
        /// Committee size
        required: usize,
    },
    /// Signing attempt is unknown to the engine
    #[error("unknown signing attempt {0}")]
    UnknownSigning(TrackingId),
    /// Protocol failed
    #[error("signing protocol failed")]
    Protocol(#[source] Box<dyn Error + Send + Sync>),
}
