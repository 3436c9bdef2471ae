//! Multi-guardian simulation
//!
//! Runs several guardians in a single process: [`Simulation`] is an in-memory network that
//! implements [`Delivery`], and [`MockFullParty`] is a deterministic signing engine that exchanges
//! one unicast and one broadcast round and then "signs" by hashing the tracking id.
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use guardian_tss::simulation::{test_guardians, MockFullParty, Simulation};
//! use guardian_tss::{delivery, EngineBuilder};
//! use tokio_util::sync::CancellationToken;
//!
//! let shutdown = CancellationToken::new();
//! let network = Simulation::new();
//! for storage in test_guardians(5, 2)? {
//!     let full_party = Arc::new(MockFullParty::new(&storage));
//!     let connection = network.connect(storage.me().clone());
//!     let engine = EngineBuilder::new(storage).full_party(full_party).build()?;
//!     engine.start(shutdown.clone())?;
//!     tokio::spawn(delivery::run(engine, connection, shutdown.clone()));
//! }
//! # Ok(()) }
//! ```

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::{ready, Sink, Stream};
use parking_lot::Mutex;
use secp256k1::{PublicKey, SecretKey};
use sha2::{Digest as _, Sha256};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{trace, warn};

use crate::delivery::Delivery;
use crate::full_party::{
    FullParty, FullPartyError, FullPartyOutputs, MessageDestination, ParsedMessage, SignatureData,
    SigningInfo, SigningTask,
};
use crate::identity::{Identities, IdentityEntry, PartyIdentity, PartyIndex};
use crate::message::{IncomingMessage, Sendable};
use crate::rounds::SigningRound;
use crate::storage::{Configurations, GuardianStorage, StorageError};
use crate::tracking_id::{ProtocolTag, TrackingId, TRACKING_ID_SIZE};

const HEADER_SIZE: usize = 1 + TRACKING_ID_SIZE + 2;

/// Builds storages of `n` guardians sharing a directory
///
/// Guardian `i` has id `guardian-{i}`, `guardian-0` is the leader. Storages are ordered by
/// guardian index.
pub fn test_guardians(n: usize, threshold: usize) -> Result<Vec<GuardianStorage>, StorageError> {
    test_guardians_with_config(n, threshold, Configurations::default())
}

/// Same as [`test_guardians`], with custom tunables
pub fn test_guardians_with_config(
    n: usize,
    threshold: usize,
    config: Configurations,
) -> Result<Vec<GuardianStorage>, StorageError> {
    let keys = (0..n)
        .map(|i| {
            let byte = u8::try_from(i + 1).map_err(|_| StorageError::MalformedSecretKey)?;
            SecretKey::from_slice(&[byte; 32]).map_err(StorageError::InvalidSecretKey)
        })
        .collect::<Result<Vec<_>, _>>()?;
    let entries = keys
        .iter()
        .enumerate()
        .map(|(i, key)| IdentityEntry {
            id: format!("guardian-{i}"),
            public_key: PublicKey::from_secret_key_global(key),
            hostname: format!("guardian-{i}.local"),
            port: 0,
        })
        .collect::<Vec<_>>();
    let guardians = Identities::new(entries)?;

    let mut storages = keys
        .into_iter()
        .map(|key| {
            GuardianStorage::new(
                key,
                guardians.clone(),
                threshold,
                Some("guardian-0"),
                config.clone(),
            )
        })
        .collect::<Result<Vec<_>, _>>()?;
    storages.sort_by_key(|s| s.me().index);
    Ok(storages)
}

/// Deterministic signing engine
///
/// Committee of `threshold + 1` guardians is picked by rotating through non-faulty guardians,
/// starting at `digest[0]`. Every signer sends [`SigningRound::Round1`] to each other signer and
/// broadcasts [`SigningRound::Round3`]. Signature is produced once both rounds are received from
/// every other signer.
pub struct MockFullParty {
    me: PartyIndex,
    n: usize,
    committee_size: usize,
    outputs: Mutex<Option<FullPartyOutputs>>,
    sessions: Mutex<HashMap<TrackingId, Session>>,
}

#[derive(Default)]
struct Session {
    requested: bool,
    finished: bool,
    received: HashMap<SigningRound, HashSet<PartyIndex>>,
}

impl MockFullParty {
    /// Constructs engine of the local guardian
    pub fn new(storage: &GuardianStorage) -> Self {
        Self {
            me: storage.me().index,
            n: storage.guardians().len(),
            committee_size: storage.threshold() + 1,
            outputs: Mutex::new(None),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Encodes protocol message the way this engine parses it
    pub fn encode_message(
        tracking_id: &TrackingId,
        round: SigningRound,
        from: PartyIndex,
        body: &[u8],
    ) -> Vec<u8> {
        let mut payload = Vec::with_capacity(HEADER_SIZE + body.len());
        payload.push(round.number());
        payload.extend_from_slice(&tracking_id.to_bytes());
        payload.extend_from_slice(&from.to_be_bytes());
        payload.extend_from_slice(body);
        payload
    }

    /// Signature this engine produces for given signing attempt
    pub fn signature_of(tracking_id: &TrackingId) -> Vec<u8> {
        Sha256::digest(tracking_id.to_bytes()).to_vec()
    }

    fn committee(&self, task: &SigningTask) -> Result<Vec<PartyIndex>, FullPartyError> {
        let candidates = (0..self.n)
            .filter_map(|i| PartyIndex::try_from(i).ok())
            .filter(|i| !task.faulties.contains(i))
            .collect::<Vec<_>>();
        if candidates.len() < self.committee_size {
            return Err(FullPartyError::NotEnoughGuardians {
                available: candidates.len(),
                required: self.committee_size,
            });
        }
        let start = usize::from(task.digest[0]) % candidates.len();
        let mut committee = candidates
            .iter()
            .cycle()
            .skip(start)
            .take(self.committee_size)
            .copied()
            .collect::<Vec<_>>();
        committee.sort_unstable();
        Ok(committee)
    }

    fn outputs(&self) -> Result<FullPartyOutputs, FullPartyError> {
        self.outputs.lock().clone().ok_or(FullPartyError::NotStarted)
    }

    fn emit(&self, outputs: &FullPartyOutputs, msg: ParsedMessage) {
        let (tracking_id, round) = (msg.tracking_id, msg.round);
        if outputs.messages.try_send(msg).is_err() {
            warn!(%tracking_id, %round, "mock engine couldn't emit message");
        }
    }

    fn try_finish(&self, outputs: &FullPartyOutputs, tracking_id: &TrackingId, session: &mut Session) {
        if session.finished || !session.requested {
            return;
        }
        let others = tracking_id
            .committee()
            .into_iter()
            .filter(|&p| p != self.me)
            .collect::<Vec<_>>();
        let received_all = [SigningRound::Round1, SigningRound::Round3]
            .iter()
            .all(|round| {
                session
                    .received
                    .get(round)
                    .map(|from| others.iter().all(|p| from.contains(p)))
                    .unwrap_or(false)
            });
        if !received_all {
            return;
        }

        session.finished = true;
        trace!(%tracking_id, "mock signature is ready");
        let sig = SignatureData {
            tracking_id: *tracking_id,
            signature: Self::signature_of(tracking_id),
        };
        if outputs.signatures.try_send(sig).is_err() {
            warn!(%tracking_id, "mock engine couldn't emit signature");
        }
    }
}

impl FullParty for MockFullParty {
    fn start(&self, outputs: FullPartyOutputs) -> Result<(), FullPartyError> {
        let mut slot = self.outputs.lock();
        if slot.is_some() {
            return Err(FullPartyError::AlreadyStarted);
        }
        *slot = Some(outputs);
        Ok(())
    }

    fn stop(&self) -> Result<(), FullPartyError> {
        self.outputs
            .lock()
            .take()
            .map(|_| ())
            .ok_or(FullPartyError::NotStarted)
    }

    fn get_signing_info(&self, task: &SigningTask) -> Result<SigningInfo, FullPartyError> {
        let committee = self.committee(task)?;
        let tracking_id = TrackingId::new(ProtocolTag::Ecdsa, task.digest, task.chain, &committee)
            .map_err(|e| FullPartyError::Protocol(Box::new(e)))?;
        Ok(SigningInfo {
            is_signer: committee.contains(&self.me),
            committee,
            tracking_id,
        })
    }

    fn async_request_new_signature(
        &self,
        task: SigningTask,
    ) -> Result<SigningInfo, FullPartyError> {
        let info = self.get_signing_info(&task)?;
        let outputs = self.outputs()?;
        if !info.is_signer {
            return Ok(info);
        }

        let tracking_id = info.tracking_id;
        let others = info
            .committee
            .iter()
            .copied()
            .filter(|&p| p != self.me)
            .collect::<Vec<_>>();
        for &to in &others {
            self.emit(
                &outputs,
                ParsedMessage {
                    tracking_id,
                    round: SigningRound::Round1,
                    from: self.me,
                    destination: MessageDestination::Parties(vec![to]),
                    payload: Self::encode_message(&tracking_id, SigningRound::Round1, self.me, &to.to_be_bytes()),
                },
            );
        }
        self.emit(
            &outputs,
            ParsedMessage {
                tracking_id,
                round: SigningRound::Round3,
                from: self.me,
                destination: MessageDestination::AllParties,
                payload: Self::encode_message(&tracking_id, SigningRound::Round3, self.me, b"commit"),
            },
        );

        let mut sessions = self.sessions.lock();
        let session = sessions.entry(tracking_id).or_default();
        session.requested = true;
        self.try_finish(&outputs, &tracking_id, session);
        Ok(info)
    }

    fn parse_message(
        &self,
        payload: &[u8],
        _from: PartyIndex,
        is_broadcast: bool,
    ) -> Result<ParsedMessage, FullPartyError> {
        if payload.len() < HEADER_SIZE {
            return Err(FullPartyError::MalformedMessage(Box::new(
                MockMessageError::TooShort(payload.len()),
            )));
        }
        let round = SigningRound::try_from(payload[0])
            .map_err(|e| FullPartyError::MalformedMessage(Box::new(e)))?;
        let tracking_id = TrackingId::from_bytes(&payload[1..1 + TRACKING_ID_SIZE])
            .map_err(|e| FullPartyError::MalformedMessage(Box::new(e)))?;
        let from = PartyIndex::from_be_bytes([
            payload[1 + TRACKING_ID_SIZE],
            payload[2 + TRACKING_ID_SIZE],
        ]);
        let destination = if is_broadcast {
            MessageDestination::AllParties
        } else {
            MessageDestination::Parties(vec![self.me])
        };
        Ok(ParsedMessage {
            tracking_id,
            round,
            from,
            destination,
            payload: payload.to_vec(),
        })
    }

    fn update(&self, msg: ParsedMessage) -> Result<(), FullPartyError> {
        let outputs = self.outputs()?;
        if !msg.tracking_id.contains(self.me) {
            // someone else's signing, nothing to do
            return Ok(());
        }
        let mut sessions = self.sessions.lock();
        let session = sessions.entry(msg.tracking_id).or_default();
        session
            .received
            .entry(msg.round)
            .or_default()
            .insert(msg.from);
        self.try_finish(&outputs, &msg.tracking_id, session);
        Ok(())
    }
}

/// Payload can't be parsed by [`MockFullParty`]
#[derive(Debug, Error)]
pub enum MockMessageError {
    /// Payload is shorter than the header
    #[error("payload is too short: {0} bytes")]
    TooShort(usize),
}

/// In-memory network connecting guardians of a single process
pub struct Simulation {
    channel: broadcast::Sender<Envelope>,
}

#[derive(Debug, Clone)]
struct Envelope {
    source: Arc<PartyIdentity>,
    msg: Sendable,
}

impl Simulation {
    /// Constructs network that buffers up to 1024 messages per guardian
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Constructs network with given buffer size
    ///
    /// Guardians lagging behind by more than `capacity` messages lose them.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channel: broadcast::channel(capacity).0,
        }
    }

    /// Connects a guardian to the network
    pub fn connect(&self, me: Arc<PartyIdentity>) -> SimulationDelivery {
        SimulationDelivery {
            incoming: SimulationIncoming {
                me: me.clone(),
                receiver: BroadcastStream::new(self.channel.subscribe()),
            },
            outgoing: SimulationOutgoing {
                me,
                sender: self.channel.clone(),
            },
        }
    }
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection of a single guardian to [`Simulation`]
pub struct SimulationDelivery {
    incoming: SimulationIncoming,
    outgoing: SimulationOutgoing,
}

impl Delivery for SimulationDelivery {
    type Send = SimulationOutgoing;
    type Receive = SimulationIncoming;
    type SendError = SimulationSendError;
    type ReceiveError = BroadcastStreamRecvError;

    fn split(self) -> (Self::Receive, Self::Send) {
        (self.incoming, self.outgoing)
    }
}

/// Messages addressed to the guardian
pub struct SimulationIncoming {
    me: Arc<PartyIdentity>,
    receiver: BroadcastStream<Envelope>,
}

impl Stream for SimulationIncoming {
    type Item = Result<IncomingMessage, BroadcastStreamRecvError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let envelope = match ready!(Pin::new(&mut self.receiver).poll_next(cx)) {
                Some(Ok(envelope)) => envelope,
                Some(Err(e)) => return Poll::Ready(Some(Err(e))),
                None => return Poll::Ready(None),
            };
            if !envelope.msg.recipients.iter().any(|r| r.index == self.me.index) {
                continue;
            }
            return Poll::Ready(Some(Ok(IncomingMessage {
                source: envelope.source,
                message: envelope.msg.message,
            })));
        }
    }
}

/// Messages sent by the guardian
pub struct SimulationOutgoing {
    me: Arc<PartyIdentity>,
    sender: broadcast::Sender<Envelope>,
}

impl Sink<Sendable> for SimulationOutgoing {
    type Error = SimulationSendError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, msg: Sendable) -> Result<(), Self::Error> {
        self.sender
            .send(Envelope {
                source: self.me.clone(),
                msg,
            })
            .map(|_| ())
            .map_err(|_| SimulationSendError)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

/// Every guardian is disconnected from [`Simulation`]
#[derive(Debug, Error)]
#[error("simulated network is closed")]
pub struct SimulationSendError;

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::tracking_id::ChainId;

    fn outputs() -> (
        FullPartyOutputs,
        mpsc::Receiver<ParsedMessage>,
        mpsc::Receiver<SignatureData>,
    ) {
        let (messages, messages_rx) = mpsc::channel(16);
        let (signatures, signatures_rx) = mpsc::channel(16);
        let (errors, _) = mpsc::channel(16);
        (
            FullPartyOutputs {
                messages,
                signatures,
                errors,
            },
            messages_rx,
            signatures_rx,
        )
    }

    fn task(digest: u8, faulties: Vec<PartyIndex>) -> SigningTask {
        SigningTask {
            digest: [digest; 32],
            chain: ChainId(2),
            faulties,
        }
    }

    #[test]
    fn guardians_are_sorted_by_index() {
        let guardians = test_guardians(4, 1).unwrap();
        let indexes = guardians.iter().map(|g| g.me().index).collect::<Vec<_>>();
        assert_eq!(indexes, vec![0, 1, 2, 3]);
        assert!(guardians.iter().all(|g| g.leader().is_some()));
    }

    #[test]
    fn committee_skips_faulties() {
        let guardians = test_guardians(5, 2).unwrap();
        let fp = MockFullParty::new(&guardians[0]);

        let info = fp.get_signing_info(&task(1, vec![])).unwrap();
        assert_eq!(info.committee, vec![1, 2, 3]);
        assert!(!info.is_signer);

        let info = fp.get_signing_info(&task(1, vec![2])).unwrap();
        assert_eq!(info.committee, vec![1, 3, 4]);
        assert_eq!(info.tracking_id.committee(), vec![1, 3, 4]);

        let err = fp.get_signing_info(&task(1, vec![0, 1, 2])).unwrap_err();
        assert!(matches!(
            err,
            FullPartyError::NotEnoughGuardians {
                available: 2,
                required: 3
            }
        ));
    }

    #[test]
    fn parses_what_it_encodes() {
        let guardians = test_guardians(3, 1).unwrap();
        let fp = MockFullParty::new(&guardians[1]);
        let info = fp.get_signing_info(&task(0, vec![])).unwrap();

        let payload = MockFullParty::encode_message(&info.tracking_id, SigningRound::Round1, 0, b"x");
        let parsed = fp.parse_message(&payload, 0, false).unwrap();
        assert_eq!(parsed.tracking_id, info.tracking_id);
        assert_eq!(parsed.round, SigningRound::Round1);
        assert_eq!(parsed.from, 0);
        assert_eq!(parsed.destination, MessageDestination::Parties(vec![1]));

        assert!(matches!(
            fp.parse_message(&payload[..10], 0, true),
            Err(FullPartyError::MalformedMessage(_))
        ));
    }

    #[test]
    fn signs_after_hearing_from_committee() {
        let guardians = test_guardians(3, 1).unwrap();
        let fp = MockFullParty::new(&guardians[0]);
        let (outputs, mut messages, mut signatures) = outputs();
        fp.start(outputs).unwrap();

        // digest[0] = 0 picks guardians 0 and 1
        let info = fp.async_request_new_signature(task(0, vec![])).unwrap();
        assert!(info.is_signer);
        assert_eq!(messages.try_recv().unwrap().round, SigningRound::Round1);
        assert!(messages.try_recv().unwrap().destination.is_broadcast());

        for round in [SigningRound::Round1, SigningRound::Round3] {
            assert!(signatures.try_recv().is_err());
            let payload = MockFullParty::encode_message(&info.tracking_id, round, 1, b"");
            let parsed = fp.parse_message(&payload, 1, round.is_broadcast()).unwrap();
            fp.update(parsed).unwrap();
        }

        let sig = signatures.try_recv().unwrap();
        assert_eq!(sig.tracking_id, info.tracking_id);
        assert_eq!(sig.signature, MockFullParty::signature_of(&info.tracking_id));

        fp.stop().unwrap();
        assert!(matches!(fp.stop(), Err(FullPartyError::NotStarted)));
    }
}
