//! Byzantine reliable broadcast
//!
//! Bracha-style echo/deliver tolerating `f = ⌊threshold/2⌋` byzantine guardians. Every broadcasted
//! message is identified by its [`Uuid`]; per uuid we keep a state recording the
//! content digest, who echoed it, and whether it was already echoed or delivered by us.
//!
//! * A message is echoed once: immediately when received directly from its sender, or once `f+1`
//!   guardians echoed it (at least one of them is honest)
//! * A message is delivered once, after `2f+1` guardians echoed it. Any two honest guardians
//!   delivering share at least `f+1` honest voters, so they deliver the same content
//! * Two validly signed contents under the same uuid prove that the sender equivocates. A content
//!   that doesn't match sender's signature proves that the echoer lies
//!
//! Echoes are usually [`HashEcho`](crate::message::HashEcho)es: they carry the original signature
//! and content digest but not the content. Delivery requires the content to be known.
//!
//! States are kept in a map guarded by short-lived lock, and every state has its own lock, so
//! unrelated messages are processed concurrently.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;

use crate::full_party::ParsedMessage;
use crate::identity::{Identities, PartyIdentity, PartyIndex};
use crate::message::{tss_uuid, Announcement, Problem, SignatureError, SignedMessage, Uuid};
use crate::quorum::{delivery_quorum, max_broadcast_faults};
use crate::tracking_id::Digest;

/// Content handed to upper layer once delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deliverable {
    /// Signing protocol message
    Tss(ParsedMessage),
    /// Problem report
    Problem {
        /// Guardian reporting the problem
        issuer: PartyIndex,
        /// Reported problem
        problem: Problem,
    },
    /// Leader announcement
    Announcement {
        /// Guardian that signed the announcement
        leader: PartyIndex,
        /// Announced digest
        announcement: Announcement,
    },
}

impl Deliverable {
    /// Uuid of the message
    pub fn uuid(&self) -> Uuid {
        match self {
            Deliverable::Tss(parsed) => tss_uuid(&parsed.tracking_id, parsed.round, parsed.from),
            Deliverable::Problem { issuer, problem } => problem.uuid(*issuer),
            Deliverable::Announcement {
                leader,
                announcement,
            } => announcement.uuid(*leader),
        }
    }
}

/// Echo as understood by the broadcast layer
#[derive(Debug, Clone)]
pub enum ParsedEcho {
    /// Echo carrying the content
    Content(Deliverable),
    /// Echo referring to the content by digest
    HashEcho(Uuid),
}

impl ParsedEcho {
    /// Uuid of echoed message
    pub fn uuid(&self) -> Uuid {
        match self {
            ParsedEcho::Content(content) => content.uuid(),
            ParsedEcho::HashEcho(uuid) => *uuid,
        }
    }

    fn into_content(self) -> Option<Deliverable> {
        match self {
            ParsedEcho::Content(content) => Some(content),
            ParsedEcho::HashEcho(_) => None,
        }
    }
}

/// Outcome of processing an echo
///
/// Both echo and delivery may be required at the same time.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct BroadcastDecision {
    /// Whether local guardian must echo the message now
    pub should_echo: bool,
    /// Content to deliver. It's `Some` exactly once per uuid
    pub delivered: Option<Deliverable>,
}

impl BroadcastDecision {
    /// Whether the message must be delivered now
    pub fn should_deliver(&self) -> bool {
        self.delivered.is_some()
    }
}

/// Outcome of recording a unicast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnicastStatus {
    /// Unicast seen for the first time
    New,
    /// Exactly the same unicast was already received
    AlreadyReceived,
}

#[derive(Debug)]
struct BroadcastState {
    created_at: Instant,
    content_digest: Digest,
    content: Option<Deliverable>,
    votes: HashSet<PartyIndex>,
    echoed_already: bool,
    delivered_already: bool,
}

impl BroadcastState {
    fn new(content_digest: Digest) -> Self {
        Self {
            created_at: Instant::now(),
            content_digest,
            content: None,
            votes: HashSet::new(),
            echoed_already: false,
            delivered_already: false,
        }
    }

    fn should_echo(
        &mut self,
        sender: PartyIndex,
        echoer: PartyIndex,
        me: PartyIndex,
        max_faults: usize,
    ) -> bool {
        if self.echoed_already || self.content.is_none() || sender == me {
            return false;
        }
        if echoer == sender || self.votes.len() > max_faults {
            self.echoed_already = true;
            return true;
        }
        false
    }

    fn try_deliver(&mut self, quorum: usize) -> Option<Deliverable> {
        if self.delivered_already || self.votes.len() < quorum {
            return None;
        }
        let content = self.content.clone()?;
        self.delivered_already = true;
        Some(content)
    }
}

#[derive(Debug)]
struct UnicastRecord {
    received_at: Instant,
    digest: Digest,
}

/// Reliable broadcast engine of a single guardian
#[derive(Debug)]
pub struct ReliableBroadcast {
    identities: Arc<Identities>,
    me: PartyIndex,
    max_faults: usize,
    quorum: usize,
    states: Mutex<HashMap<Uuid, Arc<Mutex<BroadcastState>>>>,
    unicasts: Mutex<HashMap<Uuid, UnicastRecord>>,
}

impl ReliableBroadcast {
    /// Constructs broadcast engine of guardian `me`
    ///
    /// `threshold` is the non-inclusive signing threshold, the engine tolerates
    /// `⌊threshold/2⌋` faulty guardians.
    pub fn new(identities: Arc<Identities>, me: PartyIndex, threshold: usize) -> Self {
        Self {
            identities,
            me,
            max_faults: max_broadcast_faults(threshold),
            quorum: delivery_quorum(threshold),
            states: Mutex::new(HashMap::new()),
            unicasts: Mutex::new(HashMap::new()),
        }
    }

    /// Maximum amount of faulty guardians tolerated
    pub fn max_faults(&self) -> usize {
        self.max_faults
    }

    /// Amount of votes required to deliver a message
    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Processes a validated echo of `msg` received from `echoer`
    ///
    /// Returns whether local guardian must echo the message, and the content if it must be
    /// delivered. State is updated only if signature of the original sender checks out.
    pub fn inspect(
        &self,
        parsed: ParsedEcho,
        msg: &SignedMessage,
        echoer: &PartyIdentity,
    ) -> Result<BroadcastDecision, BroadcastError> {
        let sender = self
            .identities
            .get(msg.sender)
            .ok_or(BroadcastError::UnknownSender(msg.sender))?;
        if !self.identities.is_known(echoer) {
            return Err(BroadcastError::UnknownEchoer(echoer.id.clone()));
        }

        let uuid = parsed.uuid();
        let digest = msg.content.digest();

        if let Err(err) = msg.verify(&uuid, &sender.public_key) {
            let existing = self.states.lock().get(&uuid).cloned();
            return Err(match existing {
                Some(state) if state.lock().content_digest != digest => {
                    BroadcastError::EquivocatingEchoer {
                        echoer: self.resolve(echoer),
                    }
                }
                _ => BroadcastError::InvalidSignature {
                    sender: sender.clone(),
                    echoer: self.resolve(echoer),
                    source: err,
                },
            });
        }

        let state = self
            .states
            .lock()
            .entry(uuid)
            .or_insert_with(|| Arc::new(Mutex::new(BroadcastState::new(digest))))
            .clone();
        let mut state = state.lock();

        if state.content_digest != digest {
            return Err(BroadcastError::EquivocatingSender {
                sender: sender.clone(),
            });
        }

        if state.content.is_none() {
            state.content = parsed.into_content();
        }
        state.votes.insert(echoer.index);

        let should_echo = state.should_echo(msg.sender, echoer.index, self.me, self.max_faults);
        let delivered = state.try_deliver(self.quorum);
        Ok(BroadcastDecision {
            should_echo,
            delivered,
        })
    }

    /// Records a unicast received from `source`
    ///
    /// The same uuid with a different digest is an equivocation of the source.
    pub fn record_unicast(
        &self,
        uuid: Uuid,
        digest: Digest,
        source: &PartyIdentity,
    ) -> Result<UnicastStatus, BroadcastError> {
        use std::collections::hash_map::Entry;

        match self.unicasts.lock().entry(uuid) {
            Entry::Occupied(record) if record.get().digest != digest => {
                Err(BroadcastError::EquivocatingUnicast {
                    culprit: self.resolve(source),
                })
            }
            Entry::Occupied(_) => Ok(UnicastStatus::AlreadyReceived),
            Entry::Vacant(entry) => {
                entry.insert(UnicastRecord {
                    received_at: Instant::now(),
                    digest,
                });
                Ok(UnicastStatus::New)
            }
        }
    }

    /// Forgets messages older than `max_age`
    ///
    /// `max_age` must exceed lifetime of a signing attempt: a forgotten uuid can't be checked
    /// for equivocation anymore.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        let mut states = self.states.lock();
        let before = states.len();
        states.retain(|_, state| now.duration_since(state.lock().created_at) <= max_age);
        removed += before - states.len();
        drop(states);

        let mut unicasts = self.unicasts.lock();
        let before = unicasts.len();
        unicasts.retain(|_, record| now.duration_since(record.received_at) <= max_age);
        removed += before - unicasts.len();

        removed
    }

    /// Amount of tracked broadcast messages
    pub fn tracked_messages(&self) -> usize {
        self.states.lock().len()
    }

    fn resolve(&self, party: &PartyIdentity) -> Arc<PartyIdentity> {
        self.identities
            .get(party.index)
            .cloned()
            .unwrap_or_else(|| Arc::new(party.clone()))
    }
}

/// Reliable broadcast error
#[derive(Debug, Error)]
pub enum BroadcastError {
    /// Original sender is not in the directory
    #[error("unknown sender #{0}")]
    UnknownSender(PartyIndex),
    /// Echoer is not in the directory
    #[error("unknown echoer `{0}`")]
    UnknownEchoer(String),
    /// Content doesn't match signature of the sender
    #[error("message from {sender} echoed by {echoer} has invalid signature")]
    InvalidSignature {
        /// Original sender
        sender: Arc<PartyIdentity>,
        /// Guardian that echoed the message
        echoer: Arc<PartyIdentity>,
        /// Verification error
        #[source]
        source: SignatureError,
    },
    /// Sender signed two different contents under the same uuid
    #[error("equivocation: {sender} signed two different contents for the same message")]
    EquivocatingSender {
        /// Accused guardian
        sender: Arc<PartyIdentity>,
    },
    /// Echoer forwarded content that the sender never signed
    #[error("equivocation: {echoer} echoed content that differs from what the sender signed")]
    EquivocatingEchoer {
        /// Accused guardian
        echoer: Arc<PartyIdentity>,
    },
    /// Source sent two different unicasts under the same uuid
    #[error("equivocation: {culprit} sent two different unicasts for the same message")]
    EquivocatingUnicast {
        /// Accused guardian
        culprit: Arc<PartyIdentity>,
    },
}

impl BroadcastError {
    /// Guardian proven to be byzantine, if any
    pub fn accused(&self) -> Option<&Arc<PartyIdentity>> {
        match self {
            BroadcastError::EquivocatingSender { sender } => Some(sender),
            BroadcastError::EquivocatingEchoer { echoer } => Some(echoer),
            BroadcastError::EquivocatingUnicast { culprit } => Some(culprit),
            BroadcastError::UnknownSender(_)
            | BroadcastError::UnknownEchoer(_)
            | BroadcastError::InvalidSignature { .. } => None,
        }
    }

    /// Whether error is an equivocation
    pub fn is_equivocation(&self) -> bool {
        self.accused().is_some()
    }
}

#[cfg(test)]
mod tests {
    use matches::assert_matches;
    use secp256k1::{PublicKey, SecretKey};

    use super::*;
    use crate::full_party::MessageDestination;
    use crate::identity::IdentityEntry;
    use crate::message::{Content, TssContent};
    use crate::rounds::SigningRound;
    use crate::tracking_id::{ChainId, ProtocolTag, TrackingId};

    struct Net {
        identities: Arc<Identities>,
        keys: Vec<SecretKey>,
    }

    impl Net {
        fn new(n: u8) -> Self {
            let secret_keys = (1..=n)
                .map(|i| SecretKey::from_slice(&[i; 32]).unwrap())
                .collect::<Vec<_>>();
            let entries = secret_keys
                .iter()
                .enumerate()
                .map(|(i, sk)| IdentityEntry {
                    id: format!("guardian-{i}"),
                    public_key: PublicKey::from_secret_key_global(sk),
                    hostname: "localhost".to_string(),
                    port: 0,
                })
                .collect();
            let identities = Arc::new(Identities::new(entries).unwrap());
            let keys = identities
                .iter()
                .map(|party| {
                    *secret_keys
                        .iter()
                        .find(|sk| PublicKey::from_secret_key_global(sk) == party.public_key)
                        .unwrap()
                })
                .collect();
            Self { identities, keys }
        }

        fn party(&self, i: PartyIndex) -> Arc<PartyIdentity> {
            self.identities.get(i).unwrap().clone()
        }

        fn engine(&self, me: PartyIndex, threshold: usize) -> ReliableBroadcast {
            ReliableBroadcast::new(self.identities.clone(), me, threshold)
        }

        /// Round 3 message of `from`, signed by `from`
        fn tss_message(&self, from: PartyIndex, payload: &[u8]) -> (ParsedEcho, SignedMessage) {
            let parsed = ParsedMessage {
                tracking_id: TrackingId::new(ProtocolTag::Ecdsa, [0xd; 32], ChainId(1), &[0, 1, 2])
                    .unwrap(),
                round: SigningRound::Round3,
                from,
                destination: MessageDestination::AllParties,
                payload: payload.to_vec(),
            };
            let echo = ParsedEcho::Content(Deliverable::Tss(parsed));
            let content = Content::Tss(TssContent {
                payload: payload.to_vec(),
                msg_serial_number: 1,
            });
            let signed = SignedMessage::sign(
                from,
                content,
                &echo.uuid(),
                &self.keys[usize::from(from)],
            );
            (echo, signed)
        }
    }

    fn hash_echo(echo: &ParsedEcho, msg: &SignedMessage) -> (ParsedEcho, SignedMessage) {
        let uuid = echo.uuid();
        (ParsedEcho::HashEcho(uuid), msg.to_hash_echo(uuid))
    }

    #[test]
    fn delivers_exactly_once_after_2f_plus_1_votes() {
        // 5 guardians, threshold 2, f = 1
        let net = Net::new(5);
        let rb = net.engine(4, 2);
        assert_eq!(rb.max_faults(), 1);
        assert_eq!(rb.quorum(), 3);

        let (content, signed) = net.tss_message(0, b"round 3 of A");
        let (hashed, hash_signed) = hash_echo(&content, &signed);

        let first = rb.inspect(content.clone(), &signed, &net.party(0)).unwrap();
        assert!(first.should_echo);
        assert!(!first.should_deliver());

        let second = rb.inspect(hashed.clone(), &hash_signed, &net.party(1)).unwrap();
        assert!(!second.should_echo);
        assert!(!second.should_deliver());

        let third = rb.inspect(hashed.clone(), &hash_signed, &net.party(2)).unwrap();
        assert!(!third.should_echo);
        assert_matches!(third.delivered, Some(Deliverable::Tss(ref m)) if m.from == 0);

        let fourth = rb.inspect(hashed, &hash_signed, &net.party(3)).unwrap();
        assert!(!fourth.should_deliver());
        assert!(!fourth.should_echo);
    }

    #[test]
    fn votes_are_idempotent() {
        let net = Net::new(5);
        let rb = net.engine(4, 2);
        let (content, signed) = net.tss_message(0, b"payload");
        let (hashed, hash_signed) = hash_echo(&content, &signed);

        rb.inspect(content, &signed, &net.party(0)).unwrap();
        for _ in 0..5 {
            let decision = rb.inspect(hashed.clone(), &hash_signed, &net.party(1)).unwrap();
            assert!(!decision.should_deliver());
        }
    }

    #[test]
    fn echoes_after_f_plus_1_votes() {
        let net = Net::new(5);
        let rb = net.engine(4, 2);
        let (content, signed) = net.tss_message(0, b"payload");
        let (hashed, hash_signed) = hash_echo(&content, &signed);

        // full content forwarded by a guardian other than the sender
        let decision = rb.inspect(content, &signed, &net.party(1)).unwrap();
        assert!(!decision.should_echo);

        let decision = rb.inspect(hashed.clone(), &hash_signed, &net.party(2)).unwrap();
        assert!(decision.should_echo);

        let decision = rb.inspect(hashed, &hash_signed, &net.party(3)).unwrap();
        assert!(!decision.should_echo);
        assert!(decision.should_deliver());
    }

    #[test]
    fn needs_content_to_echo_and_deliver() {
        let net = Net::new(5);
        let rb = net.engine(4, 2);
        let (content, signed) = net.tss_message(0, b"payload");
        let (hashed, hash_signed) = hash_echo(&content, &signed);

        for echoer in 1..=3 {
            let decision = rb
                .inspect(hashed.clone(), &hash_signed, &net.party(echoer))
                .unwrap();
            assert!(!decision.should_echo);
            assert!(!decision.should_deliver());
        }

        let decision = rb.inspect(content, &signed, &net.party(0)).unwrap();
        assert!(decision.should_echo);
        assert!(decision.should_deliver());
    }

    #[test]
    fn never_echoes_own_message() {
        let net = Net::new(5);
        let rb = net.engine(0, 2);
        let (content, signed) = net.tss_message(0, b"payload");
        let (hashed, hash_signed) = hash_echo(&content, &signed);

        assert!(!rb.inspect(content, &signed, &net.party(0)).unwrap().should_echo);
        assert!(!rb.inspect(hashed.clone(), &hash_signed, &net.party(1)).unwrap().should_echo);
        let decision = rb.inspect(hashed, &hash_signed, &net.party(2)).unwrap();
        assert!(!decision.should_echo);
        assert!(decision.should_deliver());
    }

    #[test]
    fn equivocating_sender_is_accused() {
        let net = Net::new(5);
        let rb = net.engine(4, 2);
        let (content, signed) = net.tss_message(0, b"first version");
        let (other_content, other_signed) = net.tss_message(0, b"second version");
        assert_eq!(content.uuid(), other_content.uuid());

        rb.inspect(content, &signed, &net.party(0)).unwrap();
        let err = rb
            .inspect(other_content, &other_signed, &net.party(1))
            .unwrap_err();
        assert!(err.is_equivocation());
        assert_matches!(err, BroadcastError::EquivocatingSender { sender } if sender.index == 0);
    }

    #[test]
    fn lying_echoer_is_accused() {
        let net = Net::new(5);
        let rb = net.engine(4, 2);
        let (content, signed) = net.tss_message(0, b"genuine");
        rb.inspect(content.clone(), &signed, &net.party(0)).unwrap();

        // guardian 2 replaces the content but keeps the sender's signature
        let mut forged = signed.clone();
        forged.content = Content::Tss(TssContent {
            payload: b"forged".to_vec(),
            msg_serial_number: 1,
        });
        let err = rb.inspect(content.clone(), &forged, &net.party(2)).unwrap_err();
        assert_matches!(err, BroadcastError::EquivocatingEchoer { echoer } if echoer.index == 2);

        // forged hash echo
        let mut forged_hash = signed.to_hash_echo(content.uuid());
        forged_hash.content = Content::HashEcho(crate::message::HashEcho {
            session_uuid: content.uuid(),
            original_content_digest: [1; 32],
        });
        let err = rb
            .inspect(ParsedEcho::HashEcho(content.uuid()), &forged_hash, &net.party(3))
            .unwrap_err();
        assert_matches!(err, BroadcastError::EquivocatingEchoer { echoer } if echoer.index == 3);

        // state isn't affected
        assert_eq!(rb.tracked_messages(), 1);
    }

    #[test]
    fn invalid_signature_on_new_message() {
        let net = Net::new(5);
        let rb = net.engine(4, 2);
        let (content, mut signed) = net.tss_message(0, b"payload");
        signed.signature = SignedMessage::sign(
            0,
            signed.content.clone(),
            &content.uuid(),
            &net.keys[1],
        )
        .signature;

        let err = rb.inspect(content, &signed, &net.party(0)).unwrap_err();
        assert_matches!(err, BroadcastError::InvalidSignature { .. });
        assert!(!err.is_equivocation());
        assert_eq!(rb.tracked_messages(), 0);
    }

    #[test]
    fn unknown_parties_are_rejected() {
        let net = Net::new(5);
        let rb = net.engine(4, 2);
        let (content, mut signed) = net.tss_message(0, b"payload");

        let mut stranger = (*net.party(1)).clone();
        stranger.index = 9;
        assert_matches!(
            rb.inspect(content.clone(), &signed, &stranger),
            Err(BroadcastError::UnknownEchoer(_))
        );

        signed.sender = 17;
        assert_matches!(
            rb.inspect(content, &signed, &net.party(1)),
            Err(BroadcastError::UnknownSender(17))
        );
    }

    #[test]
    fn unicast_equivocation() {
        let net = Net::new(3);
        let rb = net.engine(0, 2);
        let source = net.party(1);

        assert_eq!(
            rb.record_unicast([1; 32], [2; 32], &source).unwrap(),
            UnicastStatus::New
        );
        assert_eq!(
            rb.record_unicast([1; 32], [2; 32], &source).unwrap(),
            UnicastStatus::AlreadyReceived
        );
        let err = rb.record_unicast([1; 32], [3; 32], &source).unwrap_err();
        assert_matches!(err, BroadcastError::EquivocatingUnicast { ref culprit } if culprit.index == 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_forgets_old_messages() {
        let net = Net::new(5);
        let rb = net.engine(4, 2);
        let (content, signed) = net.tss_message(0, b"payload");
        rb.inspect(content, &signed, &net.party(0)).unwrap();
        rb.record_unicast([1; 32], [2; 32], &net.party(1)).unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        let (content, signed) = net.tss_message(1, b"payload");
        rb.inspect(content, &signed, &net.party(1)).unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(rb.cleanup(Duration::from_secs(60)), 2);
        assert_eq!(rb.tracked_messages(), 1);
    }
}
