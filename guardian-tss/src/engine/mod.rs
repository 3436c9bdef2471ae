//! Guardian signing engine
//!
//! [`Engine`] ties everything together: it validates incoming messages, runs them through
//! [reliable broadcast](crate::broadcast), feeds delivered protocol messages into the
//! [signing engine](crate::full_party::FullParty), and keeps the
//! [fault tracker](crate::fault_tolerance) informed about every signing attempt.
//!
//! ## Lifecycle
//! Engine is built with [`EngineBuilder`] and started once with [`Engine::start`], which spawns
//! the fault tracker and the signing engine listener. Both are stopped when the provided
//! [`CancellationToken`] is cancelled. Messages to be sent to other guardians are written into a
//! channel obtained via [`Engine::produced_output_messages`]; usually it's consumed by
//! [`delivery::run`](crate::delivery::run).

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::broadcast::{Deliverable, ParsedEcho, ReliableBroadcast};
use crate::fault_tolerance::{
    run_tracker, FtCommand, FtEnvironment, FtTracker, Inactives, PrepareToSignCommand,
    RetryRequest, SigPreparationInfo, SignCommand, TrackerConfig,
};
use crate::full_party::{
    FullParty, FullPartyError, FullPartyOutputs, SignatureData, SigningInfo, SigningTask,
};
use crate::identity::{PartyIdentity, PartyIndex};
use crate::leader::sign_announcement;
use crate::message::{Content, Echo, Problem, PropagatedMessage, Sendable, SignedMessage};
use crate::rounds::{NUM_BROADCAST_ROUNDS, NUM_UNICAST_ROUNDS};
use crate::sig_counter::SigCounter;
use crate::storage::GuardianStorage;
use crate::tracking_id::{ChainId, Digest};

mod error;
mod incoming;
mod listener;

pub use error::{EngineError, IncomingError};

/// Builds [`Engine`]
pub struct EngineBuilder {
    storage: GuardianStorage,
    full_party: Option<Arc<dyn FullParty>>,
    channel_capacity: Option<usize>,
}

impl EngineBuilder {
    /// Starts building engine of the guardian
    pub fn new(storage: GuardianStorage) -> Self {
        Self {
            storage,
            full_party: None,
            channel_capacity: None,
        }
    }

    /// Sets signing engine
    pub fn full_party(mut self, full_party: Arc<dyn FullParty>) -> Self {
        self.full_party = Some(full_party);
        self
    }

    /// Overrides capacity of message channels
    ///
    /// By default, capacity fits every protocol message of every allowed simultaneous signature.
    /// Engine never waits for space in a full channel: echoes of received messages are dropped,
    /// everything else fails with a [capacity error](EngineError::is_capacity).
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = Some(capacity.max(1));
        self
    }

    /// Builds the engine
    pub fn build(self) -> Result<Engine, EngineError> {
        let full_party = self.full_party.ok_or(EngineError::MissingFullParty)?;
        let storage = self.storage;
        let max_signatures = storage.config.max_simultaneous_signatures;
        let capacity = self.channel_capacity.unwrap_or_else(|| {
            (max_signatures
                * (NUM_BROADCAST_ROUNDS + NUM_UNICAST_ROUNDS)
                * storage.guardians().len())
            .max(1)
        });

        let (outgoing, outgoing_rx) = mpsc::channel(capacity);
        let (signatures, signatures_rx) = mpsc::channel(max_signatures.max(1));
        let (ft_commands, ft_rx) = mpsc::channel(capacity);

        let broadcast = ReliableBroadcast::new(
            storage.guardians().clone(),
            storage.me().index,
            storage.threshold(),
        );

        Ok(Engine {
            inner: Arc::new(Inner {
                full_party,
                broadcast,
                sig_counter: Mutex::new(SigCounter::new()),
                msg_serial_number: AtomicU64::new(0),
                equivocations: AtomicU64::new(0),
                shutdown: OnceLock::new(),
                capacity,
                outgoing,
                signatures,
                ft_commands,
                outgoing_rx: Mutex::new(Some(outgoing_rx)),
                signatures_rx: Mutex::new(Some(signatures_rx)),
                ft_rx: Mutex::new(Some(ft_rx)),
                storage,
            }),
        })
    }
}

/// Guardian signing engine, see [module docs](self)
///
/// Cheap to clone: clones share the same engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    storage: GuardianStorage,
    full_party: Arc<dyn FullParty>,
    broadcast: ReliableBroadcast,
    sig_counter: Mutex<SigCounter>,
    msg_serial_number: AtomicU64,
    equivocations: AtomicU64,
    shutdown: OnceLock<CancellationToken>,
    capacity: usize,

    outgoing: mpsc::Sender<Sendable>,
    signatures: mpsc::Sender<SignatureData>,
    ft_commands: mpsc::Sender<FtCommand>,

    outgoing_rx: Mutex<Option<mpsc::Receiver<Sendable>>>,
    signatures_rx: Mutex<Option<mpsc::Receiver<SignatureData>>>,
    ft_rx: Mutex<Option<mpsc::Receiver<FtCommand>>>,
}

impl Engine {
    /// Starts the engine
    ///
    /// Spawns fault tracker and signing engine listener onto current tokio runtime. They're
    /// running until `shutdown` is cancelled. Engine can only be started once.
    pub fn start(&self, shutdown: CancellationToken) -> Result<(), EngineError> {
        if self.inner.shutdown.set(shutdown.clone()).is_err() {
            return Err(EngineError::AlreadyStarted);
        }
        let ft_rx = self
            .inner
            .ft_rx
            .lock()
            .take()
            .ok_or(EngineError::AlreadyStarted)?;

        let capacity = self.inner.capacity;
        let (messages, messages_rx) = mpsc::channel(capacity);
        let (signatures, signatures_rx) = mpsc::channel(capacity);
        let (errors, errors_rx) = mpsc::channel(capacity);
        self.inner.full_party.start(FullPartyOutputs {
            messages,
            signatures,
            errors,
        })?;

        let me = self.me().clone();
        let tracker = FtTracker::new(TrackerConfig::from_storage(&self.inner.storage));
        let env: Arc<dyn FtEnvironment> = Arc::new(self.clone());
        tokio::spawn(
            run_tracker(tracker, env, ft_rx, shutdown.clone())
                .instrument(info_span!("fault_tracker", guardian = %me)),
        );
        tokio::spawn(
            listener::run(
                self.clone(),
                listener::FullPartyReceivers {
                    messages: messages_rx,
                    signatures: signatures_rx,
                    errors: errors_rx,
                },
                shutdown,
            )
            .instrument(info_span!("full_party_listener", guardian = %me)),
        );

        info!(guardian = %me, threshold = self.inner.storage.threshold(), "engine started");
        Ok(())
    }

    /// Local guardian
    pub fn me(&self) -> &Arc<PartyIdentity> {
        self.inner.storage.me()
    }

    /// Guardian storage the engine was built with
    pub fn storage(&self) -> &GuardianStorage {
        &self.inner.storage
    }

    /// Takes the channel of signatures produced by the engine
    ///
    /// Returns `None` if it was already taken.
    pub fn produced_signatures(&self) -> Option<mpsc::Receiver<SignatureData>> {
        self.inner.signatures_rx.lock().take()
    }

    /// Takes the channel of messages to be sent to other guardians
    ///
    /// Returns `None` if it was already taken.
    pub fn produced_output_messages(&self) -> Option<mpsc::Receiver<Sendable>> {
        self.inner.outgoing_rx.lock().take()
    }

    /// Amount of equivocations detected since start
    pub fn equivocations_detected(&self) -> u64 {
        self.inner.equivocations.load(Ordering::Relaxed)
    }

    /// Signs `digest` observed on `chain`
    ///
    /// Committee is chosen by the signing engine excluding guardians known to be inactive on
    /// `chain`. Returns once the signing engine is asked to sign, the signature is delivered via
    /// [`Engine::produced_signatures`].
    pub async fn begin_async_threshold_signing_protocol(
        &self,
        digest: &[u8],
        chain: ChainId,
        consistency_level: u8,
    ) -> Result<(), EngineError> {
        self.shutdown_token()?;
        let digest: Digest = digest
            .try_into()
            .map_err(|_| EngineError::InvalidDigestLength(digest.len()))?;
        self.begin_signing(digest, chain, consistency_level, None)
            .await
    }

    /// Announces a digest to every guardian, so they all start signing it
    ///
    /// Only the leader can announce digests.
    pub async fn announce_digest(
        &self,
        digest: &[u8],
        chain: ChainId,
        consistency_level: u8,
    ) -> Result<(), EngineError> {
        self.shutdown_token()?;
        if !self.inner.storage.is_leader() {
            return Err(EngineError::NotLeader);
        }
        let digest: Digest = digest
            .try_into()
            .map_err(|_| EngineError::InvalidDigestLength(digest.len()))?;

        let announcement = sign_announcement(
            digest,
            chain,
            consistency_level,
            self.inner.storage.signing_key(),
        );
        info!(digest = %hex::encode(digest), %chain, consistency_level, "announce digest");
        self.originate(
            Deliverable::Announcement {
                leader: self.me().index,
                announcement: announcement.clone(),
            },
            Content::Announcement(announcement),
        )
        .await
    }

    /// Reports to other guardians that the local guardian can't sign on `chain`
    pub async fn report_problem(&self, chain: ChainId) -> Result<(), EngineError> {
        self.shutdown_token()?;
        let problem = Problem::issued_now(chain);
        warn!(%chain, "report problem");
        self.originate(
            Deliverable::Problem {
                issuer: self.me().index,
                problem,
            },
            Content::Problem(problem),
        )
        .await
    }

    /// Guardians currently excluded from committees on `chain`
    pub async fn inactive_guardians(&self, chain: ChainId) -> Result<Inactives, EngineError> {
        Ok(self.prepare_to_sign([0; 32], chain).await?.inactives)
    }

    async fn begin_signing(
        &self,
        digest: Digest,
        chain: ChainId,
        consistency_level: u8,
        faulties: Option<Vec<PartyIndex>>,
    ) -> Result<(), EngineError> {
        let full_party = &self.inner.full_party;

        // tracker learns about the digest before anyone could see us signing it
        let approved = full_party.get_signing_info(&SigningTask {
            digest,
            chain,
            faulties: vec![],
        })?;
        self.send_to_tracker(FtCommand::Sign(SignCommand {
            info: approved,
            passed_to_fp: false,
            consistency_level,
        }))?;

        let preparation = self.prepare_to_sign(digest, chain).await?;
        let task = SigningTask {
            digest,
            chain,
            faulties: faulties.unwrap_or(preparation.inactives.party_ids),
        };
        let info = full_party.get_signing_info(&task)?;
        if preparation.already_started.contains(&info.tracking_id) {
            debug!(tracking_id = %info.tracking_id, "signing is already started");
            return Ok(());
        }

        let me = self.me().index;
        let max = self.inner.storage.config.max_simultaneous_signatures;
        if info.is_signer && !self.inner.sig_counter.lock().add(&info.tracking_id, me, max) {
            return Err(EngineError::TooManySimultaneousSignatures { max });
        }
        let info = match full_party.async_request_new_signature(task) {
            Ok(info) => info,
            Err(err) => {
                self.inner.sig_counter.lock().remove(&info.tracking_id);
                return Err(err.into());
            }
        };
        info!(
            tracking_id = %info.tracking_id,
            %chain,
            committee = ?info.committee,
            is_signer = info.is_signer,
            "guardian started signing protocol"
        );

        self.send_to_tracker(FtCommand::Sign(SignCommand {
            info,
            passed_to_fp: true,
            consistency_level,
        }))
    }

    async fn prepare_to_sign(
        &self,
        digest: Digest,
        chain: ChainId,
    ) -> Result<SigPreparationInfo, EngineError> {
        let (reply, response) = oneshot::channel();
        self.send_to_tracker(FtCommand::PrepareToSign(PrepareToSignCommand {
            digest,
            chain,
            reply,
        }))?;
        self.until_shutdown(response)
            .await?
            .map_err(|_| EngineError::TrackerUnavailable)
    }

    /// Signs and broadcasts a message produced by the local guardian
    async fn originate(&self, deliverable: Deliverable, content: Content) -> Result<(), EngineError> {
        let me = self.me().clone();
        let uuid = deliverable.uuid();
        let msg = SignedMessage::sign(me.index, content, &uuid, self.inner.storage.signing_key());

        let decision = self
            .inner
            .broadcast
            .inspect(ParsedEcho::Content(deliverable), &msg, &me)?;
        self.send_out(Sendable {
            message: PropagatedMessage::Echo(Echo { message: msg }),
            recipients: self.other_guardians(),
        })?;

        if let Some(delivered) = decision.delivered {
            self.deliver(delivered).await?;
        }
        Ok(())
    }

    fn other_guardians(&self) -> Vec<Arc<PartyIdentity>> {
        let me = self.me().index;
        self.inner
            .storage
            .guardians()
            .iter()
            .filter(|g| g.index != me)
            .cloned()
            .collect()
    }

    fn next_serial_number(&self) -> u64 {
        self.inner.msg_serial_number.fetch_add(1, Ordering::Relaxed)
    }

    fn shutdown_token(&self) -> Result<&CancellationToken, EngineError> {
        let token = self.inner.shutdown.get().ok_or(EngineError::NotStarted)?;
        if token.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }
        Ok(token)
    }

    async fn until_shutdown<F: Future>(&self, future: F) -> Result<F::Output, EngineError> {
        let shutdown = self.shutdown_token()?;
        tokio::select! {
            _ = shutdown.cancelled() => Err(EngineError::ShuttingDown),
            output = future => Ok(output),
        }
    }

    /// Never waits for the tracker to free up space
    fn send_to_tracker(&self, cmd: FtCommand) -> Result<(), EngineError> {
        self.shutdown_token()?;
        self.inner
            .ft_commands
            .try_send(cmd)
            .map_err(|err| match err {
                TrySendError::Full(_) => EngineError::TrackerBufferFull,
                TrySendError::Closed(_) => EngineError::TrackerUnavailable,
            })
    }

    /// Never waits for the network to free up space
    fn send_out(&self, msg: Sendable) -> Result<(), EngineError> {
        self.shutdown_token()?;
        if msg.recipients.is_empty() {
            return Ok(());
        }
        self.inner.outgoing.try_send(msg).map_err(|err| match err {
            TrySendError::Full(_) => EngineError::OutgoingBufferFull,
            TrySendError::Closed(_) => EngineError::ShuttingDown,
        })
    }
}

impl FtEnvironment for Engine {
    fn signing_info(&self, task: &SigningTask) -> Result<SigningInfo, FullPartyError> {
        self.inner.full_party.get_signing_info(task)
    }

    fn report_problem(&self, chain: ChainId) {
        let engine = self.clone();
        tokio::spawn(
            async move {
                if let Err(err) = engine.report_problem(chain).await {
                    warn!(%err, %chain, "couldn't report problem");
                }
            }
            .in_current_span(),
        );
    }

    fn retry_signing(&self, request: RetryRequest) {
        let engine = self.clone();
        tokio::spawn(
            async move {
                let RetryRequest {
                    digest,
                    chain,
                    consistency_level,
                    faulties,
                } = request;
                if let Err(err) = engine
                    .begin_signing(digest, chain, consistency_level, faulties)
                    .await
                {
                    warn!(%err, digest = %hex::encode(digest), %chain, "couldn't retry signing");
                }
            }
            .in_current_span(),
        );
    }
}
