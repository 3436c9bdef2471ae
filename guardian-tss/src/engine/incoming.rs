use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, error, trace, warn};

use crate::broadcast::{Deliverable, ParsedEcho, UnicastStatus};
use crate::fault_tolerance::{DeliveryCommand, FtCommand, ProblemCommand};
use crate::full_party::ParsedMessage;
use crate::identity::{PartyIdentity, PartyIndex};
use crate::leader::{verify_announcement, LeaderError};
use crate::message::{
    tss_uuid, Content, Echo, IncomingMessage, PropagatedMessage, Sendable, SignedMessage, Unicast,
};
use crate::rounds::SigningRound;
use crate::tracking_id::TrackingId;
use crate::validation::{
    validate_broadcast_message, validate_problem_freshness, validate_signed_message,
    validate_source, validate_unicast, validate_unicast_message, ValidationError,
};

use super::{Engine, EngineError, IncomingError};

/// Context of a message being handled, filled as it's learned
struct MessageContext {
    source: Arc<PartyIdentity>,
    tracking_id: Option<TrackingId>,
    round: Option<SigningRound>,
    sender: Option<PartyIndex>,
}

impl MessageContext {
    fn learn(&mut self, parsed: &ParsedMessage) {
        self.tracking_id = Some(parsed.tracking_id);
        self.round = Some(parsed.round);
        self.sender = Some(parsed.from);
    }

    fn into_error(self, error: EngineError) -> IncomingError {
        IncomingError {
            tracking_id: self.tracking_id,
            round: self.round,
            sender: self.sender,
            source: self.source,
            error,
        }
    }
}

impl Engine {
    /// Handles a message received from another guardian
    ///
    /// Malformed messages are rejected before they affect any state. Equivocations are counted
    /// in [`Engine::equivocations_detected`].
    pub async fn handle_incoming_tss_message(
        &self,
        incoming: IncomingMessage,
    ) -> Result<(), IncomingError> {
        let mut ctx = MessageContext {
            source: incoming.source.clone(),
            tracking_id: None,
            round: None,
            sender: None,
        };
        let result = match self.shutdown_token() {
            Err(err) => Err(err),
            Ok(_) => match incoming.message {
                PropagatedMessage::Echo(echo) => {
                    self.handle_echo(echo, &incoming.source, &mut ctx).await
                }
                PropagatedMessage::Unicast(unicast) => {
                    self.handle_unicast(unicast, &incoming.source, &mut ctx).await
                }
            },
        };

        result.map_err(|err| {
            let err = ctx.into_error(err);
            self.report_incoming_error(&err);
            err
        })
    }

    async fn handle_echo(
        &self,
        echo: Echo,
        source: &Arc<PartyIdentity>,
        ctx: &mut MessageContext,
    ) -> Result<(), EngineError> {
        let guardians = self.inner.storage.guardians();
        validate_source(source, guardians)?;
        validate_signed_message(&echo.message, guardians)?;
        ctx.sender = Some(echo.message.sender);

        let parsed = self.parse_echo(&echo.message)?;
        if let ParsedEcho::Content(Deliverable::Tss(parsed)) = &parsed {
            ctx.learn(parsed);
        }
        let uuid = parsed.uuid();
        trace!(kind = echo.message.content.kind(), uuid = %hex::encode(uuid), "received echo");

        let decision = self
            .inner
            .broadcast
            .inspect(parsed, &echo.message, source)?;
        let mut delivered = decision.delivered;

        if decision.should_echo {
            let me = self.me().clone();
            let hash_echo = echo.message.to_hash_echo(uuid);
            // local guardian votes for the message it echoes
            let own_vote = self
                .inner
                .broadcast
                .inspect(ParsedEcho::HashEcho(uuid), &hash_echo, &me)?;
            delivered = delivered.or(own_vote.delivered);

            match self.send_out(Sendable {
                message: PropagatedMessage::Echo(Echo { message: hash_echo }),
                recipients: self.other_guardians(),
            }) {
                Err(EngineError::OutgoingBufferFull) => {
                    warn!(uuid = %hex::encode(uuid), "couldn't echo the message, network output buffer is full");
                }
                result => result?,
            }
        }

        if let Some(delivered) = delivered {
            self.deliver(delivered).await?;
        }
        Ok(())
    }

    fn parse_echo(&self, msg: &SignedMessage) -> Result<ParsedEcho, EngineError> {
        let n = self.inner.storage.guardians().len();
        match &msg.content {
            Content::Tss(tss) => {
                let parsed = self
                    .inner
                    .full_party
                    .parse_message(&tss.payload, msg.sender, true)
                    .map_err(ValidationError::Parse)?;
                validate_broadcast_message(&parsed, msg.sender, n)?;
                Ok(ParsedEcho::Content(Deliverable::Tss(parsed)))
            }
            Content::Problem(problem) => {
                let max_age = self.inner.storage.config.max_heartbeat_interval;
                validate_problem_freshness(problem.issued_at(), SystemTime::now(), max_age)?;
                Ok(ParsedEcho::Content(Deliverable::Problem {
                    issuer: msg.sender,
                    problem: *problem,
                }))
            }
            Content::Announcement(announcement) => {
                let leader = self.inner.storage.leader().ok_or(LeaderError::NoLeader)?;
                if leader.index != msg.sender {
                    return Err(LeaderError::NotBroadcastedByLeader(msg.sender).into());
                }
                verify_announcement(announcement, &leader.public_key)?;
                Ok(ParsedEcho::Content(Deliverable::Announcement {
                    leader: msg.sender,
                    announcement: announcement.clone(),
                }))
            }
            Content::HashEcho(echo) => Ok(ParsedEcho::HashEcho(echo.session_uuid)),
        }
    }

    async fn handle_unicast(
        &self,
        unicast: Unicast,
        source: &Arc<PartyIdentity>,
        ctx: &mut MessageContext,
    ) -> Result<(), EngineError> {
        let guardians = self.inner.storage.guardians();
        validate_source(source, guardians)?;
        validate_unicast(&unicast)?;

        let parsed = self
            .inner
            .full_party
            .parse_message(&unicast.content.payload, source.index, false)
            .map_err(ValidationError::Parse)?;
        ctx.learn(&parsed);
        validate_unicast_message(&parsed, source.index, guardians.len())?;

        let uuid = tss_uuid(&parsed.tracking_id, parsed.round, parsed.from);
        let digest = Content::Tss(unicast.content).digest();
        match self.inner.broadcast.record_unicast(uuid, digest, source)? {
            UnicastStatus::New => self.feed_full_party(parsed).await,
            UnicastStatus::AlreadyReceived => {
                debug!(uuid = %hex::encode(uuid), "unicast is already received");
                Ok(())
            }
        }
    }

    /// Acts on a message delivered by reliable broadcast
    pub(super) async fn deliver(&self, delivered: Deliverable) -> Result<(), EngineError> {
        match delivered {
            Deliverable::Tss(parsed) => {
                trace!(tracking_id = %parsed.tracking_id, round = %parsed.round, from = parsed.from, "deliver protocol message");
                if parsed.from == self.me().index {
                    // signing engine knows its own messages
                    self.send_to_tracker(FtCommand::Delivery(DeliveryCommand { parsed }))
                } else {
                    self.feed_full_party(parsed).await
                }
            }
            Deliverable::Problem { issuer, problem } => {
                debug!(issuer, chain = %problem.chain, "deliver problem");
                self.send_to_tracker(FtCommand::ReportProblem(ProblemCommand { issuer, problem }))
            }
            Deliverable::Announcement {
                leader,
                announcement,
            } => {
                debug!(
                    leader,
                    digest = %hex::encode(announcement.digest),
                    chain = %announcement.chain,
                    "deliver announcement"
                );
                self.begin_signing(
                    announcement.digest,
                    announcement.chain,
                    announcement.consistency_level,
                    None,
                )
                .await
            }
        }
    }

    async fn feed_full_party(&self, parsed: ParsedMessage) -> Result<(), EngineError> {
        let max = self.inner.storage.config.max_simultaneous_signatures;
        if !self
            .inner
            .sig_counter
            .lock()
            .add(&parsed.tracking_id, parsed.from, max)
        {
            return Err(EngineError::GuardianOverloaded {
                guardian: parsed.from,
                max,
            });
        }
        self.inner.full_party.update(parsed.clone())?;
        self.send_to_tracker(FtCommand::Delivery(DeliveryCommand { parsed }))
    }

    fn report_incoming_error(&self, err: &IncomingError) {
        let tracking_id = err.tracking_id.map(|id| id.to_string());
        let round = err.round.map(|r| r.number());
        let source = err.source.to_string();
        let cause = &err.error;

        if cause.is_equivocation() {
            self.inner.equivocations.fetch_add(1, Ordering::Relaxed);
            error!(
                security = true,
                %source,
                sender = ?err.sender,
                ?tracking_id,
                ?round,
                error = %cause,
                accused = ?accused(cause),
                "equivocation detected"
            );
        } else if matches!(cause, EngineError::ShuttingDown | EngineError::NotStarted) {
            debug!(%source, error = %cause, "message dropped");
        } else {
            warn!(
                %source,
                sender = ?err.sender,
                ?tracking_id,
                ?round,
                error = %cause,
                details = ?std::error::Error::source(cause).map(|e| e.to_string()),
                "couldn't handle incoming message"
            );
        }
    }
}

fn accused(err: &EngineError) -> Option<String> {
    match err {
        EngineError::Broadcast(err) => err.accused().map(|g| g.to_string()),
        _ => None,
    }
}
