use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::broadcast::Deliverable;
use crate::fault_tolerance::FtCommand;
use crate::full_party::{MessageDestination, ParsedMessage, SignatureData, TrackableError};
use crate::message::{Content, PropagatedMessage, Sendable, TssContent, Unicast};

use super::Engine;

pub(super) struct FullPartyReceivers {
    pub messages: mpsc::Receiver<ParsedMessage>,
    pub signatures: mpsc::Receiver<SignatureData>,
    pub errors: mpsc::Receiver<TrackableError>,
}

/// Routes outputs of the signing engine until shutdown, then stops the signing engine
pub(super) async fn run(engine: Engine, mut rx: FullPartyReceivers, shutdown: CancellationToken) {
    let config = &engine.inner.storage.config;
    let period = config.max_signer_ttl;
    let max_age = config.cleanup_ttl();
    let mut cleanup = tokio::time::interval_at(Instant::now() + period, period);
    cleanup.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(msg) = rx.messages.recv() => engine.handle_full_party_output(msg).await,
            Some(sig) = rx.signatures.recv() => engine.handle_full_party_signature(sig),
            Some(err) = rx.errors.recv() => engine.handle_full_party_error(err),
            _ = cleanup.tick() => engine.cleanup(max_age),
        }
    }

    if let Err(err) = engine.inner.full_party.stop() {
        warn!(%err, "couldn't stop signing engine");
    }
    debug!("signing engine listener is stopped");
}

impl Engine {
    async fn handle_full_party_output(&self, msg: ParsedMessage) {
        let tracking_id = msg.tracking_id;
        let round = msg.round;
        let content = TssContent {
            payload: msg.payload.clone(),
            msg_serial_number: self.next_serial_number(),
        };

        let result = match msg.destination.clone() {
            MessageDestination::AllParties => {
                self.originate(Deliverable::Tss(msg), Content::Tss(content))
                    .await
            }
            MessageDestination::Parties(parties) => {
                let guardians = self.inner.storage.guardians();
                let recipients = parties
                    .iter()
                    .filter(|&&p| p != self.me().index)
                    .filter_map(|&p| guardians.get(p).cloned())
                    .collect::<Vec<_>>();
                if recipients.len() != parties.len() {
                    warn!(%tracking_id, %round, ?parties, "some recipients are unknown or local");
                }
                self.send_out(Sendable {
                    message: PropagatedMessage::Unicast(Unicast { content }),
                    recipients,
                })
            }
        };

        if let Err(err) = result {
            error!(%err, %tracking_id, %round, "couldn't send protocol message to the network");
        }
    }

    fn handle_full_party_signature(&self, sig: SignatureData) {
        debug!(tracking_id = %sig.tracking_id, "signature produced");
        self.inner.sig_counter.lock().remove(&sig.tracking_id);

        // tracker drops the state on expiry anyway
        if self
            .inner
            .ft_commands
            .try_send(FtCommand::SigEnd(sig.tracking_id))
            .is_err()
        {
            warn!(tracking_id = %sig.tracking_id, "couldn't inform tracker about signature end");
        }

        let tracking_id = sig.tracking_id;
        if self.inner.signatures.try_send(sig).is_err() {
            error!(%tracking_id, "signature is lost, signatures channel is full or closed");
        }
    }

    fn handle_full_party_error(&self, err: TrackableError) {
        let Some(tracking_id) = err.tracking_id else {
            error!(error = %err.error, culprits = ?err.culprits, "signing failed, unknown signing attempt");
            return;
        };

        if self
            .inner
            .ft_commands
            .try_send(FtCommand::SigEnd(tracking_id))
            .is_err()
        {
            warn!(%tracking_id, "couldn't inform tracker about signature end");
        }
        self.inner.sig_counter.lock().remove(&tracking_id);

        warn!(
            %tracking_id,
            error = %err.error,
            culprits = ?err.culprits,
            "signing failed"
        );
    }

    fn cleanup(&self, max_age: Duration) {
        let forgotten = self.inner.broadcast.cleanup(max_age);
        self.inner.sig_counter.lock().clean_self(max_age);
        debug!(forgotten, "cleanup");
    }
}
