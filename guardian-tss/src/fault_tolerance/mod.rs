//! Fault tolerance of signing
//!
//! A single tracker task owns all the knowledge about running signing attempts and about
//! guardians that are expected to be unavailable. Other components talk to it only via
//! [`FtCommand`]s sent over a bounded channel; commands are applied strictly in arrival order.
//!
//! The tracker:
//! * keeps a [signature state](tracker) per `(digest, chain)`, bounded in number and in age
//! * excludes guardians that reported a [`Problem`] from new committees on that chain until
//!   their revival time, and retries signatures that were waiting for them
//! * reports a problem itself when `f+1` guardians are seen signing a digest the local guardian
//!   never approved, which means it lags behind on that chain
//! * retries pending signatures when an excluded guardian is expected back

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::full_party::{FullPartyError, ParsedMessage, SigningInfo, SigningTask};
use crate::identity::PartyIndex;
use crate::message::Problem;
use crate::storage::GuardianStorage;
use crate::tracking_id::{ChainId, Digest, TrackingId};

mod tracker;

pub use tracker::FtTracker;

/// Consistency level of observations that may still be reverted on their chain
///
/// Such digests may not be observed by every guardian, so they never cause problem reports or
/// retries.
pub const INSTANT_CONSISTENCY_LEVEL: u8 = 200;

/// Whether failures to sign digests of this consistency level should be tolerated by retries
pub fn is_reportable(consistency_level: u8) -> bool {
    consistency_level != INSTANT_CONSISTENCY_LEVEL
}

/// Command to the fault tracker
#[derive(Debug)]
pub enum FtCommand {
    /// Digest is approved for signing by the committee
    Sign(SignCommand),
    /// Asks which signing attempts were already started, and who is inactive
    PrepareToSign(PrepareToSignCommand),
    /// Signing attempt ended, successfully or not
    SigEnd(TrackingId),
    /// Protocol message of a signing attempt was delivered
    Delivery(DeliveryCommand),
    /// Guardian reported a problem
    ReportProblem(ProblemCommand),
}

/// See [`FtCommand::Sign`]
#[derive(Debug, Clone)]
pub struct SignCommand {
    /// Committee and tracking id
    pub info: SigningInfo,
    /// Whether signing was requested from the signing engine
    pub passed_to_fp: bool,
    /// Consistency level of the observation
    pub consistency_level: u8,
}

/// See [`FtCommand::PrepareToSign`]
#[derive(Debug)]
pub struct PrepareToSignCommand {
    /// Digest to be signed
    pub digest: Digest,
    /// Chain of the digest
    pub chain: ChainId,
    /// Receives the answer
    pub reply: oneshot::Sender<SigPreparationInfo>,
}

/// Answer to [`PrepareToSignCommand`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SigPreparationInfo {
    /// Tracking ids already passed to the signing engine
    pub already_started: HashSet<TrackingId>,
    /// Guardians inactive on the chain
    pub inactives: Inactives,
}

/// See [`FtCommand::Delivery`]
#[derive(Debug, Clone)]
pub struct DeliveryCommand {
    /// Delivered message
    pub parsed: ParsedMessage,
}

/// See [`FtCommand::ReportProblem`]
#[derive(Debug, Clone)]
pub struct ProblemCommand {
    /// Guardian that reported the problem
    pub issuer: PartyIndex,
    /// Reported problem
    pub problem: Problem,
}

/// Guardians excluded from committees on a chain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inactives {
    /// Guardians that are not expected to sign, ascending
    pub party_ids: Vec<PartyIndex>,
    /// Guardians whose exclusion ends (or just ended) around now, ascending
    pub downtime_ending: Vec<PartyIndex>,
}

impl Inactives {
    /// Faulty sets worth trying: all inactives, and then inactives without each guardian whose
    /// downtime is ending
    pub fn faulties_lists(&self) -> Vec<Vec<PartyIndex>> {
        let mut lists = Vec::with_capacity(self.downtime_ending.len() + 1);
        lists.push(self.party_ids.clone());
        for ending in &self.downtime_ending {
            lists.push(
                self.party_ids
                    .iter()
                    .copied()
                    .filter(|p| p != ending)
                    .collect(),
            );
        }
        lists
    }
}

/// Request to sign a digest once more
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryRequest {
    /// Digest to sign
    pub digest: Digest,
    /// Chain of the digest
    pub chain: ChainId,
    /// Consistency level of the observation
    pub consistency_level: u8,
    /// Guardians to exclude. `None` means excluding currently inactive guardians
    pub faulties: Option<Vec<PartyIndex>>,
}

/// Side effects the tracker needs from the rest of the engine
///
/// Implementations must not block: they're called from the tracker task.
pub trait FtEnvironment: Send + Sync + 'static {
    /// Committee of the signing task
    fn signing_info(&self, task: &SigningTask) -> Result<SigningInfo, FullPartyError>;
    /// Broadcasts a problem report of the local guardian
    fn report_problem(&self, chain: ChainId);
    /// Starts signing a digest again
    fn retry_signing(&self, request: RetryRequest);
}

/// Tunables of the tracker
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Local guardian
    pub me: PartyIndex,
    /// All guardians
    pub guardians: Vec<PartyIndex>,
    /// Byzantine guardians tolerated
    pub max_faults: usize,
    /// Maximum amount of tracked signatures
    pub max_tracked_signatures: usize,
    /// Signature states older than that are dropped
    pub signature_ttl: Duration,
    /// Period of cleanup ticker
    pub cleanup_period: Duration,
    /// Wait before inspecting a digest the local guardian didn't approve
    pub delay_grace_time: Duration,
    /// Exclusion time of a guardian reporting a problem
    pub guardian_down_time: Duration,
    /// Upper bound of the jitter added to exclusion
    pub max_jitter: Duration,
    /// Window around revival time
    pub synchronising_interval: Duration,
    /// Chains local guardian doesn't report problems on
    pub chains_with_no_self_report: HashSet<ChainId>,
}

impl TrackerConfig {
    /// Derives tracker config from guardian storage
    pub fn from_storage(storage: &GuardianStorage) -> Self {
        let config = &storage.config;
        Self {
            me: storage.me().index,
            guardians: storage.guardians().iter().map(|g| g.index).collect(),
            max_faults: storage.max_expected_faults(),
            max_tracked_signatures: config.max_tracked_signatures,
            signature_ttl: config.cleanup_ttl(),
            cleanup_period: config.max_signer_ttl,
            delay_grace_time: config.delay_grace_time,
            guardian_down_time: config.guardian_down_time,
            max_jitter: config.max_jitter,
            synchronising_interval: config.synchronising_interval,
            chains_with_no_self_report: config.chains_with_no_self_report.iter().copied().collect(),
        }
    }
}

/// Runs the tracker until `shutdown` is cancelled or all command senders are dropped
pub async fn run_tracker(
    mut tracker: FtTracker,
    env: Arc<dyn FtEnvironment>,
    mut commands: mpsc::Receiver<FtCommand>,
    shutdown: CancellationToken,
) {
    let period = tracker.config().cleanup_period;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let (sig_alerts, downtime_alerts) = tracker.alerts_mut();
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("fault tracker is shut down");
                return;
            }
            cmd = commands.recv() => {
                let Some(cmd) = cmd else {
                    debug!("all command senders are dropped, fault tracker exits");
                    return;
                };
                trace!(?cmd, "apply command");
                tracker.apply(cmd, env.as_ref(), Instant::now());
            }
            _ = ticker.tick() => {
                tracker.enforce_limits(Instant::now());
            }
            alerts = sig_alerts.expired() => {
                tracker.inspect_sig_alerts(alerts, env.as_ref(), Instant::now());
            }
            alerts = downtime_alerts.expired() => {
                tracker.inspect_downtime_alerts(alerts, env.as_ref(), Instant::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faulties_lists() {
        let inactives = Inactives {
            party_ids: vec![1, 3, 4],
            downtime_ending: vec![3, 4],
        };
        assert_eq!(
            inactives.faulties_lists(),
            vec![vec![1, 3, 4], vec![1, 4], vec![1, 3]]
        );
        assert_eq!(Inactives::default().faulties_lists(), vec![Vec::<u16>::new()]);
    }

    #[test]
    fn instant_level_is_not_reportable() {
        assert!(!is_reportable(INSTANT_CONSISTENCY_LEVEL));
        assert!(is_reportable(1));
        assert!(is_reportable(0));
    }
}
