use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::full_party::SigningTask;
use crate::identity::PartyIndex;
use crate::message::Problem;
use crate::ttl::TtlHeap;
use crate::tracking_id::{ChainId, Digest, TrackingId};

use super::{
    is_reportable, DeliveryCommand, FtCommand, FtEnvironment, Inactives, PrepareToSignCommand,
    ProblemCommand, RetryRequest, SigPreparationInfo, SignCommand, TrackerConfig,
};

type SigKey = (Digest, ChainId);

#[derive(Debug, Default)]
struct TrackingContext {
    already_requested_signature: bool,
    saw_messages_from: HashSet<PartyIndex>,
}

#[derive(Debug)]
struct SignatureState {
    begin_time: Instant,
    approved_to_sign: bool,
    consistency_level: u8,
    tracking: HashMap<TrackingId, TrackingContext>,
}

impl SignatureState {
    fn new(begin_time: Instant) -> Self {
        Self {
            begin_time,
            approved_to_sign: false,
            consistency_level: 0,
            tracking: HashMap::new(),
        }
    }

    fn max_guardian_votes(&self) -> usize {
        self.tracking
            .values()
            .map(|c| c.saw_messages_from.len())
            .max()
            .unwrap_or(0)
    }

    fn already_requested(&self, tracking_id: &TrackingId) -> bool {
        self.tracking
            .get(tracking_id)
            .map(|c| c.already_requested_signature)
            .unwrap_or(false)
    }
}

#[derive(Debug, Default)]
struct MemberChainContext {
    time_to_revive: Option<Instant>,
    pending_sigs: HashSet<SigKey>,
}

/// State machine behind the [fault tracker task](super::run_tracker)
///
/// Every method takes current time explicitly, the tracker never reads the clock itself.
pub struct FtTracker {
    config: TrackerConfig,
    sigs: HashMap<SigKey, SignatureState>,
    chain_sigs: HashMap<ChainId, HashSet<SigKey>>,
    // creation order of signature states; stale entries are skipped lazily
    ttl_list: VecDeque<(SigKey, Instant)>,
    members: BTreeMap<PartyIndex, HashMap<ChainId, MemberChainContext>>,
    sig_alerts: TtlHeap<SigKey>,
    downtime_alerts: TtlHeap<(PartyIndex, ChainId)>,
}

impl FtTracker {
    /// Constructs a tracker with no signatures and all guardians active
    pub fn new(config: TrackerConfig) -> Self {
        let members = config
            .guardians
            .iter()
            .map(|&g| (g, HashMap::new()))
            .collect();
        Self {
            config,
            sigs: HashMap::new(),
            chain_sigs: HashMap::new(),
            ttl_list: VecDeque::new(),
            members,
            sig_alerts: TtlHeap::new(),
            downtime_alerts: TtlHeap::new(),
        }
    }

    /// Tracker config
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Amount of tracked signatures
    pub fn tracked_signatures(&self) -> usize {
        self.sigs.len()
    }

    /// Whether signature of the digest is tracked
    pub fn is_tracked(&self, digest: &Digest, chain: ChainId) -> bool {
        self.sigs.contains_key(&(*digest, chain))
    }

    /// Signatures `guardian` is expected to take part in on `chain`
    pub fn pending_sigs(&self, guardian: PartyIndex, chain: ChainId) -> usize {
        self.members
            .get(&guardian)
            .and_then(|chains| chains.get(&chain))
            .map(|ctx| ctx.pending_sigs.len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub(super) fn sig_alerts_mut(&mut self) -> &mut TtlHeap<SigKey> {
        &mut self.sig_alerts
    }

    #[cfg(test)]
    pub(super) fn downtime_alerts_mut(&mut self) -> &mut TtlHeap<(PartyIndex, ChainId)> {
        &mut self.downtime_alerts
    }

    pub(super) fn alerts_mut(
        &mut self,
    ) -> (&mut TtlHeap<SigKey>, &mut TtlHeap<(PartyIndex, ChainId)>) {
        (&mut self.sig_alerts, &mut self.downtime_alerts)
    }

    /// Applies a command, then enforces tracking limits
    pub fn apply(&mut self, cmd: FtCommand, env: &dyn FtEnvironment, now: Instant) {
        match cmd {
            FtCommand::Sign(cmd) => self.apply_sign(cmd, now),
            FtCommand::PrepareToSign(cmd) => self.apply_prepare_to_sign(cmd, now),
            FtCommand::SigEnd(tracking_id) => {
                self.remove(&(*tracking_id.digest(), tracking_id.chain_id()))
            }
            FtCommand::Delivery(cmd) => self.apply_delivery(cmd, now),
            FtCommand::ReportProblem(cmd) => self.apply_problem(cmd, env, now),
        }
        self.enforce_limits(now);
    }

    fn apply_sign(&mut self, cmd: SignCommand, now: Instant) {
        let tracking_id = cmd.info.tracking_id;
        let key = (*tracking_id.digest(), tracking_id.chain_id());
        let reportable = is_reportable(cmd.consistency_level);

        let state = self.get_or_create(key, now);
        state.approved_to_sign = true;
        state.consistency_level = cmd.consistency_level;
        if cmd.passed_to_fp {
            state
                .tracking
                .entry(tracking_id)
                .or_default()
                .already_requested_signature = true;
        }

        if !reportable {
            return;
        }
        for member in &cmd.info.committee {
            if let Some(chains) = self.members.get_mut(member) {
                chains.entry(key.1).or_default().pending_sigs.insert(key);
            }
        }
    }

    fn apply_prepare_to_sign(&mut self, cmd: PrepareToSignCommand, now: Instant) {
        let already_started = self
            .sigs
            .get(&(cmd.digest, cmd.chain))
            .map(|state| {
                state
                    .tracking
                    .iter()
                    .filter(|(_, ctx)| ctx.already_requested_signature)
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default();
        let info = SigPreparationInfo {
            already_started,
            inactives: self.inactives(cmd.chain, now),
        };
        if cmd.reply.send(info).is_err() {
            debug!("prepare-to-sign requester is gone");
        }
    }

    fn apply_delivery(&mut self, cmd: DeliveryCommand, now: Instant) {
        let tracking_id = cmd.parsed.tracking_id;
        let key = (*tracking_id.digest(), tracking_id.chain_id());
        let is_new = !self.sigs.contains_key(&key);

        self.get_or_create(key, now)
            .tracking
            .entry(tracking_id)
            .or_default()
            .saw_messages_from
            .insert(cmd.parsed.from);

        if is_new {
            self.sig_alerts
                .enqueue(key, now + self.config.delay_grace_time);
        }
    }

    fn apply_problem(&mut self, cmd: ProblemCommand, env: &dyn FtEnvironment, now: Instant) {
        let ProblemCommand { issuer, problem } = cmd;
        let chain = problem.chain;
        let jitter = problem_jitter(&problem, issuer, self.config.max_jitter);
        let down_time = self.config.guardian_down_time;

        let Some(chains) = self.members.get_mut(&issuer) else {
            warn!(issuer, "problem reported by unknown guardian");
            return;
        };
        let ctx = chains.entry(chain).or_default();

        // a guardian already excluded isn't excluded for longer by repeating reports
        if ctx.time_to_revive.map(|revive| now > revive).unwrap_or(true) {
            let revive = now + down_time + jitter;
            ctx.time_to_revive = Some(revive);
            self.downtime_alerts.enqueue((issuer, chain), revive);
            info!(issuer, %chain, ?down_time, ?jitter, "guardian is excluded from committees");
        }

        if issuer == self.config.me {
            return;
        }

        let pending = std::mem::take(&mut ctx.pending_sigs);
        for key in pending {
            let Some(state) = self.sigs.get(&key) else {
                continue;
            };
            if !state.approved_to_sign || !is_reportable(state.consistency_level) {
                continue;
            }
            debug!(digest = %hex::encode(key.0), %chain, issuer, "retry signing without the guardian");
            env.retry_signing(RetryRequest {
                digest: key.0,
                chain: key.1,
                consistency_level: state.consistency_level,
                faulties: None,
            });
        }
    }

    /// Inspects digests whose grace time passed
    ///
    /// If the local guardian never approved the digest but more than `f` guardians are signing
    /// it, the local guardian reports a problem on that chain.
    pub fn inspect_sig_alerts(&mut self, alerts: Vec<SigKey>, env: &dyn FtEnvironment, now: Instant) {
        for key in alerts {
            let Some(state) = self.sigs.get(&key) else {
                continue;
            };
            if state.approved_to_sign {
                continue;
            }
            if state.max_guardian_votes() > self.config.max_faults {
                if self.config.chains_with_no_self_report.contains(&key.1) {
                    debug!(chain = %key.1, "digest wasn't approved locally, but self report is disabled on this chain");
                    continue;
                }
                warn!(
                    digest = %hex::encode(key.0),
                    chain = %key.1,
                    "guardians are signing digest that wasn't approved locally, reporting a problem"
                );
                env.report_problem(key.1);
            } else {
                self.sig_alerts
                    .enqueue(key, now + self.config.delay_grace_time / 2);
            }
        }
    }

    /// Retries pending signatures of chains where a guardian's downtime is ending
    pub fn inspect_downtime_alerts(
        &mut self,
        alerts: Vec<(PartyIndex, ChainId)>,
        env: &dyn FtEnvironment,
        now: Instant,
    ) {
        let chains = alerts
            .into_iter()
            .map(|(guardian, chain)| {
                debug!(guardian, %chain, "guardian downtime is ending");
                chain
            })
            .collect::<HashSet<_>>();

        for chain in chains {
            let faulties_lists = self.inactives(chain, now).faulties_lists();
            let Some(keys) = self.chain_sigs.get(&chain) else {
                continue;
            };
            let mut requested = HashSet::new();
            for key in keys {
                let Some(state) = self.sigs.get(key) else {
                    continue;
                };
                if !state.approved_to_sign || !is_reportable(state.consistency_level) {
                    continue;
                }
                for faulties in &faulties_lists {
                    let task = SigningTask {
                        digest: key.0,
                        chain,
                        faulties: faulties.clone(),
                    };
                    let info = match env.signing_info(&task) {
                        Ok(info) => info,
                        Err(err) => {
                            warn!(%err, "couldn't compute committee of a retry");
                            continue;
                        }
                    };
                    if !info.is_signer
                        || state.already_requested(&info.tracking_id)
                        || !requested.insert(info.tracking_id)
                    {
                        continue;
                    }
                    env.retry_signing(RetryRequest {
                        digest: key.0,
                        chain,
                        consistency_level: state.consistency_level,
                        faulties: Some(faulties.clone()),
                    });
                }
            }
        }
    }

    /// Guardians excluded from committees of `chain` at `now`
    pub fn inactives(&self, chain: ChainId, now: Instant) -> Inactives {
        let mut inactives = Inactives::default();
        for (&guardian, chains) in &self.members {
            let Some(revive) = chains.get(&chain).and_then(|ctx| ctx.time_to_revive) else {
                continue;
            };
            let distance = if revive > now {
                revive - now
            } else {
                now - revive
            };
            if distance < self.config.synchronising_interval {
                inactives.downtime_ending.push(guardian);
            }
            if revive > now {
                inactives.party_ids.push(guardian);
            }
        }
        inactives
    }

    /// Drops the oldest signatures above the limit, and the signatures older than TTL
    pub fn enforce_limits(&mut self, now: Instant) {
        let mut evicted = 0;
        while self.sigs.len() > self.config.max_tracked_signatures {
            let Some((key, created)) = self.ttl_list.pop_front() else {
                break;
            };
            if self.is_current(&key, created) {
                self.remove(&key);
                evicted += 1;
            }
        }

        let mut expired = 0;
        while let Some(&(key, created)) = self.ttl_list.front() {
            if now.saturating_duration_since(created) <= self.config.signature_ttl {
                break;
            }
            self.ttl_list.pop_front();
            if self.is_current(&key, created) {
                self.remove(&key);
                expired += 1;
            }
        }

        if self.ttl_list.len() > 2 * self.sigs.len() + 64 {
            let sigs = &self.sigs;
            self.ttl_list.retain(|(key, created)| {
                sigs.get(key)
                    .map(|s| s.begin_time == *created)
                    .unwrap_or(false)
            });
        }

        if evicted > 0 {
            warn!(
                evicted,
                limit = self.config.max_tracked_signatures,
                "too many tracked signatures, the oldest are dropped"
            );
        }
        if expired > 0 {
            debug!(expired, "expired signatures are dropped");
        }
    }

    fn is_current(&self, key: &SigKey, created: Instant) -> bool {
        self.sigs
            .get(key)
            .map(|s| s.begin_time == created)
            .unwrap_or(false)
    }

    fn get_or_create(&mut self, key: SigKey, now: Instant) -> &mut SignatureState {
        if !self.sigs.contains_key(&key) {
            self.ttl_list.push_back((key, now));
            self.chain_sigs.entry(key.1).or_default().insert(key);
        }
        self.sigs
            .entry(key)
            .or_insert_with(|| SignatureState::new(now))
    }

    fn remove(&mut self, key: &SigKey) {
        if self.sigs.remove(key).is_none() {
            return;
        }
        if let Some(keys) = self.chain_sigs.get_mut(&key.1) {
            keys.remove(key);
            if keys.is_empty() {
                self.chain_sigs.remove(&key.1);
            }
        }
        for chains in self.members.values_mut() {
            if let Some(ctx) = chains.get_mut(&key.1) {
                ctx.pending_sigs.remove(key);
            }
        }
    }
}

/// Extra exclusion time, the same on every guardian for the same problem
fn problem_jitter(problem: &Problem, issuer: PartyIndex, max: Duration) -> Duration {
    let max_millis = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_millis == 0 {
        return Duration::ZERO;
    }
    let uuid = problem.uuid(issuer);
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&uuid[..8]);
    Duration::from_millis(u64::from_be_bytes(seed) % max_millis)
}
