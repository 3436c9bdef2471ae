use std::time::Duration;

use matches::assert_matches;

use guardian_tss::message::{
    tss_uuid, Content, Echo, IncomingMessage, Problem, PropagatedMessage, SignedMessage,
    TssContent, Unicast,
};
use guardian_tss::rounds::SigningRound;
use guardian_tss::simulation::{test_guardians, MockFullParty};
use guardian_tss::tracking_id::ProtocolTag;
use guardian_tss::validation::ValidationError;
use guardian_tss::{
    ChainId, Engine, EngineBuilder, EngineError, GuardianStorage, PartyIndex, TrackingId,
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const CHAIN: ChainId = ChainId(2);

struct Setup {
    guardians: Vec<GuardianStorage>,
    engine: Engine,
    tracking_id: TrackingId,
    _shutdown: tokio_util::sync::DropGuard,
}

/// Engine of guardian 1 out of 3, which is in committee with guardian 0
fn setup() -> Setup {
    setup_with(|builder| builder)
}

fn setup_with(configure: impl FnOnce(EngineBuilder) -> EngineBuilder) -> Setup {
    let guardians = test_guardians(3, 1).unwrap();
    let storage = guardians[1].clone();
    let builder = EngineBuilder::new(storage.clone())
        .full_party(std::sync::Arc::new(MockFullParty::new(&storage)));
    let engine = configure(builder).build().unwrap();
    let shutdown = CancellationToken::new();
    engine.start(shutdown.clone()).unwrap();

    Setup {
        guardians,
        engine,
        tracking_id: TrackingId::new(ProtocolTag::Ecdsa, [5; 32], CHAIN, &[0, 1]).unwrap(),
        _shutdown: shutdown.drop_guard(),
    }
}

impl Setup {
    fn unicast(&self, source: usize, round: SigningRound, from: PartyIndex, body: &[u8]) -> IncomingMessage {
        IncomingMessage {
            source: self.guardians[source].me().clone(),
            message: PropagatedMessage::Unicast(Unicast {
                content: TssContent {
                    payload: MockFullParty::encode_message(&self.tracking_id, round, from, body),
                    msg_serial_number: 0,
                },
            }),
        }
    }

    fn echo(&self, sender: usize, round: SigningRound, from: PartyIndex, body: &[u8]) -> IncomingMessage {
        let storage = &self.guardians[sender];
        let uuid = tss_uuid(&self.tracking_id, round, from);
        let content = Content::Tss(TssContent {
            payload: MockFullParty::encode_message(&self.tracking_id, round, from, body),
            msg_serial_number: 0,
        });
        IncomingMessage {
            source: storage.me().clone(),
            message: PropagatedMessage::Echo(Echo {
                message: SignedMessage::sign(
                    storage.me().index,
                    content,
                    &uuid,
                    storage.signing_key(),
                ),
            }),
        }
    }
}

#[tokio::test]
async fn broadcast_round_via_unicast_is_rejected() {
    let s = setup();
    let err = s
        .engine
        .handle_incoming_tss_message(s.unicast(0, SigningRound::Round5, 0, b"x"))
        .await
        .unwrap_err();
    assert_matches!(
        err.error,
        EngineError::Validation(ValidationError::WrongRoundForUnicast(SigningRound::Round5))
    );
    assert_eq!(err.round, Some(SigningRound::Round5));
    assert_eq!(err.tracking_id, Some(s.tracking_id));
    assert!(err.error.is_malformed_input());
}

#[tokio::test]
async fn unicast_round_via_broadcast_is_rejected() {
    let s = setup();
    let err = s
        .engine
        .handle_incoming_tss_message(s.echo(0, SigningRound::Round1, 0, b"x"))
        .await
        .unwrap_err();
    assert_matches!(
        err.error,
        EngineError::Validation(ValidationError::WrongRoundForBroadcast(SigningRound::Round1))
    );
    assert_eq!(err.sender, Some(0));
}

#[tokio::test]
async fn claimed_sender_must_match_transport_source() {
    let s = setup();
    let err = s
        .engine
        .handle_incoming_tss_message(s.unicast(0, SigningRound::Round1, 2, b"x"))
        .await
        .unwrap_err();
    assert_matches!(
        err.error,
        EngineError::Validation(ValidationError::SourceMismatch {
            claimed: 2,
            received_from: 0
        })
    );

    let err = s
        .engine
        .handle_incoming_tss_message(s.echo(0, SigningRound::Round3, 2, b"x"))
        .await
        .unwrap_err();
    assert_matches!(
        err.error,
        EngineError::Validation(ValidationError::SenderMismatch {
            claimed: 2,
            actual: 0
        })
    );
}

#[tokio::test]
async fn equivocating_broadcast_is_detected() {
    let s = setup();
    s.engine
        .handle_incoming_tss_message(s.echo(0, SigningRound::Round3, 0, b"commit"))
        .await
        .unwrap();
    // same message again is just a repeated vote
    s.engine
        .handle_incoming_tss_message(s.echo(0, SigningRound::Round3, 0, b"commit"))
        .await
        .unwrap();
    assert_eq!(s.engine.equivocations_detected(), 0);

    let err = s
        .engine
        .handle_incoming_tss_message(s.echo(0, SigningRound::Round3, 0, b"another commit"))
        .await
        .unwrap_err();
    assert!(err.error.is_equivocation());
    assert_eq!(err.tracking_id, Some(s.tracking_id));
    assert_eq!(s.engine.equivocations_detected(), 1);
}

#[tokio::test]
async fn equivocating_unicast_is_detected() {
    let s = setup();
    s.engine
        .handle_incoming_tss_message(s.unicast(0, SigningRound::Round1, 0, b"share"))
        .await
        .unwrap();
    s.engine
        .handle_incoming_tss_message(s.unicast(0, SigningRound::Round1, 0, b"share"))
        .await
        .unwrap();

    let err = s
        .engine
        .handle_incoming_tss_message(s.unicast(0, SigningRound::Round1, 0, b"other share"))
        .await
        .unwrap_err();
    assert!(err.error.is_equivocation());
    assert_eq!(s.engine.equivocations_detected(), 1);
}

#[tokio::test]
async fn stale_problem_is_rejected() {
    let s = setup();
    let issuer = &s.guardians[0];
    let problem = Problem {
        chain: CHAIN,
        issuing_time: 0,
    };
    let msg = IncomingMessage {
        source: issuer.me().clone(),
        message: PropagatedMessage::Echo(Echo {
            message: SignedMessage::sign(
                issuer.me().index,
                Content::Problem(problem),
                &problem.uuid(issuer.me().index),
                issuer.signing_key(),
            ),
        }),
    };

    let mut outgoing = s.engine.produced_output_messages().unwrap();
    let err = s.engine.handle_incoming_tss_message(msg).await.unwrap_err();
    assert_matches!(
        err.error,
        EngineError::Validation(ValidationError::StaleProblem { .. })
    );
    // stale report is not gossiped further
    assert!(outgoing.try_recv().is_err());
    let inactives = s.engine.inactive_guardians(CHAIN).await.unwrap();
    assert!(inactives.party_ids.is_empty());
}

#[tokio::test]
async fn full_output_buffer_does_not_stall_incoming_messages() {
    let s = setup_with(|builder| builder.channel_capacity(1));
    // nobody drains the network output
    let mut outgoing = s.engine.produced_output_messages().unwrap();

    let rounds = [SigningRound::Round3, SigningRound::Round4, SigningRound::Round5];
    for (i, round) in rounds.into_iter().enumerate() {
        let handled = timeout(
            Duration::from_secs(2),
            s.engine
                .handle_incoming_tss_message(s.echo(0, round, 0, round.to_string().as_bytes())),
        )
        .await
        .unwrap_or_else(|_| panic!("echo #{i} ({round}) is blocked"));
        if let Err(err) = handled {
            assert!(err.error.is_capacity(), "echo #{i} ({round}): {err}");
        }
        tokio::task::yield_now().await;
    }

    let echoed = outgoing.try_recv().unwrap();
    assert_matches!(echoed.message, PropagatedMessage::Echo(_));
    assert!(outgoing.try_recv().is_err());
    assert_eq!(s.engine.equivocations_detected(), 0);
}
