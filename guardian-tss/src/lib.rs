//! Reliable broadcast and fault-tolerant coordination of threshold signing among guardians.
//!
//! A set of guardians watches chains and jointly signs observed digests with a threshold signing
//! protocol. This crate sits between the networking layer and the signing engine doing the
//! multi-party math:
//!
//! * Broadcast protocol messages go through a byzantine [reliable broadcast](broadcast), so every
//!   honest guardian delivers the same message or none. Senders that sign two different messages
//!   under the same id are detected and reported.
//! * Unicast protocol messages are validated and checked for equivocation.
//! * The [fault tracker](fault_tolerance) watches signing attempts. It reports a problem when the
//!   local guardian falls behind, excludes guardians that reported problems from committees for
//!   a while, and retries signings with new committees.
//!
//! ## Networking
//!
//! Transport is not part of the crate. Implement [`Delivery`](delivery::Delivery), a stream of
//! received messages and a sink of messages to send, and pump it with [`delivery::run`]. The
//! transport must authenticate peers: every received message is attributed to the guardian it
//! came from.
//!
//! ## Features
//!
//! * `dev` enables [multi-guardian simulation](simulation) with an in-memory network and a mock
//!   signing engine

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

pub mod broadcast;
pub mod delivery;
pub mod engine;
pub mod fault_tolerance;
pub mod full_party;
pub mod identity;
pub mod leader;
pub mod message;
pub mod quorum;
pub mod rounds;
pub mod sig_counter;
pub mod storage;
pub mod tracking_id;
pub mod ttl;
pub mod validation;

#[cfg(any(test, feature = "dev"))]
#[cfg_attr(docsrs, doc(cfg(feature = "dev")))]
pub mod simulation;

#[doc(no_inline)]
pub use self::{
    engine::{Engine, EngineBuilder, EngineError, IncomingError},
    full_party::{FullParty, SignatureData},
    identity::{PartyIdentity, PartyIndex},
    message::{IncomingMessage, Sendable},
    storage::{Configurations, GuardianStorage},
    tracking_id::{ChainId, TrackingId},
};
