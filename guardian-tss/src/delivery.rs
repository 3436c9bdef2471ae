//! Networking abstraction
//!
//! The engine doesn't know how guardians are connected. A transport authenticates peers (e.g.
//! with mutual TLS), resolves them into [`PartyIdentity`]s and exposes itself as a [`Delivery`]:
//! a [`Stream`] of received messages and a [`Sink`] of messages to send. [`run`] then pumps
//! messages between the transport and the [`Engine`].

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::engine::Engine;
use crate::identity::{PartyIdentity, PartyIndex};
use crate::message::{IncomingMessage, Sendable};
use crate::storage::Configurations;
use crate::ttl::BackoffHeap;

/// Networking abstraction
///
/// Basically, it's pair of channels: [`Stream`] for receiving messages, and [`Sink`] for sending
/// messages to other guardians.
pub trait Delivery {
    /// Outgoing delivery channel
    type Send: Sink<Sendable, Error = Self::SendError> + Unpin;
    /// Incoming delivery channel
    type Receive: Stream<Item = Result<IncomingMessage, Self::ReceiveError>> + Unpin;
    /// Error of outgoing delivery channel
    type SendError: Error + Send + Sync + 'static;
    /// Error of incoming delivery channel
    type ReceiveError: Error + Send + Sync + 'static;
    /// Returns a pair of incoming and outgoing delivery channels
    fn split(self) -> (Self::Receive, Self::Send);
}

impl<I, O, IErr, OErr> Delivery for (I, O)
where
    I: Stream<Item = Result<IncomingMessage, IErr>> + Unpin,
    O: Sink<Sendable, Error = OErr> + Unpin,
    IErr: Error + Send + Sync + 'static,
    OErr: Error + Send + Sync + 'static,
{
    type Send = O;
    type Receive = I;
    type SendError = OErr;
    type ReceiveError = IErr;

    fn split(self) -> (Self::Receive, Self::Send) {
        (self.0, self.1)
    }
}

/// Pumps messages between the engine and the transport
///
/// Received messages are handled one by one in receiving order, messages produced by the engine
/// are sent concurrently. Returns when `shutdown` is cancelled or the transport fails to send.
/// Errors of receiving a message don't stop the pump: they're logged and skipped.
pub async fn run<D>(engine: Engine, delivery: D, shutdown: CancellationToken) -> Result<(), DeliveryError>
where
    D: Delivery,
{
    let mut outgoing = engine
        .produced_output_messages()
        .ok_or(DeliveryError::OutputTaken)?;
    let (mut incoming, mut sending) = delivery.split();

    let receive = async {
        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                msg = incoming.next() => msg,
            };
            match msg {
                Some(Ok(msg)) => {
                    // handling errors are logged by the engine
                    let _ = engine.handle_incoming_tss_message(msg).await;
                }
                Some(Err(err)) => warn!(%err, "couldn't receive message"),
                None => {
                    debug!("incoming stream is exhausted");
                    return Ok::<_, DeliveryError>(());
                }
            }
        }
    };

    let send = async {
        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                msg = outgoing.recv() => msg,
            };
            let Some(msg) = msg else {
                return Ok::<_, DeliveryError>(());
            };
            trace!(recipients = msg.recipients.len(), broadcast = msg.is_broadcast(), "send message");
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                result = sending.send(msg) => result.map_err(|e| DeliveryError::Send(Box::new(e)))?,
            }
        }
    };

    info!(guardian = %engine.me(), "delivery started");
    tokio::try_join!(receive, send).map(|_| ())
}

/// Schedules reconnection to peers with exponential backoff
///
/// A transport calls [`Redialer::dial_failed`] every time connection to a peer fails or drops, and
/// [`Redialer::connected`] once it's established. Peers are handed back by
/// [`Redialer::next_redial`] when it's time to dial them again.
pub struct Redialer {
    peers: BackoffHeap<PartyIndex>,
}

impl Redialer {
    /// Constructs redialer with given backoff bounds
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            peers: BackoffHeap::new(base, max),
        }
    }

    /// Constructs redialer with backoff bounds from config
    pub fn from_config(config: &Configurations) -> Self {
        Self::new(config.reconnect_base_backoff, config.reconnect_max_backoff)
    }

    /// Schedules redial of the peer
    ///
    /// Returns the delay, or `None` if the peer is already scheduled.
    pub fn dial_failed(&mut self, peer: &Arc<PartyIdentity>) -> Option<Duration> {
        let delay = self.peers.enqueue(peer.index)?;
        debug!(%peer, ?delay, "schedule redial");
        Some(delay)
    }

    /// Resets backoff of the peer
    pub fn connected(&mut self, peer: &Arc<PartyIdentity>) {
        self.peers.reset_attempts(&peer.index);
    }

    /// Waits until it's time to redial a peer
    ///
    /// Never resolves while no peer is scheduled. Cancel safe.
    pub async fn next_redial(&mut self) -> PartyIndex {
        self.peers.next_due().await
    }

    /// Amount of peers waiting for redial
    pub fn pending(&self) -> usize {
        self.peers.len()
    }
}

/// Delivery error
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Output channel of the engine was taken by someone else
    #[error("engine output channel is already taken")]
    OutputTaken,
    /// Transport failed to send a message
    #[error("couldn't send message")]
    Send(#[source] Box<dyn Error + Send + Sync>),
}
