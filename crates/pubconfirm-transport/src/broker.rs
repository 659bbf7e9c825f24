//! Simulated broker channel with publisher confirms enabled.
//!
//! Acks mean "the exchange accepted the message": an existing exchange acks
//! whether or not any queue was routed to. A missing exchange nacks with a
//! broker-style `NOT_FOUND` cause.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use pubconfirm_core::{ConfirmSignal, CorrelationId, Topology, TransportEvent};
use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::debug;

use crate::adapter::{
    confirm_channel, ConfirmEventSink, ConfirmEvents, ConfirmTransport, OutboundPublish,
    TransportHealthSnapshot,
};

/// Close cause reported when the channel is shut down by the client.
pub const CLEAN_SHUTDOWN_CAUSE: &str = "clean channel shutdown; protocol method: \
#method<channel.close>(reply-code=200, reply-text=OK, class-id=0, method-id=0)";

/// Builds the nack cause a broker reports for a publish to a missing exchange.
pub fn missing_exchange_cause(exchange: &str) -> String {
    format!(
        "channel error; protocol method: #method<channel.close>(reply-code=404, \
reply-text=NOT_FOUND - no exchange '{exchange}' in vhost '/', class-id=60, method-id=40)"
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("channel is closed")]
    Closed,
    #[error("send rejected: {0}")]
    SendRejected(String),
}

/// How the broker emits confirms after accepting a send.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfirmMode {
    /// Emit the confirm as soon as the send is processed.
    #[default]
    Immediate,
    /// Keep confirms until `release_held` is called.
    Hold,
    /// Never emit confirms (stalled or lossy channel).
    Drop,
}

/// Order in which held confirms are released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOrder {
    Fifo,
    Reverse,
    Shuffled,
}

/// A message delivered into a queue by exchange routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedMessage {
    pub correlation_id: CorrelationId,
    pub exchange: String,
    pub routing_key: String,
    pub body: Bytes,
}

#[derive(Debug, Default)]
struct BrokerState {
    topology: Topology,
    mode: ConfirmMode,
    reject_sends: bool,
    closed: bool,
    held: Vec<ConfirmSignal>,
    queues: HashMap<String, VecDeque<RoutedMessage>>,
    health: TransportHealthSnapshot,
}

/// In-memory broker channel implementing [`ConfirmTransport`].
///
/// Cloning yields another handle to the same channel, so tests can keep one
/// handle for fault injection while the engine owns another.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    events: ConfirmEventSink,
}

impl InMemoryBroker {
    /// Opens a channel against `topology` and returns its confirm stream.
    pub fn new(topology: Topology) -> (Self, ConfirmEvents) {
        let (events, rx) = confirm_channel();
        let broker = Self {
            state: Arc::new(Mutex::new(BrokerState {
                topology,
                ..BrokerState::default()
            })),
            events,
        };
        (broker, rx)
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_confirm_mode(&self, mode: ConfirmMode) {
        self.lock().mode = mode;
    }

    /// If enabled, sends fail synchronously while the channel stays open.
    pub fn reject_sends(&self, reject: bool) {
        self.lock().reject_sends = reject;
    }

    /// Emits held confirms in `order` and returns how many were released.
    pub fn release_held(&self, order: ReleaseOrder) -> usize {
        let mut held = {
            let mut state = self.lock();
            if state.closed {
                return 0;
            }
            state.health.confirms_held = 0;
            std::mem::take(&mut state.held)
        };
        match order {
            ReleaseOrder::Fifo => {}
            ReleaseOrder::Reverse => held.reverse(),
            ReleaseOrder::Shuffled => held.shuffle(&mut rand::thread_rng()),
        }
        let released = held.len();
        for signal in held {
            self.events.emit(TransportEvent::Confirm(signal));
        }
        released
    }

    /// Injects an arbitrary event, e.g. a late or foreign confirm.
    pub fn emit_raw(&self, event: TransportEvent) -> bool {
        self.events.emit(event)
    }

    /// Closes the channel. Held confirms are lost; later sends fail.
    ///
    /// Returns `false` if the channel was already closed.
    pub fn close_channel(&self, cause: impl Into<String>) -> bool {
        {
            let mut state = self.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
            state.health.closed = true;
            state.health.confirms_dropped += state.held.len() as u64;
            state.health.confirms_held = 0;
            state.held.clear();
        }
        let cause = cause.into();
        debug!(%cause, "in-memory broker channel closed");
        self.events.emit(TransportEvent::Closed { cause });
        true
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn topology(&self) -> Topology {
        self.lock().topology.clone()
    }

    /// Number of messages waiting in `queue`.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Drains and returns every message routed to `queue` so far.
    pub fn take_queue(&self, queue: &str) -> Vec<RoutedMessage> {
        self.lock()
            .queues
            .get_mut(queue)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }
}

impl ConfirmTransport for InMemoryBroker {
    type Error = BrokerError;

    fn send(&self, publish: OutboundPublish<'_>) -> Result<(), Self::Error> {
        let mut state = self.lock();
        if state.closed {
            state.health.outbound_send_err += 1;
            state.health.last_error = Some(BrokerError::Closed.to_string());
            return Err(BrokerError::Closed);
        }
        if state.reject_sends {
            let err = BrokerError::SendRejected("broker refused the frame".to_string());
            state.health.outbound_send_err += 1;
            state.health.last_error = Some(err.to_string());
            return Err(err);
        }
        state.health.outbound_send_ok += 1;

        let correlation_id = publish.correlation_id.clone();
        let routed: Option<Vec<String>> = state
            .topology
            .route(publish.exchange, publish.routing_key)
            .map(|queues| queues.into_iter().map(str::to_owned).collect());

        let signal = match routed {
            None => {
                state.health.confirms_nacked += 1;
                ConfirmSignal::nack(correlation_id, missing_exchange_cause(publish.exchange))
            }
            Some(queues) => {
                if queues.is_empty() {
                    state.health.unroutable_messages += 1;
                }
                for queue in queues {
                    state.health.routed_messages += 1;
                    state
                        .queues
                        .entry(queue)
                        .or_default()
                        .push_back(RoutedMessage {
                            correlation_id: correlation_id.clone(),
                            exchange: publish.exchange.to_string(),
                            routing_key: publish.routing_key.to_string(),
                            body: publish.body.clone(),
                        });
                }
                state.health.confirms_acked += 1;
                ConfirmSignal::ack(correlation_id)
            }
        };

        let mode = state.mode;
        match mode {
            ConfirmMode::Immediate => {
                drop(state);
                self.events.emit(TransportEvent::Confirm(signal));
            }
            ConfirmMode::Hold => {
                state.health.confirms_held += 1;
                state.held.push(signal);
            }
            ConfirmMode::Drop => {
                state.health.confirms_dropped += 1;
            }
        }
        Ok(())
    }

    fn close(&self) {
        self.close_channel(CLEAN_SHUTDOWN_CAUSE);
    }

    fn health_snapshot(&self) -> TransportHealthSnapshot {
        self.lock().health.clone()
    }
}
