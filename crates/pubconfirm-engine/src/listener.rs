//! Confirm listener: drains one transport channel's confirm stream.
//!
//! Confirms may arrive in any order relative to their publishes. Signals for
//! ids the registry no longer tracks (already expired, evicted, or foreign)
//! are counted and otherwise ignored.

use std::sync::Arc;

use pubconfirm_core::{ConfirmOutcome, ConfirmSignal, TransportEvent};
use pubconfirm_transport::ConfirmEvents;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::registry::{CorrelationRegistry, Resolution};

/// Cause recorded when the transport drops its event stream without a close.
pub const EVENT_STREAM_ENDED: &str = "confirm event stream ended";
/// Cause recorded when the publisher itself shuts the listener down.
pub const PUBLISHER_SHUTDOWN: &str = "publisher shutdown";

/// Lifecycle of the channel as observed by the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Open,
    Closed { cause: String },
}

impl ChannelStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Why the listener task stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerExit {
    /// The transport closed; residual entries were nacked.
    ChannelClosed { cause: String, failed: usize },
    /// Shutdown was requested; residual entries were expired.
    Shutdown { expired: usize },
}

pub struct ConfirmListener {
    registry: Arc<CorrelationRegistry>,
    events: ConfirmEvents,
    status: watch::Sender<ChannelStatus>,
}

impl ConfirmListener {
    /// Creates a listener and the status handle publishers consult before
    /// sending.
    pub fn new(
        registry: Arc<CorrelationRegistry>,
        events: ConfirmEvents,
    ) -> (Self, watch::Receiver<ChannelStatus>) {
        let (status, status_rx) = watch::channel(ChannelStatus::Open);
        (
            Self {
                registry,
                events,
                status,
            },
            status_rx,
        )
    }

    /// Runs until the transport closes or `shutdown` flips to `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> ListenerExit {
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(TransportEvent::Confirm(signal)) => {
                        self.handle_signal(signal);
                    }
                    Some(TransportEvent::Closed { cause }) => return self.on_closed(cause),
                    None => return self.on_closed(EVENT_STREAM_ENDED.to_string()),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return self.on_shutdown();
                    }
                }
            }
        }
    }

    /// Resolves the registry entry a single confirm refers to.
    pub fn handle_signal(&self, signal: ConfirmSignal) -> Resolution {
        let outcome = signal.to_outcome();
        let resolution = self.registry.try_resolve(&signal.correlation_id, outcome);
        match resolution {
            Resolution::Resolved => {
                debug!(correlation_id = %signal.correlation_id, ack = signal.ack, "confirm resolved");
            }
            Resolution::AlreadyResolved => {}
            Resolution::Unknown => {
                self.registry.stats().record_unknown_signal();
                debug!(
                    correlation_id = %signal.correlation_id,
                    ack = signal.ack,
                    "confirm for untracked correlation id ignored"
                );
            }
        }
        resolution
    }

    fn on_closed(&self, cause: String) -> ListenerExit {
        self.status.send_replace(ChannelStatus::Closed {
            cause: cause.clone(),
        });
        let failed = self
            .registry
            .fail_pending(ConfirmOutcome::nacked(format!("channel closed: {cause}")));
        warn!(%cause, failed, "transport channel closed");
        ListenerExit::ChannelClosed { cause, failed }
    }

    fn on_shutdown(&mut self) -> ListenerExit {
        while let Ok(event) = self.events.try_recv() {
            match event {
                TransportEvent::Confirm(signal) => {
                    self.handle_signal(signal);
                }
                TransportEvent::Closed { cause } => return self.on_closed(cause),
            }
        }
        self.status.send_replace(ChannelStatus::Closed {
            cause: PUBLISHER_SHUTDOWN.to_string(),
        });
        let expired = self.registry.fail_pending(ConfirmOutcome::TimedOut);
        info!(expired, "confirm listener stopped");
        ListenerExit::Shutdown { expired }
    }
}
