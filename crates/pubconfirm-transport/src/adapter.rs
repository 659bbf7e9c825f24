use bytes::Bytes;
use pubconfirm_core::{CorrelationId, TransportEvent};
use tokio::sync::mpsc;

/// Receiving half of a transport's confirm stream.
pub type ConfirmEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Coarse per-transport health counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportHealthSnapshot {
    pub outbound_send_ok: u64,
    pub outbound_send_err: u64,
    pub confirms_acked: u64,
    pub confirms_nacked: u64,
    pub confirms_held: u64,
    pub confirms_dropped: u64,
    pub routed_messages: u64,
    pub unroutable_messages: u64,
    pub closed: bool,
    pub last_error: Option<String>,
}

/// One message handed to the transport, tagged for confirm correlation.
#[derive(Debug, Clone, Copy)]
pub struct OutboundPublish<'a> {
    pub exchange: &'a str,
    pub routing_key: &'a str,
    pub body: &'a Bytes,
    pub correlation_id: &'a CorrelationId,
}

/// Publish-side transport contract used by the confirm engine.
///
/// `send` is a synchronous submission only: broker acceptance arrives later as
/// a `TransportEvent::Confirm` on the transport's event stream.
pub trait ConfirmTransport: Send + Sync {
    /// Transport-specific synchronous send error.
    type Error: std::fmt::Display;

    /// Submits a message; fails fast if the channel cannot take it.
    fn send(&self, publish: OutboundPublish<'_>) -> Result<(), Self::Error>;

    /// Releases the underlying channel. Called once during engine shutdown.
    fn close(&self) {}

    /// Best-effort transport health counters.
    fn health_snapshot(&self) -> TransportHealthSnapshot {
        TransportHealthSnapshot::default()
    }
}

/// Sending half of a confirm stream. Never blocks: events are queued until
/// the listener drains them.
#[derive(Debug, Clone)]
pub struct ConfirmEventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl ConfirmEventSink {
    /// Queues an event. Returns `false` once the listener side is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Creates a confirm stream pair for a transport channel.
pub fn confirm_channel() -> (ConfirmEventSink, ConfirmEvents) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ConfirmEventSink { tx }, rx)
}
