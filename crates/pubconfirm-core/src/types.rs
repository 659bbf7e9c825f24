use std::fmt;

use serde::{Deserialize, Serialize};

/// Reason recorded when the broker nacks without giving a cause.
pub const NACK_WITHOUT_CAUSE: &str = "nack without cause";

/// Opaque token linking an asynchronous confirm back to its publish.
///
/// Generated ids are random UUIDv4 strings; callers may supply their own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a fresh, never-reused identity.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Terminal result of one publish under publisher confirms.
///
/// `Acked` means the exchange accepted the message; it says nothing about
/// whether any queue received it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConfirmOutcome {
    Acked,
    Nacked { reason: String },
    /// No signal arrived in time. The true outcome is unknown.
    TimedOut,
}

impl ConfirmOutcome {
    pub fn nacked(reason: impl Into<String>) -> Self {
        Self::Nacked {
            reason: reason.into(),
        }
    }

    pub fn is_acked(&self) -> bool {
        matches!(self, Self::Acked)
    }

    pub fn is_nacked(&self) -> bool {
        matches!(self, Self::Nacked { .. })
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut)
    }

    /// Broker cause for a nack, passed through verbatim.
    pub fn nack_reason(&self) -> Option<&str> {
        match self {
            Self::Nacked { reason } => Some(reason),
            _ => None,
        }
    }

    /// Stable short label used in logs and reports.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Acked => "acked",
            Self::Nacked { .. } => "nacked",
            Self::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for ConfirmOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nacked { reason } => write!(f, "nacked: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}

/// One ack/nack emitted by the transport for a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmSignal {
    pub correlation_id: CorrelationId,
    pub ack: bool,
    pub cause: Option<String>,
}

impl ConfirmSignal {
    pub fn ack(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            ack: true,
            cause: None,
        }
    }

    pub fn nack(correlation_id: CorrelationId, cause: impl Into<String>) -> Self {
        Self {
            correlation_id,
            ack: false,
            cause: Some(cause.into()),
        }
    }

    /// Maps the wire-level signal onto the outcome it resolves to.
    pub fn to_outcome(&self) -> ConfirmOutcome {
        if self.ack {
            ConfirmOutcome::Acked
        } else {
            ConfirmOutcome::nacked(
                self.cause
                    .clone()
                    .unwrap_or_else(|| NACK_WITHOUT_CAUSE.to_string()),
            )
        }
    }
}

/// Events a transport channel emits towards the confirm listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Confirm(ConfirmSignal),
    /// The channel or connection went away; no further confirms will arrive.
    Closed { cause: String },
}
