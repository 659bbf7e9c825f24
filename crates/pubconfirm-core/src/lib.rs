//! Core publisher-confirm primitives shared across crates.
//!
//! Includes correlation identities, confirm outcomes and signals, the broker
//! topology descriptor, and base errors.

pub mod error;
pub mod topology;
pub mod types;

pub use error::TopologyError;
pub use topology::{Binding, Exchange, ExchangeKind, Queue, Topology};
pub use types::{
    ConfirmOutcome, ConfirmSignal, CorrelationId, TransportEvent, NACK_WITHOUT_CAUSE,
};
