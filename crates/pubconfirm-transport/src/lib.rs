//! Transport abstractions for publisher confirms.
//!
//! The engine only depends on the `ConfirmTransport` trait and the confirm
//! event channel defined here. `InMemoryBroker` is a simulated broker used by
//! tests, simulations, and the probe app.

pub mod adapter;
pub mod broker;

pub use adapter::{
    confirm_channel, ConfirmEventSink, ConfirmEvents, ConfirmTransport, OutboundPublish,
    TransportHealthSnapshot,
};
pub use broker::{BrokerError, ConfirmMode, InMemoryBroker, ReleaseOrder, RoutedMessage};
