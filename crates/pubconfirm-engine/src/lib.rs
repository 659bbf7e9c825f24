//! Publisher-confirm correlation engine.
//!
//! This crate issues publishes through a `ConfirmTransport`, tracks each one
//! in a shared correlation registry, resolves them from the transport's
//! asynchronous confirm stream, and expires the ones nobody answers.

pub mod config;
pub mod listener;
pub mod publisher;
pub mod reaper;
pub mod registry;
pub mod stats;

pub use config::EngineConfig;
pub use listener::{ChannelStatus, ConfirmListener, ListenerExit};
pub use publisher::{
    ConfirmPublisher, PublishError, PublishRequest, ShutdownReport, SEND_FAILED_REASON,
    SHUT_DOWN_REASON,
};
pub use reaper::{SweepReport, TimeoutReaper};
pub use registry::{
    deadline_after, ConfirmWaiter, CorrelationRegistry, PendingPublish, RegistryError, Resolution,
};
pub use stats::{EngineStats, EngineStatsSnapshot};
