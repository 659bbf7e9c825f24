use thiserror::Error;

use crate::topology::ExchangeKind;

/// Errors raised while declaring a broker topology.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    /// Exchange and queue names must be non-empty.
    #[error("empty {0} name")]
    EmptyName(&'static str),
    #[error("unknown exchange '{0}'")]
    UnknownExchange(String),
    #[error("unknown queue '{0}'")]
    UnknownQueue(String),
    /// Re-declaring an exchange with a different kind.
    #[error("exchange '{name}' already declared as {existing:?}, requested {requested:?}")]
    ExchangeKindMismatch {
        name: String,
        existing: ExchangeKind,
        requested: ExchangeKind,
    },
}
