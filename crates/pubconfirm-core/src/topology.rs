//! Immutable-after-setup description of exchanges, queues, and bindings.
//!
//! Declarations are idempotent: re-declaring an identical exchange, queue, or
//! binding is a no-op. The confirm engine never consults bindings to compute
//! outcomes; the topology only drives the simulated broker and fixtures.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TopologyError;

/// Routing behavior of an exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Routes to queues whose binding key equals the routing key.
    #[default]
    Direct,
    /// Routes to every bound queue, ignoring the routing key.
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub name: String,
    #[serde(default)]
    pub kind: ExchangeKind,
    #[serde(default = "default_durable")]
    pub durable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Queue {
    pub name: String,
    #[serde(default = "default_durable")]
    pub durable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Binding {
    pub exchange: String,
    pub queue: String,
    #[serde(default)]
    pub routing_key: String,
}

fn default_durable() -> bool {
    true
}

/// Raw declaration lists, validated into a [`Topology`] on deserialize.
#[derive(Debug, Default, Deserialize)]
struct TopologyDecl {
    #[serde(default)]
    exchanges: Vec<Exchange>,
    #[serde(default)]
    queues: Vec<Queue>,
    #[serde(default)]
    bindings: Vec<Binding>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TopologyDecl")]
pub struct Topology {
    exchanges: Vec<Exchange>,
    queues: Vec<Queue>,
    bindings: Vec<Binding>,
}

impl TryFrom<TopologyDecl> for Topology {
    type Error = TopologyError;

    fn try_from(decl: TopologyDecl) -> Result<Self, Self::Error> {
        Topology::from_declarations(decl.exchanges, decl.queues, decl.bindings)
    }
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares exchanges, then queues, then bindings, in order.
    pub fn from_declarations(
        exchanges: impl IntoIterator<Item = Exchange>,
        queues: impl IntoIterator<Item = Queue>,
        bindings: impl IntoIterator<Item = Binding>,
    ) -> Result<Self, TopologyError> {
        let mut topology = Topology::new();
        for exchange in exchanges {
            topology.declare_exchange_with(exchange)?;
        }
        for queue in queues {
            topology.declare_queue_with(queue)?;
        }
        for binding in bindings {
            topology.bind(binding.exchange, binding.queue, binding.routing_key)?;
        }
        Ok(topology)
    }

    /// Declares a durable exchange of `kind`.
    pub fn declare_exchange(
        &mut self,
        name: impl Into<String>,
        kind: ExchangeKind,
    ) -> Result<&mut Self, TopologyError> {
        self.declare_exchange_with(Exchange {
            name: name.into(),
            kind,
            durable: true,
        })?;
        Ok(self)
    }

    fn declare_exchange_with(&mut self, exchange: Exchange) -> Result<(), TopologyError> {
        if exchange.name.trim().is_empty() {
            return Err(TopologyError::EmptyName("exchange"));
        }
        match self.exchange(&exchange.name) {
            Some(existing) if existing.kind != exchange.kind => {
                Err(TopologyError::ExchangeKindMismatch {
                    name: exchange.name,
                    existing: existing.kind,
                    requested: exchange.kind,
                })
            }
            Some(_) => Ok(()),
            None => {
                self.exchanges.push(exchange);
                Ok(())
            }
        }
    }

    /// Declares a durable queue.
    pub fn declare_queue(&mut self, name: impl Into<String>) -> Result<&mut Self, TopologyError> {
        self.declare_queue_with(Queue {
            name: name.into(),
            durable: true,
        })?;
        Ok(self)
    }

    fn declare_queue_with(&mut self, queue: Queue) -> Result<(), TopologyError> {
        if queue.name.trim().is_empty() {
            return Err(TopologyError::EmptyName("queue"));
        }
        if !self.has_queue(&queue.name) {
            self.queues.push(queue);
        }
        Ok(())
    }

    /// Binds `queue` to `exchange` under `routing_key`. Both must be declared.
    pub fn bind(
        &mut self,
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Result<&mut Self, TopologyError> {
        let binding = Binding {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
        };
        if !self.has_exchange(&binding.exchange) {
            return Err(TopologyError::UnknownExchange(binding.exchange));
        }
        if !self.has_queue(&binding.queue) {
            return Err(TopologyError::UnknownQueue(binding.queue));
        }
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
        Ok(self)
    }

    pub fn exchange(&self, name: &str) -> Option<&Exchange> {
        self.exchanges.iter().find(|e| e.name == name)
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.exchange(name).is_some()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.queues.iter().any(|q| q.name == name)
    }

    pub fn exchanges(&self) -> &[Exchange] {
        &self.exchanges
    }

    pub fn queues(&self) -> &[Queue] {
        &self.queues
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Whether any queue is bound to `exchange`.
    pub fn is_bound(&self, exchange: &str) -> bool {
        self.bindings.iter().any(|b| b.exchange == exchange)
    }

    /// Resolves the queues a message would reach.
    ///
    /// Returns `None` when the exchange does not exist. An empty list means
    /// the exchange accepted the message but nothing was routed.
    pub fn route(&self, exchange: &str, routing_key: &str) -> Option<Vec<&str>> {
        let kind = self.exchange(exchange)?.kind;
        let mut queues: Vec<&str> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let matches = match kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Fanout => true,
            };
            if matches && !queues.contains(&binding.queue.as_str()) {
                queues.push(&binding.queue);
            }
        }
        Some(queues)
    }
}
