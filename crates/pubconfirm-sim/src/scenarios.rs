use std::sync::Arc;
use std::time::Duration;

use pubconfirm_core::{ConfirmOutcome, CorrelationId, ExchangeKind, Topology, TopologyError};
use pubconfirm_engine::{
    ConfirmPublisher, EngineConfig, PublishError, PublishRequest, ShutdownReport,
};
use pubconfirm_transport::{ConfirmMode, InMemoryBroker, ReleaseOrder};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Direct exchange bound to [`QUEUE_NAME`].
pub const EXCHANGE_NAME: &str = "exchange_name";
/// Direct exchange declared without any binding.
pub const EXCHANGE_WITHOUT_QUEUE: &str = "EXCHANGE_WITHOUT_QUEUE";
pub const QUEUE_NAME: &str = "confirm_queue";
pub const ROUTING_KEY: &str = "key_confirm";
/// Routing key that matches no binding on [`EXCHANGE_NAME`].
pub const UNMATCHED_ROUTING_KEY: &str = "key_confirm_no_queue_received";
/// Exchange that is never declared.
pub const NOT_EXISTED_EXCHANGE: &str = "not_existed_exchange";
pub const PROBE_BODY: &str = "boot mq hello~~~";

/// The canned confirm topology.
pub fn confirm_fixture() -> Result<Topology, TopologyError> {
    let mut topology = Topology::new();
    topology
        .declare_exchange(EXCHANGE_NAME, ExchangeKind::Direct)?
        .declare_exchange(EXCHANGE_WITHOUT_QUEUE, ExchangeKind::Direct)?
        .declare_queue(QUEUE_NAME)?
        .bind(EXCHANGE_NAME, QUEUE_NAME, ROUTING_KEY)?;
    Ok(topology)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedOutcome {
    Acked,
    Nacked,
    TimedOut,
}

impl ExpectedOutcome {
    pub fn matches(self, outcome: &ConfirmOutcome) -> bool {
        match self {
            Self::Acked => outcome.is_acked(),
            Self::Nacked => outcome.is_nacked(),
            Self::TimedOut => outcome.is_timed_out(),
        }
    }
}

/// One probe publish, as declared in `[[probes]]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeCase {
    pub name: String,
    pub exchange: String,
    #[serde(default)]
    pub routing_key: String,
    #[serde(default = "default_body")]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<ExpectedOutcome>,
}

fn default_body() -> String {
    PROBE_BODY.to_string()
}

impl ProbeCase {
    pub fn new(
        name: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            body: default_body(),
            expect: None,
        }
    }

    pub fn expecting(mut self, expect: ExpectedOutcome) -> Self {
        self.expect = Some(expect);
        self
    }
}

/// The four confirm cases run against [`confirm_fixture`].
///
/// Only the missing exchange nacks: an exchange that exists acks whether or
/// not the message reached a queue.
pub fn default_probe_cases() -> Vec<ProbeCase> {
    vec![
        ProbeCase::new("unmatched_routing_key", EXCHANGE_NAME, UNMATCHED_ROUTING_KEY)
            .expecting(ExpectedOutcome::Acked),
        ProbeCase::new("bound_queue", EXCHANGE_NAME, ROUTING_KEY)
            .expecting(ExpectedOutcome::Acked),
        ProbeCase::new("exchange_without_queue", EXCHANGE_WITHOUT_QUEUE, ROUTING_KEY)
            .expecting(ExpectedOutcome::Acked),
        ProbeCase::new("missing_exchange", NOT_EXISTED_EXCHANGE, ROUTING_KEY)
            .expecting(ExpectedOutcome::Nacked),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub name: String,
    pub exchange: String,
    pub routing_key: String,
    pub correlation_id: CorrelationId,
    #[serde(flatten)]
    pub outcome: ConfirmOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<ExpectedOutcome>,
}

impl ProbeResult {
    /// `true` when no expectation was declared or the outcome meets it.
    pub fn passed(&self) -> bool {
        self.expected
            .map_or(true, |expected| expected.matches(&self.outcome))
    }
}

/// Many concurrent publishes whose confirms are held and released together.
#[derive(Debug, Clone, Copy)]
pub struct BurstScenario {
    pub publishes: usize,
    /// Share of publishes aimed at [`NOT_EXISTED_EXCHANGE`].
    pub missing_exchange_percent: u8,
    pub release_order: ReleaseOrder,
    pub wait_timeout: Duration,
    pub seed: u64,
}

pub const PRACTICAL_BURST: BurstScenario = BurstScenario {
    publishes: 64,
    missing_exchange_percent: 10,
    release_order: ReleaseOrder::Shuffled,
    wait_timeout: Duration::from_secs(2),
    seed: 7,
};

pub fn practical_burst() -> BurstScenario {
    PRACTICAL_BURST
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BurstReport {
    pub released: usize,
    pub acked: usize,
    pub nacked: usize,
    pub timed_out: usize,
    /// Publishes that returned an error or whose task failed.
    pub failed: usize,
    /// Outcomes that differ from what their exchange should produce.
    pub mismatched: usize,
}

impl BurstReport {
    fn record(&mut self, outcome: &ConfirmOutcome) {
        match outcome {
            ConfirmOutcome::Acked => self.acked += 1,
            ConfirmOutcome::Nacked { .. } => self.nacked += 1,
            ConfirmOutcome::TimedOut => self.timed_out += 1,
        }
    }

    pub fn resolved(&self) -> usize {
        self.acked + self.nacked + self.timed_out
    }
}

/// A publisher wired to an [`InMemoryBroker`].
pub struct ConfirmHarness {
    pub publisher: Arc<ConfirmPublisher<InMemoryBroker>>,
    pub broker: InMemoryBroker,
}

impl ConfirmHarness {
    /// Must be called from within a tokio runtime.
    pub fn start(topology: Topology, config: EngineConfig) -> Self {
        let (broker, events) = InMemoryBroker::new(topology);
        let publisher = ConfirmPublisher::start(broker.clone(), events, config);
        Self {
            publisher: Arc::new(publisher),
            broker,
        }
    }

    /// Starts a harness over [`confirm_fixture`].
    pub fn with_fixture(config: EngineConfig) -> Result<Self, TopologyError> {
        Ok(Self::start(confirm_fixture()?, config))
    }

    /// Publishes each case in order and collects its outcome.
    pub async fn run_probes(
        &self,
        cases: &[ProbeCase],
        wait_timeout: Duration,
    ) -> Result<Vec<ProbeResult>, PublishError> {
        let mut results = Vec::with_capacity(cases.len());
        for case in cases {
            let id = CorrelationId::generate();
            let request = PublishRequest::new(
                case.exchange.as_str(),
                case.routing_key.as_str(),
                case.body.clone(),
            )
            .with_correlation_id(id.clone())
            .with_wait_timeout(wait_timeout);
            let outcome = self.publisher.publish_request(request).await?;
            debug!(probe = %case.name, correlation_id = %id, %outcome, "probe finished");
            results.push(ProbeResult {
                name: case.name.clone(),
                exchange: case.exchange.clone(),
                routing_key: case.routing_key.clone(),
                correlation_id: id,
                outcome,
                expected: case.expect,
            });
        }
        Ok(results)
    }

    /// Fires `scenario.publishes` concurrent publishes, holds every confirm
    /// until all are in flight, then releases them in `release_order`.
    pub async fn run_burst(&self, scenario: BurstScenario) -> BurstReport {
        let mut rng = StdRng::seed_from_u64(scenario.seed);
        self.broker.set_confirm_mode(ConfirmMode::Hold);

        let mut handles = Vec::with_capacity(scenario.publishes);
        for n in 0..scenario.publishes {
            let missing = rng.gen_range(0..100_u8) < scenario.missing_exchange_percent;
            let (exchange, expected) = if missing {
                (NOT_EXISTED_EXCHANGE, ExpectedOutcome::Nacked)
            } else {
                (EXCHANGE_NAME, ExpectedOutcome::Acked)
            };
            let request = PublishRequest::new(exchange, ROUTING_KEY, format!("burst message {n}"))
                .with_correlation_id(format!("burst-{}-{n}", scenario.seed))
                .with_wait_timeout(scenario.wait_timeout);
            let publisher = Arc::clone(&self.publisher);
            handles.push((
                expected,
                tokio::spawn(async move { publisher.publish_request(request).await }),
            ));
        }

        let all_in_flight = self
            .publisher
            .registry()
            .wait_pending(scenario.publishes, scenario.wait_timeout)
            .await;
        // Sends that race the release are confirmed directly.
        self.broker.set_confirm_mode(ConfirmMode::Immediate);
        let released = self.broker.release_held(scenario.release_order);

        let mut report = BurstReport {
            released,
            ..BurstReport::default()
        };
        for (expected, handle) in handles {
            match handle.await {
                Ok(Ok(outcome)) => {
                    if !expected.matches(&outcome) {
                        report.mismatched += 1;
                    }
                    report.record(&outcome);
                }
                Ok(Err(_)) | Err(_) => report.failed += 1,
            }
        }
        debug!(all_in_flight, ?report, "burst finished");
        report
    }

    pub async fn shutdown(&self) -> ShutdownReport {
        self.publisher.shutdown().await
    }
}
