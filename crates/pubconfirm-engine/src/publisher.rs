//! Publish coordinator: the public face of the confirm engine.
//!
//! One `publish` call registers a correlation entry, hands the message to the
//! transport, waits (bounded) for the confirm, and evicts the entry. The
//! listener and reaper run as background tasks owned by the publisher until
//! `shutdown` joins them.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use pubconfirm_core::{ConfirmOutcome, CorrelationId};
use pubconfirm_transport::{ConfirmEvents, ConfirmTransport, OutboundPublish};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::listener::{ChannelStatus, ConfirmListener, ListenerExit};
use crate::reaper::TimeoutReaper;
use crate::registry::{deadline_after, ConfirmWaiter, CorrelationRegistry, RegistryError};
use crate::stats::EngineStatsSnapshot;

/// Reason stored on an entry whose send was rejected synchronously.
pub const SEND_FAILED_REASON: &str = "send failed";
/// Reason reported for publishes attempted after `shutdown` began.
pub const SHUT_DOWN_REASON: &str = "publisher is shut down";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// The transport refused the message synchronously; nothing was waited on.
    #[error("send failed for {id}: {reason}")]
    SendFailed { id: CorrelationId, reason: String },
    /// The correlation id is still in use by another publish.
    #[error("correlation id {0} is already in flight")]
    DuplicateId(CorrelationId),
}

/// One message to publish under confirms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub exchange: String,
    pub routing_key: String,
    pub body: Bytes,
    /// Caller-supplied identity; generated when absent.
    pub correlation_id: Option<CorrelationId>,
    /// Per-publish wait bound; `EngineConfig::default_wait_timeout` when absent.
    pub wait_timeout: Option<Duration>,
}

impl PublishRequest {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            body: body.into(),
            correlation_id: None,
            wait_timeout: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = Some(wait_timeout);
        self
    }
}

/// What `shutdown` found and did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Entries still pending when shutdown began.
    pub pending_at_start: usize,
    /// Whether every pending entry resolved within the drain timeout.
    pub drained: bool,
    /// Residual entries resolved as `TimedOut` by the listener.
    pub expired: usize,
}

struct BackgroundTasks {
    listener: JoinHandle<ListenerExit>,
    reaper: JoinHandle<()>,
}

/// Evicts the entry when the publish finishes or its future is dropped.
struct EvictOnDrop<'a> {
    registry: &'a CorrelationRegistry,
    id: &'a CorrelationId,
}

impl Drop for EvictOnDrop<'_> {
    fn drop(&mut self) {
        self.registry.evict(self.id);
    }
}

/// Publisher-confirm coordinator over one transport channel.
pub struct ConfirmPublisher<T: ConfirmTransport> {
    transport: T,
    registry: Arc<CorrelationRegistry>,
    config: EngineConfig,
    status: watch::Receiver<ChannelStatus>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Option<BackgroundTasks>>,
}

impl<T: ConfirmTransport> ConfirmPublisher<T> {
    /// Spawns the confirm listener for `events` and the timeout reaper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(transport: T, events: ConfirmEvents, config: EngineConfig) -> Self {
        let registry = Arc::new(CorrelationRegistry::new());
        let (listener, status) = ConfirmListener::new(Arc::clone(&registry), events);
        let reaper = TimeoutReaper::new(
            Arc::clone(&registry),
            config.effective_reaper_interval(),
            config.resolved_grace,
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tasks = BackgroundTasks {
            listener: tokio::spawn(listener.run(shutdown_rx.clone())),
            reaper: tokio::spawn(reaper.run(shutdown_rx)),
        };

        Self {
            transport,
            registry,
            config,
            status,
            shutdown_tx,
            tasks: Mutex::new(Some(tasks)),
        }
    }

    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.registry.stats().snapshot()
    }

    pub fn channel_status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    /// Publishes `body` and waits up to `wait_timeout` for its confirm.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<Bytes>,
        wait_timeout: Duration,
    ) -> Result<ConfirmOutcome, PublishError> {
        self.publish_request(
            PublishRequest::new(exchange, routing_key, body).with_wait_timeout(wait_timeout),
        )
        .await
    }

    /// Runs the full register, send, wait, evict cycle for `request`.
    ///
    /// `Nacked` and `TimedOut` are outcomes, not errors. Dropping the returned
    /// future before it completes leaves the entry to the listener or reaper,
    /// which evict it on resolution.
    pub async fn publish_request(
        &self,
        request: PublishRequest,
    ) -> Result<ConfirmOutcome, PublishError> {
        let id = request
            .correlation_id
            .unwrap_or_else(CorrelationId::generate);
        let wait_timeout = request
            .wait_timeout
            .unwrap_or(self.config.default_wait_timeout);

        if let Some(reason) = self.refusal_reason() {
            self.registry.stats().record_send_failed();
            return Err(PublishError::SendFailed { id, reason });
        }

        let (_, mut waiter) = self
            .registry
            .register_waiter(
                id.clone(),
                &request.exchange,
                &request.routing_key,
                deadline_after(wait_timeout),
            )
            .map_err(|err| match err {
                RegistryError::Closed => {
                    self.registry.stats().record_send_failed();
                    PublishError::SendFailed {
                        id: id.clone(),
                        reason: SHUT_DOWN_REASON.to_string(),
                    }
                }
                _ => PublishError::DuplicateId(id.clone()),
            })?;

        let sent = self.transport.send(OutboundPublish {
            exchange: &request.exchange,
            routing_key: &request.routing_key,
            body: &request.body,
            correlation_id: &id,
        });
        if let Err(err) = sent {
            let reason = err.to_string();
            self.registry
                .resolve(&id, ConfirmOutcome::nacked(SEND_FAILED_REASON));
            self.registry.evict(&id);
            self.registry.stats().record_send_failed();
            warn!(correlation_id = %id, exchange = %request.exchange, %reason, "publish send failed");
            return Err(PublishError::SendFailed { id, reason });
        }
        self.registry.stats().record_published();

        let _evict = EvictOnDrop {
            registry: &self.registry,
            id: &id,
        };
        let outcome = match waiter.wait(wait_timeout).await {
            Some(outcome) => outcome,
            None => self.settle_local_timeout(&waiter),
        };

        debug!(
            correlation_id = %id,
            exchange = %request.exchange,
            routing_key = %request.routing_key,
            outcome = %outcome,
            "publish resolved"
        );
        Ok(outcome)
    }

    /// Records `TimedOut` after a local wait timeout, unless a confirm won
    /// the race in the meantime, and returns whatever is stored.
    fn settle_local_timeout(&self, waiter: &ConfirmWaiter) -> ConfirmOutcome {
        if self
            .registry
            .resolve(waiter.correlation_id(), ConfirmOutcome::TimedOut)
        {
            return ConfirmOutcome::TimedOut;
        }
        waiter.outcome().unwrap_or(ConfirmOutcome::TimedOut)
    }

    fn refusal_reason(&self) -> Option<String> {
        if self.registry.is_closed() {
            return Some(SHUT_DOWN_REASON.to_string());
        }
        match &*self.status.borrow() {
            ChannelStatus::Open => None,
            ChannelStatus::Closed { cause } => Some(format!("channel closed: {cause}")),
        }
    }

    /// Stops accepting publishes, drains in-flight confirms up to
    /// `shutdown_drain_timeout`, expires the rest, joins the background tasks,
    /// and closes the transport. Later calls return an empty report.
    pub async fn shutdown(&self) -> ShutdownReport {
        // No entry can register past this point, so the count below is complete.
        self.registry.close();
        let tasks = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(tasks) = tasks else {
            return ShutdownReport::default();
        };

        let pending_at_start = self.registry.pending_count();
        let drained = self
            .registry
            .wait_settled(self.config.shutdown_drain_timeout)
            .await;

        self.shutdown_tx.send_replace(true);
        let expired = match tasks.listener.await {
            Ok(ListenerExit::Shutdown { expired }) => expired,
            Ok(ListenerExit::ChannelClosed { .. }) => 0,
            Err(err) => {
                warn!(%err, "confirm listener task failed");
                self.registry.fail_pending(ConfirmOutcome::TimedOut)
            }
        };
        if let Err(err) = tasks.reaper.await {
            warn!(%err, "timeout reaper task failed");
        }
        self.transport.close();

        info!(pending_at_start, drained, expired, "confirm publisher shut down");
        ShutdownReport {
            pending_at_start,
            drained,
            expired,
        }
    }
}

impl<T: ConfirmTransport> Drop for ConfirmPublisher<T> {
    fn drop(&mut self) {
        let tasks = self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tasks) = tasks {
            self.shutdown_tx.send_replace(true);
            tasks.listener.abort();
            tasks.reaper.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfirmPublisher, PublishError, PublishRequest, ShutdownReport};
    use crate::config::EngineConfig;
    use crate::listener::ChannelStatus;
    use pubconfirm_core::{
        ConfirmOutcome, ConfirmSignal, CorrelationId, ExchangeKind, Topology, TransportEvent,
    };
    use pubconfirm_transport::{
        confirm_channel, ConfirmEventSink, ConfirmMode, ConfirmTransport, InMemoryBroker,
        OutboundPublish, ReleaseOrder,
    };
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::time::Duration;

    /// Acks every publish from inside `send`, then keeps `send` blocked.
    struct SlowSendTransport {
        events: ConfirmEventSink,
        block_for: Duration,
    }

    impl ConfirmTransport for SlowSendTransport {
        type Error = Infallible;

        fn send(&self, publish: OutboundPublish<'_>) -> Result<(), Self::Error> {
            self.events.emit(TransportEvent::Confirm(ConfirmSignal::ack(
                publish.correlation_id.clone(),
            )));
            std::thread::sleep(self.block_for);
            Ok(())
        }
    }

    fn topology() -> Topology {
        let mut topology = Topology::new();
        topology
            .declare_exchange("bound", ExchangeKind::Direct)
            .and_then(|t| t.declare_exchange("unbound", ExchangeKind::Direct))
            .and_then(|t| t.declare_queue("q"))
            .and_then(|t| t.bind("bound", "q", "key"))
            .expect("topology should declare");
        topology
    }

    fn start() -> (ConfirmPublisher<InMemoryBroker>, InMemoryBroker) {
        let (broker, events) = InMemoryBroker::new(topology());
        let publisher = ConfirmPublisher::start(broker.clone(), events, EngineConfig::default());
        (publisher, broker)
    }

    const WAIT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn existing_exchange_acks_and_entry_is_evicted() {
        let (publisher, broker) = start();
        let outcome = publisher
            .publish("bound", "key", "hello", WAIT)
            .await
            .expect("publish");
        assert_eq!(outcome, ConfirmOutcome::Acked);
        assert_eq!(broker.queue_depth("q"), 1);
        assert!(publisher.registry().is_empty());

        let stats = publisher.stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.evicted, 1);
    }

    #[tokio::test]
    async fn missing_exchange_nacks_with_broker_cause() {
        let (publisher, _broker) = start();
        let outcome = publisher
            .publish("missing", "key", "hello", WAIT)
            .await
            .expect("publish");
        let reason = outcome.nack_reason().expect("nacked");
        assert!(reason.contains("no exchange 'missing'"));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_broker_times_out_and_late_ack_is_ignored() {
        let (publisher, broker) = start();
        broker.set_confirm_mode(ConfirmMode::Hold);

        let outcome = publisher
            .publish_request(
                PublishRequest::new("bound", "key", "hello")
                    .with_correlation_id("late-1")
                    .with_wait_timeout(Duration::from_millis(100)),
            )
            .await
            .expect("publish");
        assert_eq!(outcome, ConfirmOutcome::TimedOut);
        assert!(publisher.registry().is_empty());

        assert_eq!(broker.release_held(ReleaseOrder::Fifo), 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let stats = publisher.stats();
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.acked, 0);
        assert_eq!(stats.unknown_signals, 1);
    }

    #[tokio::test]
    async fn synchronous_send_failure_is_reported_without_waiting() {
        let (publisher, broker) = start();
        broker.reject_sends(true);

        let err = publisher
            .publish_request(
                PublishRequest::new("bound", "key", "hello").with_correlation_id("fail-1"),
            )
            .await
            .expect_err("send should fail");
        assert!(matches!(err, PublishError::SendFailed { ref id, .. } if id.as_str() == "fail-1"));
        assert!(publisher.registry().is_empty());

        let stats = publisher.stats();
        assert_eq!(stats.send_failed, 1);
        assert_eq!(stats.nacked, 1);
        assert_eq!(stats.published, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_correlation_id_cannot_be_reused() {
        let (publisher, broker) = start();
        broker.set_confirm_mode(ConfirmMode::Hold);

        let first = publisher.publish_request(
            PublishRequest::new("bound", "key", "one")
                .with_correlation_id("dup")
                .with_wait_timeout(Duration::from_millis(200)),
        );
        let second = async {
            tokio::task::yield_now().await;
            publisher
                .publish_request(
                    PublishRequest::new("bound", "key", "two").with_correlation_id("dup"),
                )
                .await
        };
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first, Ok(ConfirmOutcome::TimedOut));
        assert_eq!(second, Err(PublishError::DuplicateId(CorrelationId::new("dup"))));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_publish_does_not_leak_its_entry() {
        let (publisher, broker) = start();
        broker.set_confirm_mode(ConfirmMode::Hold);

        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            publisher.publish_request(
                PublishRequest::new("bound", "key", "hello")
                    .with_correlation_id("cancel-1")
                    .with_wait_timeout(Duration::from_secs(5)),
            ),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(publisher.registry().len(), 1);

        broker.release_held(ReleaseOrder::Fifo);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(publisher.registry().is_empty());
        assert_eq!(publisher.stats().acked, 1);
    }

    #[tokio::test]
    async fn channel_close_fails_in_flight_and_later_publishes() {
        let (publisher, broker) = start();
        broker.set_confirm_mode(ConfirmMode::Hold);

        let in_flight = publisher.publish("bound", "key", "hello", WAIT);
        let closer = async {
            tokio::task::yield_now().await;
            broker.close_channel("connection reset by peer");
        };
        let (outcome, ()) = tokio::join!(in_flight, closer);
        assert_eq!(
            outcome,
            Ok(ConfirmOutcome::nacked("channel closed: connection reset by peer"))
        );
        assert_eq!(
            publisher.channel_status(),
            ChannelStatus::Closed {
                cause: "connection reset by peer".into()
            }
        );

        let err = publisher
            .publish("bound", "key", "again", WAIT)
            .await
            .expect_err("closed channel should refuse");
        assert!(matches!(err, PublishError::SendFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_expires_unanswered_publishes_and_refuses_new_ones() {
        let (broker, events) = InMemoryBroker::new(topology());
        let publisher = ConfirmPublisher::start(
            broker.clone(),
            events,
            EngineConfig {
                shutdown_drain_timeout: Duration::from_millis(50),
                ..EngineConfig::default()
            },
        );
        broker.set_confirm_mode(ConfirmMode::Drop);

        let (outcome, report) = tokio::join!(
            publisher.publish("bound", "key", "hello", Duration::from_secs(30)),
            async {
                tokio::task::yield_now().await;
                publisher.shutdown().await
            }
        );

        assert_eq!(outcome, Ok(ConfirmOutcome::TimedOut));
        assert_eq!(
            report,
            ShutdownReport {
                pending_at_start: 1,
                drained: false,
                expired: 1
            }
        );
        assert!(broker.is_closed());
        assert_eq!(publisher.shutdown().await, ShutdownReport::default());
        assert!(matches!(
            publisher.publish("bound", "key", "late", WAIT).await,
            Err(PublishError::SendFailed { .. })
        ));
    }

    #[tokio::test]
    async fn shutdown_drains_held_confirms_released_in_time() {
        let (publisher, broker) = start();
        broker.set_confirm_mode(ConfirmMode::Hold);

        let (outcome, report) = tokio::join!(
            publisher.publish("unbound", "key", "hello", WAIT),
            async {
                tokio::task::yield_now().await;
                let releaser = broker.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    releaser.release_held(ReleaseOrder::Fifo);
                });
                publisher.shutdown().await
            }
        );

        assert_eq!(outcome, Ok(ConfirmOutcome::Acked));
        assert!(report.drained);
        assert_eq!(report.expired, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ack_during_slow_send_survives_reaper_purge() {
        let (events, confirms) = confirm_channel();
        let publisher = ConfirmPublisher::start(
            SlowSendTransport {
                events,
                block_for: Duration::from_millis(150),
            },
            confirms,
            EngineConfig {
                reaper_interval: Duration::from_millis(5),
                resolved_grace: Duration::from_millis(20),
                ..EngineConfig::default()
            },
        );

        let outcome = publisher
            .publish_request(
                PublishRequest::new("bound", "key", "hello").with_correlation_id("slow-1"),
            )
            .await;
        assert_eq!(outcome, Ok(ConfirmOutcome::Acked));
        assert!(publisher.registry().is_empty());

        let stats = publisher.stats();
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.timed_out, 0);
        publisher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_wait_timeout_does_not_overflow() {
        let (publisher, broker) = start();
        broker.set_confirm_mode(ConfirmMode::Hold);

        let releaser = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            releaser.release_held(ReleaseOrder::Fifo);
        });
        let outcome = publisher
            .publish("bound", "key", "hello", Duration::MAX)
            .await;
        assert_eq!(outcome, Ok(ConfirmOutcome::Acked));
        assert!(publisher.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_shutdown_drain_does_not_overflow() {
        let (broker, events) = InMemoryBroker::new(topology());
        let publisher = ConfirmPublisher::start(
            broker,
            events,
            EngineConfig {
                shutdown_drain_timeout: Duration::MAX,
                resolved_grace: Duration::MAX,
                ..EngineConfig::default()
            },
        );
        assert_eq!(
            publisher.publish("bound", "key", "hello", WAIT).await,
            Ok(ConfirmOutcome::Acked)
        );
        tokio::time::sleep(Duration::from_millis(200)).await;

        let report = publisher.shutdown().await;
        assert!(report.drained);
        assert_eq!(report.pending_at_start, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn publish_racing_shutdown_is_always_accounted_for() {
        for round in 0..32 {
            let (broker, events) = InMemoryBroker::new(topology());
            broker.set_confirm_mode(ConfirmMode::Drop);
            let publisher = Arc::new(ConfirmPublisher::start(
                broker.clone(),
                events,
                EngineConfig {
                    shutdown_drain_timeout: Duration::from_millis(5),
                    ..EngineConfig::default()
                },
            ));

            let racer = Arc::clone(&publisher);
            let publish = tokio::spawn(async move {
                racer
                    .publish("bound", "key", "hello", Duration::from_secs(30))
                    .await
            });
            let report = publisher.shutdown().await;

            let outcome = tokio::time::timeout(Duration::from_secs(5), publish)
                .await
                .unwrap_or_else(|_| panic!("round {round}: publish outlived shutdown"))
                .expect("publish task");
            match outcome {
                Ok(outcome) => assert_eq!(outcome, ConfirmOutcome::TimedOut, "round {round}"),
                Err(PublishError::SendFailed { .. }) => {}
                Err(other) => panic!("round {round}: unexpected error {other:?}"),
            }
            assert!(report.pending_at_start <= 1, "round {round}");
            assert_eq!(report.expired, report.pending_at_start, "round {round}");
            assert!(publisher.registry().is_empty(), "round {round}");
        }
    }

    #[tokio::test]
    async fn publish_after_shutdown_reports_shut_down_reason() {
        let (publisher, _broker) = start();
        publisher.shutdown().await;

        let err = publisher
            .publish_request(
                PublishRequest::new("bound", "key", "late").with_correlation_id("late-2"),
            )
            .await
            .expect_err("shut down publisher should refuse");
        assert_eq!(
            err,
            PublishError::SendFailed {
                id: CorrelationId::new("late-2"),
                reason: super::SHUT_DOWN_REASON.to_string(),
            }
        );
        assert_eq!(publisher.stats().published, 0);
    }
}
