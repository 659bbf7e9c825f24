use std::time::Duration;

use pubconfirm_core::{ConfirmOutcome, TransportEvent};
use pubconfirm_engine::{ChannelStatus, EngineConfig, PublishError};
use pubconfirm_sim::{ConfirmHarness, EXCHANGE_NAME, PROBE_BODY, ROUTING_KEY};
use pubconfirm_transport::{ConfirmMode, ConfirmTransport, ReleaseOrder};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test(start_paused = true)]
async fn e2e_channel_close_nacks_in_flight_publishes() {
    let harness =
        ConfirmHarness::with_fixture(EngineConfig::default()).expect("fixture should declare");
    harness.broker.set_confirm_mode(ConfirmMode::Hold);

    let (first, second, ()) = tokio::join!(
        harness
            .publisher
            .publish(EXCHANGE_NAME, ROUTING_KEY, PROBE_BODY, WAIT),
        harness
            .publisher
            .publish(EXCHANGE_NAME, ROUTING_KEY, PROBE_BODY, WAIT),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            harness.broker.emit_raw(TransportEvent::Closed {
                cause: "heartbeat timeout".into(),
            });
        }
    );

    let expected = ConfirmOutcome::nacked("channel closed: heartbeat timeout");
    assert_eq!(first, Ok(expected.clone()));
    assert_eq!(second, Ok(expected));
    assert!(!harness.publisher.channel_status().is_open());

    let refused = harness
        .publisher
        .publish(EXCHANGE_NAME, ROUTING_KEY, PROBE_BODY, WAIT)
        .await;
    assert!(matches!(refused, Err(PublishError::SendFailed { .. })));
}

#[tokio::test]
async fn e2e_rejected_send_fails_synchronously() {
    let harness =
        ConfirmHarness::with_fixture(EngineConfig::default()).expect("fixture should declare");
    harness.broker.reject_sends(true);

    let err = harness
        .publisher
        .publish(EXCHANGE_NAME, ROUTING_KEY, PROBE_BODY, WAIT)
        .await
        .expect_err("rejected send should fail");
    match err {
        PublishError::SendFailed { reason, .. } => assert!(reason.contains("rejected")),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(harness.broker.health_snapshot().outbound_send_err, 1);
    assert!(harness.publisher.registry().is_empty());

    harness.broker.reject_sends(false);
    let outcome = harness
        .publisher
        .publish(EXCHANGE_NAME, ROUTING_KEY, PROBE_BODY, WAIT)
        .await
        .expect("publish should be sent");
    assert_eq!(outcome, ConfirmOutcome::Acked);
}

#[tokio::test(start_paused = true)]
async fn e2e_shutdown_drains_then_closes_transport() {
    let harness = ConfirmHarness::with_fixture(EngineConfig {
        shutdown_drain_timeout: Duration::from_secs(1),
        ..EngineConfig::default()
    })
    .expect("fixture should declare");
    harness.broker.set_confirm_mode(ConfirmMode::Hold);

    let (outcome, report) = tokio::join!(
        harness
            .publisher
            .publish(EXCHANGE_NAME, ROUTING_KEY, PROBE_BODY, WAIT),
        async {
            tokio::task::yield_now().await;
            let broker = harness.broker.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                broker.release_held(ReleaseOrder::Fifo);
            });
            harness.shutdown().await
        }
    );

    assert_eq!(outcome, Ok(ConfirmOutcome::Acked));
    assert_eq!(report.pending_at_start, 1);
    assert!(report.drained);
    assert_eq!(report.expired, 0);
    assert!(harness.broker.is_closed());
    assert_eq!(
        harness.publisher.channel_status(),
        ChannelStatus::Closed {
            cause: "publisher shutdown".into()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn e2e_shutdown_expires_what_never_drains() {
    let harness = ConfirmHarness::with_fixture(EngineConfig {
        shutdown_drain_timeout: Duration::from_millis(200),
        ..EngineConfig::default()
    })
    .expect("fixture should declare");
    harness.broker.set_confirm_mode(ConfirmMode::Drop);

    let (first, second, report) = tokio::join!(
        harness
            .publisher
            .publish(EXCHANGE_NAME, ROUTING_KEY, PROBE_BODY, WAIT),
        harness
            .publisher
            .publish(EXCHANGE_NAME, ROUTING_KEY, PROBE_BODY, WAIT),
        async {
            tokio::task::yield_now().await;
            harness.shutdown().await
        }
    );

    assert_eq!(first, Ok(ConfirmOutcome::TimedOut));
    assert_eq!(second, Ok(ConfirmOutcome::TimedOut));
    assert!(!report.drained);
    assert_eq!(report.expired, 2);
    assert!(harness.publisher.registry().is_empty());
    assert!(matches!(
        harness
            .publisher
            .publish(EXCHANGE_NAME, ROUTING_KEY, PROBE_BODY, WAIT)
            .await,
        Err(PublishError::SendFailed { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn e2e_many_cycles_do_not_accumulate_entries() {
    let harness = ConfirmHarness::with_fixture(EngineConfig {
        resolved_grace: Duration::from_millis(20),
        ..EngineConfig::default()
    })
    .expect("fixture should declare");

    for round in 0..10_u32 {
        for _ in 0..50 {
            harness
                .publisher
                .publish(EXCHANGE_NAME, ROUTING_KEY, PROBE_BODY, WAIT)
                .await
                .expect("publish should be sent");
        }
        harness.broker.set_confirm_mode(ConfirmMode::Hold);
        let cancelled = tokio::time::timeout(
            Duration::from_millis(1),
            harness
                .publisher
                .publish(EXCHANGE_NAME, ROUTING_KEY, PROBE_BODY, WAIT),
        )
        .await;
        assert!(cancelled.is_err(), "round {round}");
        harness.broker.release_held(ReleaseOrder::Fifo);
        harness.broker.set_confirm_mode(ConfirmMode::Immediate);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(harness.publisher.registry().is_empty(), "round {round}");
    }

    assert_eq!(harness.publisher.stats().published, 510);
    assert_eq!(harness.broker.take_queue(pubconfirm_sim::QUEUE_NAME).len(), 510);
}
