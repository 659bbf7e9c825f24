//! Canned fixtures and scenario runners for exercising the confirm engine
//! against the in-memory broker.

pub mod scenarios;

pub use scenarios::{
    confirm_fixture, default_probe_cases, practical_burst, BurstReport, BurstScenario,
    ConfirmHarness, ExpectedOutcome, ProbeCase, ProbeResult, EXCHANGE_NAME,
    EXCHANGE_WITHOUT_QUEUE, NOT_EXISTED_EXCHANGE, PRACTICAL_BURST, PROBE_BODY, QUEUE_NAME,
    ROUTING_KEY, UNMATCHED_ROUTING_KEY,
};
