#![no_main]

use std::time::Duration;

use libfuzzer_sys::fuzz_target;
use pubconfirm_core::{ConfirmOutcome, CorrelationId};
use pubconfirm_engine::{CorrelationRegistry, Resolution};
use tokio::time::Instant;

fuzz_target!(|data: &[u8]| {
    let registry = CorrelationRegistry::new();
    let base = Instant::now();

    for (step, pair) in data.chunks(2).enumerate() {
        let op = pair[0];
        let arg = pair.get(1).copied().unwrap_or_default();
        let id = CorrelationId::new(format!("id-{}", arg % 16));
        let now = base + Duration::from_millis(step as u64);

        match op % 5 {
            0 => {
                let _ = registry.register(id, now + Duration::from_millis(u64::from(arg)));
            }
            1 => {
                let before = registry.outcome(&id);
                let resolution = registry.try_resolve(&id, ConfirmOutcome::Acked);
                if resolution == Resolution::AlreadyResolved {
                    assert_eq!(registry.outcome(&id), before);
                }
            }
            2 => {
                registry.evict(&id);
            }
            3 => {
                registry.expire_overdue(now);
            }
            _ => {
                registry.purge_settled(now, Duration::from_millis(u64::from(arg)));
            }
        }
        assert!(registry.pending_count() <= registry.len());
    }
});
