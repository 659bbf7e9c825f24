#![no_main]

use libfuzzer_sys::fuzz_target;
use pubconfirm_core::Topology;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(topology) = toml::from_str::<Topology>(text) {
        for binding in topology.bindings() {
            assert!(topology.has_exchange(&binding.exchange));
            assert!(topology.has_queue(&binding.queue));
            let _ = topology.route(&binding.exchange, &binding.routing_key);
        }
    }
});
