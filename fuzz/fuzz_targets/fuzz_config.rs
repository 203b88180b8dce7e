#![no_main]

use courier::ReliabilityConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(json) = std::str::from_utf8(data) else {
        return;
    };

    // Parsing validates; anything accepted must build every component
    if let Ok(config) = ReliabilityConfig::from_json(json) {
        for name in config.pipelines.keys() {
            config.pipeline(name).expect("validated pipeline must build");
        }
        config.breaker_configs().expect("validated breakers must build");
        config.retry_policies().expect("validated policies must build");
    }
});
