#![no_main]

use arbitrary::Arbitrary;
use courier_resilience::BackoffPolicy;
use libfuzzer_sys::fuzz_target;
use std::time::Duration;

#[derive(Debug, Arbitrary)]
struct BackoffInput {
    initial_ms: u32,
    max_ms: u32,
    multiplier: f64,
    max_retries: u8,
    max_elapsed_ms: Option<u32>,
}

fuzz_target!(|input: BackoffInput| {
    if !input.multiplier.is_finite() {
        return;
    }
    let mut policy = BackoffPolicy::exponential(
        Duration::from_millis(input.initial_ms.into()),
        Duration::from_millis(input.max_ms.into()),
        input.multiplier,
        input.max_retries.into(),
    );
    if let Some(ms) = input.max_elapsed_ms {
        policy = policy.with_max_elapsed(Duration::from_millis(ms.into()));
    }
    if policy.validate().is_err() {
        return;
    }

    let mut total = Duration::ZERO;
    let mut count = 0u32;
    for delay in policy.delays() {
        assert!(delay <= policy.max_interval);
        total += delay;
        count += 1;
    }
    assert!(count <= u32::from(input.max_retries));
    if let Some(limit) = policy.max_elapsed {
        assert!(total <= limit);
    }
});
