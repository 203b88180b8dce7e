#![no_main]

use arbitrary::Arbitrary;
use courier::dead_letter::headers;
use courier::DeadLetterEnvelope;
use libfuzzer_sys::fuzz_target;
use std::collections::BTreeMap;

#[derive(Debug, Arbitrary)]
struct HeaderInput {
    topic: String,
    partition: String,
    offset: String,
    timestamp: String,
    class: String,
    message: String,
    failed_at: String,
    retries: String,
    extra: Vec<(String, String)>,
}

fuzz_target!(|input: HeaderInput| {
    let mut map: BTreeMap<String, String> = input.extra.into_iter().collect();
    map.insert(headers::ORIGINAL_TOPIC.to_string(), input.topic);
    map.insert(headers::ORIGINAL_PARTITION.to_string(), input.partition);
    map.insert(headers::ORIGINAL_OFFSET.to_string(), input.offset);
    map.insert(headers::ORIGINAL_TIMESTAMP.to_string(), input.timestamp);
    map.insert(headers::EXCEPTION_CLASS.to_string(), input.class);
    map.insert(headers::EXCEPTION_MESSAGE.to_string(), input.message);
    map.insert(headers::FAILURE_TIMESTAMP.to_string(), input.failed_at);
    map.insert(headers::RETRY_ATTEMPTS.to_string(), input.retries);

    // Malformed headers are errors, never panics
    if let Ok(envelope) = DeadLetterEnvelope::from_headers(&map) {
        // Whatever parsed must survive a second trip through the headers
        let again = DeadLetterEnvelope::from_headers(&envelope.to_headers())
            .expect("re-encoded headers must parse");
        assert_eq!(again.original_topic, envelope.original_topic);
        assert_eq!(again.original_offset, envelope.original_offset);
        assert_eq!(again.exception_kind, envelope.exception_kind);
        assert_eq!(again.retry_attempts, envelope.retry_attempts);
    }
});
