//! Integration tests for the composition root: configuration, guards and reporting

use courier::prelude::*;
use courier::{
    CircuitState, Collaborators, DeadLetterOutcome, FileSpill, ProcessOutcome, Reliability,
    ReliabilityConfig,
};
use courier_testing::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

struct Fixture {
    publisher: Arc<RecordingPublisher>,
    alerts: Arc<RecordingAlerts>,
    reliability: Reliability,
}

fn fixture(config: ReliabilityConfig) -> Fixture {
    let publisher = Arc::new(RecordingPublisher::new());
    let alerts = Arc::new(RecordingAlerts::new());
    let collaborators = Collaborators::new(publisher.clone(), Arc::new(RecordingConsumer::new()))
        .with_alerts(alerts.clone());
    let reliability = Reliability::from_config(config, collaborators).unwrap();
    Fixture {
        publisher,
        alerts,
        reliability,
    }
}

mod guard_tests {
    use super::*;

    fn payment_config() -> ReliabilityConfig {
        let mut config = ReliabilityConfig::default();
        let breaker = config.breakers.get_mut("payment-api").unwrap();
        breaker.failure_rate_threshold = 40.0;
        breaker.minimum_number_of_calls = 10;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_payment_breaker_opens_and_rejects_without_invoking() {
        let f = fixture(payment_config());
        let guard = f.reliability.guard("payment-api", "payment-write").unwrap();
        let calls = AtomicU32::new(0);

        for i in 0..10 {
            let counter = &calls;
            let result: Result<(), _> = guard
                .call(move |_| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if i < 5 {
                        Err(ProcessingError::new(ErrorKind::Connect, "payment gateway refused"))
                    } else {
                        Ok(())
                    }
                })
                .await;
            assert_eq!(result.is_ok(), i >= 5);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 10);

        let breaker = f.reliability.breakers().get("payment-api").unwrap();
        assert_eq!(breaker.state(), CircuitState::Open);

        let counter = &calls;
        let rejected: Result<(), _> = guard
            .call(move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        let err = rejected.unwrap_err();
        assert!(err.last_error.is_not_permitted());
        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 10, "rejected call never runs");

        let report = f.reliability.report().await;
        let payment = report.breakers.iter().find(|m| m.name == "payment-api").unwrap();
        assert_eq!(payment.state, CircuitState::Open);
        assert_eq!(payment.not_permitted_calls, 1);
        assert_eq!(payment.failure_rate, Some(50.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_policy_retries_through_breaker() {
        let f = fixture(ReliabilityConfig::default());
        let guard = f.reliability.guard("campaign-api", "campaign-read").unwrap();
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<u32, _> = guard
            .call(move |attempt| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    Err(ProcessingError::new(ErrorKind::Timeout, "campaign api timed out"))
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_unknown_names_are_errors() {
        let f = fixture(ReliabilityConfig::default());
        assert!(f.reliability.guard("ledger-api", "payment-write").is_err());
        assert!(f.reliability.guard("payment-api", "ledger-write").is_err());
        assert!(f
            .reliability
            .pipeline("nonexistent", Arc::new(ScriptedHandler::succeeding()))
            .is_err());
    }
}

mod pipeline_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_configured_pipeline_dead_letters_and_reports() {
        let f = fixture(ReliabilityConfig::default());
        let handler = Arc::new(ScriptedHandler::new([
            Err(ProcessingError::new(ErrorKind::Connect, "refused")),
            Err(ProcessingError::new(ErrorKind::IllegalArgument, "negative quantity")),
        ]));
        let pipeline = f.reliability.pipeline("order-processing", handler.clone()).unwrap();

        let message = InboundMessage::new("ecommerce.order.created", 2, 77, b"{}".to_vec());
        let outcome = pipeline.process(&message).await;

        assert!(matches!(outcome, ProcessOutcome::DeadLettered { attempts: 2, .. }));
        let records = f.publisher.records_for("ecommerce.order.created.dlq");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].headers.get("dlt-retry-attempts").map(String::as_str), Some("1"));

        let report = f.reliability.report().await;
        assert_eq!(report.errors["totalErrors"], 2.0);
        assert_eq!(report.errors["retriedErrors"], 1.0);
        assert_eq!(report.errors["nonRetryableErrors"], 1.0);
        assert_eq!(report.errors["dlqSentCount"], 1.0);
        assert_eq!(report.errors["errorRate"], 0.5);
        assert_eq!(report.breakers.len(), 4);

        let json = serde_json::to_value(&report).unwrap();
        assert!(json["counters"]["dlqSentCount"].is_number());
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivered_duplicate_is_skipped() {
        let f = fixture(ReliabilityConfig::default());
        let handler = Arc::new(ScriptedHandler::succeeding());
        let pipeline = f.reliability.pipeline("default", handler.clone()).unwrap();

        let message = InboundMessage::new("ecommerce.order.created", 0, 1, b"{}".to_vec());
        pipeline.process(&message).await;
        assert_eq!(pipeline.process(&message).await, ProcessOutcome::Duplicate);
        assert_eq!(handler.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_letter_pipeline_escalates() {
        let f = fixture(ReliabilityConfig::default());
        let handler = Arc::new(ScriptedHandler::failing(ErrorKind::ServiceUnavailable, "still down"));
        let pipeline = f.reliability.pipeline("dead-letter", handler.clone()).unwrap();

        let message = InboundMessage::new("ecommerce.order.created.dlq", 0, 5, b"{}".to_vec());
        let outcome = pipeline.process(&message).await;

        assert_eq!(outcome, ProcessOutcome::Escalated { attempts: 3 });
        assert_eq!(f.alerts.of_kind(AlertKind::DeadLetterProcessingFailed).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_spill_path_receives_unpublishable_dead_letters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dead-letters.jsonl");
        let mut config = ReliabilityConfig::default();
        config.dead_letter.spill_path = Some(path.clone());

        let f = fixture(config);
        f.publisher.set_failing(true);
        let handler = Arc::new(ScriptedHandler::failing(ErrorKind::IllegalArgument, "bad"));
        let pipeline = f.reliability.pipeline("default", handler).unwrap();

        let message = InboundMessage::new("smm.offer.assignment.events", 0, 9, b"{}".to_vec());
        let outcome = pipeline.process(&message).await;

        match outcome {
            ProcessOutcome::DeadLettered { outcome, .. } => {
                assert_eq!(
                    outcome,
                    DeadLetterOutcome::Spilled {
                        topic: "smm.offer.assignments.dlq".to_string()
                    }
                );
            }
            other => panic!("expected dead letter, got {:?}", other),
        }

        let spilled = FileSpill::new(&path).read_all().await.unwrap();
        assert_eq!(spilled.len(), 1);
        assert_eq!(spilled[0].topic, "smm.offer.assignments.dlq");
        assert_eq!(f.reliability.metrics().snapshot().dead_letters_spilled, 1);
    }
}

mod config_tests {
    use super::*;

    #[test]
    fn test_invalid_configuration_is_rejected() {
        let mut config = ReliabilityConfig::default();
        config.consumer.concurrency = 0;
        let collaborators = Collaborators::new(
            Arc::new(RecordingPublisher::new()),
            Arc::new(RecordingConsumer::new()),
        );
        assert!(Reliability::from_config(config, collaborators).is_err());
    }

    #[test]
    fn test_idempotency_can_be_disabled() {
        let mut config = ReliabilityConfig::default();
        config.consumer.idempotency_ttl = 0;
        let f = fixture(config);
        assert!(f.reliability.idempotency().is_none());
    }

    #[test]
    fn test_registries_follow_configuration() {
        let f = fixture(ReliabilityConfig::default());
        assert_eq!(
            f.reliability.breakers().names(),
            vec!["campaign-api", "database", "payment-api", "video-api"]
        );
        assert_eq!(f.reliability.retries().len(), 5);
        assert_eq!(f.reliability.rebalance().group(), "courier");
    }
}
