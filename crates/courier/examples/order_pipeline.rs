//! Order pipeline walkthrough
//!
//! Feeds a handful of orders through the `order-processing` pipeline with
//! in-memory collaborators, then prints what was committed, dead-lettered and
//! reported.
//!
//! ```bash
//! RUST_LOG=courier=debug cargo run --example order_pipeline
//! ```

use courier::prelude::*;
use courier::{CallGuard, Collaborators, Reliability, ReliabilityConfig};
use courier_testing::{RecordingConsumer, RecordingPublisher, VecSource};
use serde::Deserialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Order {
    order_id: String,
    quantity: i64,
}

/// Reserves stock through a flaky inventory service guarded by a breaker
struct OrderHandler {
    inventory: CallGuard,
    inventory_calls: AtomicU32,
}

#[async_trait]
impl MessageHandler for OrderHandler {
    async fn handle(&self, ctx: &ProcessingContext<'_>) -> Result<(), ProcessingError> {
        let order: Order = serde_json::from_slice(&ctx.message.payload)
            .map_err(|e| ProcessingError::new(ErrorKind::JsonParse, e.to_string()))?;
        if order.quantity <= 0 {
            return Err(ProcessingError::new(
                ErrorKind::IllegalArgument,
                format!("order {} has quantity {}", order.order_id, order.quantity),
            ));
        }

        let calls = &self.inventory_calls;
        self.inventory
            .call(move |_| async move {
                // Every third call to the inventory service is refused
                if calls.fetch_add(1, Ordering::SeqCst) % 3 == 2 {
                    Err(ProcessingError::new(ErrorKind::Connect, "inventory refused connection"))
                } else {
                    Ok(())
                }
            })
            .await?;

        tracing::info!(order_id = %order.order_id, attempt = ctx.attempt, "Order reserved");
        Ok(())
    }
}

fn order(offset: i64, payload: &str) -> InboundMessage {
    InboundMessage::new("ecommerce.order.created", (offset % 2) as i32, offset, payload.as_bytes().to_vec())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("courier=info")))
        .init();

    let mut config = ReliabilityConfig::from_env()?;
    config.consumer.poll_timeout = 100;
    if let Some(pipeline) = config.pipelines.get_mut("order-processing") {
        pipeline.initial_interval = 50;
        pipeline.max_interval = 400;
    }

    let publisher = Arc::new(RecordingPublisher::new());
    let consumer = Arc::new(RecordingConsumer::new());
    let reliability = Reliability::from_config(
        config,
        Collaborators::new(publisher.clone(), consumer.clone()),
    )?;

    let handler = Arc::new(OrderHandler {
        inventory: reliability.guard("database", "payment-read")?,
        inventory_calls: AtomicU32::new(0),
    });
    let pipeline = Arc::new(reliability.pipeline("order-processing", handler)?);

    let source = Arc::new(VecSource::new([vec![
        order(0, r#"{"orderId":"o-100","quantity":2}"#),
        order(1, r#"{"orderId":"o-101","quantity":1}"#),
        order(2, r#"{"orderId":"o-102","quantity":0}"#),
        order(3, r#"{"orderId":"o-103""#),
        order(4, r#"{"orderId":"o-104","quantity":5}"#),
    ]]));
    let runtime = Arc::new(reliability.runtime(source, pipeline));

    let (stop, shutdown) = tokio::sync::watch::channel(false);
    let task = tokio::spawn({
        let runtime = Arc::clone(&runtime);
        async move { runtime.run(shutdown).await }
    });
    tokio::time::sleep(Duration::from_secs(5)).await;
    stop.send(true)?;
    let summary = task.await??;

    println!("run summary: {}", serde_json::to_string_pretty(&summary)?);
    for record in publisher.records() {
        println!(
            "dead letter -> {} ({})",
            record.topic,
            record.headers.get("dlt-exception-class").map(String::as_str).unwrap_or("?")
        );
    }
    for partition in [0, 1] {
        let tp = TopicPartition::new("ecommerce.order.created", partition);
        println!("committed {} -> {:?}", tp, consumer.committed(&tp));
    }
    println!("report: {}", serde_json::to_string_pretty(&reliability.report().await)?);
    Ok(())
}
