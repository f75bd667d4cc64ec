//! The processor capability and its runner.
//!
//! Each processor consumes one or more topics through its own consumer group
//! and emits signals to its output topic plus `kalshi:signals:all`. Topic
//! readers forward into a single bounded per-processor queue; back-pressure
//! propagates by blocking the readers.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::bus::{DEFAULT_BATCH_SIZE, StreamConsumer, StreamEntry, StreamHandler, StreamPublisher};
use crate::error::{Error, Result};
use crate::models::Signal;

/// Bounded capacity of the per-processor fan-in queue.
const QUEUE_CAPACITY: usize = 1_024;

/// Stats cadence.
const STATS_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// A stateful signal processor.
#[async_trait]
pub trait Processor: Send + 'static {
    fn name(&self) -> &'static str;
    fn input_topics(&self) -> &'static [&'static str];
    fn output_topic(&self) -> &'static str;

    /// Process one message payload from `topic`, returning zero or more
    /// signals. Errors are logged and the message is skipped; they never
    /// stop the processor.
    async fn process(&mut self, topic: &'static str, payload: &str) -> Result<Vec<Signal>>;
}

/// Forwards consumed entries into the processor's queue. Acknowledgement
/// happens on enqueue; a full queue blocks the reader.
struct QueueForwarder {
    topic: &'static str,
    tx: mpsc::Sender<(&'static str, StreamEntry)>,
}

#[async_trait]
impl StreamHandler for QueueForwarder {
    async fn handle(&mut self, entries: &[StreamEntry]) -> Result<()> {
        for entry in entries {
            self.tx
                .send((self.topic, entry.clone()))
                .await
                .map_err(|_| Error::Parse("processor queue closed".to_string()))?;
        }
        Ok(())
    }
}

/// Run a processor until its input readers stop.
pub async fn run_processor<P: Processor>(
    mut processor: P,
    consumer: StreamConsumer,
    mut publisher: StreamPublisher,
) -> Result<()> {
    let name = processor.name();
    let output_topic = processor.output_topic();
    let group = format!("sig_{name}");

    info!(processor = name, inputs = ?processor.input_topics(), "processor_starting");

    let (tx, mut rx) = mpsc::channel::<(&'static str, StreamEntry)>(QUEUE_CAPACITY);

    let mut readers = Vec::new();
    for &topic in processor.input_topics() {
        let mut consumer = consumer.clone();
        let group = group.clone();
        let consumer_name = format!("{}_{}", name, topic.replace(':', "_"));
        let tx = tx.clone();

        readers.push(tokio::spawn(async move {
            let mut forwarder = QueueForwarder { topic, tx };
            consumer
                .consume(topic, &group, &consumer_name, DEFAULT_BATCH_SIZE, &mut forwarder)
                .await
        }));
    }
    drop(tx);

    let mut stats_timer = tokio::time::interval_at(
        tokio::time::Instant::now() + STATS_INTERVAL,
        STATS_INTERVAL,
    );
    let mut messages_processed: u64 = 0;
    let mut signals_emitted: u64 = 0;

    loop {
        tokio::select! {
            item = rx.recv() => {
                let Some((topic, entry)) = item else { break };

                match processor.process(topic, &entry.data).await {
                    Ok(signals) => {
                        messages_processed += 1;
                        for signal in signals {
                            publisher.publish_signal(output_topic, &signal).await?;
                            signals_emitted += 1;
                        }
                    }
                    Err(e) => {
                        warn!(processor = name, topic, id = %entry.id, error = %e, "message_processing_error");
                    }
                }
            }

            _ = stats_timer.tick() => {
                info!(
                    processor = name,
                    messages_processed,
                    signals_emitted,
                    msg_per_sec = messages_processed as f64 / STATS_INTERVAL.as_secs_f64(),
                    "processor_stats"
                );
                messages_processed = 0;
                signals_emitted = 0;
            }
        }
    }

    for reader in readers {
        reader.abort();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_forwarder_enqueues_entries_in_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut forwarder = QueueForwarder {
            topic: "kalshi:trades",
            tx,
        };

        let entries = vec![
            StreamEntry {
                id: "1-0".to_string(),
                data: "{\"a\":1}".to_string(),
            },
            StreamEntry {
                id: "2-0".to_string(),
                data: "{\"a\":2}".to_string(),
            },
        ];
        forwarder.handle(&entries).await.unwrap();

        let (topic, first) = rx.recv().await.unwrap();
        assert_eq!(topic, "kalshi:trades");
        assert_eq!(first.id, "1-0");
        let (_, second) = rx.recv().await.unwrap();
        assert_eq!(second.id, "2-0");
    }

    #[tokio::test]
    async fn test_forwarder_errors_when_queue_closed() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let mut forwarder = QueueForwarder {
            topic: "kalshi:trades",
            tx,
        };
        let entries = vec![StreamEntry {
            id: "1-0".to_string(),
            data: "{}".to_string(),
        }];
        // The batch must not be acknowledged once the processor is gone.
        assert!(forwarder.handle(&entries).await.is_err());
    }
}
