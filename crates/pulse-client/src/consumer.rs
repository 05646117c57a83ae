// Consumption loop: pulls deliveries off a subscription, fans them out to
// concurrent handlers, and records every outcome into shared stats.
// Lifecycle: listening until cancelled or the stream ends, then draining
// in-flight handlers, then stopped.
use crate::loopback::{Delivery, Subscription};
use chrono::Utc;
use pulse_stats::{DeliveryStats, Summary};
use pulse_wire::Envelope;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumerConfig {
    /// Cap on concurrently running handlers. `None` removes the cap.
    pub max_concurrency: Option<usize>,
    /// How long to wait for in-flight handlers after a cancel before
    /// aborting them. `None` waits indefinitely.
    pub drain_grace: Option<Duration>,
    /// Artificial per-message processing time, for shaping handler load.
    pub per_message_delay: Option<Duration>,
}

/// Drives a subscription until cancelled and aggregates delivery outcomes.
///
/// ```no_run
/// # async fn demo() {
/// use pulse_client::{ConsumerConfig, ConsumerLoop, LoopbackTransport};
/// use tokio::sync::watch;
///
/// let transport = LoopbackTransport::new();
/// let subscription = transport.subscribe("local/topic");
/// let (_cancel_tx, cancel_rx) = watch::channel(false);
/// let consumer = ConsumerLoop::new(ConsumerConfig::default());
/// let summary = consumer.run(subscription, cancel_rx).await;
/// println!("{summary}");
/// # }
/// ```
pub struct ConsumerLoop {
    config: ConsumerConfig,
    stats: Arc<DeliveryStats>,
}

impl ConsumerLoop {
    pub fn new(config: ConsumerConfig) -> Self {
        Self {
            config,
            stats: Arc::new(DeliveryStats::new()),
        }
    }

    /// Shared handle to the live aggregator, for polling mid-run.
    pub fn stats(&self) -> Arc<DeliveryStats> {
        Arc::clone(&self.stats)
    }

    /// Consume deliveries until `cancel` flips to true or the stream ends,
    /// drain in-flight handlers, and return the finalized summary.
    pub async fn run(
        &self,
        mut subscription: Subscription,
        mut cancel: watch::Receiver<bool>,
    ) -> Summary {
        let limiter = self
            .config
            .max_concurrency
            .map(|cap| Arc::new(Semaphore::new(cap.max(1))));
        let mut handlers: JoinSet<()> = JoinSet::new();
        tracing::debug!("consumer listening");

        loop {
            // Reap finished handlers so the set does not grow unbounded.
            while handlers.try_join_next().is_some() {}

            tokio::select! {
                // The watch guard is dropped inside the branch so the future
                // stays `Send`; a dropped sender counts as a stop signal too.
                _ = async { let _ = cancel.wait_for(|stop| *stop).await; } => break,
                delivery = subscription.next_delivery() => match delivery {
                    Some(delivery) => {
                        // Admission before spawn: intake stalls when the cap
                        // is reached rather than queueing handlers.
                        let permit = match &limiter {
                            Some(semaphore) => {
                                match Arc::clone(semaphore).acquire_owned().await {
                                    Ok(permit) => Some(permit),
                                    Err(_) => break,
                                }
                            }
                            None => None,
                        };
                        let stats = Arc::clone(&self.stats);
                        let delay = self.config.per_message_delay;
                        handlers.spawn(async move {
                            let _permit = permit;
                            handle_delivery(delivery, &stats, delay).await;
                        });
                    }
                    None => break,
                },
            }
        }

        self.drain(handlers).await;
        self.stats.finalize();
        tracing::debug!("consumer stopped");
        self.stats.summary()
    }

    async fn drain(&self, mut handlers: JoinSet<()>) {
        if handlers.is_empty() {
            return;
        }
        tracing::debug!(in_flight = handlers.len(), "draining in-flight handlers");
        match self.config.drain_grace {
            None => while handlers.join_next().await.is_some() {},
            Some(grace) => {
                let drained = timeout(grace, async {
                    while handlers.join_next().await.is_some() {}
                })
                .await;
                if drained.is_err() {
                    tracing::warn!(
                        in_flight = handlers.len(),
                        "drain grace elapsed, aborting slow handlers"
                    );
                    handlers.abort_all();
                    // A handler that finished despite the abort already
                    // recorded its outcome; only joins reporting cancellation
                    // count as failures.
                    while let Some(joined) = handlers.join_next().await {
                        if joined.is_err_and(|err| err.is_cancelled()) {
                            self.stats.record_failure();
                        }
                    }
                }
            }
        }
    }
}

async fn handle_delivery(delivery: Delivery, stats: &DeliveryStats, delay: Option<Duration>) {
    let receive_time = Utc::now();
    if let Some(delay) = delay {
        sleep(delay).await;
    }
    match Envelope::decode(&delivery.payload) {
        Ok(envelope) => {
            // Negative latency is kept as-is; clock skew is part of the data.
            let latency_ms = (receive_time - envelope.timestamp)
                .num_microseconds()
                .unwrap_or(i64::MAX) as f64
                / 1000.0;
            stats.record_message(latency_ms, receive_time, envelope.count);
            delivery.ack();
        }
        Err(err) => {
            tracing::debug!(error = %err, "discarding undecodable payload");
            stats.record_failure();
            delivery.ack();
        }
    }
}
