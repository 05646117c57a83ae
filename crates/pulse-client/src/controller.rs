// Publish controller: issues sequenced envelopes under an admission policy
// and joins every attempt before reporting the batch outcome.
use crate::transport::{DeliveryId, Transport, TransportError};
use bytes::Bytes;
use pulse_wire::Envelope;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowBehavior {
    /// Suspend the publish call until an in-flight slot frees.
    Block,
    /// Fail the excess attempt immediately instead of queuing it.
    Reject,
}

#[derive(Debug, Clone)]
pub enum AdmissionPolicy {
    Unbounded,
    Bounded {
        max_in_flight: usize,
        on_exceed: OverflowBehavior,
    },
    /// Coalesce envelopes into one transport send once any threshold trips.
    /// `max_batch_bytes = 1, max_batch_count = 1, max_batch_latency = 0`
    /// degenerates to immediate single sends.
    Batched {
        max_batch_bytes: usize,
        max_batch_count: usize,
        max_batch_latency: Duration,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    #[error("admission rejected: in-flight limit reached")]
    AdmissionRejected,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("envelope encoding failed: {0}")]
    Encode(String),
}

#[derive(Debug)]
pub enum PublishOutcome {
    Delivered { id: DeliveryId },
    Failed { cause: PublishError },
}

impl PublishOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// Per-batch audit: outcomes keep the original sequence order regardless of
/// completion order.
#[derive(Debug)]
pub struct BatchResult {
    pub attempted: usize,
    pub succeeded: usize,
    pub outcomes: Vec<PublishOutcome>,
}

impl BatchResult {
    fn from_outcomes(outcomes: Vec<PublishOutcome>) -> Self {
        let succeeded = outcomes.iter().filter(|o| o.is_delivered()).count();
        Self {
            attempted: outcomes.len(),
            succeeded,
            outcomes,
        }
    }
}

/// Issues envelopes for one source identity with a monotonically increasing
/// sequence counter assigned in construction order.
pub struct PublishController {
    transport: Arc<dyn Transport>,
    topic: String,
    source: String,
    policy: AdmissionPolicy,
    sequence: AtomicU64,
}

impl PublishController {
    pub fn new(
        transport: Arc<dyn Transport>,
        topic: impl Into<String>,
        source: impl Into<String>,
        policy: AdmissionPolicy,
    ) -> Self {
        Self {
            transport,
            topic: topic.into(),
            source: source.into(),
            policy,
            sequence: AtomicU64::new(0),
        }
    }

    // Sequence values start at 1 and never repeat for this controller.
    fn next_count(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Publish `count` envelopes under the configured admission policy and
    /// wait for every attempt to complete. A single failure never aborts the
    /// rest of the batch.
    pub async fn publish_batch(&self, count: usize) -> BatchResult {
        match self.policy.clone() {
            AdmissionPolicy::Batched {
                max_batch_bytes,
                max_batch_count,
                max_batch_latency,
            } => {
                self.publish_batch_coalesced(
                    count,
                    BatchLimits {
                        max_bytes: max_batch_bytes,
                        max_count: max_batch_count,
                        max_latency: max_batch_latency,
                    },
                )
                .await
            }
            policy => self.publish_batch_concurrent(count, policy).await,
        }
    }

    /// Publish a single envelope immediately, outside any batching window.
    /// Used by the continuous-publish mode.
    pub async fn publish_one(&self) -> PublishOutcome {
        let count = self.next_count();
        let bytes = match Envelope::new(&self.source, count).and_then(|e| e.encode()) {
            Ok(bytes) => bytes,
            Err(err) => {
                return PublishOutcome::Failed {
                    cause: PublishError::Encode(err.to_string()),
                };
            }
        };
        match self.transport.publish(&self.topic, bytes).await {
            Ok(id) => PublishOutcome::Delivered { id },
            Err(err) => PublishOutcome::Failed {
                cause: PublishError::Transport(err),
            },
        }
    }

    async fn publish_batch_concurrent(&self, count: usize, policy: AdmissionPolicy) -> BatchResult {
        let (semaphore, on_exceed) = match &policy {
            AdmissionPolicy::Bounded {
                max_in_flight,
                on_exceed,
            } => (
                Some(Arc::new(Semaphore::new((*max_in_flight).max(1)))),
                *on_exceed,
            ),
            _ => (None, OverflowBehavior::Block),
        };

        let mut outcomes: Vec<Option<PublishOutcome>> =
            std::iter::repeat_with(|| None).take(count).collect();
        let mut tasks: JoinSet<(usize, PublishOutcome)> = JoinSet::new();

        for slot in 0..count {
            let envelope = match Envelope::new(&self.source, self.next_count()) {
                Ok(envelope) => envelope,
                Err(err) => {
                    outcomes[slot] = Some(PublishOutcome::Failed {
                        cause: PublishError::Encode(err.to_string()),
                    });
                    continue;
                }
            };

            // Admission happens at issue time, in sequence order; the permit
            // is released when the transport call completes.
            let permit = match &semaphore {
                None => None,
                Some(semaphore) => match on_exceed {
                    OverflowBehavior::Block => match Arc::clone(semaphore).acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => {
                            outcomes[slot] = Some(PublishOutcome::Failed {
                                cause: PublishError::AdmissionRejected,
                            });
                            continue;
                        }
                    },
                    OverflowBehavior::Reject => match Arc::clone(semaphore).try_acquire_owned() {
                        Ok(permit) => Some(permit),
                        Err(_) => {
                            outcomes[slot] = Some(PublishOutcome::Failed {
                                cause: PublishError::AdmissionRejected,
                            });
                            continue;
                        }
                    },
                },
            };

            let transport = Arc::clone(&self.transport);
            let topic = self.topic.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let outcome = match envelope.encode() {
                    Ok(bytes) => match transport.publish(&topic, bytes).await {
                        Ok(id) => PublishOutcome::Delivered { id },
                        Err(err) => PublishOutcome::Failed {
                            cause: PublishError::Transport(err),
                        },
                    },
                    Err(err) => PublishOutcome::Failed {
                        cause: PublishError::Encode(err.to_string()),
                    },
                };
                (slot, outcome)
            });
        }

        // Explicit join barrier: every issued attempt has completed before the
        // result is assembled, failures included.
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, outcome)) => outcomes[slot] = Some(outcome),
                Err(err) => tracing::warn!(error = %err, "publish task aborted"),
            }
        }

        let outcomes = outcomes
            .into_iter()
            .map(|slot| {
                slot.unwrap_or(PublishOutcome::Failed {
                    cause: PublishError::Transport(TransportError::Publish(
                        "publish task aborted".to_string(),
                    )),
                })
            })
            .collect();
        BatchResult::from_outcomes(outcomes)
    }

    async fn publish_batch_coalesced(&self, count: usize, limits: BatchLimits) -> BatchResult {
        let (tx, rx) = mpsc::channel(count.max(1));
        let writer = tokio::spawn(run_batch_writer(
            Arc::clone(&self.transport),
            self.topic.clone(),
            limits,
            rx,
        ));

        let mut responses = Vec::with_capacity(count);
        for _ in 0..count {
            let sequence = self.next_count();
            let (response_tx, response_rx) = oneshot::channel();
            match Envelope::new(&self.source, sequence).and_then(|e| e.encode()) {
                Ok(bytes) => {
                    if let Err(send_err) = tx
                        .send(BatchItem {
                            bytes,
                            response: response_tx,
                        })
                        .await
                    {
                        let _ = send_err.0.response.send(Err(PublishError::Transport(
                            TransportError::Publish("batch writer stopped".to_string()),
                        )));
                    }
                }
                Err(err) => {
                    let _ = response_tx.send(Err(PublishError::Encode(err.to_string())));
                }
            }
            responses.push(response_rx);
        }
        // Closing the queue flushes any partial tail batch.
        drop(tx);

        let mut outcomes = Vec::with_capacity(count);
        for response in responses {
            let outcome = match response.await {
                Ok(Ok(id)) => PublishOutcome::Delivered { id },
                Ok(Err(cause)) => PublishOutcome::Failed { cause },
                Err(_) => PublishOutcome::Failed {
                    cause: PublishError::Transport(TransportError::Publish(
                        "batch response dropped".to_string(),
                    )),
                },
            };
            outcomes.push(outcome);
        }

        if let Err(err) = writer.await {
            tracing::warn!(error = %err, "batch writer task aborted");
        }
        BatchResult::from_outcomes(outcomes)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct BatchLimits {
    pub(crate) max_bytes: usize,
    pub(crate) max_count: usize,
    pub(crate) max_latency: Duration,
}

pub(crate) struct BatchItem {
    pub(crate) bytes: Bytes,
    pub(crate) response: oneshot::Sender<Result<DeliveryId, PublishError>>,
}

// Single batching worker: accumulate queued envelopes and flush them as one
// coalesced transport send when a byte, count, or age threshold trips.
pub(crate) async fn run_batch_writer(
    transport: Arc<dyn Transport>,
    topic: String,
    limits: BatchLimits,
    mut rx: mpsc::Receiver<BatchItem>,
) {
    let max_count = limits.max_count.max(1);
    let mut pending: Vec<BatchItem> = Vec::new();
    let mut pending_bytes = 0usize;
    let mut oldest: Option<Instant> = None;

    loop {
        let deadline = oldest.map(|at| at + limits.max_latency);
        tokio::select! {
            item = rx.recv() => match item {
                Some(item) => {
                    pending_bytes += item.bytes.len();
                    let oldest_at = *oldest.get_or_insert_with(Instant::now);
                    pending.push(item);
                    if pending.len() >= max_count
                        || pending_bytes >= limits.max_bytes
                        || oldest_at.elapsed() >= limits.max_latency
                    {
                        flush_batch(&transport, &topic, &mut pending).await;
                        pending_bytes = 0;
                        oldest = None;
                    }
                }
                None => break,
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                // Age of the oldest unsent message reached the latency cap.
                flush_batch(&transport, &topic, &mut pending).await;
                pending_bytes = 0;
                oldest = None;
            }
        }
    }
    flush_batch(&transport, &topic, &mut pending).await;
}

async fn flush_batch(transport: &Arc<dyn Transport>, topic: &str, pending: &mut Vec<BatchItem>) {
    if pending.is_empty() {
        return;
    }
    let batch = std::mem::take(pending);
    let payloads: Vec<Bytes> = batch.iter().map(|item| item.bytes.clone()).collect();
    match transport.publish_batch(topic, payloads).await {
        Ok(ids) => {
            for (item, id) in batch.into_iter().zip(ids) {
                let _ = item.response.send(Ok(id));
            }
        }
        Err(err) => {
            // One failed coalesced send fails every message it carried.
            for item in batch {
                let _ = item
                    .response
                    .send(Err(PublishError::Transport(err.clone())));
            }
        }
    }
}
