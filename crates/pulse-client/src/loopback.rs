// In-process loopback transport used by tests and the probe binary.
use crate::transport::{DeliveryId, Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Topic registry delivering published payloads to in-process subscribers.
///
/// ```
/// use bytes::Bytes;
/// use pulse_client::{LoopbackTransport, Transport};
/// use std::sync::Arc;
///
/// let transport = Arc::new(LoopbackTransport::new());
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let mut subscription = transport.subscribe("local/updates");
///     transport
///         .publish("local/updates", Bytes::from_static(b"payload"))
///         .await
///         .expect("publish");
///     let delivery = subscription.next_delivery().await.expect("delivery");
///     assert_eq!(delivery.payload, Bytes::from_static(b"payload"));
///     delivery.ack();
/// });
/// ```
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    topics: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Delivery>>>>,
    next_id: AtomicU64,
    acks: Arc<AtomicU64>,
}

/// One delivered message. `ack` consumes the delivery so it can only be
/// acknowledged once.
#[derive(Debug)]
pub struct Delivery {
    pub payload: Bytes,
    acks: Arc<AtomicU64>,
}

impl Delivery {
    pub fn ack(self) {
        self.acks.fetch_add(1, Ordering::Relaxed);
    }
}

/// Receiving end of a loopback subscription.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    /// Next delivery, or `None` once the transport side is gone.
    pub async fn next_delivery(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self.topics.lock().expect("topic registry lock");
        topics.entry(topic.to_string()).or_default().push(tx);
        Subscription { rx }
    }

    /// Acknowledgements observed across all deliveries from this transport.
    pub fn acked_count(&self) -> u64 {
        self.acks.load(Ordering::Relaxed)
    }

    fn deliver(&self, topic: &str, payload: &Bytes) {
        let mut topics = self.topics.lock().expect("topic registry lock");
        if let Some(senders) = topics.get_mut(topic) {
            // Drop senders whose subscription has been closed.
            senders.retain(|tx| {
                tx.send(Delivery {
                    payload: payload.clone(),
                    acks: Arc::clone(&self.acks),
                })
                .is_ok()
            });
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<DeliveryId, TransportError> {
        // A topic with no subscribers still accepts publishes; the payload is
        // simply not retained anywhere.
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.deliver(topic, &payload);
        Ok(id)
    }

    async fn publish_batch(
        &self,
        topic: &str,
        payloads: Vec<Bytes>,
    ) -> Result<Vec<DeliveryId>, TransportError> {
        let mut ids = Vec::with_capacity(payloads.len());
        for payload in &payloads {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            self.deliver(topic, payload);
            ids.push(id);
        }
        Ok(ids)
    }
}
