// Transport seam consumed by the pipeline. Real deployments implement this
// over their pub/sub client; tests and the probe binary use the loopback.
use async_trait::async_trait;
use bytes::Bytes;

/// Server-assigned identifier returned for a successful publish.
pub type DeliveryId = u64;

#[derive(thiserror::Error, Debug, Clone)]
pub enum TransportError {
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("topic not found: {0}")]
    TopicNotFound(String),
}

/// Client-facing publish operations. At-least-once redelivery and retry
/// policy belong to the implementation, never to the callers here.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<DeliveryId, TransportError>;

    /// One coalesced send carrying several payloads; used by the batched
    /// admission policy. Returns one delivery id per payload, in order.
    async fn publish_batch(
        &self,
        topic: &str,
        payloads: Vec<Bytes>,
    ) -> Result<Vec<DeliveryId>, TransportError>;
}
