// Publish controller and consumption loop for the delivery measurement
// pipeline. The transport itself is an external collaborator behind the
// `Transport` seam; a loopback implementation is provided for local runs.
mod consumer;
mod controller;
mod loopback;
mod transport;

pub use consumer::{ConsumerConfig, ConsumerLoop};
pub use controller::{
    AdmissionPolicy, BatchResult, OverflowBehavior, PublishController, PublishError,
    PublishOutcome,
};
pub use loopback::{Delivery, LoopbackTransport, Subscription};
pub use transport::{DeliveryId, Transport, TransportError};
