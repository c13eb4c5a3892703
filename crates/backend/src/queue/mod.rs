//! Message broker contracts.
//!
//! The broker decouples ingress from the crawler pool: publishers push
//! serialized [`AnnotatedResource`]s with a priority, consumers pull
//! [`Delivery`]s and settle them with ack / nack-with-requeue. [`amqp`]
//! speaks to a real broker; [`memory`] is the in-process double.

pub mod amqp;
pub mod memory;

use async_trait::async_trait;
use cidsift_core::AnnotatedResource;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Highest priority, used by explicit `add` submissions.
pub const MANUAL_PRIORITY: u8 = 9;

#[derive(Debug, Error)]
pub enum QueueError {
  #[error("broker: {0}")]
  Broker(String),

  #[error("encoding message: {0}")]
  Encoding(#[from] serde_json::Error),

  #[error("queue closed")]
  Closed,
}

impl From<lapin::Error> for QueueError {
  fn from(e: lapin::Error) -> Self {
    QueueError::Broker(e.to_string())
  }
}

#[async_trait]
pub trait Publisher: Send + Sync {
  async fn publish(&self, resource: &AnnotatedResource, priority: u8) -> Result<(), QueueError>;
}

/// Creates publishers bound to named queues; connection state is shared
/// behind the factory.
#[async_trait]
pub trait PublisherFactory: Send + Sync {
  async fn publisher(&self, queue: &str) -> Result<std::sync::Arc<dyn Publisher>, QueueError>;
}

/// Settles one delivery. Consumed on first use.
#[async_trait]
pub trait Acker: Send {
  async fn ack(self: Box<Self>) -> Result<(), QueueError>;
  async fn nack(self: Box<Self>, requeue: bool) -> Result<(), QueueError>;
}

/// One message pulled from a queue.
pub struct Delivery {
  body: Vec<u8>,
  acker: Box<dyn Acker>,
}

impl Delivery {
  pub fn new(body: Vec<u8>, acker: Box<dyn Acker>) -> Self {
    Self { body, acker }
  }

  pub fn decode(&self) -> Result<AnnotatedResource, QueueError> {
    Ok(serde_json::from_slice(&self.body)?)
  }

  pub async fn ack(self) -> Result<(), QueueError> {
    self.acker.ack().await
  }

  pub async fn nack(self, requeue: bool) -> Result<(), QueueError> {
    self.acker.nack(requeue).await
  }
}

/// Source of deliveries from one named queue.
#[async_trait]
pub trait Consumer: Send + Sync {
  /// Start consuming. Deliveries arrive on the returned channel until the
  /// token is cancelled or the broker connection drops.
  async fn consume(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<Delivery>, QueueError>;
}
