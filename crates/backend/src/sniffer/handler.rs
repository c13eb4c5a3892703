//! Event-to-provider bridge between the bus and the filter stage.

use chrono::Utc;
use cidsift_core::{Provider, Resource};
use tokio::sync::mpsc;

use super::SnifferError;
use super::event_source::ProviderPut;

#[derive(Clone)]
pub struct Handler {
  providers: mpsc::Sender<Provider>,
}

impl Handler {
  pub fn new(providers: mpsc::Sender<Provider>) -> Self {
    Self { providers }
  }

  /// Convert one bus event into a [`Provider`] and push it downstream.
  /// Blocks when the channel is full; that backpressure is what pauses
  /// bus draining when the pipeline is slow.
  pub async fn handle(&self, event: ProviderPut) -> Result<(), SnifferError> {
    let provider = Provider {
      resource: Resource::ipfs(event.cid),
      date: Utc::now(),
      provider: event.peer_id,
      span: event.span,
    };

    self
      .providers
      .send(provider)
      .await
      .map_err(|_| SnifferError::ChannelClosed)
  }
}
