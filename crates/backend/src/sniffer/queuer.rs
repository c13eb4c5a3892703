//! Queue stage: filtered providers become queued work.

use std::sync::Arc;

use cidsift_core::{AnnotatedResource, Provider, Source};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, trace};

use super::SnifferError;
use crate::queue::Publisher;

/// Sniffed resources enter at the lowest priority; explicit submissions
/// and directory children outrank them.
const PUBLISH_PRIORITY: u8 = 0;

pub struct Queuer {
  publisher: Arc<dyn Publisher>,
  input: mpsc::Receiver<Provider>,
}

impl Queuer {
  pub fn new(publisher: Arc<dyn Publisher>, input: mpsc::Receiver<Provider>) -> Self {
    Self { publisher, input }
  }

  pub async fn run(mut self, cancel: CancellationToken) -> Result<(), SnifferError> {
    loop {
      let provider = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(SnifferError::Cancelled),
        received = self.input.recv() => match received {
          None => return Ok(()),
          Some(provider) => provider,
        },
      };

      let span = provider.span.clone();
      let resource = AnnotatedResource::new(provider.resource, Source::Sniffer);
      self
        .publisher
        .publish(&resource, PUBLISH_PRIORITY)
        .instrument(span)
        .await?;
      trace!(cid = resource.id(), "queued sniffed resource");
    }
  }
}
