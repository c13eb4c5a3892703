//! Channel-to-channel filter driver.

use cidsift_core::Provider;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::SnifferError;
use super::filters::ProviderFilter;

/// Drains the input channel, forwards accepted providers to the output.
/// The output channel closes when this stage ends (the sender drops).
pub struct StreamFilter<F> {
  filter: F,
  input: mpsc::Receiver<Provider>,
  output: mpsc::Sender<Provider>,
}

impl<F: ProviderFilter> StreamFilter<F> {
  pub fn new(filter: F, input: mpsc::Receiver<Provider>, output: mpsc::Sender<Provider>) -> Self {
    Self { filter, input, output }
  }

  pub async fn run(mut self, cancel: CancellationToken) -> Result<(), SnifferError> {
    loop {
      tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(SnifferError::Cancelled),
        received = self.input.recv() => match received {
          None => return Ok(()),
          Some(provider) => {
            if self.filter.accept(&provider) {
              self
                .output
                .send(provider)
                .await
                .map_err(|_| SnifferError::ChannelClosed)?;
            } else {
              trace!(provider = %provider, "filtered out");
            }
          }
        },
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use chrono::Utc;
  use cidsift_core::Resource;

  use super::*;
  use crate::sniffer::filters::{LastSeenFilter, MultiFilter};
  use std::time::Duration;

  fn provider(cid: &str) -> Provider {
    Provider {
      resource: Resource::ipfs(cid),
      date: Utc::now(),
      provider: "Peer".to_string(),
      span: tracing::Span::none(),
    }
  }

  #[tokio::test]
  async fn forwards_survivors_and_drops_duplicates() {
    let (in_tx, in_rx) = mpsc::channel(8);
    let (out_tx, mut out_rx) = mpsc::channel(8);

    let filter = MultiFilter::new(vec![Box::new(LastSeenFilter::new(Duration::from_secs(60), 16))]);
    let stage = StreamFilter::new(filter, in_rx, out_tx);
    let handle = tokio::spawn(stage.run(CancellationToken::new()));

    in_tx.send(provider("QmA")).await.unwrap();
    in_tx.send(provider("QmA")).await.unwrap();
    in_tx.send(provider("QmB")).await.unwrap();
    drop(in_tx);

    assert_eq!(out_rx.recv().await.unwrap().resource.id, "QmA");
    assert_eq!(out_rx.recv().await.unwrap().resource.id, "QmB");
    assert!(out_rx.recv().await.is_none(), "output closes on input close");

    handle.await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn cancellation_stops_the_stage() {
    let (_in_tx, in_rx) = mpsc::channel::<Provider>(1);
    let (out_tx, _out_rx) = mpsc::channel(1);

    let filter = MultiFilter::new(vec![]);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(StreamFilter::new(filter, in_rx, out_tx).run(cancel.clone()));

    cancel.cancel();
    let result = handle.await.unwrap();
    assert!(matches!(result, Err(SnifferError::Cancelled)));
  }
}
