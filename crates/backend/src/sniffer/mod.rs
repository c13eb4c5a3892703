//! Sniffer: passive ingress from a DHT node's datastore.
//!
//! ```text
//! datastore (proxied) → event source → subscribe → [sniffed]
//!   → filter (last-seen ∧ cid) → [filtered] → queue → broker
//! ```
//!
//! The three stages run in a task group: the first error cancels the other
//! two, the supervisor logs it and restarts the whole pipeline after a
//! fixed delay. Only parent cancellation ends the loop.

pub mod event_source;
pub mod filters;
pub mod handler;
pub mod proxy;
pub mod queuer;
pub mod stream_filter;

use std::sync::Arc;
use std::time::Duration;

use cidsift_core::config::Sniffer as SnifferConfig;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use self::event_source::EventSource;
use self::filters::{CidFilter, LastSeenFilter, MultiFilter};
use self::handler::Handler;
use self::proxy::{Datastore, HookedDatastore};
use self::queuer::Queuer;
use self::stream_filter::StreamFilter;
use crate::queue::{PublisherFactory, QueueError};
use crate::taskgroup::TaskGroup;

// TODO: replace the fixed delay with a circuit breaker once restart storms
// show up in production metrics.
const RESTART_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SnifferError {
  #[error("cancelled")]
  Cancelled,

  #[error("event handler timed out")]
  HandlerTimeout,

  #[error("event bus closed")]
  BusClosed,

  #[error("stage channel closed")]
  ChannelClosed,

  #[error(transparent)]
  Queue(#[from] QueueError),
}

pub struct Sniffer {
  cfg: SnifferConfig,
  events: EventSource,
  factory: Arc<dyn PublisherFactory>,
  queue_name: String,
}

impl Sniffer {
  pub fn new(cfg: &SnifferConfig, factory: Arc<dyn PublisherFactory>, queue_name: impl Into<String>) -> Self {
    Self {
      cfg: cfg.clone(),
      events: EventSource::new(),
      factory,
      queue_name: queue_name.into(),
    }
  }

  /// Proxy a datastore through the event source. The node must use the
  /// returned store in place of the original for writes to be observed.
  pub fn wrap<D: Datastore>(&self, datastore: D) -> HookedDatastore<D> {
    self.events.wrap(datastore)
  }

  /// One pipeline run: three stages, two bounded channels, first error
  /// cancels the siblings, first error is returned.
  async fn iterate(&self, cancel: &CancellationToken) -> Result<(), SnifferError> {
    let (sniffed_tx, sniffed_rx) = mpsc::channel(self.cfg.buffer_size);
    let (filtered_tx, filtered_rx) = mpsc::channel(self.cfg.buffer_size);

    let publisher = self.factory.publisher(&self.queue_name).await?;

    let mut group: TaskGroup<SnifferError> = TaskGroup::new(cancel);

    let events = self.events.clone();
    let subscribe_token = group.token();
    group.spawn(async move {
      let handler = Handler::new(sniffed_tx);
      events
        .subscribe(subscribe_token, move |event| {
          let handler = handler.clone();
          async move { handler.handle(event).await }
        })
        .await
    });

    let filter = MultiFilter::new(vec![
      Box::new(LastSeenFilter::new(
        self.cfg.lastseen_expiration(),
        self.cfg.lastseen_prunelen,
      )),
      Box::new(CidFilter::new()),
    ]);
    group.spawn(StreamFilter::new(filter, sniffed_rx, filtered_tx).run(group.token()));

    group.spawn(Queuer::new(publisher, filtered_rx).run(group.token()));

    group.wait().await
  }

  /// Sniff until the parent context is cancelled, restarting the pipeline
  /// on intermittent errors.
  pub async fn sniff(&self, cancel: CancellationToken) -> Result<(), SnifferError> {
    info!(queue = %self.queue_name, buffer_size = self.cfg.buffer_size, "sniffer starting");

    loop {
      let error = match self.iterate(&cancel).await {
        // Stages only finish cleanly when a sibling's channel closed
        // under them; treat it like any other pipeline failure.
        Ok(()) => SnifferError::ChannelClosed,
        Err(e) => e,
      };

      if cancel.is_cancelled() {
        info!("sniffer stopping: parent cancelled");
        return Err(SnifferError::Cancelled);
      }

      warn!(error = %error, "sniffer pipeline failed, restarting");

      tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(SnifferError::Cancelled),
        _ = tokio::time::sleep(RESTART_DELAY) => {}
      }
    }
  }
}
