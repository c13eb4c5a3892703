//! Crawler worker pool.
//!
//! A fixed number of workers per queue, all pulling from one shared
//! delivery channel. Outcomes decide settlement: success and terminal
//! failures (panics, invalid resources, malformed payloads) acknowledge;
//! transient failures nack with requeue and let the broker redeliver.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::crawler::Crawler;
use crate::queue::{Consumer, Delivery, QueueError};

#[derive(Debug, Error)]
pub enum WorkerError {
  #[error(transparent)]
  Queue(#[from] QueueError),
}

/// Worker counts per queue type.
#[derive(Debug, Clone, Copy)]
pub struct PoolSizes {
  pub hashes: usize,
  pub files: usize,
  pub directories: usize,
}

impl From<&cidsift_core::config::Workers> for PoolSizes {
  fn from(cfg: &cidsift_core::config::Workers) -> Self {
    Self {
      hashes: cfg.hash_workers,
      files: cfg.file_workers,
      directories: cfg.directory_workers,
    }
  }
}

pub struct Pool {
  crawler: Crawler,
  sizes: PoolSizes,
  workers: JoinSet<()>,
}

impl Pool {
  pub fn new(crawler: Crawler, sizes: PoolSizes) -> Self {
    Self {
      crawler,
      sizes,
      workers: JoinSet::new(),
    }
  }

  /// Start all workers. Consumption stops when `cancel` fires; in-flight
  /// deliveries are settled before workers exit.
  pub async fn start(
    &mut self,
    cancel: CancellationToken,
    files: &dyn Consumer,
    directories: &dyn Consumer,
    hashes: &dyn Consumer,
  ) -> Result<(), WorkerError> {
    self
      .start_workers(cancel.clone(), "files", files, self.sizes.files)
      .await?;
    self
      .start_workers(cancel.clone(), "directories", directories, self.sizes.directories)
      .await?;
    self.start_workers(cancel, "hashes", hashes, self.sizes.hashes).await?;
    Ok(())
  }

  /// Wait for every worker to settle its current delivery and exit.
  pub async fn join(&mut self) {
    while let Some(joined) = self.workers.join_next().await {
      if let Err(e) = joined
        && e.is_panic()
      {
        error!(error = %e, "worker task panicked");
      }
    }
  }

  async fn start_workers(
    &mut self,
    cancel: CancellationToken,
    pool_name: &str,
    consumer: &dyn Consumer,
    workers: usize,
  ) -> Result<(), WorkerError> {
    info!(pool = pool_name, workers, "starting workers");

    let deliveries = consumer.consume(cancel.clone()).await?;
    let shared = Arc::new(Mutex::new(deliveries));

    for worker_id in 0..workers {
      let name = format!("{pool_name}-{worker_id}");
      let crawler = self.crawler.clone();
      let rx = Arc::clone(&shared);
      let cancel = cancel.clone();
      self.workers.spawn(worker_loop(name, crawler, rx, cancel));
    }

    Ok(())
  }
}

async fn worker_loop(
  name: String,
  crawler: Crawler,
  deliveries: Arc<Mutex<mpsc::Receiver<Delivery>>>,
  cancel: CancellationToken,
) {
  loop {
    // Hold the lock only while waiting for one delivery, like every
    // other worker in the pool.
    let delivery = {
      let mut rx = deliveries.lock().await;
      tokio::select! {
        biased;
        _ = cancel.cancelled() => break,
        received = rx.recv() => match received {
          Some(delivery) => delivery,
          None => break,
        },
      }
    };

    handle_delivery(&name, &crawler, &cancel, delivery).await;
  }

  debug!(worker = %name, "worker stopped");
}

async fn handle_delivery(name: &str, crawler: &Crawler, cancel: &CancellationToken, delivery: Delivery) {
  let mut resource = match delivery.decode() {
    Ok(resource) => resource,
    Err(e) => {
      // A payload that cannot be decoded never will be; drop it.
      error!(worker = name, error = %e, "discarding malformed delivery");
      settle(delivery.ack().await);
      return;
    }
  };

  let outcome = AssertUnwindSafe(crawler.crawl(cancel, &mut resource))
    .catch_unwind()
    .await;

  match outcome {
    Err(_) => {
      // The panic payload was already reported by the panic hook; the
      // message must not be retried.
      error!(worker = name, cid = resource.id(), "crawl panicked, dropping delivery");
      settle(delivery.ack().await);
    }
    Ok(Ok(())) => {
      settle(delivery.ack().await);
    }
    Ok(Err(e)) if e.is_invalid() => {
      // Already recorded in the invalids index; done with it.
      settle(delivery.ack().await);
    }
    Ok(Err(e)) if cancel.is_cancelled() => {
      debug!(worker = name, cid = resource.id(), error = %e, "requeueing delivery on shutdown");
      settle(delivery.nack(true).await);
    }
    Ok(Err(e)) => {
      warn!(worker = name, cid = resource.id(), error = %e, "crawl failed, requeueing");
      settle(delivery.nack(true).await);
    }
  }
}

fn settle(result: Result<(), QueueError>) {
  if let Err(e) = result {
    warn!(error = %e, "failed to settle delivery");
  }
}
