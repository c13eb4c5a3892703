//! Background batching writer.
//!
//! Writes are enqueued as pre-serialized `_bulk` payload fragments and
//! flushed whenever the pending byte count reaches the configured
//! threshold or the oldest pending item has waited long enough. Failed
//! items are logged and dropped; the queue redelivers their source
//! messages eventually.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, trace};

use super::{BulkResponse, SearchTransport};
use crate::index::IndexError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkAction {
  Create,
  Update,
  Delete,
}

enum Msg {
  Op(String),
  Close(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct BulkIndexer {
  tx: mpsc::Sender<Msg>,
}

impl BulkIndexer {
  pub fn new(transport: Arc<dyn SearchTransport>, workers: usize, flush_bytes: usize, flush_timeout: Duration) -> Self {
    let (tx, rx) = mpsc::channel(1024);
    tokio::spawn(scheduler(transport, rx, workers.max(1), flush_bytes, flush_timeout));
    Self { tx }
  }

  /// Enqueue one operation. Writes to the same id from the same task keep
  /// their order; nothing is ordered across tasks.
  pub async fn add(&self, action: BulkAction, index: &str, id: &str, body: Option<&Value>) -> Result<(), IndexError> {
    let payload = encode_op(action, index, id, body)?;
    self.tx.send(Msg::Op(payload)).await.map_err(|_| IndexError::Closed)
  }

  /// Flush pending operations, wait for in-flight requests, stop.
  pub async fn close(&self) {
    let (done_tx, done_rx) = oneshot::channel();
    if self.tx.send(Msg::Close(done_tx)).await.is_ok() {
      let _ = done_rx.await;
    }
  }
}

/// Serialize one op as its `_bulk` action line plus optional body line.
/// Update bodies are wrapped in the `{"doc": …}` envelope the backend
/// expects for partial updates.
fn encode_op(action: BulkAction, index: &str, id: &str, body: Option<&Value>) -> Result<String, IndexError> {
  let verb = match action {
    BulkAction::Create => "create",
    BulkAction::Update => "update",
    BulkAction::Delete => "delete",
  };
  let mut payload = serde_json::to_string(&json!({ verb: { "_index": index, "_id": id } }))?;
  payload.push('\n');

  if let Some(body) = body {
    let body = match action {
      BulkAction::Update => json!({ "doc": body }),
      _ => body.clone(),
    };
    payload.push_str(&serde_json::to_string(&body)?);
    payload.push('\n');
  }
  Ok(payload)
}

async fn scheduler(
  transport: Arc<dyn SearchTransport>,
  mut rx: mpsc::Receiver<Msg>,
  workers: usize,
  flush_bytes: usize,
  flush_timeout: Duration,
) {
  let mut pending: Vec<String> = Vec::new();
  let mut pending_bytes = 0usize;
  let mut oldest: Option<Instant> = None;
  let semaphore = Arc::new(Semaphore::new(workers));
  let mut flushes: JoinSet<()> = JoinSet::new();

  debug!(workers, flush_bytes, flush_timeout_ms = flush_timeout.as_millis() as u64, "bulk indexer starting");

  loop {
    tokio::select! {
      biased;

      msg = rx.recv() => match msg {
        Some(Msg::Op(payload)) => {
          pending_bytes += payload.len();
          pending.push(payload);
          oldest.get_or_insert_with(Instant::now);

          if pending_bytes >= flush_bytes {
            spawn_flush(&transport, &semaphore, &mut flushes, std::mem::take(&mut pending));
            pending_bytes = 0;
            oldest = None;
          }
        }
        Some(Msg::Close(done)) => {
          while let Ok(msg) = rx.try_recv() {
            if let Msg::Op(payload) = msg {
              pending.push(payload);
            }
          }
          if !pending.is_empty() {
            spawn_flush(&transport, &semaphore, &mut flushes, std::mem::take(&mut pending));
          }
          while flushes.join_next().await.is_some() {}
          let _ = done.send(());
          debug!("bulk indexer closed");
          return;
        }
        None => {
          if !pending.is_empty() {
            spawn_flush(&transport, &semaphore, &mut flushes, std::mem::take(&mut pending));
          }
          while flushes.join_next().await.is_some() {}
          return;
        }
      },

      _ = deadline(oldest, flush_timeout), if oldest.is_some() => {
        trace!(items = pending.len(), bytes = pending_bytes, "timeout flush");
        spawn_flush(&transport, &semaphore, &mut flushes, std::mem::take(&mut pending));
        pending_bytes = 0;
        oldest = None;
      }

      Some(_) = flushes.join_next(), if !flushes.is_empty() => {}
    }
  }
}

async fn deadline(oldest: Option<Instant>, flush_timeout: Duration) {
  match oldest {
    Some(at) => tokio::time::sleep_until(at + flush_timeout).await,
    None => std::future::pending().await,
  }
}

fn spawn_flush(
  transport: &Arc<dyn SearchTransport>,
  semaphore: &Arc<Semaphore>,
  flushes: &mut JoinSet<()>,
  ops: Vec<String>,
) {
  let transport = Arc::clone(transport);
  let semaphore = Arc::clone(semaphore);

  flushes.spawn(async move {
    let Ok(_permit) = semaphore.acquire_owned().await else {
      return;
    };

    let items = ops.len();
    match transport.bulk(ops.concat()).await {
      Ok(response) => {
        log_item_failures(&response);
        trace!(items, "flushed index buffer");
      }
      Err(e) => error!(error = %e, items, "bulk flush failed"),
    }
  });
}

/// Per-item failures are terminal here: the source message is redelivered
/// by the queue if the write mattered.
fn log_item_failures(response: &BulkResponse) {
  if !response.errors {
    return;
  }
  for item in &response.items {
    let Some((action, detail)) = item.as_object().and_then(|o| o.iter().next()) else {
      continue;
    };
    if let Some(error) = detail.get("error") {
      error!(
        action,
        id = detail.get("_id").and_then(serde_json::Value::as_str).unwrap_or(""),
        error = %error,
        "bulk item failed"
      );
    }
  }
}
