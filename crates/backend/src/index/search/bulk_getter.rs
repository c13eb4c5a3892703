//! Batched multi-get coalescer.
//!
//! Callers enqueue a request and immediately receive a channel carrying
//! exactly one result. The worker accumulates requests until the batch is
//! full or the batch's first request has waited `batch_timeout`, then
//! issues a single `_mget`. Identical `(index, id, fields)` requests share
//! one backend document: at most one fetch in flight per key-set.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{MgetDoc, SearchTransport};
use crate::index::IndexError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GetRequest {
  pub index: String,
  pub doc_id: String,
  /// Source projection; empty fetches the whole document.
  pub fields: Vec<String>,
}

pub type GetResult = Result<Option<Value>, IndexError>;

struct ReqResp {
  req: GetRequest,
  resp: oneshot::Sender<GetResult>,
}

#[derive(Clone)]
pub struct BulkGetter {
  tx: mpsc::Sender<ReqResp>,
}

impl BulkGetter {
  pub fn new(
    transport: Arc<dyn SearchTransport>,
    batch_size: usize,
    batch_timeout: Duration,
    cancel: CancellationToken,
  ) -> Self {
    let (tx, rx) = mpsc::channel(1024);
    tokio::spawn(worker(transport, rx, batch_size.max(1), batch_timeout, cancel));
    Self { tx }
  }

  /// Enqueue a request; the returned channel receives exactly one result.
  pub async fn get(&self, req: GetRequest) -> oneshot::Receiver<GetResult> {
    let (resp, rx) = oneshot::channel();
    if let Err(send_error) = self.tx.send(ReqResp { req, resp }).await {
      let _ = send_error.0.resp.send(Err(IndexError::Closed));
    }
    rx
  }
}

struct Batch {
  keys: Vec<GetRequest>,
  waiters: HashMap<GetRequest, Vec<oneshot::Sender<GetResult>>>,
  started: Instant,
}

impl Batch {
  fn new(first: ReqResp) -> Self {
    let mut batch = Self {
      keys: Vec::new(),
      waiters: HashMap::new(),
      started: Instant::now(),
    };
    batch.add(first);
    batch
  }

  fn add(&mut self, rr: ReqResp) {
    let entry = self.waiters.entry(rr.req.clone()).or_default();
    if entry.is_empty() {
      self.keys.push(rr.req);
    }
    entry.push(rr.resp);
  }

  fn len(&self) -> usize {
    self.keys.len()
  }
}

async fn worker(
  transport: Arc<dyn SearchTransport>,
  mut rx: mpsc::Receiver<ReqResp>,
  batch_size: usize,
  batch_timeout: Duration,
  cancel: CancellationToken,
) {
  debug!(batch_size, batch_timeout_ms = batch_timeout.as_millis() as u64, "bulk getter starting");

  'outer: loop {
    let first = tokio::select! {
      biased;
      _ = cancel.cancelled() => break 'outer,
      msg = rx.recv() => match msg {
        Some(msg) => msg,
        None => break 'outer,
      },
    };

    let mut batch = Batch::new(first);
    let deadline = batch.started + batch_timeout;
    let mut input_open = true;

    while batch.len() < batch_size && input_open {
      tokio::select! {
        biased;
        _ = cancel.cancelled() => {
          fan_out_error(batch, &IndexError::Closed);
          break 'outer;
        }
        _ = tokio::time::sleep_until(deadline) => break,
        msg = rx.recv() => match msg {
          Some(msg) => batch.add(msg),
          None => input_open = false,
        },
      }
    }

    execute(&transport, batch).await;
    if !input_open {
      break;
    }
  }

  debug!("bulk getter stopped");
}

async fn execute(transport: &Arc<dyn SearchTransport>, batch: Batch) {
  let Batch { keys, mut waiters, .. } = batch;
  trace!(keys = keys.len(), "multi-get");

  let docs: Vec<MgetDoc> = keys
    .iter()
    .map(|key| MgetDoc {
      index: key.index.clone(),
      id: key.doc_id.clone(),
      source: if key.fields.is_empty() {
        Value::Bool(true)
      } else {
        Value::from(key.fields.clone())
      },
    })
    .collect();

  let response = match transport.mget(&docs).await {
    Ok(response) => response,
    Err(e) => {
      warn!(error = %e, keys = keys.len(), "multi-get failed");
      let message = e.to_string();
      for senders in waiters.into_values() {
        for sender in senders {
          let _ = sender.send(Err(IndexError::Backend(message.clone())));
        }
      }
      return;
    }
  };

  if response.docs.len() != keys.len() {
    let detail = format!("mget returned {} docs for {} requests", response.docs.len(), keys.len());
    for senders in waiters.into_values() {
      for sender in senders {
        let _ = sender.send(Err(IndexError::UnexpectedResponse(detail.clone())));
      }
    }
    return;
  }

  // Responses are positional: one hit per requested key-set.
  for (key, hit) in keys.into_iter().zip(response.docs) {
    let source = if hit.found {
      Some(hit.source.unwrap_or(Value::Null))
    } else {
      None
    };

    if let Some(senders) = waiters.remove(&key) {
      for sender in senders {
        let _ = sender.send(Ok(source.clone()));
      }
    }
  }
}

fn fan_out_error(batch: Batch, error: &IndexError) {
  let message = error.to_string();
  for senders in batch.waiters.into_values() {
    for sender in senders {
      let _ = sender.send(Err(IndexError::Backend(message.clone())));
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Mutex;

  use async_trait::async_trait;
  use serde_json::json;

  use super::*;
  use crate::index::search::{BulkResponse, MgetHit, MgetResponse};

  struct StubTransport {
    docs: HashMap<String, Value>,
    fail: bool,
    calls: Mutex<Vec<usize>>,
  }

  impl StubTransport {
    fn with_docs(docs: &[(&str, Value)]) -> Arc<Self> {
      Arc::new(Self {
        docs: docs.iter().map(|(id, v)| (id.to_string(), v.clone())).collect(),
        fail: false,
        calls: Mutex::new(Vec::new()),
      })
    }

    fn failing() -> Arc<Self> {
      Arc::new(Self {
        docs: HashMap::new(),
        fail: true,
        calls: Mutex::new(Vec::new()),
      })
    }

    fn calls(&self) -> Vec<usize> {
      self.calls.lock().unwrap().clone()
    }
  }

  #[async_trait]
  impl SearchTransport for StubTransport {
    async fn bulk(&self, _body: String) -> Result<BulkResponse, IndexError> {
      unimplemented!("not used by the getter")
    }

    async fn mget(&self, docs: &[MgetDoc]) -> Result<MgetResponse, IndexError> {
      self.calls.lock().unwrap().push(docs.len());
      if self.fail {
        return Err(IndexError::Backend("backend down".to_string()));
      }
      Ok(MgetResponse {
        docs: docs
          .iter()
          .map(|doc| match self.docs.get(&doc.id) {
            Some(source) => MgetHit {
              id: doc.id.clone(),
              found: true,
              source: Some(source.clone()),
            },
            None => MgetHit {
              id: doc.id.clone(),
              found: false,
              source: None,
            },
          })
          .collect(),
      })
    }
  }

  fn request(id: &str) -> GetRequest {
    GetRequest {
      index: "files".to_string(),
      doc_id: id.to_string(),
      fields: vec!["references".to_string()],
    }
  }

  #[tokio::test]
  async fn batch_size_one_degenerates_to_single_requests() {
    let transport = StubTransport::with_docs(&[("QmA", json!({"references": []}))]);
    let getter = BulkGetter::new(transport.clone(), 1, Duration::from_secs(10), CancellationToken::new());

    let a = getter.get(request("QmA")).await;
    assert_eq!(a.await.unwrap().unwrap(), Some(json!({"references": []})));

    let b = getter.get(request("QmB")).await;
    assert_eq!(b.await.unwrap().unwrap(), None);

    assert_eq!(transport.calls(), vec![1, 1]);
  }

  #[tokio::test]
  async fn identical_requests_coalesce_into_one_key() {
    let transport = StubTransport::with_docs(&[("QmA", json!({"size": 1}))]);
    let getter = BulkGetter::new(transport.clone(), 2, Duration::from_millis(50), CancellationToken::new());

    let first = getter.get(request("QmA")).await;
    let second = getter.get(request("QmA")).await;

    assert_eq!(first.await.unwrap().unwrap(), Some(json!({"size": 1})));
    assert_eq!(second.await.unwrap().unwrap(), Some(json!({"size": 1})));

    // Two waiters, one backend document.
    assert_eq!(transport.calls(), vec![1]);
  }

  #[tokio::test]
  async fn missing_id_resolves_not_found_without_error() {
    let transport = StubTransport::with_docs(&[]);
    let getter = BulkGetter::new(transport, 4, Duration::from_millis(10), CancellationToken::new());

    let rx = getter.get(request("QmMissing")).await;
    assert_eq!(rx.await.unwrap().unwrap(), None);
  }

  #[tokio::test]
  async fn backend_failure_fans_out_to_every_waiter() {
    let transport = StubTransport::failing();
    let getter = BulkGetter::new(transport, 4, Duration::from_millis(10), CancellationToken::new());

    let a = getter.get(request("QmA")).await;
    let b = getter.get(request("QmB")).await;

    assert!(a.await.unwrap().is_err());
    assert!(b.await.unwrap().is_err());
  }

  #[tokio::test]
  async fn fills_batch_before_timeout() {
    let transport = StubTransport::with_docs(&[]);
    let getter = BulkGetter::new(transport.clone(), 2, Duration::from_secs(10), CancellationToken::new());

    let a = getter.get(request("QmA")).await;
    let b = getter.get(request("QmB")).await;

    assert_eq!(a.await.unwrap().unwrap(), None);
    assert_eq!(b.await.unwrap().unwrap(), None);
    assert_eq!(transport.calls(), vec![2]);
  }
}
