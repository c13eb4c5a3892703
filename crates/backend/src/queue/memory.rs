//! In-process broker.
//!
//! Priority-ordered queues over a shared heap; FIFO within a priority.
//! Backs the test suites and single-process development setups.

use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cidsift_core::AnnotatedResource;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use super::{Acker, Consumer, Delivery, Publisher, PublisherFactory, QueueError};

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueuedMessage {
  priority: u8,
  seq: u64,
  body: Vec<u8>,
}

impl Ord for QueuedMessage {
  fn cmp(&self, other: &Self) -> std::cmp::Ordering {
    // Max-heap: highest priority first, then lowest sequence (FIFO).
    self
      .priority
      .cmp(&other.priority)
      .then_with(|| other.seq.cmp(&self.seq))
  }
}

impl PartialOrd for QueuedMessage {
  fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
    Some(self.cmp(other))
  }
}

#[derive(Debug, Default)]
struct QueueState {
  heap: BinaryHeap<QueuedMessage>,
  published: Vec<QueuedMessage>,
  next_seq: u64,
}

/// One named in-memory queue.
#[derive(Debug, Default)]
pub struct MemoryQueue {
  state: Mutex<QueueState>,
  notify: Notify,
}

impl MemoryQueue {
  fn push(&self, priority: u8, body: Vec<u8>) {
    let mut state = self.state.lock().unwrap();
    let message = QueuedMessage {
      priority,
      seq: state.next_seq,
      body,
    };
    state.next_seq += 1;
    state.published.push(message.clone());
    state.heap.push(message);
    drop(state);
    // notify_one stores a permit, so a push racing the consumer between
    // its pop and its wait is not lost.
    self.notify.notify_one();
  }

  /// Enqueue a raw body, bypassing serialization.
  pub fn push_raw(&self, priority: u8, body: Vec<u8>) {
    self.push(priority, body);
  }

  fn pop(&self) -> Option<(u8, Vec<u8>)> {
    let mut state = self.state.lock().unwrap();
    state.heap.pop().map(|m| (m.priority, m.body))
  }

  /// Everything ever published to this queue, in publish order, decoded.
  pub fn published(&self) -> Vec<(u8, AnnotatedResource)> {
    let state = self.state.lock().unwrap();
    state
      .published
      .iter()
      .filter_map(|m| serde_json::from_slice(&m.body).ok().map(|r| (m.priority, r)))
      .collect()
  }

  pub fn published_len(&self) -> usize {
    self.state.lock().unwrap().published.len()
  }

  pub fn pending_len(&self) -> usize {
    self.state.lock().unwrap().heap.len()
  }
}

/// In-process broker handing out publishers and consumers per queue name.
#[derive(Debug, Default)]
pub struct MemoryBroker {
  queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
}

impl MemoryBroker {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn queue(&self, name: &str) -> Arc<MemoryQueue> {
    let mut queues = self.queues.lock().unwrap();
    Arc::clone(queues.entry(name.to_string()).or_default())
  }

  pub fn consumer(&self, name: &str) -> MemoryConsumer {
    MemoryConsumer {
      queue: self.queue(name),
    }
  }
}

#[async_trait]
impl PublisherFactory for MemoryBroker {
  async fn publisher(&self, queue: &str) -> Result<Arc<dyn Publisher>, QueueError> {
    Ok(Arc::new(MemoryPublisher {
      queue: self.queue(queue),
    }))
  }
}

pub struct MemoryPublisher {
  queue: Arc<MemoryQueue>,
}

#[async_trait]
impl Publisher for MemoryPublisher {
  async fn publish(&self, resource: &AnnotatedResource, priority: u8) -> Result<(), QueueError> {
    let body = serde_json::to_vec(resource)?;
    self.queue.push(priority, body);
    Ok(())
  }
}

pub struct MemoryConsumer {
  queue: Arc<MemoryQueue>,
}

#[async_trait]
impl Consumer for MemoryConsumer {
  async fn consume(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<Delivery>, QueueError> {
    let (tx, rx) = mpsc::channel(16);
    let queue = Arc::clone(&self.queue);

    tokio::spawn(async move {
      loop {
        let message = loop {
          if let Some(message) = queue.pop() {
            break message;
          }
          tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = queue.notify.notified() => {}
          }
        };

        let (_, body) = message;
        let delivery = Delivery::new(
          body.clone(),
          Box::new(MemoryAcker {
            queue: Arc::clone(&queue),
            body,
          }),
        );

        tokio::select! {
          biased;
          _ = cancel.cancelled() => return,
          sent = tx.send(delivery) => {
            if sent.is_err() {
              return;
            }
          }
        }
      }
    });

    Ok(rx)
  }
}

struct MemoryAcker {
  queue: Arc<MemoryQueue>,
  body: Vec<u8>,
}

#[async_trait]
impl Acker for MemoryAcker {
  async fn ack(self: Box<Self>) -> Result<(), QueueError> {
    Ok(())
  }

  async fn nack(self: Box<Self>, requeue: bool) -> Result<(), QueueError> {
    if requeue {
      // Requeued messages re-enter at default priority order.
      self.queue.push(0, self.body);
    }
    Ok(())
  }
}
