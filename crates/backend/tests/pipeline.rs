//! End-to-end pipeline scenarios over the in-memory implementations:
//! datastore writes through the sniffer into the queue, and queued work
//! through the worker pool into the indexes.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cidsift_backend::crawler::{Crawler, Indexes, Queues};
use cidsift_backend::index::memory::MemoryIndex;
use cidsift_backend::protocol::{Protocol as ProtocolClient, ProtocolError};
use cidsift_backend::queue::memory::MemoryBroker;
use cidsift_backend::queue::{Publisher, PublisherFactory, QueueError};
use cidsift_backend::sniffer::proxy::{Datastore, MemoryDatastore};
use cidsift_backend::sniffer::{Sniffer, SnifferError, event_source::provider_key};
use cidsift_backend::worker::{Pool, PoolSizes};
use cidsift_core::config::{Crawler as CrawlerConfig, Sniffer as SnifferConfig};
use cidsift_core::{AnnotatedResource, ResourceType, Source, Stat};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const CID_A: &str = "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG";
const CID_B: &str = "QmT78zSuBmuS4z925WZfrqQ1qHaJ56DQaTfyMUF7F8ff5o";
const CID_C: &str = "QmPZ9gcCEpqKTo6aq61g2nXGUhM4iCL3ewB6LDXZCtioEB";

fn sniffer_config() -> SnifferConfig {
  SnifferConfig {
    lastseen_expiration_secs: 3600,
    lastseen_prunelen: 16,
    buffer_size: 8,
  }
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
  for _ in 0..200 {
    if condition() {
      return;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn sniffed_providers_are_deduped_and_queued_in_order() {
  let broker = MemoryBroker::new();
  let factory: Arc<dyn PublisherFactory> = broker.clone();
  let sniffer = Arc::new(Sniffer::new(&sniffer_config(), factory, "hashes"));
  let store = sniffer.wrap(MemoryDatastore::new());

  let cancel = CancellationToken::new();
  let sniff = tokio::spawn({
    let sniffer = Arc::clone(&sniffer);
    let cancel = cancel.clone();
    async move { sniffer.sniff(cancel).await }
  });

  // Let the subscription attach before writing.
  tokio::time::sleep(Duration::from_millis(50)).await;

  store.put(provider_key(CID_A, "Peer1"), b"r".to_vec()).unwrap();
  store.put(provider_key(CID_B, "Peer2"), b"r".to_vec()).unwrap();
  store.put(provider_key(CID_C, "Peer3"), b"r".to_vec()).unwrap();
  // Duplicate within the expiration window, from a different peer.
  store.put(provider_key(CID_A, "Peer4"), b"r".to_vec()).unwrap();
  // Syntactic garbage never reaches the queue.
  store.put(provider_key("not-a-cid", "Peer5"), b"r".to_vec()).unwrap();

  let queue = broker.queue("hashes");
  eventually("three queued messages", || queue.published_len() == 3).await;
  // Give the duplicate a chance to (wrongly) land.
  tokio::time::sleep(Duration::from_millis(50)).await;

  let published = queue.published();
  assert_eq!(published.len(), 3);
  let cids: Vec<&str> = published.iter().map(|(_, r)| r.id()).collect();
  assert_eq!(cids, vec![CID_A, CID_B, CID_C], "insertion order preserved");
  for (priority, resource) in &published {
    assert_eq!(*priority, 0, "sniffer ingress publishes at priority 0");
    assert_eq!(resource.source, Source::Sniffer);
  }

  cancel.cancel();
  let result = sniff.await.unwrap();
  assert!(matches!(result, Err(SnifferError::Cancelled)));
}

/// Publisher that fails a fixed number of publishes before recovering.
struct FlakyPublisher {
  inner: Arc<dyn Publisher>,
  failures_left: Arc<AtomicUsize>,
}

#[async_trait]
impl Publisher for FlakyPublisher {
  async fn publish(&self, resource: &AnnotatedResource, priority: u8) -> Result<(), QueueError> {
    if self
      .failures_left
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok()
    {
      return Err(QueueError::Broker("injected transient failure".to_string()));
    }
    self.inner.publish(resource, priority).await
  }
}

struct FlakyFactory {
  broker: Arc<MemoryBroker>,
  failures: Arc<AtomicUsize>,
}

#[async_trait]
impl PublisherFactory for FlakyFactory {
  async fn publisher(&self, queue: &str) -> Result<Arc<dyn Publisher>, QueueError> {
    Ok(Arc::new(FlakyPublisher {
      inner: self.broker.publisher(queue).await?,
      failures_left: Arc::clone(&self.failures),
    }))
  }
}

#[tokio::test]
async fn sniffer_restarts_after_transient_queue_failure() {
  let broker = MemoryBroker::new();
  let factory: Arc<dyn PublisherFactory> = Arc::new(FlakyFactory {
    broker: broker.clone(),
    failures: Arc::new(AtomicUsize::new(1)),
  });

  let sniffer = Arc::new(Sniffer::new(&sniffer_config(), factory, "hashes"));
  let store = sniffer.wrap(MemoryDatastore::new());

  let cancel = CancellationToken::new();
  let sniff = tokio::spawn({
    let sniffer = Arc::clone(&sniffer);
    let cancel = cancel.clone();
    async move { sniffer.sniff(cancel).await }
  });

  tokio::time::sleep(Duration::from_millis(50)).await;

  // This one hits the injected failure and brings the pipeline down.
  store.put(provider_key(CID_A, "Peer1"), b"r".to_vec()).unwrap();

  // Past the 1s restart delay the pipeline must be live again.
  tokio::time::sleep(Duration::from_millis(1400)).await;
  store.put(provider_key(CID_B, "Peer2"), b"r".to_vec()).unwrap();

  let queue = broker.queue("hashes");
  eventually("post-restart publish", || queue.published_len() == 1).await;
  assert_eq!(queue.published()[0].1.id(), CID_B);

  cancel.cancel();
  let result = sniff.await.unwrap();
  assert!(matches!(result, Err(SnifferError::Cancelled)));
}

#[tokio::test]
async fn cancellation_during_restart_sleep_returns_instead_of_restarting() {
  let broker = MemoryBroker::new();
  // Every publish fails: the supervisor ends up in its restart sleep.
  let factory: Arc<dyn PublisherFactory> = Arc::new(FlakyFactory {
    broker,
    failures: Arc::new(AtomicUsize::new(usize::MAX)),
  });

  let sniffer = Arc::new(Sniffer::new(&sniffer_config(), factory, "hashes"));
  let store = sniffer.wrap(MemoryDatastore::new());

  let cancel = CancellationToken::new();
  let sniff = tokio::spawn({
    let sniffer = Arc::clone(&sniffer);
    let cancel = cancel.clone();
    async move { sniffer.sniff(cancel).await }
  });

  tokio::time::sleep(Duration::from_millis(50)).await;
  store.put(provider_key(CID_A, "Peer1"), b"r".to_vec()).unwrap();

  // Cancel well inside the restart delay.
  tokio::time::sleep(Duration::from_millis(300)).await;
  let cancelled_at = Instant::now();
  cancel.cancel();

  let result = sniff.await.unwrap();
  assert!(matches!(result, Err(SnifferError::Cancelled)));
  assert!(
    cancelled_at.elapsed() < Duration::from_millis(500),
    "supervisor must return promptly, not finish the restart sleep"
  );
}

/// Minimal protocol stub: every CID stats as a 100-byte file.
struct FileProtocol;

#[async_trait]
impl ProtocolClient for FileProtocol {
  async fn stat(&self, resource: &mut AnnotatedResource) -> Result<(), ProtocolError> {
    resource.stat = Stat {
      resource_type: ResourceType::File,
      size: 100,
    };
    Ok(())
  }

  async fn ls(&self, _: &AnnotatedResource, _: mpsc::Sender<AnnotatedResource>) -> Result<(), ProtocolError> {
    Ok(())
  }

  fn gateway_url(&self, resource: &AnnotatedResource) -> String {
    format!("http://gateway.test/ipfs/{}", resource.id())
  }
}

#[tokio::test]
async fn sniffed_cid_flows_through_workers_into_the_files_index() {
  let broker = MemoryBroker::new();
  let factory: Arc<dyn PublisherFactory> = broker.clone();
  let sniffer = Arc::new(Sniffer::new(&sniffer_config(), factory, "hashes"));
  let store = sniffer.wrap(MemoryDatastore::new());

  let files = Arc::new(MemoryIndex::new("files"));
  let indexes = Indexes {
    files: files.clone(),
    directories: Arc::new(MemoryIndex::new("directories")),
    invalids: Arc::new(MemoryIndex::new("invalids")),
    partials: Arc::new(MemoryIndex::new("partials")),
  };
  let queues = Queues {
    files: broker.publisher("files").await.unwrap(),
    directories: broker.publisher("directories").await.unwrap(),
    hashes: broker.publisher("hashes").await.unwrap(),
  };
  let crawler = Crawler::new(CrawlerConfig::default(), indexes, queues, Arc::new(FileProtocol), Vec::new());

  let cancel = CancellationToken::new();

  let sniff = tokio::spawn({
    let sniffer = Arc::clone(&sniffer);
    let cancel = cancel.clone();
    async move { sniffer.sniff(cancel).await }
  });

  let mut pool = Pool::new(
    crawler,
    PoolSizes {
      hashes: 2,
      files: 1,
      directories: 1,
    },
  );
  pool
    .start(
      cancel.clone(),
      &broker.consumer("files"),
      &broker.consumer("directories"),
      &broker.consumer("hashes"),
    )
    .await
    .unwrap();

  tokio::time::sleep(Duration::from_millis(50)).await;
  store.put(provider_key(CID_A, "Peer1"), b"r".to_vec()).unwrap();

  eventually("file document indexed", || files.doc(CID_A).is_some()).await;

  let doc = files.doc(CID_A).unwrap();
  assert_eq!(doc["size"], 100);
  assert_eq!(doc["first-seen"], doc["last-seen"]);

  cancel.cancel();
  pool.join().await;
  let _ = sniff.await.unwrap();
}
