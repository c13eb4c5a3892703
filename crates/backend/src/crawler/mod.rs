//! Crawler core.
//!
//! One call to [`Crawler::crawl`] takes an [`AnnotatedResource`] through
//! the full state machine: reconcile against what the indexes already
//! hold, resolve the type via a protocol stat, then dispatch. Files get
//! the extractor chain, directories get expanded, partials get a marker,
//! unsupported resources land in the invalids index.

mod dir;
mod update;

use std::sync::Arc;

use chrono::Utc;
use cidsift_core::config::Crawler as CrawlerConfig;
use cidsift_core::{AnnotatedResource, InvalidResource, Protocol, ResourceType};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::extractor::{Extractor, ExtractorError};
use crate::index::types::{self, DocReference, Document, File, Invalid, Partial};
use crate::index::{Index, IndexError};
use crate::protocol::{Protocol as ProtocolClient, ProtocolError};
use crate::queue::{Publisher, QueueError};

#[derive(Debug, Error)]
pub enum CrawlError {
  /// Terminal: the resource was (or will be) indexed as invalid.
  #[error("invalid resource: {0}")]
  Invalid(InvalidResource),

  #[error("protocol: {0}")]
  Protocol(ProtocolError),

  #[error("extractor: {0}")]
  Extractor(ExtractorError),

  #[error("index: {0}")]
  Index(#[from] IndexError),

  #[error("queue: {0}")]
  Queue(#[from] QueueError),

  #[error("directory entry timed out")]
  DirEntryTimeout,

  #[error("cancelled")]
  Cancelled,
}

// Invalid causes are hoisted out of component errors so the crawl loop
// can divert them to the invalids index with one match.
impl From<ProtocolError> for CrawlError {
  fn from(e: ProtocolError) -> Self {
    match e {
      ProtocolError::Invalid(cause) => CrawlError::Invalid(cause),
      other => CrawlError::Protocol(other),
    }
  }
}

impl From<ExtractorError> for CrawlError {
  fn from(e: ExtractorError) -> Self {
    match e {
      ExtractorError::Invalid(cause) => CrawlError::Invalid(cause),
      other => CrawlError::Extractor(other),
    }
  }
}

impl From<InvalidResource> for CrawlError {
  fn from(cause: InvalidResource) -> Self {
    CrawlError::Invalid(cause)
  }
}

impl CrawlError {
  pub fn is_invalid(&self) -> bool {
    matches!(self, CrawlError::Invalid(_))
  }
}

/// The four document indexes, by role.
#[derive(Clone)]
pub struct Indexes {
  pub files: Arc<dyn Index>,
  pub directories: Arc<dyn Index>,
  pub invalids: Arc<dyn Index>,
  pub partials: Arc<dyn Index>,
}

/// The three work queues, by resolved type.
#[derive(Clone)]
pub struct Queues {
  pub files: Arc<dyn Publisher>,
  pub directories: Arc<dyn Publisher>,
  pub hashes: Arc<dyn Publisher>,
}

#[derive(Clone)]
pub struct Crawler {
  config: CrawlerConfig,
  indexes: Indexes,
  queues: Queues,
  protocol: Arc<dyn ProtocolClient>,
  extractors: Vec<Arc<dyn Extractor>>,
}

fn is_crawlable_type(resource_type: ResourceType) -> bool {
  matches!(
    resource_type,
    ResourceType::Undefined | ResourceType::File | ResourceType::Directory
  )
}

impl Crawler {
  pub fn new(
    config: CrawlerConfig,
    indexes: Indexes,
    queues: Queues,
    protocol: Arc<dyn ProtocolClient>,
    extractors: Vec<Arc<dyn Extractor>>,
  ) -> Self {
    Self {
      config,
      indexes,
      queues,
      protocol,
      extractors,
    }
  }

  /// Update a known resource or crawl and index a new one.
  ///
  /// Panics when handed a resource no ingress path can produce: an
  /// invalid protocol, or a partial/unsupported type. Those are
  /// programmer errors, not data errors.
  #[instrument(skip_all, fields(cid = %resource.id(), source = %resource.source))]
  pub async fn crawl(&self, cancel: &CancellationToken, resource: &mut AnnotatedResource) -> Result<(), CrawlError> {
    if resource.protocol() == Protocol::Invalid {
      panic!("crawl called with invalid protocol: {resource}");
    }
    if !is_crawlable_type(resource.resource_type()) {
      panic!("crawl called with type {}: {resource}", resource.resource_type());
    }

    if self.update_maybe_existing(resource).await? {
      debug!("done processing existing resource");
      return Ok(());
    }

    if let Err(e) = self.ensure_type(resource).await {
      if let CrawlError::Invalid(cause) = e {
        // No type means nothing to crawl; record why and finish.
        info!(cause = %cause, "indexing unresolvable resource as invalid");
        return self.index_invalid(resource, &cause).await;
      }
      return Err(e);
    }

    debug!("indexing new resource");
    self.index(cancel, resource).await
  }

  /// Resolve the type via a protocol stat when it is still undefined.
  ///
  /// A timeout is transient: it bubbles up, the worker nacks and the
  /// queue redelivers. Only errors the protocol classifies as invalid
  /// divert the resource to the invalids index.
  async fn ensure_type(&self, resource: &mut AnnotatedResource) -> Result<(), CrawlError> {
    if resource.resource_type() != ResourceType::Undefined {
      return Ok(());
    }

    tokio::time::timeout(self.config.stat_timeout(), self.protocol.stat(resource))
      .await
      .map_err(|_| CrawlError::Protocol(ProtocolError::Timeout))?
      .map_err(CrawlError::from)
  }

  async fn index(&self, cancel: &CancellationToken, resource: &AnnotatedResource) -> Result<(), CrawlError> {
    match resource.resource_type() {
      ResourceType::File => match self.file_document(resource).await {
        Ok(doc) => {
          self
            .indexes
            .files
            .index(resource.id(), serde_json::to_value(doc).map_err(IndexError::from)?)
            .await?;
        }
        Err(CrawlError::Invalid(cause)) => return self.index_invalid(resource, &cause).await,
        Err(e) => return Err(e),
      },

      ResourceType::Directory => {
        let document = make_document(resource);
        match self.expand_directory(cancel, resource, document).await {
          Ok(doc) => {
            self
              .indexes
              .directories
              .index(resource.id(), serde_json::to_value(doc).map_err(IndexError::from)?)
              .await?;
          }
          Err(CrawlError::Invalid(cause)) => return self.index_invalid(resource, &cause).await,
          Err(e) => return Err(e),
        }
      }

      ResourceType::Partial => {
        self
          .indexes
          .partials
          .index(resource.id(), serde_json::to_value(Partial {}).map_err(IndexError::from)?)
          .await?;
      }

      ResourceType::Unsupported => return self.index_invalid(resource, &InvalidResource::UnsupportedType).await,

      ResourceType::Undefined => panic!("undefined type after stat: {resource}"),
    }

    Ok(())
  }

  /// Run the extractor chain, in order, over a fresh file document.
  async fn file_document(&self, resource: &AnnotatedResource) -> Result<File, CrawlError> {
    let mut doc = File {
      document: make_document(resource),
      metadata: serde_json::Map::new(),
    };

    for extractor in &self.extractors {
      extractor
        .extract(resource, &mut doc.metadata)
        .await
        .map_err(CrawlError::from)?;
      debug!(extractor = extractor.name(), "extractor done");
    }

    Ok(doc)
  }

  pub(crate) async fn index_invalid(
    &self,
    resource: &AnnotatedResource,
    cause: &InvalidResource,
  ) -> Result<(), CrawlError> {
    let doc = Invalid {
      error: format!("invalid resource: {cause}"),
    };
    self
      .indexes
      .invalids
      .index(resource.id(), serde_json::to_value(doc).map_err(IndexError::from)?)
      .await?;
    Ok(())
  }
}

/// Common document fields for a freshly indexed resource.
fn make_document(resource: &AnnotatedResource) -> Document {
  let now = types::truncate_to_second(Utc::now());

  let references = match &resource.reference.parent {
    Some(parent) => vec![DocReference {
      parent_hash: parent.id().to_string(),
      name: resource.reference.name.clone(),
    }],
    None => Vec::new(),
  };

  Document {
    first_seen: now,
    last_seen: now,
    references,
    size: resource.size(),
  }
}


#[cfg(test)]
mod tests {
  use cidsift_core::{Reference, Source, Stat};
  use tokio_util::sync::CancellationToken;

  use super::testutil::{Fixture, undefined};
  use super::*;

  #[tokio::test]
  async fn new_file_is_statted_extracted_and_indexed() {
    let fixture = Fixture::new(CrawlerConfig::default()).await;
    fixture.protocol.stat_result("QmF", ResourceType::File, 100);

    let mut r = undefined("QmF", cidsift_core::Source::Manual);
    fixture.crawler.crawl(&CancellationToken::new(), &mut r).await.unwrap();

    let doc = fixture.files.doc("QmF").expect("file indexed");
    assert_eq!(doc["size"], 100);
    assert_eq!(doc["first-seen"], doc["last-seen"]);
    assert_eq!(doc["content"], "extracted");
    assert_eq!(doc["references"], serde_json::json!([]));
    assert!(fixture.invalids.is_empty());
  }

  #[tokio::test]
  async fn unresolvable_resource_lands_in_invalids() {
    let fixture = Fixture::new(CrawlerConfig::default()).await;
    // No stat scripted: the protocol rejects the cid.

    let mut r = undefined("QmBad", Source::Sniffer);
    fixture.crawler.crawl(&CancellationToken::new(), &mut r).await.unwrap();

    let doc = fixture.invalids.doc("QmBad").expect("invalid indexed");
    assert!(doc["error"].as_str().unwrap().starts_with("invalid resource:"));
    assert!(fixture.files.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn stat_timeout_is_retryable_and_indexes_nothing() {
    let fixture = Fixture::new(CrawlerConfig::default()).await;
    fixture.protocol.unavailable("QmSlow");

    let mut r = undefined("QmSlow", Source::Sniffer);
    let err = fixture
      .crawler
      .crawl(&CancellationToken::new(), &mut r)
      .await
      .unwrap_err();

    assert!(!err.is_invalid(), "timeouts must stay retryable");
    assert!(fixture.files.is_empty());
    assert!(fixture.partials.is_empty());
    assert!(fixture.invalids.is_empty());
  }

  #[tokio::test]
  async fn unsupported_type_lands_in_invalids() {
    let fixture = Fixture::new(CrawlerConfig::default()).await;
    fixture.protocol.stat_result("QmRaw", ResourceType::Unsupported, 1);

    let mut r = undefined("QmRaw", Source::Sniffer);
    fixture.crawler.crawl(&CancellationToken::new(), &mut r).await.unwrap();

    let doc = fixture.invalids.doc("QmRaw").unwrap();
    assert_eq!(doc["error"], "invalid resource: unsupported type");
  }

  #[tokio::test]
  async fn already_invalid_resource_is_skipped() {
    let fixture = Fixture::new(CrawlerConfig::default()).await;
    fixture
      .invalids
      .insert("QmBad", serde_json::json!({"error": "invalid resource: unsupported type"}));

    let mut r = undefined("QmBad", Source::Sniffer);
    fixture.crawler.crawl(&CancellationToken::new(), &mut r).await.unwrap();

    // No new writes anywhere.
    assert_eq!(fixture.invalids.write_count(), 0);
    assert!(fixture.files.is_empty());
  }

  #[tokio::test]
  async fn file_document_carries_discovery_reference() {
    let fixture = Fixture::new(CrawlerConfig::default()).await;
    fixture.protocol.stat_result("QmChild", ResourceType::File, 10);

    let parent = undefined("QmParent", Source::Sniffer);
    let mut r = AnnotatedResource {
      resource: cidsift_core::Resource::ipfs("QmChild"),
      source: Source::Directory,
      reference: Reference {
        parent: Some(Box::new(parent)),
        name: "a.txt".to_string(),
      },
      stat: Stat::default(),
    };

    fixture.crawler.crawl(&CancellationToken::new(), &mut r).await.unwrap();

    let doc = fixture.files.doc("QmChild").unwrap();
    assert_eq!(doc["references"][0]["parent_hash"], "QmParent");
    assert_eq!(doc["references"][0]["name"], "a.txt");
  }

  #[tokio::test]
  #[should_panic(expected = "invalid protocol")]
  async fn invalid_protocol_is_a_programmer_error() {
    let fixture = Fixture::new(CrawlerConfig::default()).await;
    let mut r = AnnotatedResource::new(
      cidsift_core::Resource {
        protocol: Protocol::Invalid,
        id: "QmX".to_string(),
      },
      Source::Manual,
    );
    let _ = fixture.crawler.crawl(&CancellationToken::new(), &mut r).await;
  }

  #[tokio::test]
  #[should_panic(expected = "crawl called with type")]
  async fn partial_type_is_a_programmer_error() {
    let fixture = Fixture::new(CrawlerConfig::default()).await;
    let mut r = undefined("QmX", Source::Manual);
    r.stat.resource_type = ResourceType::Partial;
    let _ = fixture.crawler.crawl(&CancellationToken::new(), &mut r).await;
  }
}
