//! Search backend access.
//!
//! [`SearchTransport`] is the wire: one `_bulk` POST, one `_mget` POST.
//! [`Client`] owns the background bulk indexer and bulk getter;
//! [`SearchIndex`] exposes one named index over them. Everything above the
//! transport is testable without a backend.

pub mod bulk_getter;
pub mod bulk_indexer;
mod index;

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

pub use self::bulk_getter::{BulkGetter, GetRequest};
pub use self::bulk_indexer::{BulkAction, BulkIndexer};
pub use self::index::SearchIndex;
use super::IndexError;

/// One document of a `_mget` request.
#[derive(Debug, Clone, Serialize)]
pub struct MgetDoc {
  #[serde(rename = "_index")]
  pub index: String,
  #[serde(rename = "_id")]
  pub id: String,
  /// `true` for the whole source, or a list of fields to project.
  #[serde(rename = "_source")]
  pub source: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MgetHit {
  #[serde(rename = "_id")]
  pub id: String,
  #[serde(default)]
  pub found: bool,
  #[serde(rename = "_source", default)]
  pub source: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MgetResponse {
  pub docs: Vec<MgetHit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkResponse {
  #[serde(default)]
  pub errors: bool,
  #[serde(default)]
  pub items: Vec<Value>,
}

/// Wire-level operations the bulk access layer is built on.
#[async_trait]
pub trait SearchTransport: Send + Sync {
  /// POST an NDJSON payload to `_bulk`.
  async fn bulk(&self, body: String) -> Result<BulkResponse, IndexError>;

  /// POST a `_mget` request.
  async fn mget(&self, docs: &[MgetDoc]) -> Result<MgetResponse, IndexError>;
}

/// HTTP transport against a real backend.
#[derive(Debug)]
pub struct HttpTransport {
  http: reqwest::Client,
  base_url: String,
}

impl HttpTransport {
  pub fn new(url: &str) -> Result<Self, IndexError> {
    Ok(Self {
      http: reqwest::Client::builder().build()?,
      base_url: url.trim_end_matches('/').to_string(),
    })
  }
}

#[async_trait]
impl SearchTransport for HttpTransport {
  async fn bulk(&self, body: String) -> Result<BulkResponse, IndexError> {
    let response = self
      .http
      .post(format!("{}/_bulk", self.base_url))
      .header(CONTENT_TYPE, "application/x-ndjson")
      .body(body)
      .send()
      .await?;

    let status = response.status();
    if !status.is_success() {
      return Err(IndexError::UnexpectedResponse(format!("bulk returned {status}")));
    }
    Ok(response.json().await?)
  }

  async fn mget(&self, docs: &[MgetDoc]) -> Result<MgetResponse, IndexError> {
    let response = self
      .http
      .post(format!("{}/_mget", self.base_url))
      .json(&serde_json::json!({ "docs": docs }))
      .send()
      .await?;

    let status = response.status();
    if !status.is_success() {
      return Err(IndexError::UnexpectedResponse(format!("mget returned {status}")));
    }
    Ok(response.json().await?)
  }
}

/// Shared backend client: one bulk indexer, one bulk getter, any number of
/// [`SearchIndex`] handles on top.
pub struct Client {
  indexer: BulkIndexer,
  getter: BulkGetter,
  cancel: CancellationToken,
}

impl Client {
  pub fn new(cfg: &cidsift_core::config::OpenSearch) -> Result<Self, IndexError> {
    let transport: Arc<dyn SearchTransport> = Arc::new(HttpTransport::new(&cfg.url)?);
    Ok(Self::with_transport(transport, cfg))
  }

  pub fn with_transport(transport: Arc<dyn SearchTransport>, cfg: &cidsift_core::config::OpenSearch) -> Self {
    let cancel = CancellationToken::new();
    let indexer = BulkIndexer::new(
      Arc::clone(&transport),
      cfg.bulk_indexer_workers,
      cfg.bulk_flush_bytes,
      cfg.bulk_flush_timeout(),
    );
    let getter = BulkGetter::new(
      transport,
      cfg.bulk_getter_batch_size,
      cfg.bulk_getter_batch_timeout(),
      cancel.child_token(),
    );
    Self { indexer, getter, cancel }
  }

  pub fn index(self: Arc<Self>, name: impl Into<String>) -> Arc<SearchIndex> {
    Arc::new(SearchIndex::new(self, name.into()))
  }

  pub(crate) fn indexer(&self) -> &BulkIndexer {
    &self.indexer
  }

  pub(crate) fn getter(&self) -> &BulkGetter {
    &self.getter
  }

  /// Flush pending writes and stop the background tasks.
  pub async fn close(&self) {
    self.indexer.close().await;
    self.cancel.cancel();
  }
}
