//! Metadata extractors.
//!
//! Extractors run in a fixed order over a file document's metadata map,
//! each fetching the resource's bytes through an external service via the
//! protocol gateway. Oversized resources are rejected up front as
//! invalid; malformed service responses are retryable.

pub mod nsfw;
pub mod tika;

use async_trait::async_trait;
use cidsift_core::{AnnotatedResource, InvalidResource};
use serde_json::{Map, Value};
use thiserror::Error;

pub use nsfw::NsfwExtractor;
pub use tika::TikaExtractor;

#[derive(Debug, Error)]
pub enum ExtractorError {
  /// Terminal; the crawler indexes the resource as invalid.
  #[error("invalid resource: {0}")]
  Invalid(#[from] InvalidResource),

  #[error("http: {0}")]
  Http(reqwest::Error),

  #[error("unexpected response: {0}")]
  UnexpectedResponse(String),

  #[error("timed out")]
  Timeout,
}

impl From<reqwest::Error> for ExtractorError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      ExtractorError::Timeout
    } else {
      ExtractorError::Http(e)
    }
  }
}

impl ExtractorError {
  pub fn invalid(&self) -> Option<&InvalidResource> {
    match self {
      ExtractorError::Invalid(cause) => Some(cause),
      _ => None,
    }
  }
}

/// Reject resources larger than an extractor is willing to fetch.
/// A zero limit disables the check.
pub fn validate_max_size(resource: &AnnotatedResource, max_size: u64) -> Result<(), ExtractorError> {
  if max_size > 0 && resource.size() > max_size {
    return Err(ExtractorError::Invalid(InvalidResource::FileTooLarge));
  }
  Ok(())
}

#[async_trait]
pub trait Extractor: Send + Sync {
  fn name(&self) -> &str;

  /// Populate fields of the document's metadata map.
  async fn extract(&self, resource: &AnnotatedResource, metadata: &mut Map<String, Value>)
  -> Result<(), ExtractorError>;
}

/// Shared HTTP client for extractor services, sized per configuration.
pub fn extractor_client(max_connections: usize) -> Result<reqwest::Client, ExtractorError> {
  Ok(
    reqwest::Client::builder()
      .pool_max_idle_per_host(max_connections)
      .build()?,
  )
}
