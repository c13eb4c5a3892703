//! Document index abstraction.
//!
//! An [`Index`] is the capability set the crawler needs from the search
//! backend: create-if-absent, partial update, delete, and a projected get.
//! [`search`] implements it against the HTTP backend through the bulk
//! access layer; [`memory`] is the in-process variant the tests run on.

pub mod memory;
pub mod search;
pub mod types;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
  #[error("http: {0}")]
  Http(#[from] reqwest::Error),

  #[error("serializing document: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error("unexpected backend response: {0}")]
  UnexpectedResponse(String),

  /// Backend-level failure fanned out to every request of a batch.
  #[error("backend: {0}")]
  Backend(String),

  #[error("index closed")]
  Closed,
}

/// One named document index.
#[async_trait]
pub trait Index: Send + Sync {
  fn name(&self) -> &str;

  /// Create the document if absent.
  async fn index(&self, id: &str, doc: Value) -> Result<(), IndexError>;

  /// Partially update an existing document.
  async fn update(&self, id: &str, doc: Value) -> Result<(), IndexError>;

  async fn delete(&self, id: &str) -> Result<(), IndexError>;

  /// Fetch a document, projected to `fields` (empty = whole source).
  /// `Ok(None)` means not found; a 404 is not an error.
  async fn get(&self, id: &str, fields: &[&str]) -> Result<Option<Value>, IndexError>;
}
