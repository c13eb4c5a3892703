//! Protocol operations against the content-addressed network.
//!
//! [`Protocol`] is the seam the crawler works through: resolve a
//! resource's type and size without fetching it (`stat`), enumerate a
//! directory's entries (`ls`), and produce a gateway URL for components
//! that do fetch bytes (the extractors).

pub mod ipfs;

use async_trait::async_trait;
use cidsift_core::{AnnotatedResource, InvalidResource};
use thiserror::Error;
use tokio::sync::mpsc;

pub use ipfs::IpfsProtocol;

#[derive(Debug, Error)]
pub enum ProtocolError {
  /// The identifier itself is unprocessable; terminal.
  #[error("invalid resource: {0}")]
  Invalid(#[from] InvalidResource),

  #[error("http: {0}")]
  Http(#[from] reqwest::Error),

  #[error("unexpected response: {0}")]
  UnexpectedResponse(String),

  #[error("timed out")]
  Timeout,
}

impl ProtocolError {
  pub fn invalid(&self) -> Option<&InvalidResource> {
    match self {
      ProtocolError::Invalid(cause) => Some(cause),
      _ => None,
    }
  }
}

#[async_trait]
pub trait Protocol: Send + Sync {
  /// Resolve type and size, writing them into the resource's stat.
  async fn stat(&self, resource: &mut AnnotatedResource) -> Result<(), ProtocolError>;

  /// Enumerate directory entries into `entries`, then close it. Each entry
  /// carries a reference back to `resource` as its parent.
  async fn ls(
    &self,
    resource: &AnnotatedResource,
    entries: mpsc::Sender<AnnotatedResource>,
  ) -> Result<(), ProtocolError>;

  /// Gateway URL serving the resource's bytes.
  fn gateway_url(&self, resource: &AnnotatedResource) -> String;
}
