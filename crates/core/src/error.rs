//! Classification of structurally unprocessable resources.
//!
//! An [`InvalidResource`] is terminal: the crawler indexes an invalid
//! marker for it, acknowledges the message and never retries. Everything
//! else (timeouts, connection loss, malformed service responses) stays a
//! component-level error and is retried through queue redelivery.

use thiserror::Error;

/// Why a resource cannot be processed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidResource {
  #[error("unsupported type")]
  UnsupportedType,

  #[error("file too large")]
  FileTooLarge,

  /// The directory exceeds the indexing cutoff. Its children are still
  /// enumerated and queued; only the directory document itself is dropped.
  #[error("directory too large")]
  DirectoryTooLarge,

  /// The protocol rejected the identifier outright.
  #[error("unresolvable: {0}")]
  Unresolvable(String),
}
