//! Reconciliation with already-indexed documents.
//!
//! Before crawling anything, the crawler asks all four indexes whether
//! they already hold the CID. The four gets are issued concurrently and
//! coalesce into a single backend multi-get. What happens next depends on
//! where the document lives and where the sighting came from.

use chrono::{DateTime, Utc};
use cidsift_core::{AnnotatedResource, Reference, Source};
use serde::Deserialize;
use tracing::{debug, trace};

use super::{CrawlError, Crawler};
use crate::index::Index;
use crate::index::types::{self, DocReference, References, Update, second_precision};

/// Projection fetched for existence checks.
const EXISTING_FIELDS: &[&str] = &["references", "last-seen"];

/// Which index holds the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
  Files,
  Directories,
  Invalids,
  Partials,
}

/// Stored fields the update policy works on.
#[derive(Debug, Default, Deserialize)]
struct ExistingSource {
  #[serde(default)]
  references: References,
  #[serde(rename = "last-seen", default, with = "second_precision::option")]
  last_seen: Option<DateTime<Utc>>,
}

struct ExistingItem {
  slot: Slot,
  references: References,
  last_seen: Option<DateTime<Utc>>,
}

/// Add the sighting's `(parent, name)` to a reference set; reports whether
/// anything changed. References are a set under that pair.
pub(crate) fn append_reference(mut references: References, reference: &Reference) -> (References, bool) {
  let Some(parent) = &reference.parent else {
    return (references, false);
  };

  let duplicate = references
    .iter()
    .any(|r| r.parent_hash == parent.id() && r.name == reference.name);
  if duplicate {
    return (references, false);
  }

  references.push(DocReference {
    parent_hash: parent.id().to_string(),
    name: reference.name.clone(),
  });
  (references, true)
}

impl Crawler {
  /// Returns `true` when the resource is fully handled (exists and was
  /// updated or skipped); `false` means: carry on, crawl it as new.
  pub(crate) async fn update_maybe_existing(&self, resource: &mut AnnotatedResource) -> Result<bool, CrawlError> {
    match self.get_existing(resource).await? {
      None => Ok(false),
      Some(item) => self.process_existing(resource, item).await,
    }
  }

  async fn get_existing(&self, resource: &AnnotatedResource) -> Result<Option<ExistingItem>, CrawlError> {
    let id = resource.id();

    // Issued together so the bulk getter folds them into one multi-get.
    let (files, directories, invalids, partials) = tokio::join!(
      self.indexes.files.get(id, EXISTING_FIELDS),
      self.indexes.directories.get(id, EXISTING_FIELDS),
      self.indexes.invalids.get(id, EXISTING_FIELDS),
      self.indexes.partials.get(id, EXISTING_FIELDS),
    );

    let found = [
      (Slot::Files, files?),
      (Slot::Directories, directories?),
      (Slot::Invalids, invalids?),
      (Slot::Partials, partials?),
    ];

    // A CID lives in at most one index; take the first hit.
    for (slot, value) in found {
      if let Some(value) = value {
        let source: ExistingSource = serde_json::from_value(value).unwrap_or_default();
        return Ok(Some(ExistingItem {
          slot,
          references: source.references,
          last_seen: source.last_seen,
        }));
      }
    }
    Ok(None)
  }

  async fn process_existing(&self, resource: &mut AnnotatedResource, item: ExistingItem) -> Result<bool, CrawlError> {
    match item.slot {
      // Already classified unprocessable; nothing more to learn.
      Slot::Invalids => Ok(true),

      Slot::Partials => {
        if resource.reference.parent.is_none() {
          trace!(cid = resource.id(), "skipping unreferenced partial");
          return Ok(true);
        }
        // A referenced partial graduates: remove the marker, then crawl
        // it as if it were new.
        debug!(cid = resource.id(), "resolving partial");
        self.indexes.partials.delete(resource.id()).await?;
        Ok(false)
      }

      Slot::Files => {
        self.update_existing(resource, &item, &self.indexes.files).await?;
        Ok(true)
      }
      Slot::Directories => {
        self.update_existing(resource, &item, &self.indexes.directories).await?;
        Ok(true)
      }
    }
  }

  async fn update_existing(
    &self,
    resource: &AnnotatedResource,
    item: &ExistingItem,
    index: &std::sync::Arc<dyn Index>,
  ) -> Result<(), CrawlError> {
    match resource.source {
      Source::Directory => {
        // Reference discovery must not reset freshness: only the
        // reference set is touched, last-seen stays as it was.
        let (references, changed) = append_reference(item.references.clone(), &resource.reference);
        if changed {
          debug!(cid = resource.id(), "adding reference to known item");
          let update = Update {
            last_seen: None,
            references: Some(references),
          };
          index
            .update(resource.id(), serde_json::to_value(update).map_err(crate::index::IndexError::from)?)
            .await?;
        }
      }

      // Unknown is legacy ingress and behaves like the sniffer.
      Source::Sniffer | Source::Unknown => {
        let now = types::truncate_to_second(Utc::now());
        let stale = match item.last_seen {
          None => true,
          Some(last_seen) => {
            let age = now.signed_duration_since(last_seen);
            age.to_std().map(|age| age > self.config.min_update_age()).unwrap_or(false)
          }
        };

        if stale {
          debug!(cid = resource.id(), "bumping last-seen on known item");
          let update = Update {
            last_seen: Some(now),
            references: None,
          };
          index
            .update(resource.id(), serde_json::to_value(update).map_err(crate::index::IndexError::from)?)
            .await?;
        }
      }

      // Explicit human input does not influence freshness metrics.
      Source::Manual | Source::User => {}
    }

    Ok(())
  }
}
