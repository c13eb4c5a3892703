//! Directory expansion.
//!
//! Two cooperating tasks share a bounded channel: the protocol lister
//! produces entries, the consumer links them into the parent document and
//! queues every child for independent processing. Directories past the
//! size cutoff are still fully enumerated; only the parent document is
//! withheld and reported as too large.

use std::sync::{Arc, Mutex};

use cidsift_core::{AnnotatedResource, InvalidResource, ResourceType};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{CrawlError, Crawler};
use crate::index::types::{Directory, Document, Link, LinkType};
use crate::protocol::Protocol as ProtocolClient;
use crate::queue::Publisher;
use crate::taskgroup::TaskGroup;

/// Progress log cadence during large enumerations.
const LOG_EVERY: u64 = 1024;

fn link_type(resource: &AnnotatedResource) -> LinkType {
  match resource.resource_type() {
    ResourceType::File => LinkType::File,
    ResourceType::Directory => LinkType::Directory,
    ResourceType::Undefined => LinkType::Unknown,
    ResourceType::Unsupported => LinkType::Unsupported,
    ResourceType::Partial => panic!("partial type in directory listing"),
  }
}

#[derive(Default)]
struct Expansion {
  links: Vec<Link>,
  count: u64,
  is_large: bool,
}

impl Crawler {
  /// Enumerate `resource` and queue its children, building the directory
  /// document. Large directories yield `DirectoryTooLarge` after
  /// enumeration completes.
  pub(crate) async fn expand_directory(
    &self,
    cancel: &CancellationToken,
    resource: &AnnotatedResource,
    document: Document,
  ) -> Result<Directory, CrawlError> {
    let (entries_tx, entries_rx) = mpsc::channel(self.config.direntry_buffer_size);
    let state = Arc::new(Mutex::new(Expansion::default()));

    let mut group: TaskGroup<CrawlError> = TaskGroup::new(cancel);

    // Lister: enumerate into the channel, then close it by dropping.
    let lister_token = group.token();
    let protocol = Arc::clone(&self.protocol);
    let lister_resource = resource.clone();
    group.spawn(async move {
      tokio::select! {
        biased;
        _ = lister_token.cancelled() => Err(CrawlError::Cancelled),
        listed = protocol.ls(&lister_resource, entries_tx) => listed.map_err(CrawlError::from),
      }
    });

    // Consumer: link, count, queue.
    let consumer = self.clone();
    let consumer_token = group.token();
    let consumer_state = Arc::clone(&state);
    group.spawn(async move { consumer.process_dir_entries(consumer_token, entries_rx, consumer_state).await });

    group.wait().await?;

    let expansion = std::mem::take(&mut *state.lock().unwrap());
    debug!(cid = resource.id(), entries = expansion.count, "directory expanded");

    Ok(Directory {
      document,
      links: expansion.links,
    })
  }

  async fn process_dir_entries(
    &self,
    cancel: CancellationToken,
    mut entries: mpsc::Receiver<AnnotatedResource>,
    state: Arc<Mutex<Expansion>>,
  ) -> Result<(), CrawlError> {
    let max_dir_size = self.config.max_dirsize as u64;
    let max_entries = self.config.max_dir_entries as u64;

    loop {
      // Fresh timeout per entry; a stalled lister fails the expansion.
      let entry = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(CrawlError::Cancelled),
        received = tokio::time::timeout(self.config.direntry_timeout(), entries.recv()) => {
          match received {
            Err(_) => return Err(CrawlError::DirEntryTimeout),
            Ok(None) => break,
            Ok(Some(entry)) => entry,
          }
        }
      };

      {
        let mut state = state.lock().unwrap();

        if state.count > 0 && state.count % LOG_EVERY == 0 {
          info!(entries = state.count, entry = %entry, "processing large directory listing");
        }

        if max_entries > 0 && state.count >= max_entries {
          // Hard enumeration cap; give up on the directory entirely.
          return Err(CrawlError::Invalid(InvalidResource::DirectoryTooLarge));
        }

        if state.count == max_dir_size {
          info!(entry = %entry, "directory exceeds index cutoff, still enumerating");
          state.is_large = true;
        }

        if !state.is_large {
          state.links.push(Link {
            hash: entry.id().to_string(),
            name: entry.reference.name.clone(),
            size: entry.size(),
            link_type: link_type(&entry),
          });
        }

        state.count += 1;
      }

      self.queue_dir_entry(&entry).await?;
    }

    if state.lock().unwrap().is_large {
      return Err(CrawlError::Invalid(InvalidResource::DirectoryTooLarge));
    }
    Ok(())
  }

  /// Queue one child for independent processing.
  ///
  /// Children get a uniform random priority in [1, 7]: items within one
  /// directory tend to share availability, and scattering them gives
  /// downstream consumers mixed-availability batches.
  async fn queue_dir_entry(&self, entry: &AnnotatedResource) -> Result<(), CrawlError> {
    let priority: u8 = rand::thread_rng().gen_range(1..=7);

    match entry.resource_type() {
      ResourceType::Undefined => self.queues.hashes.publish(entry, priority).await?,
      ResourceType::File => self.queues.files.publish(entry, priority).await?,
      ResourceType::Directory => self.queues.directories.publish(entry, priority).await?,
      // No protocol work needed; a direct write is cheaper than the
      // queue round-trip.
      ResourceType::Unsupported => self.index_invalid(entry, &InvalidResource::UnsupportedType).await?,
      ResourceType::Partial => panic!("partial type in directory listing"),
    }
    Ok(())
  }
}
