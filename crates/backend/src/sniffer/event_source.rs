//! Provider-record event source.
//!
//! Installs the datastore hook and turns provider-record writes into
//! [`ProviderPut`] events on a bounded broadcast bus. The hook path never
//! fails the underlying write for sniffer-side problems: unparseable keys
//! are logged and skipped, emit failures are logged and swallowed.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::SnifferError;
use super::proxy::{AfterPut, Datastore, HookedDatastore, Key};

/// Bus capacity; on overflow the oldest events are dropped.
const BUS_CAPACITY: usize = 512;

/// Budget for handling one event before the subscription gives up.
const HANDLE_TIMEOUT: Duration = Duration::from_secs(1);

pub const PROVIDERS_PREFIX: &str = "/providers/";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
  #[error("not a provider key: {0}")]
  NotProvider(String),

  #[error("malformed provider key: {0}")]
  Malformed(String),
}

/// Does the key denote a provider record at all?
pub fn is_provider_key(key: &Key) -> bool {
  key.as_str().starts_with(PROVIDERS_PREFIX)
}

/// Split a provider-record key into CID and peer ID.
pub fn parse_provider_key(key: &Key) -> Result<(String, String), KeyError> {
  let rest = key
    .as_str()
    .strip_prefix(PROVIDERS_PREFIX)
    .ok_or_else(|| KeyError::NotProvider(key.to_string()))?;

  match rest.split_once('/') {
    Some((cid, peer)) if !cid.is_empty() && !peer.is_empty() && !peer.contains('/') => {
      Ok((cid.to_string(), peer.to_string()))
    }
    _ => Err(KeyError::Malformed(key.to_string())),
  }
}

/// Re-synthesise the key for a `(CID, PeerID)` pair.
pub fn provider_key(cid: &str, peer_id: &str) -> Key {
  Key::new(format!("{PROVIDERS_PREFIX}{cid}/{peer_id}"))
}

/// A freshly written provider record.
#[derive(Debug, Clone)]
pub struct ProviderPut {
  pub cid: String,
  pub peer_id: String,
  /// Links downstream work to the datastore write; process-local.
  pub span: tracing::Span,
}

/// Event bus fed by the datastore hook.
#[derive(Clone)]
pub struct EventSource {
  bus: broadcast::Sender<ProviderPut>,
}

impl Default for EventSource {
  fn default() -> Self {
    Self::new()
  }
}

impl EventSource {
  pub fn new() -> Self {
    let (bus, _) = broadcast::channel(BUS_CAPACITY);
    Self { bus }
  }

  /// Wrap a datastore so its provider-record writes emit events here.
  pub fn wrap<D: Datastore>(&self, datastore: D) -> HookedDatastore<D> {
    HookedDatastore::new(datastore, self.hook())
  }

  fn hook(&self) -> AfterPut {
    let bus = self.bus.clone();

    Arc::new(move |key, _value, error| {
      // A failed write is not an observation; pass the error through.
      if error.is_some() {
        return None;
      }
      if !is_provider_key(key) {
        return None;
      }

      let (cid, peer_id) = match parse_provider_key(key) {
        Ok(parts) => parts,
        Err(e) => {
          // The datastore write succeeded; the sniffer has no business
          // failing it over a key it merely could not read.
          warn!(key = %key, error = %e, "skipping unparseable provider key");
          return None;
        }
      };

      let span = tracing::info_span!("provider_put", cid = %cid, peer = %peer_id);
      let event = ProviderPut { cid, peer_id, span };
      if bus.send(event).is_err() {
        debug!(key = %key, "no subscribers for provider event");
      }

      None
    })
  }

  /// Dispatch events to `handler` until cancellation or a handler error.
  /// Each event gets a fixed handling budget; lagging behind the bus is
  /// logged and skipped (the bus dropped the oldest events for us).
  pub async fn subscribe<F, Fut>(&self, cancel: CancellationToken, mut handler: F) -> Result<(), SnifferError>
  where
    F: FnMut(ProviderPut) -> Fut + Send,
    Fut: Future<Output = Result<(), SnifferError>> + Send,
  {
    let mut rx = self.bus.subscribe();

    loop {
      tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(SnifferError::Cancelled),
        received = rx.recv() => match received {
          Ok(event) => {
            tokio::time::timeout(HANDLE_TIMEOUT, handler(event))
              .await
              .map_err(|_| SnifferError::HandlerTimeout)??;
          }
          Err(broadcast::error::RecvError::Lagged(dropped)) => {
            warn!(dropped, "event bus overflowed");
          }
          Err(broadcast::error::RecvError::Closed) => return Err(SnifferError::BusClosed),
        },
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sniffer::proxy::MemoryDatastore;

  #[test]
  fn provider_key_round_trip() {
    let key = provider_key("QmFoo", "12D3KooWPeer");
    assert!(is_provider_key(&key));
    let (cid, peer) = parse_provider_key(&key).unwrap();
    assert_eq!(cid, "QmFoo");
    assert_eq!(peer, "12D3KooWPeer");
    assert_eq!(provider_key(&cid, &peer), key);
  }

  #[test]
  fn rejects_malformed_keys() {
    assert!(parse_provider_key(&Key::new("/providers/onlycid")).is_err());
    assert!(parse_provider_key(&Key::new("/providers//peer")).is_err());
    assert!(parse_provider_key(&Key::new("/providers/a/b/c")).is_err());
    assert!(parse_provider_key(&Key::new("/pins/QmFoo")).is_err());
  }

  #[tokio::test]
  async fn provider_writes_emit_events() {
    let source = EventSource::new();
    let mut rx = source.bus.subscribe();
    let store = source.wrap(MemoryDatastore::new());

    store
      .put(provider_key("QmFoo", "PeerA"), b"record".to_vec())
      .unwrap();

    let event = rx.recv().await.unwrap();
    assert_eq!(event.cid, "QmFoo");
    assert_eq!(event.peer_id, "PeerA");
  }

  #[tokio::test]
  async fn non_provider_writes_are_silent() {
    let source = EventSource::new();
    let mut rx = source.bus.subscribe();
    let store = source.wrap(MemoryDatastore::new());

    store.put(Key::new("/pins/QmFoo"), b"x".to_vec()).unwrap();
    store.put(Key::new("/providers/broken"), b"x".to_vec()).unwrap();

    assert!(rx.try_recv().is_err(), "no events expected");
    assert_eq!(store.inner().len(), 2, "writes themselves must succeed");
  }

  #[tokio::test]
  async fn handler_error_ends_subscription() {
    let source = EventSource::new();
    let store = source.wrap(MemoryDatastore::new());
    let cancel = CancellationToken::new();

    let source_clone = source.clone();
    let subscription = tokio::spawn(async move {
      source_clone
        .subscribe(cancel, |_event| async { Err(SnifferError::ChannelClosed) })
        .await
    });

    // Give the subscriber a beat to register before writing.
    tokio::time::sleep(Duration::from_millis(20)).await;
    store.put(provider_key("QmFoo", "PeerA"), b"r".to_vec()).unwrap();

    let result = subscription.await.unwrap();
    assert!(matches!(result, Err(SnifferError::ChannelClosed)));
  }
}
