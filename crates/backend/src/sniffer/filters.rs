//! Provider filters.
//!
//! Single-threaded by design: the filter stage owns its filters, so no
//! synchronization is needed around the last-seen cache.

use std::time::{Duration, Instant};

use cidsift_core::{Protocol, Provider};
use lru::LruCache;
use tracing::{debug, trace};

pub trait ProviderFilter: Send {
  /// `true` to keep the provider, `false` to drop it.
  fn accept(&mut self, provider: &Provider) -> bool;
}

/// AND composition; the first rejecting filter wins.
pub struct MultiFilter {
  filters: Vec<Box<dyn ProviderFilter>>,
}

impl MultiFilter {
  pub fn new(filters: Vec<Box<dyn ProviderFilter>>) -> Self {
    Self { filters }
  }
}

impl ProviderFilter for MultiFilter {
  fn accept(&mut self, provider: &Provider) -> bool {
    self.filters.iter_mut().all(|f| f.accept(provider))
  }
}

/// Syntactic CID check: CIDv0 (`Qm` + 44 base58btc chars) or a
/// base32-lowercase CIDv1. Anything else never resolves and is dropped
/// before it costs a queue slot.
pub fn is_valid_cid(cid: &str) -> bool {
  const BASE58: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

  if let Some(rest) = cid.strip_prefix("Qm") {
    return cid.len() == 46 && rest.chars().all(|c| BASE58.contains(c));
  }
  if let Some(rest) = cid.strip_prefix('b') {
    return rest.len() >= 8 && rest.chars().all(|c| c.is_ascii_lowercase() || ('2'..='7').contains(&c));
  }
  false
}

#[derive(Debug, Default)]
pub struct CidFilter {}

impl CidFilter {
  pub fn new() -> Self {
    Self {}
  }
}

impl ProviderFilter for CidFilter {
  fn accept(&mut self, provider: &Provider) -> bool {
    if provider.resource.protocol != Protocol::Ipfs {
      debug!(provider = %provider, "dropping provider with unexpected protocol");
      return false;
    }
    if !is_valid_cid(&provider.resource.id) {
      debug!(cid = %provider.resource.id, "dropping syntactically invalid cid");
      return false;
    }
    true
  }
}

/// Recency dedupe over a bounded cache of insertion timestamps.
///
/// `seen` answers "was this CID recorded within the expiration window?"
/// and records it if not. Once the cache grows past `prune_len`, expired
/// entries are dropped; if that is not enough, the oldest entries go
/// until the cache is back at capacity. The cache therefore never holds
/// more than `prune_len + 1` entries.
pub struct LastSeenFilter {
  cache: LruCache<String, Instant>,
  expiration: Duration,
  prune_len: usize,
}

impl LastSeenFilter {
  pub fn new(expiration: Duration, prune_len: usize) -> Self {
    Self {
      cache: LruCache::unbounded(),
      expiration,
      prune_len,
    }
  }

  pub fn len(&self) -> usize {
    self.cache.len()
  }

  pub fn is_empty(&self) -> bool {
    self.cache.is_empty()
  }

  /// Monotonic-clock variant, injectable for tests.
  pub fn seen_at(&mut self, cid: &str, now: Instant) -> bool {
    // peek keeps the LRU order untouched, so order stays insertion order
    // and the LRU end is always the oldest insert.
    if let Some(&inserted) = self.cache.peek(cid)
      && now.duration_since(inserted) <= self.expiration
    {
      return true;
    }

    self.cache.put(cid.to_string(), now);
    if self.cache.len() > self.prune_len {
      self.prune(now);
    }
    false
  }

  pub fn seen(&mut self, cid: &str) -> bool {
    self.seen_at(cid, Instant::now())
  }

  fn prune(&mut self, now: Instant) {
    let before = self.cache.len();

    while let Some((_, &inserted)) = self.cache.peek_lru() {
      if now.duration_since(inserted) > self.expiration {
        self.cache.pop_lru();
      } else {
        break;
      }
    }

    while self.cache.len() > self.prune_len {
      self.cache.pop_lru();
    }

    trace!(before, after = self.cache.len(), "pruned last-seen cache");
  }
}

impl ProviderFilter for LastSeenFilter {
  fn accept(&mut self, provider: &Provider) -> bool {
    !self.seen(&provider.resource.id)
  }
}

#[cfg(test)]
mod tests {
  use chrono::Utc;
  use cidsift_core::Resource;

  use super::*;

  fn provider(cid: &str) -> Provider {
    Provider {
      resource: Resource::ipfs(cid),
      date: Utc::now(),
      provider: "Peer".to_string(),
      span: tracing::Span::none(),
    }
  }

  const VALID_V0: &str = "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG";

  #[test]
  fn cid_filter_accepts_valid_v0_and_v1() {
    let mut filter = CidFilter::new();
    assert!(filter.accept(&provider(VALID_V0)));
    assert!(filter.accept(&provider("bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi")));
  }

  #[test]
  fn cid_filter_rejects_garbage() {
    let mut filter = CidFilter::new();
    assert!(!filter.accept(&provider("not-a-cid")));
    assert!(!filter.accept(&provider("Qmshort")));
    assert!(!filter.accept(&provider("BAFYUPPERCASE")));

    let mut invalid_protocol = provider(VALID_V0);
    invalid_protocol.resource.protocol = Protocol::Invalid;
    assert!(!filter.accept(&invalid_protocol));
  }

  #[test]
  fn last_seen_suppresses_within_window() {
    let mut filter = LastSeenFilter::new(Duration::from_secs(60), 16);
    let start = Instant::now();

    assert!(!filter.seen_at("QmA", start));
    assert!(filter.seen_at("QmA", start + Duration::from_secs(30)));
    assert!(!filter.seen_at("QmB", start + Duration::from_secs(30)));
  }

  #[test]
  fn expired_entry_is_recorded_again() {
    let mut filter = LastSeenFilter::new(Duration::from_secs(60), 16);
    let start = Instant::now();

    assert!(!filter.seen_at("QmA", start));
    assert!(!filter.seen_at("QmA", start + Duration::from_secs(61)));
    // The refresh restarts the window.
    assert!(filter.seen_at("QmA", start + Duration::from_secs(62)));
  }

  #[test]
  fn zero_expiration_rejects_only_exact_duplicates() {
    let mut filter = LastSeenFilter::new(Duration::ZERO, 16);
    let start = Instant::now();

    assert!(!filter.seen_at("QmA", start));
    // Same instant: not yet expired, still a duplicate.
    assert!(filter.seen_at("QmA", start));
    // Any later sighting is past the zero-length window.
    assert!(!filter.seen_at("QmA", start + Duration::from_nanos(1)));
  }

  #[test]
  fn cache_stays_within_twice_prune_len() {
    let prune_len = 8;
    let mut filter = LastSeenFilter::new(Duration::from_secs(3600), prune_len);
    let start = Instant::now();

    for i in 0..1000 {
      filter.seen_at(&format!("Qm{i}"), start + Duration::from_millis(i));
      assert!(
        filter.len() <= prune_len * 2,
        "cache exceeded bound at {} entries",
        filter.len()
      );
    }
  }

  #[test]
  fn prune_prefers_expired_then_oldest() {
    let mut filter = LastSeenFilter::new(Duration::from_secs(10), 2);
    let start = Instant::now();

    filter.seen_at("QmOld", start);
    filter.seen_at("QmMid", start + Duration::from_secs(20));
    // Third insert prunes: QmOld is expired relative to t=21 and goes.
    filter.seen_at("QmNew", start + Duration::from_secs(21));

    assert_eq!(filter.len(), 2);
    assert!(filter.seen_at("QmMid", start + Duration::from_secs(22)));
    assert!(!filter.seen_at("QmOld", start + Duration::from_secs(22)));
  }

  #[test]
  fn multi_filter_is_and_with_first_rejection_winning() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingReject {
      calls: Arc<AtomicUsize>,
    }
    impl ProviderFilter for CountingReject {
      fn accept(&mut self, _: &Provider) -> bool {
        self.calls.fetch_add(1, Ordering::Relaxed);
        false
      }
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let mut filter = MultiFilter::new(vec![
      Box::new(CountingReject { calls: Arc::clone(&calls) }),
      Box::new(CidFilter::new()),
    ]);

    assert!(!filter.accept(&provider(VALID_V0)));
    assert_eq!(calls.load(Ordering::Relaxed), 1);

    let mut accepting = MultiFilter::new(vec![
      Box::new(CidFilter::new()),
      Box::new(LastSeenFilter::new(Duration::from_secs(60), 4)),
    ]);
    assert!(accepting.accept(&provider(VALID_V0)));
    assert!(!accepting.accept(&provider(VALID_V0)));
  }
}
