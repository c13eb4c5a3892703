//! Datastore proxy.
//!
//! Wraps an ordered key-value batching store and invokes a hook after
//! each successful put, including puts applied by a committed batch. The
//! hook runs synchronously on the writer's path and must not block; any
//! long work is offloaded by the hook itself (the event source publishes
//! onto a buffered bus for exactly that reason).

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Path-style datastore key, e.g. `/providers/<cid>/<peer>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key(String);

impl Key {
  pub fn new(key: impl Into<String>) -> Self {
    Self(key.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for Key {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
  #[error("store: {0}")]
  Store(String),

  #[error("hook: {0}")]
  Hook(String),
}

/// Pending writes that commit atomically.
pub trait Batch: Send {
  fn put(&mut self, key: Key, value: Vec<u8>);
  fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Ordered key-value store with batching.
pub trait Datastore: Send + Sync {
  fn put(&self, key: Key, value: Vec<u8>) -> Result<(), StoreError>;
  fn batch(&self) -> Box<dyn Batch + '_>;
}

/// Post-put hook. Receives the write's outcome; may return an error of its
/// own, which replaces the outcome only when the write succeeded.
pub type AfterPut = Arc<dyn Fn(&Key, &[u8], Option<&StoreError>) -> Option<StoreError> + Send + Sync>;

/// A datastore that calls `after_put` after every put.
pub struct HookedDatastore<D> {
  inner: D,
  after_put: AfterPut,
}

impl<D: Datastore> HookedDatastore<D> {
  pub fn new(inner: D, after_put: AfterPut) -> Self {
    Self { inner, after_put }
  }

  pub fn inner(&self) -> &D {
    &self.inner
  }
}

fn run_hook(after_put: &AfterPut, key: &Key, value: &[u8], result: Result<(), StoreError>) -> Result<(), StoreError> {
  let original = result.err();
  let hook_error = (after_put)(key, value, original.as_ref());

  // The original error always wins; the hook can only fail a write that
  // succeeded.
  match original {
    Some(e) => Err(e),
    None => match hook_error {
      Some(e) => Err(e),
      None => Ok(()),
    },
  }
}

impl<D: Datastore> Datastore for HookedDatastore<D> {
  fn put(&self, key: Key, value: Vec<u8>) -> Result<(), StoreError> {
    let result = self.inner.put(key.clone(), value.clone());
    run_hook(&self.after_put, &key, &value, result)
  }

  fn batch(&self) -> Box<dyn Batch + '_> {
    Box::new(HookedBatch {
      inner: self.inner.batch(),
      after_put: Arc::clone(&self.after_put),
      puts: Vec::new(),
    })
  }
}

struct HookedBatch<'a> {
  inner: Box<dyn Batch + 'a>,
  after_put: AfterPut,
  puts: Vec<(Key, Vec<u8>)>,
}

impl Batch for HookedBatch<'_> {
  fn put(&mut self, key: Key, value: Vec<u8>) {
    self.puts.push((key.clone(), value.clone()));
    self.inner.put(key, value);
  }

  fn commit(self: Box<Self>) -> Result<(), StoreError> {
    let result = self.inner.commit();
    let mut outcome = result.clone();

    for (key, value) in &self.puts {
      let hooked = run_hook(&self.after_put, key, value, result.clone());
      if outcome.is_ok() && hooked.is_err() {
        outcome = hooked;
      }
    }

    outcome
  }
}

/// In-memory datastore; the tests' stand-in for a DHT node's store.
#[derive(Debug, Default)]
pub struct MemoryDatastore {
  entries: std::sync::Mutex<std::collections::BTreeMap<String, Vec<u8>>>,
}

impl MemoryDatastore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.entries.lock().unwrap().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl Datastore for MemoryDatastore {
  fn put(&self, key: Key, value: Vec<u8>) -> Result<(), StoreError> {
    self.entries.lock().unwrap().insert(key.0, value);
    Ok(())
  }

  fn batch(&self) -> Box<dyn Batch + '_> {
    Box::new(MemoryBatch {
      store: self,
      puts: Vec::new(),
    })
  }
}

struct MemoryBatch<'a> {
  store: &'a MemoryDatastore,
  puts: Vec<(Key, Vec<u8>)>,
}

impl Batch for MemoryBatch<'_> {
  fn put(&mut self, key: Key, value: Vec<u8>) {
    self.puts.push((key, value));
  }

  fn commit(self: Box<Self>) -> Result<(), StoreError> {
    let mut entries = self.store.entries.lock().unwrap();
    for (key, value) in self.puts {
      entries.insert(key.0, value);
    }
    Ok(())
  }
}
