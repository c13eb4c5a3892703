//! In-process index.
//!
//! Backs the test suites and local development; behaves like the search
//! backend contract: create-if-absent, shallow partial update, projected
//! get, 404-as-None.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::{Index, IndexError};

/// A write operation observed by the index, for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
  Index(String),
  Update(String),
  Delete(String),
}

#[derive(Debug, Default)]
struct State {
  docs: HashMap<String, Value>,
  ops: Vec<Op>,
}

#[derive(Debug)]
pub struct MemoryIndex {
  name: String,
  state: Mutex<State>,
}

impl MemoryIndex {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      state: Mutex::new(State::default()),
    }
  }

  /// Seed a document, bypassing the op log.
  pub fn insert(&self, id: impl Into<String>, doc: Value) {
    self.state.lock().unwrap().docs.insert(id.into(), doc);
  }

  pub fn doc(&self, id: &str) -> Option<Value> {
    self.state.lock().unwrap().docs.get(id).cloned()
  }

  pub fn len(&self) -> usize {
    self.state.lock().unwrap().docs.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Every write issued against this index, in order.
  pub fn ops(&self) -> Vec<Op> {
    self.state.lock().unwrap().ops.clone()
  }

  pub fn write_count(&self) -> usize {
    self.state.lock().unwrap().ops.len()
  }
}

#[async_trait]
impl Index for MemoryIndex {
  fn name(&self) -> &str {
    &self.name
  }

  async fn index(&self, id: &str, doc: Value) -> Result<(), IndexError> {
    let mut state = self.state.lock().unwrap();
    state.ops.push(Op::Index(id.to_string()));
    // create-if-absent: a second create for the same id is dropped, the
    // backend reports it as a per-item error and moves on.
    state.docs.entry(id.to_string()).or_insert(doc);
    Ok(())
  }

  async fn update(&self, id: &str, doc: Value) -> Result<(), IndexError> {
    let mut state = self.state.lock().unwrap();
    state.ops.push(Op::Update(id.to_string()));
    if let Some(existing) = state.docs.get_mut(id)
      && let (Some(existing), Some(partial)) = (existing.as_object_mut(), doc.as_object())
    {
      for (key, value) in partial {
        existing.insert(key.clone(), value.clone());
      }
    }
    Ok(())
  }

  async fn delete(&self, id: &str) -> Result<(), IndexError> {
    let mut state = self.state.lock().unwrap();
    state.ops.push(Op::Delete(id.to_string()));
    state.docs.remove(id);
    Ok(())
  }

  async fn get(&self, id: &str, fields: &[&str]) -> Result<Option<Value>, IndexError> {
    let state = self.state.lock().unwrap();
    let Some(doc) = state.docs.get(id) else {
      return Ok(None);
    };

    if fields.is_empty() {
      return Ok(Some(doc.clone()));
    }

    let mut projected = serde_json::Map::new();
    if let Some(source) = doc.as_object() {
      for field in fields {
        if let Some(value) = source.get(*field) {
          projected.insert((*field).to_string(), value.clone());
        }
      }
    }
    Ok(Some(Value::Object(projected)))
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[tokio::test]
  async fn index_is_create_if_absent() {
    let index = MemoryIndex::new("files");
    index.index("a", json!({"size": 1})).await.unwrap();
    index.index("a", json!({"size": 2})).await.unwrap();
    assert_eq!(index.doc("a").unwrap()["size"], 1);
  }

  #[tokio::test]
  async fn update_merges_top_level_fields() {
    let index = MemoryIndex::new("files");
    index.insert("a", json!({"size": 1, "last-seen": "x"}));
    index.update("a", json!({"last-seen": "y"})).await.unwrap();
    let doc = index.doc("a").unwrap();
    assert_eq!(doc["size"], 1);
    assert_eq!(doc["last-seen"], "y");
  }

  #[tokio::test]
  async fn get_projects_fields() {
    let index = MemoryIndex::new("files");
    index.insert("a", json!({"size": 1, "references": []}));

    let projected = index.get("a", &["size"]).await.unwrap().unwrap();
    assert_eq!(projected, json!({"size": 1}));

    assert!(index.get("missing", &[]).await.unwrap().is_none());
  }
}
