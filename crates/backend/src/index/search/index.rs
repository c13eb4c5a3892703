//! One named index over the shared backend client.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{Client, GetRequest, bulk_indexer::BulkAction};
use crate::index::{Index, IndexError};

pub struct SearchIndex {
  name: String,
  client: Arc<Client>,
}

impl SearchIndex {
  pub fn new(client: Arc<Client>, name: String) -> Self {
    Self { name, client }
  }
}

#[async_trait]
impl Index for SearchIndex {
  fn name(&self) -> &str {
    &self.name
  }

  async fn index(&self, id: &str, doc: Value) -> Result<(), IndexError> {
    self
      .client
      .indexer()
      .add(BulkAction::Create, &self.name, id, Some(&doc))
      .await
  }

  async fn update(&self, id: &str, doc: Value) -> Result<(), IndexError> {
    self
      .client
      .indexer()
      .add(BulkAction::Update, &self.name, id, Some(&doc))
      .await
  }

  async fn delete(&self, id: &str) -> Result<(), IndexError> {
    self.client.indexer().add(BulkAction::Delete, &self.name, id, None).await
  }

  async fn get(&self, id: &str, fields: &[&str]) -> Result<Option<Value>, IndexError> {
    let request = GetRequest {
      index: self.name.clone(),
      doc_id: id.to_string(),
      fields: fields.iter().map(|f| f.to_string()).collect(),
    };
    let rx = self.client.getter().get(request).await;
    rx.await.map_err(|_| IndexError::Closed)?
  }
}
