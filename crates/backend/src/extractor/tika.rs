//! Tika extractor: text, language and document metadata.
//!
//! The extractor server fetches the resource itself (through the gateway
//! URL we hand it) and returns a JSON object whose fields are merged into
//! the document's metadata map.

use std::sync::Arc;

use async_trait::async_trait;
use cidsift_core::AnnotatedResource;
use cidsift_core::config::ExtractorService;
use serde_json::{Map, Value};
use tracing::trace;

use super::{Extractor, ExtractorError, validate_max_size};
use crate::protocol::Protocol;

pub struct TikaExtractor {
  http: reqwest::Client,
  cfg: ExtractorService,
  protocol: Arc<dyn Protocol>,
}

impl TikaExtractor {
  pub fn new(cfg: &ExtractorService, http: reqwest::Client, protocol: Arc<dyn Protocol>) -> Self {
    Self {
      http,
      cfg: cfg.clone(),
      protocol,
    }
  }
}

#[async_trait]
impl Extractor for TikaExtractor {
  fn name(&self) -> &str {
    "tika"
  }

  async fn extract(
    &self,
    resource: &AnnotatedResource,
    metadata: &mut Map<String, Value>,
  ) -> Result<(), ExtractorError> {
    validate_max_size(resource, self.cfg.max_file_size_bytes)?;

    let response = self
      .http
      .get(format!("{}/extract", self.cfg.url.trim_end_matches('/')))
      .query(&[("url", self.protocol.gateway_url(resource))])
      .timeout(self.cfg.timeout())
      .send()
      .await?;

    let status = response.status();
    if !status.is_success() {
      return Err(ExtractorError::UnexpectedResponse(format!("tika returned {status}")));
    }

    let body: Value = response
      .json()
      .await
      .map_err(|e| ExtractorError::UnexpectedResponse(format!("decoding tika response: {e}")))?;

    let Value::Object(fields) = body else {
      return Err(ExtractorError::UnexpectedResponse("tika response is not an object".to_string()));
    };

    for (key, value) in fields {
      metadata.insert(key, value);
    }

    trace!(cid = resource.id(), "tika metadata extracted");
    Ok(())
  }
}
