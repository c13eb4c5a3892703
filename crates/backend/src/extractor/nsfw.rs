//! NSFW classification extractor.
//!
//! Classifies image resources via the nsfw-server and stores the whole
//! classification object under the `nsfw` metadata key.

use async_trait::async_trait;
use cidsift_core::AnnotatedResource;
use cidsift_core::config::ExtractorService;
use serde_json::{Map, Value};
use tracing::trace;

use super::{Extractor, ExtractorError, validate_max_size};

pub struct NsfwExtractor {
  http: reqwest::Client,
  cfg: ExtractorService,
}

impl NsfwExtractor {
  pub fn new(cfg: &ExtractorService, http: reqwest::Client) -> Self {
    Self { http, cfg: cfg.clone() }
  }
}

#[async_trait]
impl Extractor for NsfwExtractor {
  fn name(&self) -> &str {
    "nsfw"
  }

  async fn extract(
    &self,
    resource: &AnnotatedResource,
    metadata: &mut Map<String, Value>,
  ) -> Result<(), ExtractorError> {
    validate_max_size(resource, self.cfg.max_file_size_bytes)?;

    let response = self
      .http
      .get(format!(
        "{}/classify/{}",
        self.cfg.url.trim_end_matches('/'),
        resource.id()
      ))
      .timeout(self.cfg.timeout())
      .send()
      .await?;

    let status = response.status();
    if !status.is_success() {
      return Err(ExtractorError::UnexpectedResponse(format!("nsfw-server returned {status}")));
    }

    let body: Value = response
      .json()
      .await
      .map_err(|e| ExtractorError::UnexpectedResponse(format!("decoding nsfw response: {e}")))?;

    metadata.insert("nsfw".to_string(), body);

    trace!(cid = resource.id(), "nsfw classification extracted");
    Ok(())
  }
}
