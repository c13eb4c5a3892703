//! IPFS node HTTP API implementation.

use cidsift_core::config::Ipfs;
use cidsift_core::{AnnotatedResource, InvalidResource, Reference, Resource, ResourceType, Source, Stat};
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{Protocol, ProtocolError};

pub struct IpfsProtocol {
  http: reqwest::Client,
  api_url: String,
  gateway_url: String,
}

impl IpfsProtocol {
  pub fn new(cfg: &Ipfs, max_connections: usize) -> Result<Self, ProtocolError> {
    let http = reqwest::Client::builder()
      .pool_max_idle_per_host(max_connections)
      .build()?;

    Ok(Self {
      http,
      api_url: cfg.api_url.trim_end_matches('/').to_string(),
      gateway_url: cfg.gateway_url.trim_end_matches('/').to_string(),
    })
  }
}

/// `files/stat` response body.
#[derive(Debug, Deserialize)]
struct StatResponse {
  #[serde(rename = "Type")]
  kind: String,
  #[serde(rename = "Size", default)]
  size: u64,
  #[serde(rename = "CumulativeSize", default)]
  cumulative_size: u64,
}

/// API error body, e.g. `{"Message":"invalid path ...","Code":0}`.
#[derive(Debug, Deserialize)]
struct ApiError {
  #[serde(rename = "Message", default)]
  message: String,
}

/// One NDJSON line of a streaming `ls` response.
#[derive(Debug, Deserialize)]
struct LsLine {
  #[serde(rename = "Objects", default)]
  objects: Vec<LsObject>,
}

#[derive(Debug, Deserialize)]
struct LsObject {
  #[serde(rename = "Links", default)]
  links: Vec<LsLink>,
}

#[derive(Debug, Deserialize)]
struct LsLink {
  #[serde(rename = "Name", default)]
  name: String,
  #[serde(rename = "Hash")]
  hash: String,
  #[serde(rename = "Size", default)]
  size: u64,
  #[serde(rename = "Type", default)]
  kind: i64,
}

/// Unixfs type codes as reported by `ls`.
fn link_resource_type(kind: i64) -> ResourceType {
  match kind {
    0 => ResourceType::Undefined,
    1 => ResourceType::Directory,
    2 => ResourceType::File,
    _ => ResourceType::Unsupported,
  }
}

impl IpfsProtocol {
  fn child_of(parent: &AnnotatedResource, link: LsLink) -> AnnotatedResource {
    AnnotatedResource {
      resource: Resource::ipfs(link.hash),
      source: Source::Directory,
      reference: Reference {
        parent: Some(Box::new(parent.clone())),
        name: link.name,
      },
      stat: Stat {
        resource_type: link_resource_type(link.kind),
        size: link.size,
      },
    }
  }

  async fn api_error(response: reqwest::Response) -> ProtocolError {
    let status = response.status();
    let message = match response.json::<ApiError>().await {
      Ok(body) => body.message,
      Err(_) => String::new(),
    };

    // Client-side rejections mean the identifier itself is bad; anything
    // else is the node misbehaving and worth a retry.
    if status.is_client_error() || message.contains("invalid") {
      ProtocolError::Invalid(InvalidResource::Unresolvable(message))
    } else {
      ProtocolError::UnexpectedResponse(format!("{status}: {message}"))
    }
  }
}

#[async_trait::async_trait]
impl Protocol for IpfsProtocol {
  async fn stat(&self, resource: &mut AnnotatedResource) -> Result<(), ProtocolError> {
    let response = self
      .http
      .post(format!("{}/api/v0/files/stat", self.api_url))
      .query(&[("arg", format!("/ipfs/{}", resource.id()))])
      .send()
      .await?;

    if !response.status().is_success() {
      return Err(Self::api_error(response).await);
    }

    let stat: StatResponse = response
      .json()
      .await
      .map_err(|e| ProtocolError::UnexpectedResponse(format!("decoding stat: {e}")))?;

    resource.stat = match stat.kind.as_str() {
      "file" => Stat {
        resource_type: ResourceType::File,
        size: stat.size,
      },
      "directory" => Stat {
        resource_type: ResourceType::Directory,
        size: stat.cumulative_size,
      },
      _ => Stat {
        resource_type: ResourceType::Unsupported,
        size: stat.size,
      },
    };

    trace!(cid = resource.id(), kind = %resource.resource_type(), size = resource.size(), "statted");
    Ok(())
  }

  async fn ls(
    &self,
    resource: &AnnotatedResource,
    entries: mpsc::Sender<AnnotatedResource>,
  ) -> Result<(), ProtocolError> {
    let response = self
      .http
      .post(format!("{}/api/v0/ls", self.api_url))
      .query(&[
        ("arg", resource.id()),
        ("resolve-type", "false"),
        ("size", "false"),
        ("stream", "true"),
      ])
      .send()
      .await?;

    if !response.status().is_success() {
      return Err(Self::api_error(response).await);
    }

    let mut stream = response.bytes_stream();
    let mut buffer = Vec::new();

    while let Some(chunk) = stream.next().await {
      buffer.extend_from_slice(&chunk?);

      while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=newline).collect();
        if line.len() <= 1 {
          continue;
        }

        let parsed: LsLine = serde_json::from_slice(&line)
          .map_err(|e| ProtocolError::UnexpectedResponse(format!("decoding ls entry: {e}")))?;

        for object in parsed.objects {
          for link in object.links {
            if entries.send(Self::child_of(resource, link)).await.is_err() {
              // Consumer stopped; nothing left to enumerate for.
              debug!(cid = resource.id(), "ls consumer went away");
              return Ok(());
            }
          }
        }
      }
    }

    Ok(())
  }

  fn gateway_url(&self, resource: &AnnotatedResource) -> String {
    format!("{}/ipfs/{}", self.gateway_url, resource.id())
  }
}
