//! The resource model.
//!
//! A [`Resource`] is a `(protocol, id)` pair naming an object in the
//! content-addressed network. An [`AnnotatedResource`] adds everything the
//! pipeline learns about it along the way: where it came from
//! ([`Source`]), how it was discovered ([`Reference`]) and what a protocol
//! stat probe said about it ([`Stat`]). Annotated resources are what
//! travels through the work queues, serialized as JSON.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Protocol tag of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
  /// Zero value; handing this to the crawler is a programmer error.
  #[default]
  Invalid,
  Ipfs,
}

impl fmt::Display for Protocol {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Protocol::Invalid => write!(f, "invalid"),
      Protocol::Ipfs => write!(f, "ipfs"),
    }
  }
}

/// Resolved type of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
  /// Not yet statted.
  #[default]
  Undefined,
  File,
  Directory,
  /// Referenced but not yet resolved; staged in the partials index.
  Partial,
  Unsupported,
}

impl fmt::Display for ResourceType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ResourceType::Undefined => "undefined",
      ResourceType::File => "file",
      ResourceType::Directory => "directory",
      ResourceType::Partial => "partial",
      ResourceType::Unsupported => "unsupported",
    };
    write!(f, "{s}")
  }
}

/// Provenance of a resource; drives the update policy for known items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
  /// Legacy ingress tag, handled like [`Source::Sniffer`].
  #[default]
  Unknown,
  Sniffer,
  Directory,
  Manual,
  User,
}

impl fmt::Display for Source {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Source::Unknown => "unknown",
      Source::Sniffer => "sniffer",
      Source::Directory => "directory",
      Source::Manual => "manual",
      Source::User => "user",
    };
    write!(f, "{s}")
  }
}

/// A content identifier within a protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
  pub protocol: Protocol,
  pub id: String,
}

impl Resource {
  pub fn ipfs(id: impl Into<String>) -> Self {
    Self {
      protocol: Protocol::Ipfs,
      id: id.into(),
    }
  }

  pub fn uri(&self) -> String {
    format!("{}://{}", self.protocol, self.id)
  }
}

/// How a resource was discovered: a parent directory and the entry name
/// within it. The parent chain is a lineage (a DAG rooted at ingress), not
/// a cycle; it is serialized into each queue message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Reference {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub parent: Option<Box<AnnotatedResource>>,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub name: String,
}

/// Fields resolved by a protocol stat probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Stat {
  #[serde(rename = "type")]
  pub resource_type: ResourceType,
  pub size: u64,
}

/// A resource annotated with provenance, discovery reference and stat data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotatedResource {
  #[serde(flatten)]
  pub resource: Resource,
  #[serde(default)]
  pub source: Source,
  #[serde(default, skip_serializing_if = "Reference::is_empty")]
  pub reference: Reference,
  #[serde(default)]
  pub stat: Stat,
}

impl Reference {
  pub fn is_empty(&self) -> bool {
    self.parent.is_none() && self.name.is_empty()
  }
}

impl AnnotatedResource {
  /// A fresh, untyped resource with no reference.
  pub fn new(resource: Resource, source: Source) -> Self {
    Self {
      resource,
      source,
      reference: Reference::default(),
      stat: Stat::default(),
    }
  }

  pub fn id(&self) -> &str {
    &self.resource.id
  }

  pub fn protocol(&self) -> Protocol {
    self.resource.protocol
  }

  pub fn resource_type(&self) -> ResourceType {
    self.stat.resource_type
  }

  pub fn size(&self) -> u64 {
    self.stat.size
  }
}

impl fmt::Display for AnnotatedResource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.reference.name.is_empty() {
      write!(f, "{}", self.resource.uri())
    } else {
      write!(f, "{} ({})", self.reference.name, self.resource.uri())
    }
  }
}

/// A freshly observed provider record: some peer claims to hold a CID.
///
/// Emitted by the sniffer, filtered, and queued. The span links work done
/// downstream back to the datastore write that triggered it; it is local
/// to this process and never serialized.
#[derive(Debug, Clone)]
pub struct Provider {
  pub resource: Resource,
  pub date: DateTime<Utc>,
  pub provider: String,
  pub span: tracing::Span,
}

impl fmt::Display for Provider {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} by {} at {}", self.resource.uri(), self.provider, self.date)
  }
}
