//! Document shapes stored in the four indexes.
//!
//! Timestamps are truncated to whole seconds and serialized without a
//! fractional part; the legacy index mappings reject millisecond
//! fractions.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Seconds-resolution timestamp wire format (`2023-01-02T10:04:05Z`).
pub mod second_precision {
  use chrono::{DateTime, NaiveDateTime, Utc};
  use serde::{self, Deserialize, Deserializer, Serializer};

  const FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

  pub fn serialize<S: Serializer>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&date.format(FORMAT).to_string())
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let s = String::deserialize(deserializer)?;
    NaiveDateTime::parse_from_str(&s, FORMAT)
      .map(|naive| naive.and_utc())
      .map_err(serde::de::Error::custom)
  }

  pub mod option {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    use super::FORMAT;

    pub fn serialize<S: Serializer>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error> {
      match date {
        Some(d) => super::serialize(d, serializer),
        None => serializer.serialize_none(),
      }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error> {
      let s = Option::<String>::deserialize(deserializer)?;
      match s {
        None => Ok(None),
        Some(s) => NaiveDateTime::parse_from_str(&s, FORMAT)
          .map(|naive| Some(naive.and_utc()))
          .map_err(serde::de::Error::custom),
      }
    }
  }
}

/// Drop sub-second precision.
pub fn truncate_to_second(t: DateTime<Utc>) -> DateTime<Utc> {
  t.with_nanosecond(0).unwrap_or(t)
}

/// How a document was discovered: parent directory hash and entry name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocReference {
  pub parent_hash: String,
  pub name: String,
}

pub type References = Vec<DocReference>;

/// Fields common to file and directory documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
  #[serde(rename = "first-seen", with = "second_precision")]
  pub first_seen: DateTime<Utc>,
  #[serde(rename = "last-seen", with = "second_precision")]
  pub last_seen: DateTime<Utc>,
  #[serde(default)]
  pub references: References,
  pub size: u64,
}

/// A file document; extractors fill the metadata map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct File {
  #[serde(flatten)]
  pub document: Document,
  #[serde(flatten)]
  pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
  File,
  Directory,
  Unknown,
  Unsupported,
}

/// One entry of a directory document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Link {
  pub hash: String,
  pub name: String,
  pub size: u64,
  #[serde(rename = "Type")]
  pub link_type: LinkType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directory {
  #[serde(flatten)]
  pub document: Document,
  #[serde(default)]
  pub links: Vec<Link>,
}

/// Marker for a referenced CID whose own metadata is still unresolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partial {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalid {
  pub error: String,
}

/// Partial update issued against an existing document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Update {
  #[serde(
    rename = "last-seen",
    default,
    with = "second_precision::option",
    skip_serializing_if = "Option::is_none"
  )]
  pub last_seen: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub references: Option<References>,
}
