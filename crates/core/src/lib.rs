//! Core domain types and configuration for cidsift.
//!
//! This crate is dependency-light on purpose: it holds the resource model
//! shared by every pipeline component (sniffer, crawler, indexes, queues)
//! and the central configuration, nothing else.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::InvalidResource;
pub use types::{AnnotatedResource, Protocol, Provider, Reference, Resource, ResourceType, Source, Stat};
