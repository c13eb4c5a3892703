//! `add`: queue a single CID for crawling.

use std::path::Path;

use anyhow::Result;
use cidsift_backend::queue::amqp::AmqpFactory;
use cidsift_backend::queue::{MANUAL_PRIORITY, Publisher, PublisherFactory};
use cidsift_core::{AnnotatedResource, Resource, Source};
use tracing::info;

use super::checked_config;

pub async fn cmd_add(config_file: Option<&Path>, cid: &str) -> Result<()> {
  let config = checked_config(config_file)?;

  let factory = AmqpFactory::connect(&config.amqp).await?;
  let publisher = factory.publisher(&config.queues.hashes.name).await?;

  let resource = AnnotatedResource::new(Resource::ipfs(cid), Source::Manual);
  publisher.publish(&resource, MANUAL_PRIORITY).await?;

  info!(cid, queue = %config.queues.hashes.name, "queued for crawling");
  Ok(())
}
