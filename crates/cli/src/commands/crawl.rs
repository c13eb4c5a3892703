//! `crawl`: run the worker pool until shutdown.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use cidsift_backend::crawler::{Crawler, Indexes, Queues};
use cidsift_backend::extractor::{Extractor, NsfwExtractor, TikaExtractor, extractor_client};
use cidsift_backend::index::search::Client;
use cidsift_backend::protocol::IpfsProtocol;
use cidsift_backend::queue::PublisherFactory;
use cidsift_backend::queue::amqp::AmqpFactory;
use cidsift_backend::worker::{Pool, PoolSizes};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::checked_config;

pub async fn cmd_crawl(config_file: Option<&Path>, cancel: CancellationToken) -> Result<()> {
  let config = checked_config(config_file)?;

  info!("initializing crawler");

  let client = Arc::new(Client::new(&config.opensearch)?);
  let indexes = Indexes {
    files: client.clone().index(&config.indexes.files.name),
    directories: client.clone().index(&config.indexes.directories.name),
    invalids: client.clone().index(&config.indexes.invalids.name),
    partials: client.clone().index(&config.indexes.partials.name),
  };

  let factory = AmqpFactory::connect(&config.amqp).await?;
  let queues = Queues {
    files: factory.publisher(&config.queues.files.name).await?,
    directories: factory.publisher(&config.queues.directories.name).await?,
    hashes: factory.publisher(&config.queues.hashes.name).await?,
  };

  let protocol = Arc::new(IpfsProtocol::new(&config.ipfs, config.workers.ipfs_max_connections)?);
  let http = extractor_client(config.workers.extractor_max_connections)?;
  let extractors: Vec<Arc<dyn Extractor>> = vec![
    Arc::new(TikaExtractor::new(&config.tika, http.clone(), protocol.clone())),
    Arc::new(NsfwExtractor::new(&config.nsfw, http)),
  ];

  let crawler = Crawler::new(config.crawler.clone(), indexes, queues, protocol, extractors);

  let mut pool = Pool::new(crawler, PoolSizes::from(&config.workers));
  pool
    .start(
      cancel.clone(),
      &factory.consumer(&config.queues.files.name).await?,
      &factory.consumer(&config.queues.directories.name).await?,
      &factory.consumer(&config.queues.hashes.name).await?,
    )
    .await?;

  info!("crawler running; waiting for shutdown signal");
  cancel.cancelled().await;

  // Let every worker settle its current delivery before the bulk access
  // layer flushes and stops.
  info!("shutting down, draining workers");
  pool.join().await;

  info!("flushing index buffers");
  client.close().await;

  Ok(())
}
