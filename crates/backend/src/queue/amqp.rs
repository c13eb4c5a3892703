//! AMQP broker implementation.
//!
//! Queues are declared durable and priority-enabled with a per-message
//! TTL. One channel per publisher/consumer, one shared connection behind
//! the factory. Reconnect policy is deliberately simple: bounded retries
//! at a fixed interval during connect; an established connection that
//! drops surfaces as an error and the process supervisor restarts us.

use std::sync::Arc;

use async_trait::async_trait;
use cidsift_core::AnnotatedResource;
use cidsift_core::config::Amqp;
use futures::StreamExt;
use lapin::options::{
  BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Acker, Consumer, Delivery, Publisher, PublisherFactory, QueueError};

/// Prefetch per consumer channel; keeps workers fed without hoarding.
const PREFETCH_COUNT: u16 = 64;

pub struct AmqpFactory {
  connection: Connection,
  message_ttl_ms: u64,
}

impl AmqpFactory {
  /// Connect with bounded retries per the configured reconnect policy.
  pub async fn connect(cfg: &Amqp) -> Result<Self, QueueError> {
    let mut attempt = 0u32;
    let connection = loop {
      match Connection::connect(&cfg.url, ConnectionProperties::default()).await {
        Ok(connection) => break connection,
        Err(e) => {
          attempt += 1;
          if attempt > cfg.max_reconnect {
            return Err(QueueError::Broker(format!("connecting to broker: {e}")));
          }
          warn!(attempt, error = %e, "broker connect failed, retrying");
          tokio::time::sleep(cfg.reconnect_wait()).await;
        }
      }
    };

    info!(url = %cfg.url, "connected to broker");
    Ok(Self {
      connection,
      message_ttl_ms: cfg.message_ttl().as_millis() as u64,
    })
  }

  async fn channel_for(&self, queue: &str) -> Result<Channel, QueueError> {
    let channel = self.connection.create_channel().await?;

    let mut arguments = FieldTable::default();
    arguments.insert(ShortString::from("x-max-priority"), AMQPValue::LongInt(9));
    arguments.insert(
      ShortString::from("x-message-ttl"),
      AMQPValue::LongLongInt(self.message_ttl_ms as i64),
    );

    channel
      .queue_declare(
        queue,
        QueueDeclareOptions {
          durable: true,
          ..QueueDeclareOptions::default()
        },
        arguments,
      )
      .await?;

    debug!(queue, "queue declared");
    Ok(channel)
  }

  pub async fn consumer(&self, queue: &str) -> Result<AmqpConsumer, QueueError> {
    let channel = self.channel_for(queue).await?;
    channel.basic_qos(PREFETCH_COUNT, BasicQosOptions::default()).await?;
    Ok(AmqpConsumer {
      channel,
      queue: queue.to_string(),
    })
  }
}

#[async_trait]
impl PublisherFactory for AmqpFactory {
  async fn publisher(&self, queue: &str) -> Result<Arc<dyn Publisher>, QueueError> {
    let channel = self.channel_for(queue).await?;
    Ok(Arc::new(AmqpPublisher {
      channel,
      queue: queue.to_string(),
    }))
  }
}

pub struct AmqpPublisher {
  channel: Channel,
  queue: String,
}

#[async_trait]
impl Publisher for AmqpPublisher {
  async fn publish(&self, resource: &AnnotatedResource, priority: u8) -> Result<(), QueueError> {
    let body = serde_json::to_vec(resource)?;

    let confirm = self
      .channel
      .basic_publish(
        "",
        &self.queue,
        BasicPublishOptions::default(),
        &body,
        BasicProperties::default()
          .with_priority(priority)
          .with_delivery_mode(2), // persistent
      )
      .await?;
    confirm.await?;
    Ok(())
  }
}

pub struct AmqpConsumer {
  channel: Channel,
  queue: String,
}

#[async_trait]
impl Consumer for AmqpConsumer {
  async fn consume(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<Delivery>, QueueError> {
    let mut stream = self
      .channel
      .basic_consume(
        &self.queue,
        "cidsift-worker",
        BasicConsumeOptions::default(),
        FieldTable::default(),
      )
      .await?;

    let (tx, rx) = mpsc::channel(PREFETCH_COUNT as usize);
    let queue = self.queue.clone();
    // The channel handle must outlive this consumer value, or the broker
    // closes the stream under the workers.
    let channel = self.channel.clone();

    tokio::spawn(async move {
      let _channel = channel;
      loop {
        tokio::select! {
          biased;
          _ = cancel.cancelled() => {
            debug!(queue, "consumer cancelled");
            break;
          }
          next = stream.next() => match next {
            Some(Ok(delivery)) => {
              let wrapped = Delivery::new(delivery.data, Box::new(AmqpAcker { acker: delivery.acker }));
              if tx.send(wrapped).await.is_err() {
                break;
              }
            }
            Some(Err(e)) => {
              warn!(queue, error = %e, "consume stream error");
              break;
            }
            None => {
              warn!(queue, "consume stream closed by broker");
              break;
            }
          },
        }
      }
    });

    Ok(rx)
  }
}

struct AmqpAcker {
  acker: lapin::acker::Acker,
}

#[async_trait]
impl Acker for AmqpAcker {
  async fn ack(self: Box<Self>) -> Result<(), QueueError> {
    self.acker.ack(BasicAckOptions::default()).await?;
    Ok(())
  }

  async fn nack(self: Box<Self>, requeue: bool) -> Result<(), QueueError> {
    self
      .acker
      .nack(BasicNackOptions {
        requeue,
        ..BasicNackOptions::default()
      })
      .await?;
    Ok(())
  }
}
