//! AMQP 0-9-1 transport (RabbitMQ)

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{options::*, types::FieldTable, Channel, Connection, ConnectionProperties};
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::error::TransportError;

use super::{Connector, Delivery, DeliveryStream};

/// Opens one channel per connection and subscribes to the configured queue
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    config: BrokerConfig,
}

impl AmqpConnector {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    async fn subscribe(&self, connection: &Connection) -> Result<(Channel, lapin::Consumer), lapin::Error> {
        let channel = connection.create_channel().await?;

        channel
            .queue_declare(
                &self.config.queue,
                QueueDeclareOptions {
                    durable: self.config.durable,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await?;

        let consumer = channel
            .basic_consume(
                &self.config.queue,
                &self.config.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok((channel, consumer))
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> Result<Box<dyn DeliveryStream>, TransportError> {
        let connection = Connection::connect(&self.config.url, ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        match self.subscribe(&connection).await {
            Ok((channel, consumer)) => {
                info!(queue = %self.config.queue, prefetch = self.config.prefetch, "Subscribed to queue");
                Ok(Box::new(AmqpStream {
                    connection,
                    channel,
                    consumer,
                }))
            },
            Err(e) => {
                if let Err(close_err) = connection.close(200, "subscription failed").await {
                    debug!(cause = %close_err, "Closing broker connection failed");
                }
                Err(TransportError::Channel(e.to_string()))
            },
        }
    }
}

pub struct AmqpStream {
    connection: Connection,
    channel: Channel,
    consumer: lapin::Consumer,
}

#[async_trait]
impl DeliveryStream for AmqpStream {
    async fn next(&mut self) -> Option<Result<Delivery, TransportError>> {
        let item = self.consumer.next().await?;
        Some(
            item.map(|delivery| Delivery {
                tag: delivery.delivery_tag,
                payload: delivery.data,
            })
            .map_err(|e| TransportError::ConnectionLost(e.to_string())),
        )
    }

    async fn ack(&mut self, tag: u64) -> Result<(), TransportError> {
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(|e| TransportError::Ack {
                tag,
                cause: e.to_string(),
            })
    }

    async fn close(&mut self) {
        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(200, "consumer shutting down").await {
                warn!(cause = %e, "Failed to close broker channel");
            }
        }
        if self.connection.status().connected() {
            if let Err(e) = self.connection.close(200, "consumer shutting down").await {
                warn!(cause = %e, "Failed to close broker connection");
            }
        }
        debug!("Broker connection released");
    }
}
