//! Queue consumer
//!
//! Owns the broker connection and feeds deliveries to a [`MessageHandler`],
//! one at a time:
//!
//! ```text
//! Disconnected -> Connecting -> Consuming -> Disconnected
//!                     |                          |
//!                     +------ reconnect policy --+
//! ```
//!
//! Deliveries are acknowledged on receipt, before decoding, so every
//! delivery is acknowledged exactly once and never redelivered (at-most-once).
//! Cancelling the token stops the consumer in any state; a message already
//! handed to the handler is processed to completion first. The connection is
//! closed on every exit path.

pub mod amqp;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{BrokerConfig, ReconnectMode};
use crate::error::TransportError;
use crate::message::Message;
use crate::pipeline::{MessageHandler, Outcome};

pub use amqp::AmqpConnector;

/// A raw message as received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: u64,
    pub payload: Vec<u8>,
}

/// Opens subscriptions on the broker
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect, declare the queue, set prefetch and register the consumer
    async fn connect(&self) -> Result<Box<dyn DeliveryStream>, TransportError>;
}

/// An open subscription
#[async_trait]
pub trait DeliveryStream: Send {
    /// Next delivery; `None` once the broker ends the stream
    async fn next(&mut self) -> Option<Result<Delivery, TransportError>>;

    async fn ack(&mut self, tag: u64) -> Result<(), TransportError>;

    /// Release the channel and the connection. Never fails.
    async fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Consuming,
}

impl ConsumerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::Disconnected => "disconnected",
            ConsumerState::Connecting => "connecting",
            ConsumerState::Consuming => "consuming",
        }
    }
}

impl std::fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens after the broker connection is lost or cannot be opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    Exit,
    Retry {
        delay: Duration,
        /// Consecutive failures tolerated; `None` retries forever
        max_attempts: Option<u32>,
    },
}

impl ReconnectPolicy {
    pub fn from_config(config: &BrokerConfig) -> Self {
        match config.reconnect {
            ReconnectMode::Exit => ReconnectPolicy::Exit,
            ReconnectMode::Retry => ReconnectPolicy::Retry {
                delay: Duration::from_secs(config.reconnect_delay_secs),
                max_attempts: config.max_reconnect_attempts,
            },
        }
    }
}

/// Why [`QueueConsumer::run`] returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Operator interrupt
    Interrupted,
    /// Transport failure under [`ReconnectPolicy::Exit`]
    TransportFailed(TransportError),
    /// Too many consecutive transport failures
    RetriesExhausted { attempts: u32, last: TransportError },
}

impl ExitReason {
    pub fn is_clean(&self) -> bool {
        matches!(self, ExitReason::Interrupted)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub connections: u64,
    pub received: u64,
    pub acknowledged: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Payloads that could not be decoded into a message
    pub rejected: u64,
}

pub struct QueueConsumer {
    connector: Arc<dyn Connector>,
    handler: Arc<dyn MessageHandler>,
    policy: ReconnectPolicy,
    state: ConsumerState,
    stats: ConsumerStats,
}

impl QueueConsumer {
    pub fn new(
        connector: Arc<dyn Connector>,
        handler: Arc<dyn MessageHandler>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            connector,
            handler,
            policy,
            state: ConsumerState::Disconnected,
            stats: ConsumerStats::default(),
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
    }

    fn transition(&mut self, next: ConsumerState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "Consumer state change");
            self.state = next;
        }
    }

    /// Consume until cancelled or the reconnect policy gives up
    pub async fn run(&mut self, cancel: CancellationToken) -> ExitReason {
        let mut failures: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return self.stop();
            }

            self.transition(ConsumerState::Connecting);
            let connector = self.connector.clone();
            let connected = tokio::select! {
                _ = cancel.cancelled() => return self.stop(),
                result = connector.connect() => result,
            };

            let err = match connected {
                Ok(mut stream) => {
                    failures = 0;
                    self.stats.connections += 1;
                    self.transition(ConsumerState::Consuming);
                    info!("Consuming from broker");

                    let result = self.consume(stream.as_mut(), &cancel).await;
                    stream.close().await;
                    self.transition(ConsumerState::Disconnected);

                    match result {
                        Ok(()) => return self.stop(),
                        Err(err) => {
                            warn!(cause = %err, "Broker connection lost");
                            err
                        },
                    }
                },
                Err(err) => {
                    self.transition(ConsumerState::Disconnected);
                    error!(cause = %err, "Failed to open broker subscription");
                    err
                },
            };

            failures += 1;
            match self.policy {
                ReconnectPolicy::Exit => return ExitReason::TransportFailed(err),
                ReconnectPolicy::Retry {
                    delay,
                    max_attempts,
                } => {
                    if let Some(max) = max_attempts {
                        if failures >= max {
                            error!(attempts = failures, "Giving up on the broker");
                            return ExitReason::RetriesExhausted {
                                attempts: failures,
                                last: err,
                            };
                        }
                    }
                    info!(delay_secs = delay.as_secs(), attempt = failures, "Reconnecting to broker");
                    tokio::select! {
                        _ = cancel.cancelled() => return self.stop(),
                        _ = tokio::time::sleep(delay) => {},
                    }
                },
            }
        }
    }

    fn stop(&mut self) -> ExitReason {
        self.transition(ConsumerState::Disconnected);
        info!(
            received = self.stats.received,
            succeeded = self.stats.succeeded,
            failed = self.stats.failed,
            rejected = self.stats.rejected,
            "Consumer stopped"
        );
        ExitReason::Interrupted
    }

    /// Returns `Ok` when cancelled, `Err` when the subscription broke
    async fn consume(
        &mut self,
        stream: &mut dyn DeliveryStream,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                next = stream.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(err)) => return Err(err),
                None => {
                    return Err(TransportError::ConnectionLost(
                        "delivery stream ended".to_string(),
                    ))
                },
            };
            self.stats.received += 1;

            stream.ack(delivery.tag).await?;
            self.stats.acknowledged += 1;

            let outcome = match Message::from_slice(&delivery.payload) {
                Ok(message) => self.handler.handle(&message).await,
                Err(err) => {
                    warn!(stage = "validation", cause = %err, tag = delivery.tag, "Discarding undecodable message");
                    self.stats.rejected += 1;
                    Outcome::rejected(err)
                },
            };

            match outcome {
                Outcome::Ok => self.stats.succeeded += 1,
                Outcome::Failed(_) => self.stats.failed += 1,
            }
        }
    }
}
