//! Queue consumer behavior against a scripted broker

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use pubindex_worker::consumer::{
    Connector, ConsumerState, Delivery, DeliveryStream, ExitReason, QueueConsumer, ReconnectPolicy,
};
use pubindex_worker::error::TransportError;
use pubindex_worker::message::Message;
use pubindex_worker::pipeline::{MessageHandler, Outcome};

#[derive(Clone, Copy)]
enum SessionEnd {
    /// Stream stays open until the consumer stops
    Hang,
    /// Broker ends the stream
    Drop,
}

struct Session {
    deliveries: Vec<Delivery>,
    end: SessionEnd,
}

#[derive(Default)]
struct Broker {
    sessions: Mutex<VecDeque<Session>>,
    acks: Arc<Mutex<Vec<u64>>>,
    connects: AtomicUsize,
    closes: Arc<AtomicUsize>,
}

impl Broker {
    fn with_sessions(sessions: Vec<Session>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(sessions.into()),
            ..Default::default()
        })
    }

    fn acks(&self) -> Vec<u64> {
        self.acks.lock().expect("acks lock").clone()
    }
}

struct ScriptedStream {
    deliveries: VecDeque<Delivery>,
    end: SessionEnd,
    acks: Arc<Mutex<Vec<u64>>>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl Connector for Broker {
    async fn connect(&self) -> Result<Box<dyn DeliveryStream>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let session = self
            .sessions
            .lock()
            .expect("sessions lock")
            .pop_front()
            .ok_or_else(|| TransportError::Connect("connection refused".to_string()))?;

        Ok(Box::new(ScriptedStream {
            deliveries: session.deliveries.into(),
            end: session.end,
            acks: self.acks.clone(),
            closes: self.closes.clone(),
        }))
    }
}

#[async_trait]
impl DeliveryStream for ScriptedStream {
    async fn next(&mut self) -> Option<Result<Delivery, TransportError>> {
        if let Some(delivery) = self.deliveries.pop_front() {
            return Some(Ok(delivery));
        }
        match self.end {
            SessionEnd::Hang => std::future::pending().await,
            SessionEnd::Drop => None,
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<(), TransportError> {
        self.acks.lock().expect("acks lock").push(tag);
        Ok(())
    }

    async fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records handled resource ids and cancels after `stop_after` messages
struct RecordingHandler {
    handled: Mutex<Vec<String>>,
    stop_after: usize,
    cancel: CancellationToken,
}

impl RecordingHandler {
    fn new(stop_after: usize, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            handled: Mutex::new(Vec::new()),
            stop_after,
            cancel,
        })
    }

    fn handled(&self) -> Vec<String> {
        self.handled.lock().expect("handled lock").clone()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, message: &Message) -> Outcome {
        let mut handled = self.handled.lock().expect("handled lock");
        handled.push(message.resource_id().to_string());
        if handled.len() >= self.stop_after {
            self.cancel.cancel();
        }
        Outcome::Ok
    }
}

fn delivery(tag: u64, resource_id: &str) -> Delivery {
    Delivery {
        tag,
        payload: format!(r#"{{"uuid":"{}","path":"/data/{}.tif","type":"single"}}"#, resource_id, resource_id)
            .into_bytes(),
    }
}

fn retry(delay_ms: u64, max_attempts: Option<u32>) -> ReconnectPolicy {
    ReconnectPolicy::Retry {
        delay: Duration::from_millis(delay_ms),
        max_attempts,
    }
}

#[tokio::test]
async fn test_every_delivery_acked_once_including_garbage() {
    let broker = Broker::with_sessions(vec![Session {
        deliveries: vec![
            delivery(1, "r1"),
            Delivery {
                tag: 2,
                payload: b"definitely not json".to_vec(),
            },
            delivery(3, "r3"),
        ],
        end: SessionEnd::Hang,
    }]);
    let cancel = CancellationToken::new();
    let handler = RecordingHandler::new(2, cancel.clone());

    let mut consumer = QueueConsumer::new(broker.clone(), handler.clone(), ReconnectPolicy::Exit);
    let reason = consumer.run(cancel).await;

    assert_eq!(reason, ExitReason::Interrupted);
    assert_eq!(broker.acks(), vec![1, 2, 3]);
    assert_eq!(handler.handled(), vec!["r1", "r3"]);

    let stats = consumer.stats();
    assert_eq!(stats.received, 3);
    assert_eq!(stats.acknowledged, 3);
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.succeeded, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(broker.closes.load(Ordering::SeqCst), 1);
    assert_eq!(consumer.state(), ConsumerState::Disconnected);
}

#[tokio::test]
async fn test_reconnects_after_stream_ends() {
    let broker = Broker::with_sessions(vec![
        Session {
            deliveries: vec![delivery(1, "r1")],
            end: SessionEnd::Drop,
        },
        Session {
            deliveries: vec![delivery(1, "r2")],
            end: SessionEnd::Hang,
        },
    ]);
    let cancel = CancellationToken::new();
    let handler = RecordingHandler::new(2, cancel.clone());

    let mut consumer = QueueConsumer::new(broker.clone(), handler.clone(), retry(10, None));
    let reason = consumer.run(cancel).await;

    assert_eq!(reason, ExitReason::Interrupted);
    assert_eq!(handler.handled(), vec!["r1", "r2"]);
    assert_eq!(consumer.stats().connections, 2);
    assert_eq!(broker.connects.load(Ordering::SeqCst), 2);
    // both connections released
    assert_eq!(broker.closes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_exit_policy_stops_on_connection_loss() {
    let broker = Broker::with_sessions(vec![Session {
        deliveries: vec![],
        end: SessionEnd::Drop,
    }]);
    let cancel = CancellationToken::new();
    let handler = RecordingHandler::new(usize::MAX, cancel.clone());

    let mut consumer = QueueConsumer::new(broker.clone(), handler, ReconnectPolicy::Exit);
    let reason = consumer.run(cancel).await;

    assert!(matches!(
        reason,
        ExitReason::TransportFailed(TransportError::ConnectionLost(_))
    ));
    assert!(!reason.is_clean());
    assert_eq!(broker.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    let broker = Broker::with_sessions(vec![]);
    let cancel = CancellationToken::new();
    let handler = RecordingHandler::new(usize::MAX, cancel.clone());

    let mut consumer = QueueConsumer::new(broker.clone(), handler, retry(1, Some(3)));
    let reason = consumer.run(cancel).await;

    match reason {
        ExitReason::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert_eq!(last, TransportError::Connect("connection refused".to_string()));
        },
        other => panic!("unexpected exit: {:?}", other),
    }
    assert_eq!(broker.connects.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_interrupt_while_waiting_to_reconnect() {
    let broker = Broker::with_sessions(vec![]);
    let cancel = CancellationToken::new();
    let handler = RecordingHandler::new(usize::MAX, cancel.clone());

    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });

    let mut consumer = QueueConsumer::new(broker.clone(), handler, retry(60_000, None));
    let reason = tokio::time::timeout(Duration::from_secs(5), consumer.run(cancel))
        .await
        .expect("consumer must honor the interrupt while sleeping");

    assert_eq!(reason, ExitReason::Interrupted);
    assert_eq!(broker.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancelled_before_start_never_connects() {
    let broker = Broker::with_sessions(vec![]);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let handler = RecordingHandler::new(1, cancel.clone());

    let mut consumer = QueueConsumer::new(broker.clone(), handler, ReconnectPolicy::Exit);
    assert_eq!(consumer.run(cancel).await, ExitReason::Interrupted);
    assert_eq!(broker.connects.load(Ordering::SeqCst), 0);
}

/// Cancels as soon as it starts, then keeps working
struct SlowHandler {
    cancel: CancellationToken,
    finished: AtomicBool,
}

#[async_trait]
impl MessageHandler for SlowHandler {
    async fn handle(&self, _message: &Message) -> Outcome {
        self.cancel.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.finished.store(true, Ordering::SeqCst);
        Outcome::Ok
    }
}

#[tokio::test]
async fn test_in_flight_message_completes_on_interrupt() {
    let broker = Broker::with_sessions(vec![Session {
        deliveries: vec![delivery(1, "r1"), delivery(2, "r2")],
        end: SessionEnd::Hang,
    }]);
    let cancel = CancellationToken::new();
    let handler = Arc::new(SlowHandler {
        cancel: cancel.clone(),
        finished: AtomicBool::new(false),
    });

    let mut consumer = QueueConsumer::new(broker.clone(), handler.clone(), ReconnectPolicy::Exit);
    let reason = consumer.run(cancel).await;

    assert_eq!(reason, ExitReason::Interrupted);
    assert!(handler.finished.load(Ordering::SeqCst));
    // the second delivery is never taken off the stream
    assert_eq!(broker.acks(), vec![1]);
    assert_eq!(broker.closes.load(Ordering::SeqCst), 1);
}
