//! AMQP/RabbitMQ session integration tests using testcontainers.
//!
//! Run with: cargo test --test bus_amqp --features amqp -- --ignored --nocapture
//!
//! Apart from the unreachable-host test, these tests spin up RabbitMQ in a container using testcontainers-rs.
//! The broker-side queues are provisioned here with plain lapin; the session
//! under test never declares anything.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use flowrelay::bus::{
    AmqpSession, BusError, FlowProperties, OutboundMessage, Session, SessionEvent,
    SessionEventHandler,
};
use flowrelay::config::{SessionConfig, Settings};
use flowrelay::pipeline::{DrainPipeline, ProcessorPipeline, ProducerErrors};
use flowrelay::runtime::{Counters, Shutdown, StopReason};
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

const INPUT_EXCHANGE: &str = "test.ingress";
const INPUT_QUEUE: &str = "CrewPayAnalyticsSvcQueue";
const OUTPUT_QUEUE: &str = "pay-observer";
const OUTPUT_TOPIC: &str = "swa/crew/pay";

/// Start RabbitMQ container.
///
/// Returns (container, "host:port").
async fn start_rabbitmq() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("rabbitmq", "3-management")
        .with_exposed_port(5672.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Server startup complete"));

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start rabbitmq container");

    // Brief delay to ensure RabbitMQ is fully ready
    tokio::time::sleep(Duration::from_secs(2)).await;

    let host_port = container
        .get_host_port_ipv4(5672)
        .await
        .expect("Failed to get mapped port");
    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    (container, format!("{}:{}", host, host_port))
}

/// Start RabbitMQ with AMQP pinned to a fixed host port, so the address
/// survives a container restart.
async fn start_rabbitmq_pinned() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .expect("Failed to pick a free port")
        .port();

    let container = GenericImage::new("rabbitmq", "3-management")
        .with_exposed_port(5672.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Server startup complete"))
        .with_mapped_port(port, 5672.tcp())
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start rabbitmq container");

    tokio::time::sleep(Duration::from_secs(2)).await;

    (container, format!("127.0.0.1:{}", port))
}

/// Declare the input exchange/queue and an observer queue on the output topic.
async fn provision(address: &str) -> (Connection, Channel) {
    let conn = Connection::connect(
        &format!("amqp://guest:guest@{}/%2f", address),
        ConnectionProperties::default(),
    )
    .await
    .expect("Failed to connect for provisioning");
    let channel = conn.create_channel().await.unwrap();

    channel
        .exchange_declare(
            INPUT_EXCHANGE,
            ExchangeKind::Topic,
            ExchangeDeclareOptions::default(),
            FieldTable::default(),
        )
        .await
        .unwrap();

    for (queue, exchange, key) in [
        (INPUT_QUEUE, INPUT_EXCHANGE, "#"),
        (OUTPUT_QUEUE, "amq.topic", OUTPUT_TOPIC),
    ] {
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .unwrap();
        channel
            .queue_bind(
                queue,
                exchange,
                key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .unwrap();
    }

    (conn, channel)
}

struct NoopEvents;

impl SessionEventHandler for NoopEvents {
    fn on_event(&self, event: &SessionEvent) {
        println!("session event: {}", event);
    }
}

/// Keeps every session event for later assertions.
#[derive(Default)]
struct RecordedEvents {
    events: Mutex<Vec<SessionEvent>>,
}

impl RecordedEvents {
    fn snapshot(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap().clone()
    }

    fn seen(&self, wanted: impl Fn(&SessionEvent) -> bool) -> bool {
        self.events.lock().unwrap().iter().any(wanted)
    }
}

impl SessionEventHandler for RecordedEvents {
    fn on_event(&self, event: &SessionEvent) {
        println!("session event: {}", event);
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Poll `condition` every 100ms until it holds or `limit` passes.
async fn eventually(limit: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    condition()
}

async fn publish_input(channel: &Channel, topic: &str) {
    channel
        .basic_publish(
            INPUT_EXCHANGE,
            topic,
            BasicPublishOptions::default(),
            b"payload",
            BasicProperties::default(),
        )
        .await
        .unwrap();
}

fn session_config(address: &str) -> SessionConfig {
    SessionConfig::new(
        address,
        "/",
        "guest",
        Some("guest".to_string()),
        &Settings::default(),
    )
    .unwrap()
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_processor_republishes_with_correlation() {
    let (_container, address) = start_rabbitmq().await;
    let (_conn, setup) = provision(&address).await;

    let session = AmqpSession::connect(session_config(&address), Arc::new(NoopEvents))
        .await
        .expect("Session should connect");

    let counters = Arc::new(Counters::new());
    let shutdown = Shutdown::new();
    let producer = session
        .create_producer(Arc::new(ProducerErrors::new(shutdown.clone())))
        .await
        .unwrap();
    let pipeline = ProcessorPipeline::new(producer, OUTPUT_TOPIC, counters.clone(), shutdown);
    let flow = session
        .create_flow(FlowProperties::exclusive(INPUT_QUEUE), Arc::new(pipeline))
        .await
        .unwrap();
    flow.start().await.expect("Flow should start");

    let mut observer = setup
        .basic_consume(
            OUTPUT_QUEUE,
            "observer",
            BasicConsumeOptions {
                no_ack: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .unwrap();

    for (topic, correlation) in [("a/b/c", None), ("x", Some("req-42")), ("Hello/World", None)] {
        let mut properties = BasicProperties::default();
        if let Some(id) = correlation {
            properties = properties.with_correlation_id(id.into());
        }
        setup
            .basic_publish(
                INPUT_EXCHANGE,
                topic,
                BasicPublishOptions::default(),
                b"payload",
                properties,
            )
            .await
            .unwrap();
    }

    let mut received = Vec::new();
    while received.len() < 3 {
        let delivery = tokio::time::timeout(Duration::from_secs(10), observer.next())
            .await
            .expect("Timed out waiting for republished message")
            .expect("Observer stream ended")
            .expect("Observer delivery error");
        received.push((
            String::from_utf8(delivery.data).unwrap(),
            delivery
                .properties
                .correlation_id()
                .as_ref()
                .map(|id| id.as_str().to_string()),
        ));
    }

    assert_eq!(
        received,
        vec![
            ("A/B/C".to_string(), None),
            ("X".to_string(), Some("req-42".to_string())),
            ("HELLO/WORLD".to_string(), None),
        ]
    );
    assert_eq!(counters.received(), 3);
    assert_eq!(counters.sent(), 3);

    session.close().await.unwrap();
    session.close().await.unwrap();
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_exclusive_flow_refuses_second_consumer() {
    let (_container, address) = start_rabbitmq().await;
    let (_conn, _setup) = provision(&address).await;

    let first = AmqpSession::connect(session_config(&address), Arc::new(NoopEvents))
        .await
        .unwrap();
    let second = AmqpSession::connect(session_config(&address), Arc::new(NoopEvents))
        .await
        .unwrap();

    let counters = Arc::new(Counters::new());
    let sink = Arc::new(DrainPipeline::new(counters));

    let held = first
        .create_flow(FlowProperties::exclusive(INPUT_QUEUE), sink.clone())
        .await
        .unwrap();
    held.start().await.unwrap();

    let refused = second
        .create_flow(FlowProperties::exclusive(INPUT_QUEUE), sink)
        .await
        .unwrap();
    let result = refused.start().await;
    assert!(
        matches!(result, Err(BusError::ErrorResponse { code: 405, .. })),
        "expected RESOURCE_LOCKED, got {:?}",
        result
    );

    first.close().await.unwrap();
    second.close().await.unwrap();
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_flow_rebinds_and_resumes_after_broker_restart() {
    let (container, address) = start_rabbitmq_pinned().await;
    let (conn, setup) = provision(&address).await;

    let mut settings = Settings::default();
    settings.reconnect_retries = 120;
    settings.reconnect_interval_ms = 500;
    let config = SessionConfig::new(&address, "/", "guest", Some("guest".to_string()), &settings)
        .unwrap();

    let events = Arc::new(RecordedEvents::default());
    let session = AmqpSession::connect(config, events.clone()).await.unwrap();
    let counters = Arc::new(Counters::new());
    let flow = session
        .create_flow(
            FlowProperties::exclusive(INPUT_QUEUE),
            Arc::new(DrainPipeline::new(counters.clone())),
        )
        .await
        .unwrap();
    flow.start().await.unwrap();

    publish_input(&setup, "before/restart").await;
    assert!(eventually(Duration::from_secs(10), || counters.received() == 1).await);
    drop(setup);
    drop(conn);

    container.stop().await.expect("Failed to stop rabbitmq");
    container.start().await.expect("Failed to restart rabbitmq");

    assert!(
        eventually(Duration::from_secs(60), || events.seen(|e| matches!(
            e,
            SessionEvent::SubscriptionsReapplied { queue } if queue == INPUT_QUEUE
        )))
        .await,
        "flow was not re-bound; events: {:?}",
        events.snapshot()
    );
    assert!(events.seen(|e| matches!(e, SessionEvent::Disconnected { .. })));
    assert!(events.seen(|e| matches!(e, SessionEvent::Reconnected { .. })));
    assert!(!events.seen(SessionEvent::is_terminal));

    let (_conn, setup) = provision(&address).await;
    publish_input(&setup, "after/restart").await;
    assert!(
        eventually(Duration::from_secs(10), || counters.received() == 2).await,
        "delivery did not resume; received {}",
        counters.received()
    );

    session.close().await.unwrap();
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_spent_reconnect_budget_stops_and_fails_sends() {
    let (container, address) = start_rabbitmq_pinned().await;
    let (_conn, _setup) = provision(&address).await;

    let mut settings = Settings::default();
    settings.reconnect_retries = 1;
    settings.reconnect_interval_ms = 100;
    let config = SessionConfig::new(&address, "/", "guest", Some("guest".to_string()), &settings)
        .unwrap();

    let events = Arc::new(RecordedEvents::default());
    let session = AmqpSession::connect(config, events.clone()).await.unwrap();
    let shutdown = Shutdown::new();
    let producer = session
        .create_producer(Arc::new(ProducerErrors::new(shutdown.clone())))
        .await
        .unwrap();
    let flow = session
        .create_flow(
            FlowProperties::exclusive(INPUT_QUEUE),
            Arc::new(DrainPipeline::new(Arc::new(Counters::new()))),
        )
        .await
        .unwrap();
    flow.start().await.unwrap();

    container.stop().await.expect("Failed to stop rabbitmq");

    assert!(
        eventually(Duration::from_secs(30), || events
            .seen(SessionEvent::is_terminal))
        .await,
        "session was not lost; events: {:?}",
        events.snapshot()
    );
    assert_eq!(shutdown.reason(), Some(StopReason::TransportLost));

    let result = producer
        .send(&OutboundMessage {
            topic: OUTPUT_TOPIC.to_string(),
            text: "LATE".to_string(),
            correlation_id: None,
        })
        .await;
    assert!(
        matches!(result, Err(BusError::Transport(_))),
        "expected transport error, got {:?}",
        result
    );

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_connect_to_unreachable_host_fails() {
    let mut settings = Settings::default();
    settings.connect_retries_per_host = 1;
    let config = SessionConfig::new("127.0.0.1:1", "/", "guest", None, &settings).unwrap();

    let result = AmqpSession::connect(config, Arc::new(NoopEvents)).await;
    assert!(matches!(result, Err(BusError::Connection(_))));
}
