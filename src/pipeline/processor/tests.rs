use super::*;
use crate::bus::{BusError, FlowProperties, MemoryBroker, Session};
use crate::pipeline::ProducerErrors;
use std::time::Duration;

const OUTPUT: &str = "swa/crew/pay";

async fn start_processor(broker: &MemoryBroker, counters: Arc<Counters>, shutdown: Shutdown) {
    let producer = broker
        .create_producer(Arc::new(ProducerErrors::new(shutdown.clone())))
        .await
        .unwrap();
    let pipeline = ProcessorPipeline::new(producer, OUTPUT, counters, shutdown);
    let flow = broker
        .create_flow(FlowProperties::exclusive("in"), Arc::new(pipeline))
        .await
        .unwrap();
    flow.start().await.unwrap();
}

#[test]
fn test_derive_uppercases_source_topic() {
    let inbound = InboundMessage::new("acme/crew/roster", "ignored body");
    let outbound = derive_outbound(&inbound, OUTPUT);

    assert_eq!(outbound.topic, OUTPUT);
    assert_eq!(outbound.text, "ACME/CREW/ROSTER");
    assert_eq!(outbound.correlation_id, None);
}

#[test]
fn test_derive_carries_correlation_id() {
    let inbound = InboundMessage::new("a/b", Vec::new()).with_correlation_id("req-42");
    let outbound = derive_outbound(&inbound, OUTPUT);

    assert_eq!(outbound.correlation_id.as_deref(), Some("req-42"));
}

#[test]
fn test_derive_uses_unicode_case_mapping() {
    let inbound = InboundMessage::new("straße/ünïcode", Vec::new());
    assert_eq!(derive_outbound(&inbound, OUTPUT).text, "STRASSE/ÜNÏCODE");
}

#[tokio::test]
async fn test_republishes_then_acks() {
    let broker = MemoryBroker::new();
    let counters = Arc::new(Counters::new());
    let shutdown = Shutdown::new();
    let id = broker.enqueue(
        "in",
        InboundMessage::new("swa/flight/123", "payload").with_correlation_id("c1"),
    );

    start_processor(&broker, counters.clone(), shutdown.clone()).await;
    broker.wait_for_acks(1, Duration::from_secs(2)).await.unwrap();

    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, OUTPUT);
    assert_eq!(published[0].text, "SWA/FLIGHT/123");
    assert_eq!(published[0].correlation_id.as_deref(), Some("c1"));
    assert_eq!(broker.acks_for(id), 1);
    assert_eq!(counters.received(), 1);
    assert_eq!(counters.sent(), 1);
    assert!(!shutdown.is_triggered());
}

#[tokio::test]
async fn test_failed_send_still_acks() {
    let broker = MemoryBroker::new();
    let counters = Arc::new(Counters::new());
    let shutdown = Shutdown::new();
    broker.fail_next_publish(BusError::ErrorResponse {
        code: 403,
        subcode: "ACCESS_REFUSED".to_string(),
        phrase: "write access refused".to_string(),
    });
    let id = broker.enqueue("in", InboundMessage::new("a/b", "x"));

    start_processor(&broker, counters.clone(), shutdown.clone()).await;
    broker.wait_for_acks(1, Duration::from_secs(2)).await.unwrap();

    assert!(broker.published().is_empty());
    assert_eq!(broker.acks_for(id), 1);
    assert_eq!(counters.received(), 1);
    assert_eq!(counters.sent(), 0);
    assert!(!shutdown.is_triggered());
}

#[tokio::test]
async fn test_transport_failure_on_send_stops_the_run() {
    let broker = MemoryBroker::new();
    let counters = Arc::new(Counters::new());
    let shutdown = Shutdown::new();
    broker.fail_next_publish(BusError::Transport("reconnects exhausted".to_string()));
    broker.enqueue("in", InboundMessage::new("a/b", "x"));

    start_processor(&broker, counters.clone(), shutdown.clone()).await;
    broker.wait_for_acks(1, Duration::from_secs(2)).await.unwrap();

    assert_eq!(shutdown.reason(), Some(StopReason::TransportLost));
    assert_eq!(counters.sent(), 0);
}

#[tokio::test]
async fn test_output_preserves_input_order() {
    let broker = MemoryBroker::new();
    let counters = Arc::new(Counters::new());
    let topics: Vec<String> = (0..50).map(|i| format!("seq/{}", i)).collect();
    for topic in &topics {
        broker.enqueue("in", InboundMessage::new(topic.as_str(), "x"));
    }

    start_processor(&broker, counters.clone(), Shutdown::new()).await;
    broker.wait_for_acks(50, Duration::from_secs(5)).await.unwrap();

    let texts: Vec<String> = broker.published().into_iter().map(|m| m.text).collect();
    let expected: Vec<String> = topics.iter().map(|t| t.to_uppercase()).collect();
    assert_eq!(texts, expected);
    assert_eq!(counters.sent(), 50);
}
