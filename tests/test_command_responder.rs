//! Command responder tests
//!
//! Acknowledgments must echo the command's correlation id, go through the
//! shared rate regulator, and never block the delivery path.

use lo_device_client::commands::{CommandResponder, ACK_KEY};
use lo_device_client::protocol::{
    CommandAcknowledgment, CorrelationId, OutboundMessage, QosLevel, Topics,
};
use lo_device_client::regulator::RateRegulator;
use lo_device_client::testing::MockTransport;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const MIN_INTERVAL: Duration = Duration::from_millis(500);

struct Fixture {
    transport: Arc<MockTransport>,
    regulator: Arc<RateRegulator<MockTransport>>,
    responder: Arc<CommandResponder<MockTransport>>,
}

async fn fixture(max_in_flight: usize) -> Fixture {
    let transport = Arc::new(MockTransport::new());
    let regulator = Arc::new(RateRegulator::new(transport.clone(), MIN_INTERVAL));
    let responder = Arc::new(CommandResponder::new(
        regulator.clone(),
        &Topics::default(),
        max_in_flight,
    ));
    responder.subscribe().await.unwrap();
    Fixture {
        transport,
        regulator,
        responder,
    }
}

async fn acknowledgments(transport: &MockTransport) -> Vec<CommandAcknowledgment> {
    transport
        .published_on("dev/cmd/res")
        .await
        .iter()
        .map(|p| serde_json::from_slice(&p.payload).unwrap())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_reboot_command_is_acknowledged() {
    let f = fixture(4).await;

    assert!(f
        .transport
        .deliver("dev/cmd", br#"{"cid":"abc123","req":"reboot"}"#));
    assert!(f.responder.drain(Duration::from_secs(5)).await);

    let acks = acknowledgments(&f.transport).await;
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].cid, CorrelationId::from("abc123"));
    let text = acks[0].res.get(ACK_KEY).and_then(Value::as_str).unwrap();
    assert!(text.contains("reboot"));

    let published = f.transport.published_on("dev/cmd/res").await;
    assert_eq!(published[0].qos, QosLevel::AtLeastOnce);
}

#[tokio::test(start_paused = true)]
async fn test_every_ack_echoes_its_command() {
    let f = fixture(16).await;

    for i in 0..5 {
        let payload = format!(r#"{{"cid":"c{i}","req":"verb{i}","arg":{{"n":{i}}}}}"#);
        f.transport.deliver("dev/cmd", payload.as_bytes());
    }
    f.transport.deliver("dev/cmd", br#"{"cid":99,"req":"numeric"}"#);
    assert!(f.responder.drain(Duration::from_secs(10)).await);

    let acks = acknowledgments(&f.transport).await;
    assert_eq!(acks.len(), 6);
    for ack in acks {
        let text = ack.res.get(ACK_KEY).and_then(Value::as_str).unwrap();
        match &ack.cid {
            CorrelationId::Text(cid) => {
                let n = cid.trim_start_matches('c');
                assert!(text.contains(&format!("verb{n}")));
            }
            CorrelationId::Numeric(cid) => {
                assert_eq!(*cid, 99);
                assert!(text.contains("numeric"));
            }
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_ack_respects_rate_limit_against_telemetry() {
    let f = fixture(4).await;

    let telemetry = OutboundMessage::new("dev/data", b"{}".to_vec(), QosLevel::AtLeastOnce);
    f.regulator.publish(&telemetry).await.unwrap();
    f.transport
        .deliver("dev/cmd", br#"{"cid":"1","req":"reboot"}"#);
    assert!(f.responder.drain(Duration::from_secs(5)).await);

    let attempts = f.transport.attempts().await;
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[1].topic, "dev/cmd/res");
    assert!(attempts[1].at - attempts[0].at >= MIN_INTERVAL);
}

#[tokio::test(start_paused = true)]
async fn test_delivery_returns_while_publish_is_throttled() {
    let f = fixture(4).await;

    let telemetry = OutboundMessage::new("dev/data", b"{}".to_vec(), QosLevel::AtLeastOnce);
    f.regulator.publish(&telemetry).await.unwrap();

    let before = tokio::time::Instant::now();
    f.transport
        .deliver("dev/cmd", br#"{"cid":"1","req":"reboot"}"#);
    assert_eq!(tokio::time::Instant::now(), before);
    assert_eq!(f.responder.in_flight(), 1);

    assert!(f.responder.drain(Duration::from_secs(5)).await);
    assert_eq!(f.responder.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_command_keeps_listening() {
    let f = fixture(4).await;

    f.transport.deliver("dev/cmd", b"{broken");
    f.transport.deliver("dev/cmd", br#"{"req":"missing cid"}"#);
    f.transport
        .deliver("dev/cmd", br#"{"cid":"ok","req":"reboot"}"#);
    assert!(f.responder.drain(Duration::from_secs(5)).await);

    assert_eq!(acknowledgments(&f.transport).await.len(), 1);
    let snapshot = f.regulator.metrics().snapshot();
    assert_eq!(snapshot.commands.received, 3);
    assert_eq!(snapshot.commands.decode_errors, 2);
}

#[tokio::test(start_paused = true)]
async fn test_drain_times_out_with_stuck_worker() {
    let transport =
        Arc::new(MockTransport::new().with_publish_delay(Duration::from_secs(60)));
    let regulator = Arc::new(RateRegulator::new(transport.clone(), MIN_INTERVAL));
    let responder = Arc::new(CommandResponder::new(
        regulator.clone(),
        &Topics::default(),
        2,
    ));
    responder.subscribe().await.unwrap();

    transport.deliver("dev/cmd", br#"{"cid":"1","req":"slow"}"#);
    assert!(!responder.drain(Duration::from_secs(1)).await);

    // drained responders refuse new work
    transport.deliver("dev/cmd", br#"{"cid":"2","req":"late"}"#);
    assert_eq!(regulator.metrics().snapshot().commands.acks_dropped, 1);
    assert_eq!(transport.attempts().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connection_loss_stops_command_processing() {
    let f = fixture(4).await;

    f.transport.lose_connection("keep-alive timeout");
    f.transport
        .deliver("dev/cmd", br#"{"cid":"1","req":"reboot"}"#);
    assert!(f.responder.drain(Duration::from_secs(1)).await);

    assert!(f.responder.is_connection_lost());
    assert!(f.transport.attempts().await.is_empty());
    assert_eq!(f.regulator.metrics().snapshot().connection.losses, 1);
}
