//! Pure routing of MQTT events
//!
//! Maps raw `rumqttc` events to the handful of outcomes the event-loop task
//! acts on.

use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet, SubscribeReasonCode};

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// ConnAck received with the given return code
    ConnectionAcknowledged(ConnectReturnCode),
    /// Message received on a subscribed topic
    MessageReceived { topic: String, payload: Vec<u8> },
    /// Broker closed the session
    Disconnected,
    /// Our DISCONNECT packet left the client
    DisconnectSent,
    /// Our SUBSCRIBE packet left the client with this packet id
    SubscribeSent { packet_id: u16 },
    /// SubAck with per-topic success flags
    SubscriptionConfirmed { packet_id: u16, granted: Vec<bool> },
    /// Infrastructure event (PingResp, PubAck, etc.)
    InfrastructureEvent(String),
    /// Other outgoing event (handled automatically)
    OutgoingEvent,
}

pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged(connack.code),
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    granted: suback
                        .return_codes
                        .iter()
                        .map(|code| matches!(code, SubscribeReasonCode::Success(_)))
                        .collect(),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(Outgoing::Subscribe(pkid)) => EventRoute::SubscribeSent { packet_id: *pkid },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Whether a topic filter matches a concrete topic (`+` and `#` wildcards)
    pub fn topic_matches(filter: &str, topic: &str) -> bool {
        let mut filter_levels = filter.split('/');
        let mut topic_levels = topic.split('/');

        loop {
            match (filter_levels.next(), topic_levels.next()) {
                (Some("#"), _) => return true,
                (Some("+"), Some(_)) => continue,
                (Some(f), Some(t)) if f == t => continue,
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, Publish, QoS, SubAck};

    #[test]
    fn test_route_connack() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged(ConnectReturnCode::Success)
        );
    }

    #[test]
    fn test_route_publish() {
        let publish = Event::Incoming(Packet::Publish(Publish::new(
            "dev/cmd",
            QoS::AtLeastOnce,
            b"{\"cid\":\"1\"}".to_vec(),
        )));

        if let EventRoute::MessageReceived { topic, payload } =
            MessageHandler::route_mqtt_event(&publish)
        {
            assert_eq!(topic, "dev/cmd");
            assert_eq!(payload, b"{\"cid\":\"1\"}");
        } else {
            panic!("Expected MessageReceived route");
        }
    }

    #[test]
    fn test_route_disconnects() {
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::Disconnect)),
            EventRoute::Disconnected
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Disconnect)),
            EventRoute::DisconnectSent
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::OutgoingEvent
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Subscribe(3))),
            EventRoute::SubscribeSent { packet_id: 3 }
        );
    }

    #[test]
    fn test_route_suback() {
        let suback = Event::Incoming(Packet::SubAck(SubAck::new(
            7,
            vec![
                SubscribeReasonCode::Success(QoS::AtLeastOnce),
                SubscribeReasonCode::Failure,
            ],
        )));
        assert_eq!(
            MessageHandler::route_mqtt_event(&suback),
            EventRoute::SubscriptionConfirmed {
                packet_id: 7,
                granted: vec![true, false],
            }
        );
    }

    #[test]
    fn test_topic_matches() {
        assert!(MessageHandler::topic_matches("dev/cmd", "dev/cmd"));
        assert!(!MessageHandler::topic_matches("dev/cmd", "dev/cmd/res"));
        assert!(MessageHandler::topic_matches("fifo/#", "fifo/DeviceToDevice"));
        assert!(MessageHandler::topic_matches("dev/+/res", "dev/cmd/res"));
        assert!(!MessageHandler::topic_matches("dev/+", "dev/cmd/res"));
    }
}
