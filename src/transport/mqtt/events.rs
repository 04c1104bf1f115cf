//! Pure routing of rumqttc events into session-level decisions

use crate::transport::InboundMessage;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet, SubscribeReasonCode};
use rumqttc::v5::Event;

#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// ConnAck received; `refused` carries the broker's reason when not successful
    ConnectionAcknowledged { refused: Option<String> },
    MessageReceived(InboundMessage),
    /// SubAck received; `rejected` counts filters the broker refused
    SubscriptionConfirmed { packet_id: u16, rejected: usize },
    Disconnected,
    Outgoing,
    Other,
}

pub fn route_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(packet) => match packet {
            Packet::ConnAck(ack) => EventRoute::ConnectionAcknowledged {
                refused: (ack.code != ConnectReturnCode::Success).then(|| format!("{:?}", ack.code)),
            },
            Packet::Publish(publish) => EventRoute::MessageReceived(InboundMessage {
                topic: String::from_utf8_lossy(&publish.topic).into_owned(),
                payload: publish.payload.clone(),
                retain: publish.retain,
            }),
            Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                packet_id: suback.pkid,
                rejected: suback
                    .return_codes
                    .iter()
                    .filter(|code| !matches!(code, SubscribeReasonCode::Success(_)))
                    .count(),
            },
            Packet::Disconnect(_) => EventRoute::Disconnected,
            _ => EventRoute::Other,
        },
        Event::Outgoing(_) => EventRoute::Outgoing,
    }
}
