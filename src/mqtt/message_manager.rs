use chrono::NaiveDateTime;
use rumqttc::QoS;
use std::fmt;

const PREVIEW_CHARS: usize = 32;

/// Raw message as delivered by a transport, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        InboundMessage {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Decoded inbound message handed to hooks and message observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    topic: String,
    content: String,
    timestamp: NaiveDateTime,
}

impl fmt::Display for MqttMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.content.chars().take(PREVIEW_CHARS).collect();
        if preview.len() < self.content.len() {
            write!(f, "{} - {}: {}...", self.timestamp, self.topic, preview)
        } else {
            write!(f, "{} - {}: {}", self.timestamp, self.topic, preview)
        }
    }
}

impl MqttMessage {
    pub fn from_topic(topic: String, content: String) -> Self {
        MqttMessage {
            topic,
            content,
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    /// Payloads are decoded as UTF-8; invalid sequences are replaced rather than rejected.
    pub fn decode(inbound: InboundMessage) -> Self {
        let content = match String::from_utf8(inbound.payload) {
            Ok(text) => text,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        };
        Self::from_topic(inbound.topic, content)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }
}

/// A publish request routed through the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>, qos: QoS, retain: bool) -> Self {
        OutboundMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        }
    }

    pub fn retained(topic: impl Into<String>, payload: impl Into<String>, qos: QoS) -> Self {
        Self::new(topic, payload, qos, true)
    }
}

pub fn qos_from_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

pub fn qos_level(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_replaces_invalid_utf8() {
        let message = MqttMessage::decode(InboundMessage::new("a/b", vec![b'o', 0xff, b'n']));
        assert_eq!(message.topic(), "a/b");
        assert_eq!(message.content(), "o\u{fffd}n");
    }

    #[test]
    fn display_truncates_long_payloads() {
        let message = MqttMessage::from_topic("t".into(), "x".repeat(100));
        let rendered = message.to_string();
        assert!(rendered.ends_with("..."));
        assert!(rendered.len() < 100);
    }

    #[test]
    fn qos_levels_map_both_ways() {
        assert_eq!(qos_from_level(1), Some(QoS::AtLeastOnce));
        assert_eq!(qos_from_level(3), None);
        assert_eq!(qos_level(QoS::ExactlyOnce), 2);
    }
}
