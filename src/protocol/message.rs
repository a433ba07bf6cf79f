use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::topic::{validate_topic_name, TopicError};

/// Delivery-guarantee tag carried by a message
///
/// Routing-level classification only: the relay never resends at any level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QoS::AtMostOnce => write!(f, "AtMostOnce"),
            QoS::AtLeastOnce => write!(f, "AtLeastOnce"),
            QoS::ExactlyOnce => write!(f, "ExactlyOnce"),
        }
    }
}

/// An immutable application message
///
/// Fields are private; the topic is validated once at construction so every
/// message that exists in the system has a publishable topic name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationMessage {
    topic: String,
    payload: Option<Bytes>,
    qos: QoS,
    retain: bool,
}

impl ApplicationMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Result<Self, TopicError> {
        let topic = topic.into();
        validate_topic_name(&topic)?;
        Ok(Self {
            topic,
            payload: Some(payload.into()),
            qos: QoS::AtMostOnce,
            retain: false,
        })
    }

    /// Message without a payload (clears a retained value when retained)
    pub fn empty(topic: impl Into<String>) -> Result<Self, TopicError> {
        let topic = topic.into();
        validate_topic_name(&topic)?;
        Ok(Self {
            topic,
            payload: None,
            qos: QoS::AtMostOnce,
            retain: false,
        })
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn retain(&self) -> bool {
        self.retain
    }

    /// True when the payload is absent or zero-length
    pub fn is_empty(&self) -> bool {
        self.payload.as_ref().map_or(true, |p| p.is_empty())
    }

    /// Payload decoded as UTF-8 (lossy), `None` if there is no payload
    pub fn payload_text(&self) -> Option<String> {
        self.payload
            .as_ref()
            .map(|p| String::from_utf8_lossy(p).into_owned())
    }

    /// Re-checks the topic of a message that arrived over the wire
    pub fn validate(&self) -> Result<(), TopicError> {
        validate_topic_name(&self.topic)
    }
}

impl fmt::Display for ApplicationMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} [{}{}]: {}",
            self.topic,
            self.qos,
            if self.retain { ", retained" } else { "" },
            self.payload_text().unwrap_or_else(|| "null".to_string())
        )
    }
}
