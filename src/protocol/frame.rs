use serde::{Deserialize, Serialize};
use std::fmt;

use super::message::{ApplicationMessage, QoS};

/// Session-level frames exchanged between client and broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Connect {
        client_id: String,
        clean_session: bool,
    },
    ConnAck {
        accepted: bool,
        session_present: bool,
        reason: Option<String>,
    },
    Publish {
        message: ApplicationMessage,
    },
    PubAck {
        topic: String,
    },
    Subscribe {
        filter: String,
        qos: QoS,
    },
    SubAck {
        filter: String,
        granted: Option<QoS>,
    },
    Unsubscribe {
        filter: String,
    },
    UnsubAck {
        filter: String,
    },
    PingReq,
    PingResp,
    Disconnect,
}

impl Frame {
    pub fn publish(message: ApplicationMessage) -> Self {
        Frame::Publish { message }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Connect { .. } => "CONNECT",
            Frame::ConnAck { .. } => "CONNACK",
            Frame::Publish { .. } => "PUBLISH",
            Frame::PubAck { .. } => "PUBACK",
            Frame::Subscribe { .. } => "SUBSCRIBE",
            Frame::SubAck { .. } => "SUBACK",
            Frame::Unsubscribe { .. } => "UNSUBSCRIBE",
            Frame::UnsubAck { .. } => "UNSUBACK",
            Frame::PingReq => "PINGREQ",
            Frame::PingResp => "PINGRESP",
            Frame::Disconnect => "DISCONNECT",
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}
