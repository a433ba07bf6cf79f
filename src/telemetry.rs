//! # Telemetry
//!
//! Write-only event stream produced by the broker: one event per accepted
//! connection and one per routed message. Sinks must not block the caller; a
//! slow sink drops events, the router's counter keeps advancing regardless.

use bytes::Bytes;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::protocol::{ApplicationMessage, QoS};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TelemetryKind {
    ConnectionAccepted {
        client_id: String,
        endpoint: String,
        clean_session: bool,
    },
    MessageRouted {
        client_id: String,
        topic: String,
        payload: Option<Bytes>,
        qos: QoS,
        retain: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEvent {
    /// Routed-message counter value; `None` for connection events
    pub sequence: Option<u64>,
    pub timestamp: DateTime<Local>,
    pub kind: TelemetryKind,
}

impl TelemetryEvent {
    pub fn connection_accepted(client_id: &str, endpoint: &str, clean_session: bool) -> Self {
        Self {
            sequence: None,
            timestamp: Local::now(),
            kind: TelemetryKind::ConnectionAccepted {
                client_id: client_id.to_string(),
                endpoint: endpoint.to_string(),
                clean_session,
            },
        }
    }

    pub fn message_routed(sequence: u64, client_id: &str, message: &ApplicationMessage) -> Self {
        Self {
            sequence: Some(sequence),
            timestamp: Local::now(),
            kind: TelemetryKind::MessageRouted {
                client_id: client_id.to_string(),
                topic: message.topic().to_string(),
                payload: message.payload().cloned(),
                qos: message.qos(),
                retain: message.retain(),
            },
        }
    }
}

/// Consumer of telemetry events
pub trait TelemetrySink: Send + Sync + 'static {
    fn emit(&self, event: TelemetryEvent);
}

impl<F> TelemetrySink for F
where
    F: Fn(TelemetryEvent) + Send + Sync + 'static,
{
    fn emit(&self, event: TelemetryEvent) {
        self(event)
    }
}

/// Renders events as structured `info!` records
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: TelemetryEvent) {
        match event.kind {
            TelemetryKind::ConnectionAccepted {
                client_id,
                endpoint,
                clean_session,
            } => {
                info!(
                    client_id = %client_id,
                    endpoint = %endpoint,
                    clean_session,
                    "New connection: ClientId = {}, Endpoint = {}, CleanSession = {}",
                    client_id,
                    endpoint,
                    clean_session
                );
            }
            TelemetryKind::MessageRouted {
                client_id,
                topic,
                payload,
                qos,
                retain,
            } => {
                let payload = payload
                    .map(|p| String::from_utf8_lossy(&p).into_owned())
                    .unwrap_or_else(|| "null".to_string());
                info!(
                    message_id = event.sequence.unwrap_or_default(),
                    client_id = %client_id,
                    topic = %topic,
                    "MessageId: {} - TimeStamp: {} -- Message: ClientId = {}, Topic = {}, Payload = {}, QoS = {}, Retain-Flag = {}",
                    event.sequence.unwrap_or_default(),
                    event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                    client_id,
                    topic,
                    payload,
                    qos,
                    retain
                );
            }
        }
    }
}

/// Forwards events into a bounded channel, dropping them when it is full
#[derive(Debug)]
pub struct ChannelSink {
    sender: mpsc::Sender<TelemetryEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TelemetryEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            Self {
                sender,
                dropped: AtomicU64::new(0),
            },
            receiver,
        )
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl TelemetrySink for ChannelSink {
    fn emit(&self, event: TelemetryEvent) {
        if let Err(e) = self.sender.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("Telemetry event dropped: {}", e);
        }
    }
}
