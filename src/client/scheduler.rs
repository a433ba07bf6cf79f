//! Periodic publisher
//!
//! Enqueues one message per tick regardless of connection state. Ticks follow the
//! nominal schedule; ticks missed while the task was busy are skipped, not bursted.

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::session::SessionPublisher;
use super::state::SessionError;
use crate::protocol::{validate_topic_name, ApplicationMessage, QoS, TopicError};

pub struct PublishScheduler<F> {
    period: Duration,
    topic: String,
    qos: QoS,
    retain: bool,
    payload: F,
}

impl<F> PublishScheduler<F>
where
    F: FnMut(u64) -> Bytes + Send + 'static,
{
    /// `payload` receives the 1-based tick number
    pub fn new(period: Duration, topic: impl Into<String>, payload: F) -> Result<Self, TopicError> {
        let topic = topic.into();
        validate_topic_name(&topic)?;
        Ok(Self {
            period: period.max(Duration::from_millis(1)),
            topic,
            qos: QoS::default(),
            retain: false,
            payload,
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

    pub fn spawn(self, publisher: SessionPublisher) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(publisher, shutdown_rx));
        SchedulerHandle {
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    async fn run(mut self, publisher: SessionPublisher, mut shutdown_rx: oneshot::Receiver<()>) -> u64 {
        info!("Publishing to {} every {:?}", self.topic, self.period);
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticks = 0;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = ticker.tick() => {
                    ticks += 1;
                    let message = ApplicationMessage::new(self.topic.as_str(), (self.payload)(ticks))
                        .map(|m| m.with_qos(self.qos).with_retain(self.retain));
                    let message = match message {
                        Ok(message) => message,
                        Err(e) => {
                            error!("Scheduler topic became invalid: {}", e);
                            break;
                        }
                    };
                    match publisher.publish(message) {
                        Ok(()) => debug!("Tick {} queued ({} pending)", ticks, publisher.pending()),
                        Err(SessionError::ShutDown) => {
                            info!("Session closed, stopping scheduler");
                            break;
                        }
                        Err(e) => warn!("Tick {} not queued: {}", ticks, e),
                    }
                }
            }
        }
        ticks
    }
}

/// Handle to a running scheduler
pub struct SchedulerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<u64>,
}

impl SchedulerHandle {
    /// Stops the scheduler; returns the number of ticks it fired
    pub async fn shutdown(mut self) -> u64 {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(ticks) => ticks,
            Err(e) => {
                error!("Scheduler task panicked: {}", e);
                0
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// `{"message": "Test - client message", "sent": <UTC RFC 3339>}`
pub fn demo_payload() -> Bytes {
    let body = serde_json::json!({
        "message": "Test - client message",
        "sent": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    });
    Bytes::from(body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::queue::PublishQueue;
    use tokio_util::sync::CancellationToken;

    fn publisher() -> SessionPublisher {
        SessionPublisher {
            queue: PublishQueue::default(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn ticks_are_queued_in_order() {
        let publisher = publisher();
        let scheduler = PublishScheduler::new(Duration::from_millis(10), "tick/n", |tick| {
            Bytes::from(tick.to_string())
        })
        .unwrap()
        .with_qos(QoS::AtLeastOnce);
        let handle = scheduler.spawn(publisher.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let ticks = handle.shutdown().await;
        assert!(ticks >= 3, "only {} ticks", ticks);

        let queued: Vec<ApplicationMessage> = std::iter::from_fn(|| publisher.queue.pop()).collect();
        assert_eq!(queued.len() as u64, ticks);
        for (n, message) in queued.iter().enumerate() {
            assert_eq!(message.payload_text(), Some((n + 1).to_string()));
            assert_eq!(message.qos(), QoS::AtLeastOnce);
        }
    }

    #[tokio::test]
    async fn stops_when_session_closes() {
        let publisher = publisher();
        publisher.cancel.cancel();
        let handle = PublishScheduler::new(Duration::from_millis(5), "t", |_| Bytes::new())
            .unwrap()
            .spawn(publisher);

        tokio::time::timeout(Duration::from_secs(1), async {
            while !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(handle.shutdown().await, 1);
    }

    #[test]
    fn invalid_topic_is_refused() {
        assert!(PublishScheduler::new(Duration::from_secs(1), "a/+", |_| Bytes::new()).is_err());
    }

    #[test]
    fn demo_payload_is_json() {
        let value: serde_json::Value = serde_json::from_slice(&demo_payload()).unwrap();
        assert_eq!(value["message"], "Test - client message");
        let sent = value["sent"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(sent).is_ok());
    }
}
