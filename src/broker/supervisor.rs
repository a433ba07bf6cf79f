//! Connection supervisor
//!
//! Takes a freshly accepted transport through the handshake, the validator and
//! registration, then runs two tasks per connection:
//!
//! ```text
//!   transport ──► read loop ──► MessageRouter ──► TopicRegistry
//!                    │                                │
//!                    └──► outbound queue ◄────────────┘
//!                              │
//!                         write loop ──► transport
//! ```
//!
//! A read or write error ends only that connection. The broker never retries a
//! connection; reconnecting is the client's job.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::connection::{Connected, Connecting, Connection, DisconnectReason};
use super::registry::{ConnectionEntry, ConnectionId, DuplicateClientPolicy, RegistryError};
use super::router::MessageRouter;
use super::validator::{ConnectionValidator, ValidationOutcome};
use crate::config::BrokerConfig;
use crate::protocol::{validate_topic_filter, Frame, FrameCodec, ProtocolError, QoS, Transport};
use crate::telemetry::{TelemetryEvent, TelemetrySink};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error("rejected by validator: {0}")]
    Validation(String),

    #[error("client id already connected: {0}")]
    DuplicateClientId(String),

    #[error("empty client id requires a clean session")]
    InvalidClientId,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("no CONNECT within the handshake deadline")]
    HandshakeTimeout,

    #[error("transport failure during handshake: {0}")]
    TransportFailure(String),
}

fn shutting_down() -> RejectReason {
    RejectReason::TransportFailure("broker is shutting down".to_string())
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Connection from {endpoint} rejected: {reason}")]
pub struct ConnectionRejected {
    pub client_id: Option<String>,
    pub endpoint: String,
    pub reason: RejectReason,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub duplicate_policy: DuplicateClientPolicy,
    pub outbound_capacity: usize,
    pub connect_timeout: Duration,
    pub max_frame_size: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from(&BrokerConfig::default())
    }
}

impl From<&BrokerConfig> for SupervisorSettings {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            duplicate_policy: config.duplicate_client_policy,
            outbound_capacity: config.outbound_capacity.max(1),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            max_frame_size: config.max_frame_size,
        }
    }
}

/// An accepted, running connection
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub client_id: String,
    pub session_present: bool,
    task: JoinHandle<DisconnectReason>,
}

impl ConnectionHandle {
    /// Waits for the connection to end
    pub async fn closed(self) -> DisconnectReason {
        match self.task.await {
            Ok(reason) => reason,
            Err(e) => {
                error!("Connection task {} panicked: {}", self.id, e);
                DisconnectReason::TransportFailure(e.to_string())
            }
        }
    }
}

pub struct ConnectionSupervisor {
    settings: SupervisorSettings,
    validator: Arc<dyn ConnectionValidator>,
    router: Arc<MessageRouter>,
    telemetry: Arc<dyn TelemetrySink>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl ConnectionSupervisor {
    pub fn new(
        settings: SupervisorSettings,
        validator: Arc<dyn ConnectionValidator>,
        router: Arc<MessageRouter>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            settings,
            validator,
            router,
            telemetry,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Runs the handshake on a new transport and starts its read/write loops
    pub async fn accept<T>(&self, io: T, endpoint: String) -> Result<ConnectionHandle, ConnectionRejected>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let rejected = |reason: RejectReason| {
            warn!("Connection from {} rejected: {}", endpoint, reason);
            ConnectionRejected {
                client_id: None,
                endpoint: endpoint.clone(),
                reason,
            }
        };

        if self.shutdown.is_cancelled() {
            return Err(rejected(shutting_down()));
        }

        let mut transport = FrameCodec::framed(io, self.settings.max_frame_size);

        let first = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(rejected(shutting_down())),
            first = timeout(self.settings.connect_timeout, transport.next()) => first,
        };
        let (client_id, clean_session) =
            match first {
                Err(_) => return Err(rejected(RejectReason::HandshakeTimeout)),
                Ok(None) => {
                    return Err(rejected(RejectReason::TransportFailure(
                        "closed before CONNECT".to_string(),
                    )))
                }
                Ok(Some(Err(e))) => {
                    return Err(rejected(RejectReason::ProtocolViolation(e.to_string())))
                }
                Ok(Some(Ok(Frame::Connect {
                    client_id,
                    clean_session,
                }))) => (client_id, clean_session),
                Ok(Some(Ok(other))) => {
                    return Err(rejected(RejectReason::ProtocolViolation(format!(
                        "expected CONNECT, got {}",
                        other
                    ))))
                }
            };

        let registry = self.router.registry().clone();
        let id = registry.next_connection_id();
        let mut connecting = Connection::create(id, client_id, endpoint.clone(), clean_session);

        if connecting.client_id().is_empty() {
            if !clean_session {
                return Err(self
                    .refuse(transport, connecting, RejectReason::InvalidClientId)
                    .await);
            }
            connecting.assign_client_id(format!("relay-{}", id));
        }

        if let ValidationOutcome::Reject(reason) = self.validator.validate(&connecting.context()) {
            return Err(self
                .refuse(transport, connecting, RejectReason::Validation(reason))
                .await);
        }

        if self.shutdown.is_cancelled() {
            return Err(self.refuse(transport, connecting, shutting_down()).await);
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(self.settings.outbound_capacity);
        let cancel = self.shutdown.child_token();
        let entry = ConnectionEntry::new(
            id,
            connecting.client_id().to_string(),
            endpoint,
            clean_session,
            outbound_tx.clone(),
            cancel.clone(),
        );

        let registration = match registry.register(entry, self.settings.duplicate_policy).await {
            Ok(registration) => registration,
            Err(RegistryError::DuplicateClientId(client_id)) => {
                return Err(self
                    .refuse(transport, connecting, RejectReason::DuplicateClientId(client_id))
                    .await)
            }
            Err(e) => {
                return Err(self
                    .refuse(transport, connecting, RejectReason::ProtocolViolation(e.to_string()))
                    .await)
            }
        };

        let connection = connecting.accept();
        self.telemetry.emit(TelemetryEvent::connection_accepted(
            connection.client_id(),
            connection.endpoint(),
            connection.clean_session(),
        ));

        let client_id = connection.client_id().to_string();
        let session_present = registration.session_present;
        let (sink, stream) = transport.split();

        // CONNACK goes out before anything already queued for this connection
        let connack = Frame::ConnAck {
            accepted: true,
            session_present,
            reason: None,
        };
        let writer = self
            .tracker
            .spawn(write_loop(sink, outbound_rx, connack, id));

        let session = ConnectionSession {
            connection,
            router: self.router.clone(),
            outbound: outbound_tx,
            cancel,
            shutdown: self.shutdown.clone(),
        };
        let task = self.tracker.spawn(session.run(stream, writer));

        Ok(ConnectionHandle {
            id,
            client_id,
            session_present,
            task,
        })
    }

    async fn refuse<T>(
        &self,
        mut transport: Transport<T>,
        connecting: Connection<Connecting>,
        reason: RejectReason,
    ) -> ConnectionRejected
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let connack = Frame::ConnAck {
            accepted: false,
            session_present: false,
            reason: Some(reason.to_string()),
        };
        match timeout(self.settings.connect_timeout, transport.send(connack)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Could not deliver refusal: {}", e),
            Err(_) => debug!("Timed out delivering refusal"),
        }
        if let Err(e) = transport.close().await {
            debug!("Error closing refused transport: {}", e);
        }
        connecting.reject(reason)
    }

    /// Spawns a task on the supervisor's tracker so shutdown waits for it
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(future)
    }

    /// Cancels every connection and waits for their tasks to finish
    pub async fn shutdown(&self) {
        info!("Shutting down connection supervisor");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("All connections closed");
    }
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("settings", &self.settings)
            .field("tasks", &self.tracker.len())
            .finish()
    }
}

struct ConnectionSession {
    connection: Connection<Connected>,
    router: Arc<MessageRouter>,
    outbound: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
}

impl ConnectionSession {
    async fn run<T>(
        self,
        mut stream: SplitStream<Transport<T>>,
        mut writer: JoinHandle<Result<(), ProtocolError>>,
    ) -> DisconnectReason
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut writer_done = false;
        let reason = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    break if self.shutdown.is_cancelled() {
                        DisconnectReason::Shutdown
                    } else {
                        DisconnectReason::Evicted
                    };
                }

                result = &mut writer => {
                    writer_done = true;
                    break match result {
                        Ok(Ok(())) => DisconnectReason::PeerClosed,
                        Ok(Err(e)) => DisconnectReason::TransportFailure(e.to_string()),
                        Err(e) => DisconnectReason::TransportFailure(e.to_string()),
                    };
                }

                frame = stream.next() => match frame {
                    None => break DisconnectReason::PeerClosed,
                    Some(Err(ProtocolError::Io(e))) => {
                        break DisconnectReason::TransportFailure(e.to_string())
                    }
                    Some(Err(e)) => break DisconnectReason::ProtocolViolation(e.to_string()),
                    Some(Ok(frame)) => {
                        if let Some(reason) = self.handle(frame).await {
                            break reason;
                        }
                    }
                },
            }
        };

        let ConnectionSession {
            connection,
            router,
            outbound,
            ..
        } = self;

        router.registry().remove_connection(connection.id()).await;
        let closed = connection.disconnect(&reason);

        // the registry entry is gone; dropping the last sender lets the writer drain and close
        drop(outbound);
        if !writer_done {
            match timeout(Duration::from_secs(5), writer).await {
                Ok(Ok(Err(e))) => debug!("Writer for {} ended with: {}", closed.client_id(), e),
                Ok(_) => {}
                Err(_) => warn!("Writer for {} did not finish in time", closed.client_id()),
            }
        }

        reason
    }

    /// Handles one inbound frame; returns a reason when the session must end
    async fn handle(&self, frame: Frame) -> Option<DisconnectReason> {
        let client_id = self.connection.client_id();
        debug!("{} from {}", frame, client_id);

        match frame {
            Frame::Publish { message } => {
                if message.qos() >= QoS::AtLeastOnce {
                    self.reply(Frame::PubAck {
                        topic: message.topic().to_string(),
                    });
                }
                self.router.route(client_id, message).await;
            }
            Frame::Subscribe { filter, qos } => {
                if let Err(e) = validate_topic_filter(&filter) {
                    warn!("{} sent invalid filter {}: {}", client_id, filter, e);
                    self.reply(Frame::SubAck {
                        filter,
                        granted: None,
                    });
                    return None;
                }
                // SUBACK is queued under the registry lock, ahead of any retained replay
                let ack = Frame::SubAck {
                    filter: filter.clone(),
                    granted: Some(qos),
                };
                match self
                    .router
                    .registry()
                    .subscribe_with_ack(self.connection.id(), &filter, qos, Some(ack))
                    .await
                {
                    Ok(replayed) => info!(
                        "{} subscribed to {} ({} retained)",
                        client_id, filter, replayed
                    ),
                    Err(e) => warn!("Subscription of {} to {} failed: {}", client_id, filter, e),
                }
            }
            Frame::Unsubscribe { filter } => {
                let removed = self
                    .router
                    .registry()
                    .unsubscribe(self.connection.id(), &filter)
                    .await;
                debug!("{} unsubscribed from {} (existed: {})", client_id, filter, removed);
                self.reply(Frame::UnsubAck { filter });
            }
            Frame::PingReq => self.reply(Frame::PingResp),
            Frame::Disconnect => return Some(DisconnectReason::Graceful),
            Frame::Connect { .. } => {
                return Some(DisconnectReason::ProtocolViolation(
                    "second CONNECT on an open session".to_string(),
                ))
            }
            // acknowledgements of our deliveries carry no state here
            Frame::PubAck { .. } | Frame::PingResp => {}
            other => debug!("Ignoring {} from {}", other, client_id),
        }
        None
    }

    fn reply(&self, frame: Frame) {
        if let Err(e) = self.outbound.try_send(frame) {
            warn!(
                "Could not queue reply for {}: {}",
                self.connection.client_id(),
                e
            );
        }
    }
}

async fn write_loop<T>(
    mut sink: SplitSink<Transport<T>, Frame>,
    mut outbound: mpsc::Receiver<Frame>,
    first: Frame,
    id: ConnectionId,
) -> Result<(), ProtocolError>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    sink.send(first).await?;
    while let Some(frame) = outbound.recv().await {
        sink.send(frame).await?;
    }
    debug!("Outbound queue of connection {} closed", id);
    sink.close().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::registry::TopicRegistry;
    use crate::broker::validator::{AcceptAll, DenyList};
    use crate::protocol::{ApplicationMessage, DEFAULT_MAX_FRAME_SIZE};
    use crate::telemetry::{ChannelSink, TelemetryKind};
    use tokio::io::{AsyncWriteExt, DuplexStream};

    struct Fixture {
        supervisor: Arc<ConnectionSupervisor>,
        registry: Arc<TopicRegistry>,
        events: mpsc::Receiver<TelemetryEvent>,
    }

    fn fixture(validator: Arc<dyn ConnectionValidator>, policy: DuplicateClientPolicy) -> Fixture {
        fixture_with(
            validator,
            SupervisorSettings {
                duplicate_policy: policy,
                connect_timeout: Duration::from_millis(500),
                ..SupervisorSettings::default()
            },
        )
    }

    fn fixture_with(validator: Arc<dyn ConnectionValidator>, settings: SupervisorSettings) -> Fixture {
        let (sink, events) = ChannelSink::new(256);
        let sink: Arc<dyn TelemetrySink> = Arc::new(sink);
        let registry = Arc::new(TopicRegistry::new());
        let router = Arc::new(MessageRouter::new(registry.clone(), sink.clone()));
        Fixture {
            supervisor: Arc::new(ConnectionSupervisor::new(settings, validator, router, sink)),
            registry,
            events,
        }
    }

    async fn client(
        supervisor: &ConnectionSupervisor,
        client_id: &str,
        clean_session: bool,
    ) -> (Result<ConnectionHandle, ConnectionRejected>, Transport<DuplexStream>) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let mut peer = FrameCodec::framed(local, DEFAULT_MAX_FRAME_SIZE);
        peer.send(Frame::Connect {
            client_id: client_id.to_string(),
            clean_session,
        })
        .await
        .unwrap();
        let result = supervisor.accept(remote, format!("test:{}", client_id)).await;
        (result, peer)
    }

    async fn subscribe(peer: &mut Transport<DuplexStream>, filter: &str) {
        peer.send(Frame::Subscribe {
            filter: filter.to_string(),
            qos: QoS::AtMostOnce,
        })
        .await
        .unwrap();
        assert!(matches!(expect(peer).await, Frame::SubAck { granted: Some(_), .. }));
    }

    async fn expect(peer: &mut Transport<DuplexStream>) -> Frame {
        timeout(Duration::from_secs(2), peer.next())
            .await
            .expect("frame in time")
            .expect("stream open")
            .expect("valid frame")
    }

    #[tokio::test]
    async fn blocked_client_is_rejected_and_never_registered() {
        let mut f = fixture(Arc::new(DenyList::new(["blocked"])), DuplicateClientPolicy::default());
        let (result, mut peer) = client(&f.supervisor, "blocked", true).await;

        let rejected = result.unwrap_err();
        assert!(matches!(rejected.reason, RejectReason::Validation(_)));
        assert!(matches!(
            expect(&mut peer).await,
            Frame::ConnAck { accepted: false, .. }
        ));
        assert!(!f.registry.is_connected("blocked").await);
        assert_eq!(f.registry.connection_count().await, 0);
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn accepted_connection_emits_telemetry_and_connack() {
        let mut f = fixture(Arc::new(AcceptAll), DuplicateClientPolicy::default());
        let (result, mut peer) = client(&f.supervisor, "sensor", true).await;

        let handle = result.unwrap();
        assert_eq!(handle.client_id, "sensor");
        assert!(matches!(
            expect(&mut peer).await,
            Frame::ConnAck { accepted: true, session_present: false, .. }
        ));
        assert!(f.registry.is_connected("sensor").await);

        let event = f.events.try_recv().unwrap();
        assert_eq!(event.sequence, None);
        assert!(matches!(
            event.kind,
            TelemetryKind::ConnectionAccepted { ref client_id, clean_session: true, .. } if client_id == "sensor"
        ));
    }

    #[tokio::test]
    async fn first_frame_must_be_connect() {
        let f = fixture(Arc::new(AcceptAll), DuplicateClientPolicy::default());
        let (local, remote) = tokio::io::duplex(1024);
        let mut peer = FrameCodec::framed(local, DEFAULT_MAX_FRAME_SIZE);
        peer.send(Frame::PingReq).await.unwrap();

        let rejected = f.supervisor.accept(remote, "test".to_string()).await.unwrap_err();
        assert!(matches!(rejected.reason, RejectReason::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let f = fixture(Arc::new(AcceptAll), DuplicateClientPolicy::default());
        let (_local, remote) = tokio::io::duplex(1024);
        let rejected = f.supervisor.accept(remote, "test".to_string()).await.unwrap_err();
        assert_eq!(rejected.reason, RejectReason::HandshakeTimeout);
    }

    #[tokio::test]
    async fn empty_client_id_is_assigned_or_rejected() {
        let f = fixture(Arc::new(AcceptAll), DuplicateClientPolicy::default());
        let (result, _peer) = client(&f.supervisor, "", true).await;
        assert!(result.unwrap().client_id.starts_with("relay-"));

        let (result, _peer) = client(&f.supervisor, "", false).await;
        assert_eq!(result.unwrap_err().reason, RejectReason::InvalidClientId);
    }

    #[tokio::test]
    async fn publish_reaches_subscriber_and_retained_precedes_live() {
        let f = fixture(Arc::new(AcceptAll), DuplicateClientPolicy::default());

        let (publisher, mut pub_peer) = client(&f.supervisor, "pub", true).await;
        publisher.unwrap();
        expect(&mut pub_peer).await;

        let retained = ApplicationMessage::new("a/b", "retained").unwrap().with_retain(true);
        pub_peer.send(Frame::publish(retained)).await.unwrap();
        pub_peer.send(Frame::PingReq).await.unwrap();
        assert_eq!(expect(&mut pub_peer).await, Frame::PingResp);

        let (subscriber, mut sub_peer) = client(&f.supervisor, "sub", true).await;
        subscriber.unwrap();
        expect(&mut sub_peer).await;
        sub_peer
            .send(Frame::Subscribe {
                filter: "a/#".to_string(),
                qos: QoS::AtMostOnce,
            })
            .await
            .unwrap();
        assert!(matches!(expect(&mut sub_peer).await, Frame::SubAck { granted: Some(_), .. }));

        pub_peer
            .send(Frame::publish(ApplicationMessage::new("a/b", "live").unwrap()))
            .await
            .unwrap();

        let payloads: Vec<String> = vec![expect(&mut sub_peer).await, expect(&mut sub_peer).await]
            .into_iter()
            .map(|frame| match frame {
                Frame::Publish { message } => message.payload_text().unwrap(),
                other => panic!("expected publish, got {}", other),
            })
            .collect();
        assert_eq!(payloads, vec!["retained".to_string(), "live".to_string()]);
        assert_eq!(f.supervisor.router().routed(), 2);
    }

    #[tokio::test]
    async fn qos1_publish_is_acknowledged() {
        let f = fixture(Arc::new(AcceptAll), DuplicateClientPolicy::default());
        let (handle, mut peer) = client(&f.supervisor, "q", true).await;
        handle.unwrap();
        expect(&mut peer).await;

        let message = ApplicationMessage::new("q/1", "x").unwrap().with_qos(QoS::AtLeastOnce);
        peer.send(Frame::publish(message)).await.unwrap();
        assert_eq!(
            expect(&mut peer).await,
            Frame::PubAck {
                topic: "q/1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn transport_loss_removes_subscriptions() {
        let f = fixture(Arc::new(AcceptAll), DuplicateClientPolicy::default());
        let (handle, mut peer) = client(&f.supervisor, "gone", true).await;
        let handle = handle.unwrap();
        expect(&mut peer).await;
        peer.send(Frame::Subscribe {
            filter: "x".to_string(),
            qos: QoS::AtMostOnce,
        })
        .await
        .unwrap();
        expect(&mut peer).await;
        assert_eq!(f.registry.subscriber_count("x").await, 1);

        drop(peer);
        let reason = timeout(Duration::from_secs(2), handle.closed()).await.unwrap();
        assert_eq!(reason, DisconnectReason::PeerClosed);
        assert_eq!(f.registry.subscriber_count("x").await, 0);
        assert!(!f.registry.is_connected("gone").await);

        let outcome = f
            .supervisor
            .router()
            .route("other", ApplicationMessage::new("x", "late").unwrap())
            .await;
        assert_eq!(outcome.delivered(), 0);
    }

    #[tokio::test]
    async fn graceful_disconnect() {
        let f = fixture(Arc::new(AcceptAll), DuplicateClientPolicy::default());
        let (handle, mut peer) = client(&f.supervisor, "bye", true).await;
        let handle = handle.unwrap();
        expect(&mut peer).await;
        peer.send(Frame::Disconnect).await.unwrap();
        assert_eq!(handle.closed().await, DisconnectReason::Graceful);
    }

    #[tokio::test]
    async fn duplicate_id_evicts_existing_by_default() {
        let f = fixture(Arc::new(AcceptAll), DuplicateClientPolicy::EvictExisting);
        let (first, mut first_peer) = client(&f.supervisor, "dup", true).await;
        let first = first.unwrap();
        expect(&mut first_peer).await;

        let (second, _second_peer) = client(&f.supervisor, "dup", true).await;
        let second = second.unwrap();

        assert_eq!(first.closed().await, DisconnectReason::Evicted);
        assert_eq!(f.registry.connection_id("dup").await, Some(second.id));
    }

    #[tokio::test]
    async fn duplicate_id_rejected_when_configured() {
        let f = fixture(Arc::new(AcceptAll), DuplicateClientPolicy::RejectNew);
        let (first, _first_peer) = client(&f.supervisor, "dup", true).await;
        let first = first.unwrap();

        let (second, _second_peer) = client(&f.supervisor, "dup", true).await;
        assert!(matches!(
            second.unwrap_err().reason,
            RejectReason::DuplicateClientId(_)
        ));
        assert_eq!(f.registry.connection_id("dup").await, Some(first.id));
    }

    #[tokio::test]
    async fn shutdown_closes_connections() {
        let f = fixture(Arc::new(AcceptAll), DuplicateClientPolicy::default());
        let (handle, _peer) = client(&f.supervisor, "s", true).await;
        let handle = handle.unwrap();

        timeout(Duration::from_secs(2), f.supervisor.shutdown()).await.unwrap();
        assert_eq!(handle.closed().await, DisconnectReason::Shutdown);
        assert_eq!(f.registry.connection_count().await, 0);

        let (late, _peer) = client(&f.supervisor, "late", true).await;
        assert!(late.is_err());
    }

    #[tokio::test]
    async fn invalid_topic_is_counted_but_not_delivered() {
        let mut f = fixture(Arc::new(AcceptAll), DuplicateClientPolicy::default());
        let (subscriber, mut sub_peer) = client(&f.supervisor, "all", true).await;
        subscriber.unwrap();
        expect(&mut sub_peer).await;
        subscribe(&mut sub_peer, "#").await;

        let (publisher, mut pub_peer) = client(&f.supervisor, "bad", true).await;
        publisher.unwrap();
        expect(&mut pub_peer).await;

        // a wildcard topic name cannot be built through ApplicationMessage, so write it raw
        let json = br#"{"type":"publish","message":{"topic":"a/+","payload":null,"qos":"at_most_once","retain":false}}"#;
        let io = pub_peer.get_mut();
        io.write_all(&(json.len() as u32).to_be_bytes()).await.unwrap();
        io.write_all(json).await.unwrap();
        pub_peer.send(Frame::PingReq).await.unwrap();
        assert_eq!(expect(&mut pub_peer).await, Frame::PingResp);

        assert_eq!(f.supervisor.router().routed(), 1);
        let mut routed = Vec::new();
        while let Ok(event) = f.events.try_recv() {
            if let TelemetryKind::MessageRouted { topic, .. } = event.kind {
                routed.push((event.sequence, topic));
            }
        }
        assert_eq!(routed, vec![(Some(1), "a/+".to_string())]);
        assert!(timeout(Duration::from_millis(100), sub_peer.next()).await.is_err());
    }

    #[tokio::test]
    async fn oversized_frame_ends_only_its_connection() {
        let f = fixture_with(
            Arc::new(AcceptAll),
            SupervisorSettings {
                max_frame_size: 1024,
                ..SupervisorSettings::default()
            },
        );
        let (big, mut big_peer) = client(&f.supervisor, "big", true).await;
        let big = big.unwrap();
        expect(&mut big_peer).await;

        let (subscriber, mut sub_peer) = client(&f.supervisor, "sub", true).await;
        subscriber.unwrap();
        expect(&mut sub_peer).await;
        subscribe(&mut sub_peer, "t").await;

        let (publisher, mut pub_peer) = client(&f.supervisor, "pub", true).await;
        publisher.unwrap();
        expect(&mut pub_peer).await;

        big_peer
            .send(Frame::publish(ApplicationMessage::new("t", vec![7u8; 4096]).unwrap()))
            .await
            .unwrap();
        let reason = timeout(Duration::from_secs(2), big.closed()).await.unwrap();
        assert!(matches!(reason, DisconnectReason::ProtocolViolation(_)), "{:?}", reason);
        assert!(!f.registry.is_connected("big").await);

        pub_peer
            .send(Frame::publish(ApplicationMessage::new("t", "small").unwrap()))
            .await
            .unwrap();
        match expect(&mut sub_peer).await {
            Frame::Publish { message } => assert_eq!(message.payload_text().unwrap(), "small"),
            other => panic!("expected publish, got {}", other),
        }
        assert!(f.registry.is_connected("pub").await);
    }

    #[tokio::test]
    async fn shutdown_refuses_handshakes_in_progress() {
        let mut f = fixture_with(
            Arc::new(AcceptAll),
            SupervisorSettings {
                connect_timeout: Duration::from_secs(30),
                ..SupervisorSettings::default()
            },
        );
        let (local, remote) = tokio::io::duplex(1024);
        let mut peer = FrameCodec::framed(local, DEFAULT_MAX_FRAME_SIZE);
        let supervisor = f.supervisor.clone();
        let pending = f
            .supervisor
            .spawn(async move { supervisor.accept(remote, "test:late".to_string()).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // returns long before the handshake deadline
        timeout(Duration::from_secs(2), f.supervisor.shutdown()).await.unwrap();

        // CONNECT arriving after shutdown must not register anything
        let _ = peer
            .send(Frame::Connect {
                client_id: "late".to_string(),
                clean_session: true,
            })
            .await;
        let rejected = pending.await.unwrap().unwrap_err();
        assert_eq!(rejected.reason, shutting_down());
        assert!(!f.registry.is_connected("late").await);
        assert!(f.events.try_recv().is_err());
    }
}
