//! Managed client session
//!
//! Owns one logical connection to a broker and keeps it alive. Two tasks share
//! the session's queue and phase:
//!
//! ```text
//!  publish() ──► PublishQueue ──► drain task ──► SplitSink ──► broker
//!                                     ▲
//!                                     │ Link (one per successful handshake)
//!                                     │
//!               supervisor task: connect ─► handshake ─► resubscribe ─► read loop
//!                        ▲                                                │
//!                        └──────────── reconnect delay ◄──────────────────┘
//! ```
//!
//! The drain task only writes while it holds a [`Link`], i.e. while the phase is
//! `Connected`. A failed write puts the message back at the head of the queue.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::queue::{OverflowPolicy, PublishQueue};
use super::state::{ReconnectPolicy, SessionError, SessionEvent, SessionNotification, SessionPhase, SessionState};
use crate::config::ClientConfig;
use crate::protocol::{
    ApplicationMessage, Frame, FrameCodec, ProtocolError, QoS, Transport, DEFAULT_MAX_FRAME_SIZE,
};

type Writer = SplitSink<Transport<TcpStream>, Frame>;
type Reader = SplitStream<Transport<TcpStream>>;

const INCOMING_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub client_id: String,
    /// `host:port` of the broker
    pub address: String,
    pub clean_session: bool,
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
    pub subscriptions: Vec<(String, QoS)>,
    pub max_queue_len: Option<usize>,
    pub overflow_policy: OverflowPolicy,
    pub max_frame_size: usize,
}

impl SessionOptions {
    pub fn new(client_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            address: address.into(),
            clean_session: true,
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(5),
            subscriptions: Vec::new(),
            max_queue_len: None,
            overflow_policy: OverflowPolicy::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl From<&ClientConfig> for SessionOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            client_id: config.client_id.clone(),
            address: config.address(),
            clean_session: config.clean_session,
            reconnect: config.reconnect_policy(),
            connect_timeout: config.connect_timeout(),
            subscriptions: config
                .subscriptions
                .iter()
                .map(|filter| (filter.clone(), config.qos))
                .collect(),
            max_queue_len: config.max_queue_len,
            overflow_policy: config.overflow_policy,
            max_frame_size: config.max_frame_size,
        }
    }
}

/// Cheap handle for enqueueing messages, usable after the session is moved
#[derive(Debug, Clone)]
pub struct SessionPublisher {
    pub(crate) queue: PublishQueue,
    pub(crate) cancel: CancellationToken,
}

impl SessionPublisher {
    /// Enqueues without waiting for the connection
    pub fn publish(&self, message: ApplicationMessage) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::ShutDown);
        }
        self.queue.push(message)
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

/// Writer half of an established connection, handed to the drain task
struct Link {
    writer: Writer,
    /// Cancelled by whichever side notices the transport is gone first
    lost: CancellationToken,
}

pub struct ManagedSession {
    client_id: String,
    publisher: SessionPublisher,
    phase: watch::Receiver<SessionPhase>,
    sent: Arc<AtomicU64>,
    incoming: Option<mpsc::Receiver<ApplicationMessage>>,
    supervisor: JoinHandle<Result<(), SessionError>>,
    drain: JoinHandle<()>,
}

impl ManagedSession {
    /// Starts supervision immediately; the first connect attempt runs in the background
    pub fn start(options: SessionOptions) -> Self {
        let queue = PublishQueue::new(options.max_queue_len, options.overflow_policy);
        let cancel = CancellationToken::new();
        let sent = Arc::new(AtomicU64::new(0));
        let (phase_tx, phase_rx) = watch::channel(SessionPhase::Disconnected);
        let (link_tx, link_rx) = mpsc::channel(1);
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CAPACITY);

        info!("Starting managed session {} -> {}", options.client_id, options.address);

        let drain = tokio::spawn(drain_loop(
            options.client_id.clone(),
            queue.clone(),
            link_rx,
            sent.clone(),
            cancel.clone(),
        ));

        let client_id = options.client_id.clone();
        let state = SessionState::new(options.reconnect);
        let supervisor = tokio::spawn(
            Supervisor {
                options,
                state,
                phase: phase_tx,
                links: link_tx,
                incoming: incoming_tx,
                cancel: cancel.clone(),
            }
            .run(),
        );

        Self {
            client_id,
            publisher: SessionPublisher { queue, cancel },
            phase: phase_rx,
            sent,
            incoming: Some(incoming_rx),
            supervisor,
            drain,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::start(SessionOptions::from(config))
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Never blocks; fails only when the session is shut down or the bounded queue rejects
    pub fn publish(&self, message: ApplicationMessage) -> Result<(), SessionError> {
        self.publisher.publish(message)
    }

    pub fn publisher(&self) -> SessionPublisher {
        self.publisher.clone()
    }

    pub fn phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase.clone()
    }

    pub fn pending(&self) -> usize {
        self.publisher.pending()
    }

    /// Messages written to the transport so far
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    /// Messages the broker delivers on subscribed filters; available once
    pub fn incoming(&mut self) -> Option<mpsc::Receiver<ApplicationMessage>> {
        self.incoming.take()
    }

    /// Stops reconnecting, finishes an in-flight write, says goodbye and clears the queue
    ///
    /// Returns the supervisor's result, e.g. [`SessionError::ReconnectExhausted`] if it
    /// had already given up.
    pub async fn shutdown(self) -> Result<(), SessionError> {
        info!("Shutting down managed session {}", self.client_id);
        self.publisher.cancel.cancel();

        if let Err(e) = self.drain.await {
            error!("Drain task of {} panicked: {}", self.client_id, e);
        }
        let result = match self.supervisor.await {
            Ok(result) => result,
            Err(e) => {
                error!("Supervisor task of {} panicked: {}", self.client_id, e);
                Ok(())
            }
        };

        let discarded = self.publisher.queue.clear();
        if discarded > 0 {
            warn!("Discarded {} unsent messages of {}", discarded, self.client_id);
        }
        result
    }
}

impl std::fmt::Debug for ManagedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedSession")
            .field("client_id", &self.client_id)
            .field("phase", &*self.phase.borrow())
            .field("pending", &self.pending())
            .field("sent", &self.sent())
            .finish()
    }
}

struct Supervisor {
    options: SessionOptions,
    state: SessionState,
    phase: watch::Sender<SessionPhase>,
    links: mpsc::Sender<Link>,
    incoming: mpsc::Sender<ApplicationMessage>,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(mut self) -> Result<(), SessionError> {
        let result = self.supervise().await;

        if let Err(ref e) = result {
            error!("Session {} stopped: {}", self.options.client_id, e);
            // nothing drains the queue anymore
            self.cancel.cancel();
        }
        self.state.stop();
        self.publish_phase();
        result
    }

    async fn supervise(&mut self) -> Result<(), SessionError> {
        self.transition(SessionEvent::Start)?;

        loop {
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                result = self.handshake() => result,
            };

            match connected {
                Ok((writer, reader)) => {
                    self.transition(SessionEvent::HandshakeSucceeded)?;
                    if self.serve(writer, reader).await {
                        return Ok(());
                    }
                    self.transition(SessionEvent::TransportLost)?;
                }
                Err(e) => {
                    debug!("Handshake of {} failed: {}", self.options.client_id, e);
                    self.transition(SessionEvent::HandshakeFailed)?;
                    if self.state.exhausted() {
                        return Err(SessionError::ReconnectExhausted {
                            attempts: self.state.failed_attempts(),
                        });
                    }
                }
            }

            let delay = self.state.reconnect_delay();
            debug!("Reconnecting {} in {:?}", self.options.client_id, delay);
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
            self.transition(SessionEvent::DelayElapsed)?;
        }
    }

    fn transition(&mut self, event: SessionEvent) -> Result<(), SessionError> {
        let notification = self.state.apply(event)?;
        if self.state.exhausted() {
            // publishers must see the shutdown before the final phase
            self.cancel.cancel();
        }
        self.publish_phase();
        if let Some(notification) = notification {
            self.notify(notification);
        }
        Ok(())
    }

    fn publish_phase(&self) {
        self.phase.send_replace(self.state.phase());
    }

    fn notify(&self, notification: SessionNotification) {
        let client_id = &self.options.client_id;
        match notification {
            SessionNotification::Connected => {
                info!("Client {} connected to {}", client_id, self.options.address)
            }
            SessionNotification::ConnectingFailed {
                attempt,
                retrying: true,
            } => warn!(
                "Client {} failed to connect to {} (attempt {}), retrying in {:?}",
                client_id,
                self.options.address,
                attempt,
                self.state.reconnect_delay()
            ),
            SessionNotification::ConnectingFailed {
                attempt,
                retrying: false,
            } => warn!(
                "Client {} failed to connect to {} (attempt {}), giving up",
                client_id, self.options.address, attempt
            ),
            SessionNotification::Disconnected => info!(
                "Client {} disconnected from {}, retrying in {:?}",
                client_id,
                self.options.address,
                self.state.reconnect_delay()
            ),
        }
    }

    /// TCP connect, CONNECT/CONNACK and re-subscription, all under the connect timeout
    async fn handshake(&self) -> Result<(Writer, Reader), SessionError> {
        let options = &self.options;
        let attempt = async {
            let stream = TcpStream::connect(options.address.as_str())
                .await
                .map_err(ProtocolError::from)?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Could not set TCP_NODELAY: {}", e);
            }
            let mut transport = FrameCodec::framed(stream, options.max_frame_size);
            transport
                .send(Frame::Connect {
                    client_id: options.client_id.clone(),
                    clean_session: options.clean_session,
                })
                .await?;

            match transport.next().await {
                Some(Ok(Frame::ConnAck {
                    accepted: true,
                    session_present,
                    ..
                })) => {
                    debug!("CONNACK for {} (session present: {})", options.client_id, session_present);
                }
                Some(Ok(Frame::ConnAck { reason, .. })) => {
                    return Err(SessionError::Refused(
                        reason.unwrap_or_else(|| "no reason given".to_string()),
                    ))
                }
                Some(Ok(other)) => {
                    return Err(ProtocolError::UnexpectedFrame(other.to_string()).into())
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Err(ProtocolError::PeerClosed.into()),
            }

            for (filter, qos) in &options.subscriptions {
                transport
                    .send(Frame::Subscribe {
                        filter: filter.clone(),
                        qos: *qos,
                    })
                    .await?;
            }
            Ok::<_, SessionError>(transport.split())
        };

        match timeout(options.connect_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout.into()),
        }
    }

    /// Hands the writer to the drain task and reads until the link dies
    ///
    /// Returns `true` when the session was shut down meanwhile.
    async fn serve(&self, writer: Writer, mut reader: Reader) -> bool {
        let lost = self.cancel.child_token();
        let link = Link {
            writer,
            lost: lost.clone(),
        };
        if self.links.send(link).await.is_err() {
            return true;
        }

        let client_id = &self.options.client_id;
        let shutdown = loop {
            tokio::select! {
                _ = lost.cancelled() => break self.cancel.is_cancelled(),
                frame = reader.next() => match frame {
                    None => {
                        debug!("Broker closed the connection of {}", client_id);
                        break false;
                    }
                    Some(Err(e)) => {
                        debug!("Read error on {}: {}", client_id, e);
                        break false;
                    }
                    Some(Ok(frame)) => self.handle(frame),
                },
            }
        };
        lost.cancel();
        shutdown
    }

    fn handle(&self, frame: Frame) {
        let client_id = &self.options.client_id;
        match frame {
            Frame::Publish { message } => {
                info!("Client {} received: {}", client_id, message);
                if let Err(e) = self.incoming.try_send(message) {
                    debug!("Incoming message for {} not forwarded: {}", client_id, e);
                }
            }
            Frame::SubAck {
                filter,
                granted: Some(qos),
            } => info!("Client {} subscribed to {} ({})", client_id, filter, qos),
            Frame::SubAck {
                filter,
                granted: None,
            } => warn!("Broker refused subscription of {} to {}", client_id, filter),
            Frame::PingReq => debug!("Unexpected PINGREQ from broker"),
            other => debug!("{} for {}", other, client_id),
        }
    }
}

async fn drain_loop(
    client_id: String,
    queue: PublishQueue,
    mut links: mpsc::Receiver<Link>,
    sent: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    loop {
        let mut link = tokio::select! {
            _ = cancel.cancelled() => break,
            link = links.recv() => match link {
                Some(link) => link,
                None => break,
            },
        };
        debug!("Drain of {} resumed with {} pending", client_id, queue.len());

        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    goodbye(&client_id, &mut link.writer).await;
                    return;
                }
                _ = link.lost.cancelled() => break,
                message = queue.next() => message,
            };

            // an in-flight write always runs to completion
            match link.writer.send(Frame::publish(message.clone())).await {
                Ok(()) => {
                    sent.fetch_add(1, Ordering::SeqCst);
                    debug!("Client {} sent {}", client_id, message);
                }
                Err(e) => {
                    warn!("Write of {} failed, requeued: {}", client_id, e);
                    queue.push_front(message);
                    link.lost.cancel();
                    break;
                }
            }
        }
    }
    debug!("Drain of {} stopped", client_id);
}

async fn goodbye(client_id: &str, writer: &mut Writer) {
    let farewell = async {
        writer.send(Frame::Disconnect).await?;
        writer.close().await
    };
    match timeout(Duration::from_secs(1), farewell).await {
        Ok(Ok(())) => debug!("Client {} sent DISCONNECT", client_id),
        Ok(Err(e)) => debug!("DISCONNECT of {} failed: {}", client_id, e),
        Err(_) => debug!("DISCONNECT of {} timed out", client_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerHandle, DenyList};
    use crate::config::BrokerConfig;
    use crate::telemetry::TracingSink;
    use tokio::net::TcpListener;

    async fn broker(blocked: &[&str]) -> BrokerHandle {
        let validator = DenyList::new(blocked.iter().copied());
        Broker::new(&BrokerConfig::default(), Arc::new(validator), Arc::new(TracingSink))
            .bind("127.0.0.1:0")
            .await
            .unwrap()
    }

    async fn unused_address() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    }

    fn options(client_id: &str, address: String) -> SessionOptions {
        SessionOptions {
            reconnect: ReconnectPolicy::fixed(Duration::from_millis(50)),
            connect_timeout: Duration::from_secs(1),
            ..SessionOptions::new(client_id, address)
        }
    }

    async fn wait_for(session: &ManagedSession, phase: SessionPhase) {
        let mut rx = session.phase();
        timeout(Duration::from_secs(5), rx.wait_for(|p| *p == phase))
            .await
            .expect("phase reached in time")
            .expect("session alive");
    }

    async fn subscriber(broker: &BrokerHandle, filter: &str) -> Transport<TcpStream> {
        let stream = TcpStream::connect(broker.local_addr()).await.unwrap();
        let mut transport = FrameCodec::framed(stream, DEFAULT_MAX_FRAME_SIZE);
        transport
            .send(Frame::Connect {
                client_id: "observer".to_string(),
                clean_session: true,
            })
            .await
            .unwrap();
        transport.next().await.unwrap().unwrap();
        transport
            .send(Frame::Subscribe {
                filter: filter.to_string(),
                qos: QoS::AtMostOnce,
            })
            .await
            .unwrap();
        assert!(matches!(
            transport.next().await.unwrap().unwrap(),
            Frame::SubAck { .. }
        ));
        transport
    }

    async fn next_payload(transport: &mut Transport<TcpStream>) -> String {
        match timeout(Duration::from_secs(5), transport.next()).await {
            Ok(Some(Ok(Frame::Publish { message }))) => message.payload_text().unwrap(),
            other => panic!("expected publish, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn publishes_in_fifo_order() {
        let broker = broker(&[]).await;
        let mut observer = subscriber(&broker, "data/#").await;

        let session = ManagedSession::start(options("writer", broker.local_addr().to_string()));
        for n in 0..5 {
            session
                .publish(ApplicationMessage::new("data/seq", format!("{}", n)).unwrap())
                .unwrap();
        }
        wait_for(&session, SessionPhase::Connected).await;

        for n in 0..5 {
            assert_eq!(next_payload(&mut observer).await, n.to_string());
        }
        assert_eq!(session.sent(), 5);
        assert_eq!(session.pending(), 0);

        session.shutdown().await.unwrap();
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn subscriptions_feed_incoming() {
        let broker = broker(&[]).await;
        let mut opts = options("listener", broker.local_addr().to_string());
        opts.subscriptions = vec![("news/#".to_string(), QoS::AtMostOnce)];
        let mut session = ManagedSession::start(opts);
        let mut incoming = session.incoming().unwrap();
        assert!(session.incoming().is_none());
        wait_for(&session, SessionPhase::Connected).await;

        // the subscription is live once the broker lists it
        timeout(Duration::from_secs(5), async {
            while broker.registry().subscriber_count("news/#").await == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        broker
            .router()
            .route("test", ApplicationMessage::new("news/today", "hello").unwrap())
            .await;

        let message = timeout(Duration::from_secs(5), incoming.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.topic(), "news/today");

        session.shutdown().await.unwrap();
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn refused_handshakes_exhaust_attempts() {
        let broker = broker(&["blocked"]).await;
        let mut opts = options("blocked", broker.local_addr().to_string());
        opts.reconnect = ReconnectPolicy {
            delay: Duration::from_millis(200),
            max_delay: None,
            max_attempts: Some(2),
        };
        let session = ManagedSession::start(opts);

        wait_for(&session, SessionPhase::ReconnectPending).await;
        wait_for(&session, SessionPhase::Disconnected).await;
        assert!(!broker.registry().is_connected("blocked").await);
        assert!(matches!(
            session.publish(ApplicationMessage::new("t", "x").unwrap()),
            Err(SessionError::ShutDown)
        ));
        assert!(matches!(
            session.shutdown().await,
            Err(SessionError::ReconnectExhausted { attempts: 2 })
        ));
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn bounded_queue_while_offline() {
        let mut opts = options("offline", unused_address().await);
        opts.max_queue_len = Some(2);
        let session = ManagedSession::start(opts);

        session.publish(ApplicationMessage::new("t", "1").unwrap()).unwrap();
        session.publish(ApplicationMessage::new("t", "2").unwrap()).unwrap();
        assert!(matches!(
            session.publish(ApplicationMessage::new("t", "3").unwrap()),
            Err(SessionError::QueueFull { capacity: 2 })
        ));
        assert_eq!(session.pending(), 2);
        assert_eq!(session.sent(), 0);

        timeout(Duration::from_secs(2), session.shutdown())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_interrupts_long_reconnect_wait() {
        let mut opts = options("patient", unused_address().await);
        opts.reconnect = ReconnectPolicy::fixed(Duration::from_secs(3600));
        let session = ManagedSession::start(opts);
        wait_for(&session, SessionPhase::ReconnectPending).await;

        let mut phase = session.phase();
        timeout(Duration::from_secs(2), session.shutdown())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*phase.borrow_and_update(), SessionPhase::Disconnected);
    }

    #[tokio::test]
    async fn evicted_session_reconnects() {
        let broker = broker(&[]).await;
        let mut opts = options("twin", broker.local_addr().to_string());
        opts.reconnect = ReconnectPolicy::fixed(Duration::from_millis(300));
        let session = ManagedSession::start(opts);
        wait_for(&session, SessionPhase::Connected).await;
        let first = broker.registry().connection_id("twin").await.unwrap();

        // a second connection with the same id evicts the session's transport
        let mut intruder = FrameCodec::framed(
            TcpStream::connect(broker.local_addr()).await.unwrap(),
            DEFAULT_MAX_FRAME_SIZE,
        );
        intruder
            .send(Frame::Connect {
                client_id: "twin".to_string(),
                clean_session: true,
            })
            .await
            .unwrap();
        intruder.next().await.unwrap().unwrap();
        drop(intruder);

        wait_for(&session, SessionPhase::ReconnectPending).await;
        wait_for(&session, SessionPhase::Connected).await;
        let again = broker.registry().connection_id("twin").await;
        assert!(again.is_some_and(|id| id != first));

        session.shutdown().await.unwrap();
        broker.shutdown().await;
    }

    #[test]
    fn options_from_config() {
        let config = ClientConfig {
            subscriptions: vec!["a/#".to_string()],
            qos: QoS::AtLeastOnce,
            ..ClientConfig::default()
        };
        let options = SessionOptions::from(&config);
        assert_eq!(options.address, "localhost:707");
        assert_eq!(options.subscriptions, vec![("a/#".to_string(), QoS::AtLeastOnce)]);
        assert_eq!(options.reconnect.delay, Duration::from_secs(60));
    }
}
