//! Broker: accepts TCP connections and relays published messages to subscribers
//!
//! # Architecture
//!
//! ```text
//! TcpListener ──► accept loop ──► ConnectionSupervisor ──► per-connection tasks
//!                                        │                        │
//!                                 ConnectionValidator       MessageRouter
//!                                                                 │
//!                                       TelemetrySink ◄───────────┤
//!                                                                 ▼
//!                                                          TopicRegistry
//! ```
//!
//! [`Broker::bind`] starts the accept loop and returns a [`BrokerHandle`]; dropping
//! the handle does not stop the broker, [`BrokerHandle::shutdown`] does.

pub mod connection;
pub mod registry;
pub mod router;
pub mod supervisor;
pub mod validator;

pub use connection::DisconnectReason;
pub use registry::{ConnectionId, DuplicateClientPolicy, TopicRegistry};
pub use router::{MessageRouter, RouteOutcome};
pub use supervisor::{ConnectionRejected, ConnectionSupervisor, RejectReason, SupervisorSettings};
pub use validator::{AcceptAll, ConnectionValidator, DenyList, ValidationContext, ValidationOutcome};

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::telemetry::{TelemetrySink, TracingSink};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Listener error: {0}")]
    Listener(#[from] std::io::Error),
}

pub struct Broker {
    supervisor: Arc<ConnectionSupervisor>,
    registry: Arc<TopicRegistry>,
}

impl Broker {
    pub fn new(
        config: &BrokerConfig,
        validator: Arc<dyn ConnectionValidator>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let registry = Arc::new(TopicRegistry::new());
        let router = Arc::new(MessageRouter::new(registry.clone(), telemetry.clone()));
        let supervisor = ConnectionSupervisor::new(
            SupervisorSettings::from(config),
            validator,
            router,
            telemetry,
        );
        Self {
            supervisor: Arc::new(supervisor),
            registry,
        }
    }

    /// Deny-list validator from the config and tracing telemetry
    pub fn from_config(config: &BrokerConfig) -> Self {
        let validator = DenyList::new(config.blocked_client_ids.iter().cloned());
        Self::new(config, Arc::new(validator), Arc::new(TracingSink))
    }

    pub async fn bind<A>(self, addr: A) -> Result<BrokerHandle, BrokerError>
    where
        A: ToSocketAddrs + std::fmt::Display,
    {
        let listener = TcpListener::bind(&addr).await.map_err(|source| BrokerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        self.serve(listener)
    }

    /// Starts the accept loop on an already bound listener
    pub fn serve(self, listener: TcpListener) -> Result<BrokerHandle, BrokerError> {
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        info!("Broker listening on {}", local_addr);

        let supervisor = self.supervisor.clone();
        let accept_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            accept_loop(listener, supervisor, accept_cancel).await;
        });

        Ok(BrokerHandle {
            local_addr,
            supervisor: self.supervisor,
            registry: self.registry,
            cancel,
            task,
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    supervisor: Arc<ConnectionSupervisor>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Accept loop stopped");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
                    }
                    let connection_supervisor = supervisor.clone();
                    supervisor.spawn(async move {
                        // rejections are already logged by the supervisor
                        let _ = connection_supervisor.accept(stream, peer.to_string()).await;
                    });
                }
                Err(e) => {
                    // per-connection errors (e.g. reset before accept) must not stop the listener
                    warn!("Failed to accept connection: {}", e);
                }
            },
        }
    }
}

/// Running broker
pub struct BrokerHandle {
    local_addr: SocketAddr,
    supervisor: Arc<ConnectionSupervisor>,
    registry: Arc<TopicRegistry>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl BrokerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        self.supervisor.router()
    }

    /// Stops accepting, closes every connection and waits for their tasks
    pub async fn shutdown(mut self) {
        info!("Shutting down broker on {}", self.local_addr);
        self.cancel.cancel();
        if let Err(e) = (&mut self.task).await {
            error!("Accept loop panicked: {}", e);
        }
        self.supervisor.shutdown().await;
        info!("Broker stopped after routing {} messages", self.router().routed());
    }
}

impl std::fmt::Debug for BrokerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerHandle")
            .field("local_addr", &self.local_addr)
            .field("supervisor", &self.supervisor)
            .finish()
    }
}
