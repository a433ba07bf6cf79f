//! Topic registry: live connections, subscriptions and retained messages
//!
//! All state sits behind one `tokio::sync::RwLock`. Routing fans out under the
//! read lock (or the write lock when it also updates a retained value), so a
//! route never observes a subscriber set that is half-way through an update.
//! Outbound queues are written with `try_send`, the lock is never held across a
//! transport write.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::{topic_matches, validate_topic_filter, ApplicationMessage, Frame, QoS, TopicError};

pub type ConnectionId = u64;

/// What to do when a client id is already connected
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateClientPolicy {
    /// Last writer wins: the existing connection is closed
    #[default]
    EvictExisting,
    /// First writer wins: the newcomer is rejected
    RejectNew,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Client id already connected: {0}")]
    DuplicateClientId(String),

    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("Invalid topic filter: {0}")]
    InvalidFilter(#[from] TopicError),
}

/// A registered, connected client
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub id: ConnectionId,
    pub client_id: String,
    pub endpoint: String,
    pub clean_session: bool,
    outbound: mpsc::Sender<Frame>,
    cancel: CancellationToken,
}

impl ConnectionEntry {
    pub fn new(
        id: ConnectionId,
        client_id: String,
        endpoint: String,
        clean_session: bool,
        outbound: mpsc::Sender<Frame>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            client_id,
            endpoint,
            clean_session,
            outbound,
            cancel,
        }
    }
}

/// Result of registering a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub session_present: bool,
    pub evicted: Option<ConnectionId>,
}

/// Fan-out result for one message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dispatch {
    pub matched: usize,
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    client_ids: HashMap<String, ConnectionId>,
    // filter -> (connection -> granted qos)
    subscriptions: HashMap<String, HashMap<ConnectionId, QoS>>,
    retained: HashMap<String, ApplicationMessage>,
    // stored subscriptions of disconnected non-clean sessions
    sessions: HashMap<String, Vec<(String, QoS)>>,
}

impl RegistryState {
    fn detach(&mut self, id: ConnectionId) -> Option<ConnectionEntry> {
        let entry = self.connections.remove(&id)?;
        if self.client_ids.get(&entry.client_id) == Some(&id) {
            self.client_ids.remove(&entry.client_id);
        }

        let mut kept = Vec::new();
        self.subscriptions.retain(|filter, subscribers| {
            if let Some(qos) = subscribers.remove(&id) {
                kept.push((filter.clone(), qos));
            }
            !subscribers.is_empty()
        });

        if !entry.clean_session {
            debug!(
                "Storing {} subscriptions for session {}",
                kept.len(),
                entry.client_id
            );
            self.sessions.insert(entry.client_id.clone(), kept);
        }
        Some(entry)
    }

    fn insert_subscription(&mut self, id: ConnectionId, filter: &str, qos: QoS) {
        self.subscriptions
            .entry(filter.to_string())
            .or_default()
            .insert(id, qos);
    }

    fn fan_out(&self, message: &ApplicationMessage) -> Dispatch {
        // one copy per connection, at the highest granted qos among its matching filters
        let mut targets: HashMap<ConnectionId, QoS> = HashMap::new();
        for (filter, subscribers) in &self.subscriptions {
            if !topic_matches(filter, message.topic()) {
                continue;
            }
            for (id, granted) in subscribers {
                let entry = targets.entry(*id).or_insert(*granted);
                *entry = (*entry).max(*granted);
            }
        }

        let mut dispatch = Dispatch {
            matched: targets.len(),
            ..Dispatch::default()
        };

        for (id, granted) in targets {
            let Some(entry) = self.connections.get(&id) else {
                dispatch.failed += 1;
                continue;
            };
            let copy = message
                .clone()
                .with_qos(message.qos().min(granted))
                .with_retain(false);
            match entry.outbound.try_send(Frame::publish(copy)) {
                Ok(()) => dispatch.delivered += 1,
                Err(e) => {
                    warn!(
                        "Delivery to {} on {} failed: {}",
                        entry.client_id,
                        message.topic(),
                        e
                    );
                    dispatch.failed += 1;
                }
            }
        }

        dispatch
    }

    fn update_retained(&mut self, message: &ApplicationMessage) {
        if message.is_empty() {
            if self.retained.remove(message.topic()).is_some() {
                debug!("Cleared retained message on {}", message.topic());
            }
        } else {
            debug!("Retaining message on {}", message.topic());
            self.retained
                .insert(message.topic().to_string(), message.clone());
        }
    }
}

#[derive(Debug, Default)]
pub struct TopicRegistry {
    state: RwLock<RegistryState>,
    next_id: AtomicU64,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Registers a connection in `Connected` state, applying the duplicate-id policy
    ///
    /// A clean session discards any stored session; a persistent one restores the
    /// stored subscriptions.
    pub async fn register(
        &self,
        entry: ConnectionEntry,
        policy: DuplicateClientPolicy,
    ) -> Result<Registration, RegistryError> {
        let mut state = self.state.write().await;

        let mut evicted = None;
        if let Some(existing) = state.client_ids.get(&entry.client_id).copied() {
            match policy {
                DuplicateClientPolicy::RejectNew => {
                    return Err(RegistryError::DuplicateClientId(entry.client_id));
                }
                DuplicateClientPolicy::EvictExisting => {
                    if let Some(old) = state.detach(existing) {
                        info!(
                            "Evicting connection {} of {} in favour of a new session",
                            old.id, old.client_id
                        );
                        old.cancel.cancel();
                        evicted = Some(old.id);
                    }
                }
            }
        }

        let mut session_present = false;
        if entry.clean_session {
            state.sessions.remove(&entry.client_id);
        } else if let Some(stored) = state.sessions.remove(&entry.client_id) {
            debug!(
                "Restoring {} subscriptions for {}",
                stored.len(),
                entry.client_id
            );
            for (filter, qos) in stored {
                state.insert_subscription(entry.id, &filter, qos);
            }
            session_present = true;
        }

        state.client_ids.insert(entry.client_id.clone(), entry.id);
        state.connections.insert(entry.id, entry);

        Ok(Registration {
            session_present,
            evicted,
        })
    }

    /// Removes a connection and all of its subscriptions
    ///
    /// Returns false if the connection was already gone (e.g. evicted).
    pub async fn remove_connection(&self, id: ConnectionId) -> bool {
        self.state.write().await.detach(id).is_some()
    }

    /// Adds a subscription and replays matching retained messages into the
    /// subscriber's queue before any later publish can reach it
    ///
    /// Returns the number of retained messages replayed.
    pub async fn subscribe(
        &self,
        id: ConnectionId,
        filter: &str,
        qos: QoS,
    ) -> Result<usize, RegistryError> {
        self.subscribe_with_ack(id, filter, qos, None).await
    }

    /// Like [`subscribe`](Self::subscribe), queueing `ack` ahead of the retained replay
    pub async fn subscribe_with_ack(
        &self,
        id: ConnectionId,
        filter: &str,
        qos: QoS,
        ack: Option<Frame>,
    ) -> Result<usize, RegistryError> {
        validate_topic_filter(filter)?;
        let mut state = self.state.write().await;

        let outbound = state
            .connections
            .get(&id)
            .map(|entry| entry.outbound.clone())
            .ok_or(RegistryError::UnknownConnection(id))?;

        state.insert_subscription(id, filter, qos);

        if let Some(ack) = ack {
            if let Err(e) = outbound.try_send(ack) {
                warn!("Could not queue subscription ack for {}: {}", filter, e);
            }
        }

        let mut replayed = 0;
        for retained in state.retained.values() {
            if !topic_matches(filter, retained.topic()) {
                continue;
            }
            let copy = retained
                .clone()
                .with_qos(retained.qos().min(qos))
                .with_retain(true);
            match outbound.try_send(Frame::publish(copy)) {
                Ok(()) => replayed += 1,
                Err(e) => warn!("Retained replay on {} failed: {}", retained.topic(), e),
            }
        }

        Ok(replayed)
    }

    pub async fn unsubscribe(&self, id: ConnectionId, filter: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(subscribers) = state.subscriptions.get_mut(filter) else {
            return false;
        };
        let removed = subscribers.remove(&id).is_some();
        if subscribers.is_empty() {
            state.subscriptions.remove(filter);
        }
        removed
    }

    /// Updates the retained store if needed and fans the message out
    pub async fn dispatch(&self, message: &ApplicationMessage) -> Dispatch {
        if message.retain() {
            let mut state = self.state.write().await;
            state.update_retained(message);
            state.fan_out(message)
        } else {
            self.state.read().await.fan_out(message)
        }
    }

    pub async fn is_connected(&self, client_id: &str) -> bool {
        self.state.read().await.client_ids.contains_key(client_id)
    }

    pub async fn connection_id(&self, client_id: &str) -> Option<ConnectionId> {
        self.state.read().await.client_ids.get(client_id).copied()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    /// Filters held by a connected client, sorted
    pub async fn subscriptions_of(&self, client_id: &str) -> Vec<String> {
        let state = self.state.read().await;
        let Some(id) = state.client_ids.get(client_id) else {
            return Vec::new();
        };
        let mut filters: Vec<String> = state
            .subscriptions
            .iter()
            .filter(|(_, subscribers)| subscribers.contains_key(id))
            .map(|(filter, _)| filter.clone())
            .collect();
        filters.sort();
        filters
    }

    pub async fn subscriber_count(&self, filter: &str) -> usize {
        self.state
            .read()
            .await
            .subscriptions
            .get(filter)
            .map_or(0, HashMap::len)
    }

    pub async fn retained(&self, topic: &str) -> Option<ApplicationMessage> {
        self.state.read().await.retained.get(topic).cloned()
    }

    pub async fn has_stored_session(&self, client_id: &str) -> bool {
        self.state.read().await.sessions.contains_key(client_id)
    }
}
