//! Pending-publish queue shared by `publish` callers and the drain task

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::warn;

use super::state::SessionError;
use crate::protocol::ApplicationMessage;

/// What `push` does when a bounded queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    #[default]
    RejectNewest,
    DropOldest,
}

#[derive(Debug)]
struct Inner {
    messages: Mutex<VecDeque<ApplicationMessage>>,
    available: Notify,
    max_len: Option<usize>,
    policy: OverflowPolicy,
}

/// FIFO of messages awaiting transmission
///
/// Survives reconnects; only [`PublishQueue::clear`] empties it.
#[derive(Debug, Clone)]
pub struct PublishQueue {
    inner: Arc<Inner>,
}

impl Default for PublishQueue {
    fn default() -> Self {
        Self::new(None, OverflowPolicy::default())
    }
}

impl PublishQueue {
    pub fn new(max_len: Option<usize>, policy: OverflowPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                messages: Mutex::new(VecDeque::new()),
                available: Notify::new(),
                max_len: max_len.map(|len| len.max(1)),
                policy,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ApplicationMessage>> {
        // the deque stays consistent even if a holder panicked
        self.inner
            .messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends at the tail, applying the overflow policy when bounded
    pub fn push(&self, message: ApplicationMessage) -> Result<(), SessionError> {
        {
            let mut messages = self.lock();
            if let Some(capacity) = self.inner.max_len {
                if messages.len() >= capacity {
                    match self.inner.policy {
                        OverflowPolicy::RejectNewest => {
                            return Err(SessionError::QueueFull { capacity })
                        }
                        OverflowPolicy::DropOldest => {
                            if let Some(dropped) = messages.pop_front() {
                                warn!(
                                    "Publish queue full, dropped oldest message on {}",
                                    dropped.topic()
                                );
                            }
                        }
                    }
                }
            }
            messages.push_back(message);
        }
        self.inner.available.notify_one();
        Ok(())
    }

    /// Puts a message whose write failed back at the head
    pub fn push_front(&self, message: ApplicationMessage) {
        self.lock().push_front(message);
        self.inner.available.notify_one();
    }

    pub fn pop(&self) -> Option<ApplicationMessage> {
        self.lock().pop_front()
    }

    /// Waits for the next message; meant for a single consumer
    pub async fn next(&self) -> ApplicationMessage {
        loop {
            if let Some(message) = self.pop() {
                return message;
            }
            self.inner.available.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Empties the queue, returning how many messages were discarded
    pub fn clear(&self) -> usize {
        let mut messages = self.lock();
        let count = messages.len();
        messages.clear();
        count
    }
}
