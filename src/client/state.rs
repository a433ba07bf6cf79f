//! Reconnect state machine of the managed session
//!
//! Pure bookkeeping: the session task feeds it [`SessionEvent`]s and acts on the
//! resulting phase, delay and notification. Nothing here touches a transport, so
//! every transition can be driven by synthetic events.
//!
//! ```text
//!               Start
//! Disconnected ───────► Connecting ──HandshakeSucceeded──► Connected
//!       ▲                 │    ▲                              │
//!       │ (attempts       │    │ DelayElapsed                 │ TransportLost
//!       │  exhausted)     ▼    │                              │
//!       └──────────── ReconnectPending ◄──────────────────────┘
//!                      HandshakeFailed
//! ```

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid transition: {event:?} in phase {from}")]
    InvalidStateTransition {
        from: SessionPhase,
        event: SessionEvent,
    },

    #[error("Gave up after {attempts} failed connection attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Publish queue is full ({capacity} messages)")]
    QueueFull { capacity: usize },

    #[error("Session is shut down")]
    ShutDown,

    #[error("Connection refused by broker: {0}")]
    Refused(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    ReconnectPending,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Disconnected => "Disconnected",
            SessionPhase::Connecting => "Connecting",
            SessionPhase::Connected => "Connected",
            SessionPhase::ReconnectPending => "ReconnectPending",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Start,
    HandshakeSucceeded,
    HandshakeFailed,
    TransportLost,
    DelayElapsed,
}

/// Reported to the outside world on the matching transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionNotification {
    Connected,
    /// `retrying` is false on the attempt that exhausts the policy
    ConnectingFailed { attempt: u32, retrying: bool },
    Disconnected,
}

/// Floor for the reconnect delay; a zero delay would spin on an unreachable broker
pub const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    /// Enables doubling of the delay after each failure, capped at this value
    pub max_delay: Option<Duration>,
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(60),
            max_delay: None,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn backoff(&self, current: Duration) -> Duration {
        match self.max_delay {
            Some(max) => current.saturating_mul(2).min(max.max(self.delay)),
            None => self.delay,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionState {
    phase: SessionPhase,
    policy: ReconnectPolicy,
    /// Wait before the next attempt, valid while `ReconnectPending`
    current_delay: Duration,
    next_delay: Duration,
    /// Consecutive failed handshakes
    attempts: u32,
}

impl SessionState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let policy = ReconnectPolicy {
            delay: policy.delay.max(MIN_RECONNECT_DELAY),
            ..policy
        };
        Self {
            phase: SessionPhase::Disconnected,
            policy,
            current_delay: policy.delay,
            next_delay: policy.delay,
            attempts: 0,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn failed_attempts(&self) -> u32 {
        self.attempts
    }

    /// True once the configured maximum of consecutive failures is reached
    pub fn exhausted(&self) -> bool {
        self.policy.max_attempts.map_or(false, |max| self.attempts >= max)
    }

    pub fn apply(&mut self, event: SessionEvent) -> Result<Option<SessionNotification>, SessionError> {
        use SessionEvent::*;
        use SessionPhase::*;

        match (self.phase, event) {
            (Disconnected, Start) => {
                self.phase = Connecting;
                Ok(None)
            }
            (Connecting, HandshakeSucceeded) => {
                self.phase = Connected;
                self.attempts = 0;
                self.next_delay = self.policy.delay;
                Ok(Some(SessionNotification::Connected))
            }
            (Connecting, HandshakeFailed) => {
                self.attempts += 1;
                let retrying = !self.exhausted();
                if retrying {
                    self.enter_pending();
                } else {
                    self.phase = Disconnected;
                }
                Ok(Some(SessionNotification::ConnectingFailed {
                    attempt: self.attempts,
                    retrying,
                }))
            }
            (Connected, TransportLost) => {
                self.enter_pending();
                Ok(Some(SessionNotification::Disconnected))
            }
            (ReconnectPending, DelayElapsed) => {
                self.phase = Connecting;
                Ok(None)
            }
            (from, event) => Err(SessionError::InvalidStateTransition { from, event }),
        }
    }

    /// Explicit shutdown; valid from every phase
    pub fn stop(&mut self) {
        self.phase = SessionPhase::Disconnected;
    }

    fn enter_pending(&mut self) {
        self.phase = SessionPhase::ReconnectPending;
        self.current_delay = self.next_delay;
        self.next_delay = self.policy.backoff(self.next_delay);
    }
}
