//! Managed publishing client
//!
//! [`ManagedSession`] keeps one auto-reconnecting connection to a broker and
//! accepts publishes at any time; [`PublishScheduler`] feeds it on a fixed period.
//!
//! ```text
//! PublishScheduler ──► SessionPublisher ──► PublishQueue ──► drain task ──► broker
//!                                                                ▲
//!                                             supervisor task ───┘ (SessionState)
//! ```

pub mod queue;
pub mod scheduler;
pub mod session;
pub mod state;

pub use queue::{OverflowPolicy, PublishQueue};
pub use scheduler::{demo_payload, PublishScheduler, SchedulerHandle};
pub use session::{ManagedSession, SessionOptions, SessionPublisher};
pub use state::{
    ReconnectPolicy, SessionError, SessionEvent, SessionNotification, SessionPhase, SessionState,
};
