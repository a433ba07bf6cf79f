//! Connection validation hook
//!
//! Every connection attempt is run through a [`ConnectionValidator`] before it is
//! registered. Validators are plain strategy objects: any
//! `Fn(&ValidationContext) -> ValidationOutcome` qualifies.

use std::collections::HashSet;
use std::fmt;

/// Handshake data presented to the validator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationContext {
    pub client_id: String,
    pub endpoint: String,
    pub clean_session: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Accept,
    Reject(String),
}

impl ValidationOutcome {
    pub fn reject(reason: impl Into<String>) -> Self {
        ValidationOutcome::Reject(reason.into())
    }
}

pub trait ConnectionValidator: Send + Sync + 'static {
    fn validate(&self, context: &ValidationContext) -> ValidationOutcome;
}

impl<F> ConnectionValidator for F
where
    F: Fn(&ValidationContext) -> ValidationOutcome + Send + Sync + 'static,
{
    fn validate(&self, context: &ValidationContext) -> ValidationOutcome {
        self(context)
    }
}

/// Accepts every connection
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl ConnectionValidator for AcceptAll {
    fn validate(&self, _context: &ValidationContext) -> ValidationOutcome {
        ValidationOutcome::Accept
    }
}

/// Rejects a fixed set of client ids
#[derive(Debug, Default, Clone)]
pub struct DenyList {
    blocked: HashSet<String>,
}

impl DenyList {
    pub fn new<I, S>(blocked: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            blocked: blocked.into_iter().map(Into::into).collect(),
        }
    }
}

impl ConnectionValidator for DenyList {
    fn validate(&self, context: &ValidationContext) -> ValidationOutcome {
        if self.blocked.contains(&context.client_id) {
            ValidationOutcome::reject(format!("client id '{}' is blocked", context.client_id))
        } else {
            ValidationOutcome::Accept
        }
    }
}

impl fmt::Display for ValidationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ClientId = {}, Endpoint = {}, CleanSession = {}",
            self.client_id, self.endpoint, self.clean_session
        )
    }
}
