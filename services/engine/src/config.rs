//! Explicit runtime context
//!
//! Everything a builder or the scheduler needs from the environment is passed
//! in through these types; nothing reads process-wide state.

use std::time::Duration;

use crate::topology::credentials::CredentialKind;
use crate::topology::ids::SubscriptionId;

/// Target subscription for every declared resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AzureContext {
    pub subscription: SubscriptionId,
}

impl AzureContext {
    pub fn new(subscription: SubscriptionId) -> Self {
        Self { subscription }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            subscription: SubscriptionId::parse("00000000-0000-0000-0000-000000000001").unwrap(),
        }
    }
}

/// Scheduler and polling settings
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Maximum number of provisioning calls in flight
    pub parallelism: usize,
    pub poll_interval: Duration,
    /// How long to wait for a long-running operation before reporting it pending
    pub operation_timeout: Duration,
    pub credential_kind: CredentialKind,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            parallelism: 8,
            poll_interval: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(30 * 60),
            credential_kind: CredentialKind::Admin,
        }
    }
}
