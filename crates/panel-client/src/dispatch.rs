//! Retry policy shared by login and every authenticated call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::ConfigurationError;
use crate::gateway::ApiError;
use crate::transport::{PanelTransport, TransportError};
use crate::InstanceId;

/// Process-wide "have we ever logged in successfully" flag.
///
/// Until it flips, a network failure means the panel url is wrong and is fatal.
/// Afterwards the same failure is treated as an outage and retried.
#[derive(Clone, Default)]
pub struct ConnectionLatch {
    connected: Arc<AtomicBool>,
}

impl ConnectionLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Returns true only for the call that performed the transition.
    pub fn mark_connected(&self) -> bool {
        !self.connected.swap(true, Ordering::AcqRel)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub network_backoff: Duration,
    pub empty_body_backoff: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            network_backoff: Duration::from_secs(30),
            empty_body_backoff: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn PanelTransport>,
    latch: ConnectionLatch,
    policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn PanelTransport>,
        latch: ConnectionLatch,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            latch,
            policy,
        }
    }

    pub fn latch(&self) -> &ConnectionLatch {
        &self.latch
    }

    /// Sends one request and decodes its JSON body, sleeping through network
    /// outages and empty replies. Payload semantics are left to the caller.
    pub async fn send(
        &self,
        instance: &InstanceId,
        endpoint: &str,
        body: &Value,
    ) -> Result<Value, ApiError> {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match self.transport.post(instance, endpoint, body.clone()).await {
                Err(TransportError::Network { reason, .. }) => {
                    if !self.latch.has_connected() {
                        return Err(ApiError::Configuration(ConfigurationError::Unreachable {
                            url: self.transport.describe(),
                            reason,
                        }));
                    }
                    self.check_budget(endpoint, attempts, &reason)?;
                    warn!(
                        instance = %instance,
                        endpoint,
                        error = %reason,
                        backoff_secs = self.policy.network_backoff.as_secs(),
                        "panel unreachable; retrying"
                    );
                    tokio::time::sleep(self.policy.network_backoff).await;
                }
                Ok(raw) if raw.is_empty() => {
                    self.check_budget(endpoint, attempts, "empty response body")?;
                    debug!(
                        instance = %instance,
                        endpoint,
                        status = raw.status,
                        "panel returned an empty body; retrying"
                    );
                    tokio::time::sleep(self.policy.empty_body_backoff).await;
                }
                Ok(raw) => {
                    if attempts > 1 {
                        info!(instance = %instance, endpoint, attempts, "panel call recovered");
                    }
                    return serde_json::from_str(&raw.body).map_err(|err| ApiError::Malformed {
                        endpoint: endpoint.to_string(),
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    fn check_budget(&self, endpoint: &str, attempts: u32, reason: &str) -> Result<(), ApiError> {
        match self.policy.max_attempts {
            Some(max) if attempts >= max => Err(ApiError::Transient {
                endpoint: endpoint.to_string(),
                attempts,
                reason: reason.to_string(),
            }),
            _ => Ok(()),
        }
    }
}
