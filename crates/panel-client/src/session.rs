//! Per-instance login and session-token caching.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::ConfigurationError;
use crate::gateway::ApiError;
use crate::models::LoginReply;
use crate::otp::OtpSecret;
use crate::InstanceId;

pub const LOGIN_ENDPOINT: &str = "Core/Login";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub instance_id: InstanceId,
    pub token: String,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    /// Login failed in a way consistent with the instance simply being stopped.
    #[error("instance {instance} is offline: {reason}")]
    InstanceOffline { instance: InstanceId, reason: String },
    #[error("login for {instance} gave up: {reason}")]
    Transient { instance: InstanceId, reason: String },
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub otp: Option<OtpSecret>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("otp", &self.otp.is_some())
            .finish_non_exhaustive()
    }
}

/// Session slot owned by one instance.
///
/// Only the session manager writes the token; everyone else reads it. An
/// unauthorized reply clears it so the next call logs in again.
pub struct InstanceSession {
    id: InstanceId,
    token: RwLock<Option<Session>>,
    running: AtomicBool,
    login_gate: Mutex<()>,
}

impl InstanceSession {
    pub fn new(id: InstanceId, running: bool) -> Self {
        Self {
            id,
            token: RwLock::new(None),
            running: AtomicBool::new(running),
            login_gate: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn current(&self) -> Option<Session> {
        self.token.read().clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.token.read().is_some()
    }

    pub fn invalidate(&self) {
        if self.token.write().take().is_some() {
            debug!(instance = %self.id, "session token invalidated");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    fn store(&self, session: Session) {
        *self.token.write() = Some(session);
    }
}

#[derive(Clone)]
pub struct SessionManager {
    dispatcher: Dispatcher,
    credentials: Credentials,
}

impl SessionManager {
    pub fn new(dispatcher: Dispatcher, credentials: Credentials) -> Self {
        Self {
            dispatcher,
            credentials,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn username(&self) -> &str {
        &self.credentials.username
    }

    /// Returns the cached session or logs in. No validation round-trip is made for
    /// a cached token; the next call's reply decides whether it is still good.
    pub async fn ensure_logged_in(&self, instance: &InstanceSession) -> Result<Session, AuthError> {
        if let Some(session) = instance.current() {
            return Ok(session);
        }
        let _gate = instance.login_gate.lock().await;
        if let Some(session) = instance.current() {
            return Ok(session);
        }

        let otp = self
            .credentials
            .otp
            .as_ref()
            .map(OtpSecret::current_code)
            .unwrap_or_default();
        let body = json!({
            "username": self.credentials.username,
            "password": self.credentials.password,
            "token": otp,
            "rememberMe": false,
        });

        let reply = match self.dispatcher.send(instance.id(), LOGIN_ENDPOINT, &body).await {
            Ok(value) => value,
            Err(ApiError::Configuration(err)) => return Err(AuthError::Configuration(err)),
            Err(ApiError::Transient { reason, .. }) => {
                return Err(AuthError::Transient {
                    instance: instance.id().clone(),
                    reason,
                })
            }
            Err(err) => return Err(self.offline(instance, err.to_string())),
        };

        let login = LoginReply::from_value(&reply);
        match login.session_id() {
            Some(token) => {
                let session = Session {
                    instance_id: instance.id().clone(),
                    token: token.to_string(),
                    issued_at: Utc::now(),
                };
                instance.store(session.clone());
                instance.set_running(true);
                if self.dispatcher.latch().mark_connected() {
                    info!(instance = %instance.id(), "first successful panel login");
                } else {
                    debug!(instance = %instance.id(), "logged in");
                }
                Ok(session)
            }
            None => {
                let reason = login
                    .failure_reason()
                    .unwrap_or_else(|| "login reply carried no session id".to_string());
                Err(self.offline(instance, reason))
            }
        }
    }

    fn offline(&self, instance: &InstanceSession, reason: String) -> AuthError {
        if instance.is_running() {
            warn!(
                instance = %instance.id(),
                reason = %reason,
                "login failed; marking instance offline"
            );
        }
        instance.set_running(false);
        AuthError::InstanceOffline {
            instance: instance.id().clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{ConnectionLatch, RetryPolicy};
    use crate::mock::{MockReply, MockTransport};
    use std::sync::Arc;

    fn manager(mock: Arc<MockTransport>, latch: ConnectionLatch) -> SessionManager {
        let dispatcher = Dispatcher::new(mock, latch, RetryPolicy::default());
        SessionManager::new(
            dispatcher,
            Credentials {
                username: "warden".into(),
                password: "hunter2".into(),
                otp: None,
            },
        )
    }

    #[tokio::test]
    async fn caches_token_after_first_login() {
        let mock = Arc::new(MockTransport::new());
        let latch = ConnectionLatch::new();
        let sessions = manager(mock.clone(), latch.clone());
        let slot = InstanceSession::new(InstanceId::core(), true);

        let first = sessions.ensure_logged_in(&slot).await.expect("login");
        let second = sessions.ensure_logged_in(&slot).await.expect("cached");
        assert_eq!(first, second);
        assert_eq!(mock.calls_to(LOGIN_ENDPOINT).len(), 1);
        assert!(latch.has_connected());
    }

    #[tokio::test]
    async fn missing_session_id_marks_instance_offline() {
        let mock = Arc::new(MockTransport::new());
        let id = InstanceId::new("inst-1");
        mock.respond_for(
            &id,
            LOGIN_ENDPOINT,
            json!({"success": false, "resultReason": "Instance not running"}),
        );
        let sessions = manager(mock, ConnectionLatch::new());
        let slot = InstanceSession::new(id, true);

        let err = sessions.ensure_logged_in(&slot).await.unwrap_err();
        assert!(matches!(err, AuthError::InstanceOffline { .. }));
        assert!(!slot.is_running());
        assert!(!slot.is_logged_in());
    }

    #[tokio::test]
    async fn network_failure_before_first_login_is_fatal() {
        let mock = Arc::new(MockTransport::new());
        mock.push(LOGIN_ENDPOINT, MockReply::NetworkError("connection refused".into()));
        let sessions = manager(mock, ConnectionLatch::new());
        let slot = InstanceSession::new(InstanceId::core(), true);

        let err = sessions.ensure_logged_in(&slot).await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::Configuration(ConfigurationError::Unreachable { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn network_failure_after_first_login_is_retried() {
        let mock = Arc::new(MockTransport::new());
        mock.push(LOGIN_ENDPOINT, MockReply::NetworkError("timed out".into()));
        let latch = ConnectionLatch::new();
        latch.mark_connected();
        let sessions = manager(mock.clone(), latch);
        let slot = InstanceSession::new(InstanceId::new("inst-2"), true);

        sessions.ensure_logged_in(&slot).await.expect("recovered login");
        assert_eq!(mock.calls_to(LOGIN_ENDPOINT).len(), 2);
    }

    #[tokio::test]
    async fn sends_one_time_password_when_configured() {
        let mock = Arc::new(MockTransport::new());
        let dispatcher =
            Dispatcher::new(mock.clone(), ConnectionLatch::new(), RetryPolicy::default());
        let sessions = SessionManager::new(
            dispatcher,
            Credentials {
                username: "warden".into(),
                password: "hunter2".into(),
                otp: Some(OtpSecret::parse("GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ").unwrap()),
            },
        );
        let slot = InstanceSession::new(InstanceId::core(), true);
        sessions.ensure_logged_in(&slot).await.expect("login");

        let calls = mock.calls_to(LOGIN_ENDPOINT);
        let token = calls[0].body["token"].as_str().unwrap();
        assert_eq!(token.len(), 6);
        assert!(token.chars().all(|c| c.is_ascii_digit()));
    }
}
