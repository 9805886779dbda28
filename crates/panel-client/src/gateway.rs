use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::error::ConfigurationError;
use crate::session::{AuthError, InstanceSession, SessionManager};
use crate::InstanceId;

const SESSION_FIELD: &str = "SESSIONID";
const UNAUTHORIZED_TITLE: &str = "Unauthorized Access";

#[derive(Debug, Error)]
pub enum ApiError {
    /// The panel rejected the session. The cached token has already been dropped.
    #[error("unauthorized calling {endpoint} on {instance}")]
    Unauthorized { instance: InstanceId, endpoint: String },
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("{endpoint} kept failing after {attempts} attempts: {reason}")]
    Transient {
        endpoint: String,
        attempts: u32,
        reason: String,
    },
    #[error("malformed reply from {endpoint}: {reason}")]
    Malformed { endpoint: String, reason: String },
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

impl ApiError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ApiError::Configuration(_) | ApiError::Auth(AuthError::Configuration(_))
        )
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, ApiError::Auth(AuthError::InstanceOffline { .. }))
    }
}

/// Single choke point for authenticated panel calls.
#[derive(Clone)]
pub struct ApiGateway {
    sessions: SessionManager,
}

impl ApiGateway {
    pub fn new(sessions: SessionManager) -> Self {
        Self { sessions }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Logs in if needed, injects the session id, and returns the decoded reply
    /// untouched unless the panel flagged the session as unauthorized.
    pub async fn call(
        &self,
        instance: &InstanceSession,
        endpoint: &str,
        params: Value,
    ) -> Result<Value, ApiError> {
        let session = self.sessions.ensure_logged_in(instance).await?;
        let mut body = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other);
                map
            }
        };
        body.insert(SESSION_FIELD.into(), Value::String(session.token));
        let body = Value::Object(body);

        let reply = self
            .sessions
            .dispatcher()
            .send(instance.id(), endpoint, &body)
            .await?;
        if is_unauthorized(&reply) {
            instance.invalidate();
            debug!(instance = %instance.id(), endpoint, "panel rejected session");
            return Err(ApiError::Unauthorized {
                instance: instance.id().clone(),
                endpoint: endpoint.to_string(),
            });
        }
        Ok(reply)
    }
}

pub fn is_unauthorized(reply: &Value) -> bool {
    reply
        .get("Title")
        .and_then(Value::as_str)
        .map(|title| title == UNAUTHORIZED_TITLE)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{ConnectionLatch, Dispatcher, RetryPolicy};
    use crate::mock::{MockReply, MockTransport};
    use crate::session::Credentials;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn gateway(mock: Arc<MockTransport>, policy: RetryPolicy) -> ApiGateway {
        let latch = ConnectionLatch::new();
        let dispatcher = Dispatcher::new(mock, latch, policy);
        ApiGateway::new(SessionManager::new(
            dispatcher,
            Credentials {
                username: "warden".into(),
                password: "hunter2".into(),
                otp: None,
            },
        ))
    }

    #[tokio::test]
    async fn injects_session_id() {
        let mock = Arc::new(MockTransport::new());
        mock.respond("Core/GetStatus", json!({"result": {"State": 20}}));
        let gw = gateway(mock.clone(), RetryPolicy::default());
        let slot = InstanceSession::new(InstanceId::new("a"), true);

        let reply = gw.call(&slot, "Core/GetStatus", json!({})).await.unwrap();
        assert_eq!(reply["result"]["State"], 20);
        let calls = mock.calls_to("Core/GetStatus");
        assert_eq!(calls[0].body["SESSIONID"], "session-a");
    }

    #[tokio::test]
    async fn unauthorized_reply_drops_token_and_surfaces() {
        let mock = Arc::new(MockTransport::new());
        mock.push(
            "Core/GetUpdates",
            MockReply::Json(json!({"Title": "Unauthorized Access", "Message": "expired"})),
        );
        mock.respond("Core/GetUpdates", json!({"result": {"ConsoleEntries": []}}));
        let gw = gateway(mock.clone(), RetryPolicy::default());
        let slot = InstanceSession::new(InstanceId::new("a"), true);

        let err = gw.call(&slot, "Core/GetUpdates", json!({})).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized { .. }));
        assert!(!slot.is_logged_in());

        gw.call(&slot, "Core/GetUpdates", json!({})).await.expect("relogin");
        assert_eq!(mock.calls_to("Core/Login").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_bodies_are_retried_after_backoff() {
        let mock = Arc::new(MockTransport::new());
        mock.push("Core/GetStatus", MockReply::Empty);
        mock.push("Core/GetStatus", MockReply::Empty);
        mock.respond("Core/GetStatus", json!({"result": {"State": 0}}));
        let gw = gateway(mock.clone(), RetryPolicy::default());
        let slot = InstanceSession::new(InstanceId::new("a"), true);

        let started = tokio::time::Instant::now();
        gw.call(&slot, "Core/GetStatus", json!({})).await.unwrap();
        assert_eq!(mock.calls_to("Core/GetStatus").len(), 3);
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_ceiling_turns_into_transient_error() {
        let mock = Arc::new(MockTransport::new());
        for _ in 0..3 {
            mock.push("Core/GetStatus", MockReply::Empty);
        }
        let policy = RetryPolicy {
            max_attempts: Some(2),
            ..RetryPolicy::default()
        };
        let gw = gateway(mock, policy);
        let slot = InstanceSession::new(InstanceId::new("a"), true);

        let err = gw.call(&slot, "Core/GetStatus", json!({})).await.unwrap_err();
        assert!(matches!(err, ApiError::Transient { attempts: 2, .. }));
    }

    #[test]
    fn recognises_unauthorized_sentinel() {
        assert!(is_unauthorized(&json!({"Title": "Unauthorized Access"})));
        assert!(!is_unauthorized(&json!({"Title": "Something else"})));
        assert!(!is_unauthorized(&json!(true)));
    }
}
