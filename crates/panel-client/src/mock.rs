//! In-memory panel for tests and local wiring.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::session::LOGIN_ENDPOINT;
use crate::transport::{PanelTransport, RawResponse, TransportError};
use crate::InstanceId;

#[derive(Debug, Clone)]
pub enum MockReply {
    Json(Value),
    Empty,
    NetworkError(String),
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub instance: InstanceId,
    pub endpoint: String,
    pub body: Value,
}

/// Scripted panel.
///
/// Lookup order for a call: one-shot replies queued for that instance and
/// endpoint, then one-shot replies for the endpoint, then sticky per-instance
/// replies, then sticky endpoint replies. Logins succeed by default with a token
/// of `session-<instance>`; anything unscripted answers `{"result": null}`.
#[derive(Default)]
pub struct MockTransport {
    queued: Mutex<HashMap<(Option<InstanceId>, String), VecDeque<MockReply>>>,
    sticky: Mutex<HashMap<(Option<InstanceId>, String), MockReply>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, endpoint: &str, reply: Value) {
        self.sticky
            .lock()
            .insert((None, endpoint.to_string()), MockReply::Json(reply));
    }

    pub fn respond_for(&self, instance: &InstanceId, endpoint: &str, reply: Value) {
        self.sticky.lock().insert(
            (Some(instance.clone()), endpoint.to_string()),
            MockReply::Json(reply),
        );
    }

    pub fn push(&self, endpoint: &str, reply: MockReply) {
        self.queued
            .lock()
            .entry((None, endpoint.to_string()))
            .or_default()
            .push_back(reply);
    }

    pub fn push_for(&self, instance: &InstanceId, endpoint: &str, reply: MockReply) {
        self.queued
            .lock()
            .entry((Some(instance.clone()), endpoint.to_string()))
            .or_default()
            .push_back(reply);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, endpoint: &str) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.endpoint == endpoint)
            .cloned()
            .collect()
    }

    pub fn calls_for(&self, instance: &InstanceId, endpoint: &str) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| &call.instance == instance && call.endpoint == endpoint)
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn next_reply(&self, instance: &InstanceId, endpoint: &str) -> MockReply {
        let scoped = (Some(instance.clone()), endpoint.to_string());
        let global = (None, endpoint.to_string());
        {
            let mut queued = self.queued.lock();
            for key in [&scoped, &global] {
                if let Some(reply) = queued.get_mut(key).and_then(VecDeque::pop_front) {
                    return reply;
                }
            }
        }
        {
            let sticky = self.sticky.lock();
            for key in [&scoped, &global] {
                if let Some(reply) = sticky.get(key) {
                    return reply.clone();
                }
            }
        }
        if endpoint == LOGIN_ENDPOINT {
            return MockReply::Json(json!({
                "success": true,
                "sessionID": format!("session-{instance}"),
                "userInfo": {"ID": "user-1"},
            }));
        }
        MockReply::Json(json!({"result": null}))
    }
}

#[async_trait]
impl PanelTransport for MockTransport {
    async fn post(
        &self,
        instance: &InstanceId,
        endpoint: &str,
        body: Value,
    ) -> Result<RawResponse, TransportError> {
        self.calls.lock().push(RecordedCall {
            instance: instance.clone(),
            endpoint: endpoint.to_string(),
            body,
        });
        match self.next_reply(instance, endpoint) {
            MockReply::Json(value) => Ok(RawResponse::ok(value.to_string())),
            MockReply::Empty => Ok(RawResponse::ok("")),
            MockReply::NetworkError(reason) => Err(TransportError::Network {
                endpoint: endpoint.to_string(),
                reason,
            }),
        }
    }

    fn describe(&self) -> String {
        "mock://panel".to_string()
    }
}
