use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::error::ConfigurationError;
use crate::InstanceId;

/// Body and status of one panel reply, before any interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

impl RawResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.body.trim().is_empty()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Connection refused, DNS failure, timeout or a body that could not be read.
    #[error("network failure calling {endpoint}: {reason}")]
    Network { endpoint: String, reason: String },
}

/// The seam between the engine and the wire.
///
/// Production uses [`HttpTransport`]; tests script replies with
/// [`crate::MockTransport`].
#[async_trait]
pub trait PanelTransport: Send + Sync {
    async fn post(
        &self,
        instance: &InstanceId,
        endpoint: &str,
        body: Value,
    ) -> Result<RawResponse, TransportError>;

    /// Human readable location used in fatal error messages.
    fn describe(&self) -> String;
}

#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
    base_url: Url,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ConfigurationError> {
        let base_url = parse_base_url(base_url)?;
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ConfigurationError::InvalidBaseUrl {
                url: base_url.to_string(),
                reason: err.to_string(),
            })?;
        Ok(Self { http, base_url })
    }

    /// Core calls go straight to the panel; instance calls go through its proxy route.
    pub fn endpoint_url(&self, instance: &InstanceId, endpoint: &str) -> String {
        let base = self.base_url.as_str().trim_end_matches('/');
        if instance.is_core() {
            format!("{base}/API/{endpoint}")
        } else {
            format!("{base}/API/ADSModule/Servers/{instance}/API/{endpoint}")
        }
    }
}

#[async_trait]
impl PanelTransport for HttpTransport {
    async fn post(
        &self,
        instance: &InstanceId,
        endpoint: &str,
        body: Value,
    ) -> Result<RawResponse, TransportError> {
        let url = self.endpoint_url(instance, endpoint);
        let network = |err: reqwest::Error| TransportError::Network {
            endpoint: endpoint.to_string(),
            reason: err.to_string(),
        };
        let res = self
            .http
            .post(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(network)?;
        let status = res.status().as_u16();
        let body = res.text().await.map_err(network)?;
        Ok(RawResponse { status, body })
    }

    fn describe(&self) -> String {
        self.base_url.to_string()
    }
}

/// Validates the configured panel url once, at startup.
pub fn parse_base_url(raw: &str) -> Result<Url, ConfigurationError> {
    let invalid = |reason: String| ConfigurationError::InvalidBaseUrl {
        url: raw.to_string(),
        reason,
    };
    let url = Url::parse(raw.trim()).map_err(|err| invalid(err.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(invalid(format!("unsupported scheme {other}"))),
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".into()));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_core_and_instance_calls() {
        let transport =
            HttpTransport::new("https://panel.example.net/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            transport.endpoint_url(&InstanceId::core(), "Core/Login"),
            "https://panel.example.net/API/Core/Login"
        );
        assert_eq!(
            transport.endpoint_url(&InstanceId::new("a1b2"), "Core/GetUpdates"),
            "https://panel.example.net/API/ADSModule/Servers/a1b2/API/Core/GetUpdates"
        );
    }

    #[test]
    fn rejects_bad_base_urls() {
        assert!(parse_base_url("panel.example.net").is_err());
        assert!(parse_base_url("ftp://panel.example.net").is_err());
        assert!(parse_base_url("http://10.0.0.4:8080").is_ok());
    }
}
