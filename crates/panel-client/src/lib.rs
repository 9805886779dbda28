//! Asynchronous client for the game-server management panel API.
//!
//! The panel only speaks request/response JSON over HTTP: there is no push channel,
//! sessions expire without notice, and the server occasionally answers with an
//! empty body under load. This crate hides that behind two entry points:
//!
//! - [`SessionManager`] logs each instance in independently and caches its token.
//! - [`ApiGateway`] is the single choke point every remote call goes through; it
//!   injects the session, retries network failures and empty bodies, and turns the
//!   panel's "Unauthorized Access" sentinel into [`ApiError::Unauthorized`].
//!
//! Payload shapes are not interpreted by the gateway; [`models`] holds the typed
//! views callers decode replies into.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod mock;
pub mod models;
pub mod otp;
pub mod session;
pub mod transport;

pub use dispatch::{ConnectionLatch, Dispatcher, RetryPolicy};
pub use error::ConfigurationError;
pub use gateway::{ApiError, ApiGateway};
pub use mock::{MockReply, MockTransport, RecordedCall};
pub use otp::OtpSecret;
pub use session::{AuthError, Credentials, InstanceSession, Session, SessionManager};
pub use transport::{HttpTransport, PanelTransport, RawResponse, TransportError};

/// Identifier of one managed instance as reported by the panel.
///
/// The panel itself is addressed as the distinguished core instance `"0"`; every
/// other instance is reached through the panel's per-instance proxy path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub const CORE: &'static str = "0";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn core() -> Self {
        Self(Self::CORE.to_string())
    }

    pub fn is_core(&self) -> bool {
        self.0 == Self::CORE
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for InstanceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}
