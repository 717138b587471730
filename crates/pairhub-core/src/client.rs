//! The messaging-client collaborator, seen from the core.
//!
//! The core never talks to the messaging network itself. A [`ClientFactory`]
//! produces one [`MessagingClient`] per session together with a channel of
//! typed [`ClientEvent`]s, which the orchestrator consumes in emission order.

use crate::session::{AdminIdentity, SessionId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Buffer size for per-session lifecycle event channels.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle signals emitted by a collaborator instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A new pairing image is available.
    Qr(String),
    Authenticated,
    Ready,
    Disconnected(String),
    AuthFailure(String),
}

/// Identity data as reported by the collaborator. Fields may be missing for
/// a short window after the ready signal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub battery_level: Option<u8>,
}

impl ClientInfo {
    /// Complete identities have a non-empty account id.
    pub fn into_identity(self) -> Option<AdminIdentity> {
        let account_id = self.account_id.filter(|id| !id.trim().is_empty())?;
        Some(AdminIdentity {
            account_id,
            display_name: self.display_name,
            battery_level: self.battery_level,
        })
    }
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Failed to start client: {0}")]
    Spawn(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Teardown failed: {0}")]
    Teardown(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Client connection closed")]
    Closed,
}

/// A live collaborator instance bound to one session.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Read the account identity. Incomplete data is not an error.
    async fn info(&self) -> Result<ClientInfo, ClientError>;

    async fn send_message(&self, destination: &str, text: &str) -> Result<(), ClientError>;

    /// Shut the instance down. Callers treat failures as best-effort.
    async fn destroy(&self) -> Result<(), ClientError>;
}

/// A freshly created collaborator and its event stream.
pub struct ClientConnection {
    pub client: Arc<dyn MessagingClient>,
    pub events: mpsc::Receiver<ClientEvent>,
}

/// Creates collaborator instances.
///
/// `credential_dir` is owned exclusively by the returned instance for its
/// whole lifetime.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create(
        &self,
        session_id: &SessionId,
        credential_dir: &Path,
    ) -> Result<ClientConnection, ClientError>;
}

/// Turn a caller-supplied number into a chat address.
///
/// Bare numbers get the personal-chat suffix; anything already carrying a
/// domain is passed through.
pub fn chat_destination(number: &str) -> String {
    let number = number.trim();
    if number.contains('@') {
        number.to_string()
    } else {
        format!("{number}@c.us")
    }
}
