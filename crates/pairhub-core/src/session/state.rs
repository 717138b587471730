//! Per-session state and the lifecycle state machine.

use crate::error::SessionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path};

/// Caller-supplied session identifier.
///
/// Ids double as credential directory names, so they are restricted to a
/// single normal path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Validate and wrap a raw id.
    pub fn parse(raw: impl Into<String>) -> Result<Self, SessionError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SessionError::Validation("session_id is required".to_string()));
        }

        let mut components = Path::new(trimmed).components();
        match components.next() {
            Some(Component::Normal(_)) if components.next().is_none() => {}
            _ => {
                return Err(SessionError::Validation(format!(
                    "Invalid session_id: {trimmed}"
                )))
            }
        }
        if trimmed.contains(['/', '\\']) {
            return Err(SessionError::Validation(format!(
                "Invalid session_id: {trimmed}"
            )));
        }

        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a registry entry.
///
/// An id with no registry entry is uninitialized; there is no variant for it.
///
/// `Authenticated` sits between pairing and READY: the phone accepted the
/// code but the connection is not usable yet. Entering it retires the QR
/// artifact, since the scanned code can no longer be used, so `qr` polls
/// report `initializing` until READY. Everything that needs a usable
/// connection (send, identity) still waits for READY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Creating,
    QrPending,
    Authenticated,
    Ready,
    Disconnected,
    AuthFailed,
}

impl SessionState {
    /// Terminal markers only live until cleanup removes the entry.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::AuthFailed)
    }

    /// Apply a trigger. Returns `None` when the trigger has no effect in
    /// this state; callers log and drop it.
    pub fn next(self, trigger: Trigger) -> Option<SessionState> {
        use SessionState::*;

        match (self, trigger) {
            (Disconnected | AuthFailed, _) => None,
            (_, Trigger::Disconnect) => Some(Disconnected),
            (_, Trigger::AuthFailure) => Some(AuthFailed),
            (Creating | QrPending | Authenticated, Trigger::Qr) => Some(QrPending),
            (Creating | QrPending, Trigger::Authenticated) => Some(Authenticated),
            (Creating | QrPending | Authenticated, Trigger::Ready) => Some(Ready),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Creating => "creating",
            SessionState::QrPending => "qr_pending",
            SessionState::Authenticated => "authenticated",
            SessionState::Ready => "ready",
            SessionState::Disconnected => "disconnected",
            SessionState::AuthFailed => "auth_failed",
        };
        f.write_str(name)
    }
}

/// Inputs to the state machine, one per collaborator signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Qr,
    Authenticated,
    Ready,
    AuthFailure,
    Disconnect,
}

/// Account metadata read from a live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminIdentity {
    pub account_id: String,
    pub display_name: Option<String>,
    pub battery_level: Option<u8>,
}

/// Point-in-time view of a registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub state: SessionState,
    pub admin_number: Option<String>,
    pub identity: Option<AdminIdentity>,
    pub has_qr: bool,
    pub created_at: DateTime<Utc>,
}
