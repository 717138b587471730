//! Errors surfaced to callers of the session orchestrator.

use crate::session::{SessionId, SessionState};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    /// A required identifier was missing or malformed. No state changed.
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Session not found: {0}")]
    NotFound(SessionId),

    /// The operation needs a READY session.
    #[error("Session {session_id} is not ready (state: {state})")]
    NotReady {
        session_id: SessionId,
        state: SessionState,
    },

    /// The collaborator failed to deliver a message. Session state is unchanged.
    #[error("Failed to send message: {0}")]
    Transport(String),

    #[error("Credential storage error: {0}")]
    Storage(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_displays_session_id() {
        let id = SessionId::parse("shop1").unwrap();
        let error = SessionError::NotFound(id);
        assert!(error.to_string().contains("shop1"));
    }

    #[test]
    fn not_ready_displays_state() {
        let error = SessionError::NotReady {
            session_id: SessionId::parse("shop1").unwrap(),
            state: SessionState::QrPending,
        };
        let message = error.to_string();
        assert!(message.contains("shop1"));
        assert!(message.contains("qr_pending"));
    }

    #[test]
    fn io_errors_convert_to_storage() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let error: SessionError = io.into();
        assert!(matches!(error, SessionError::Storage(_)));
    }
}
