//! # pairhub-core
//!
//! Session lifecycle core for pairhub, a gateway that runs many messaging
//! account connections side by side.
//!
//! This crate is framework-agnostic and is used by:
//! - the HTTP surface (`pairhub-http`)
//! - the `pairhub` daemon
//!
//! ## Key Concepts
//!
//! - **Session**: one messaging account connection, keyed by a caller-supplied id
//! - **Collaborator**: the external messaging client driving a session
//!   ([`client::MessagingClient`], usually a [`bridge`] process)
//! - **Generation**: one collaborator lifetime under a session id; events
//!   from superseded generations are ignored

pub mod admin;
pub mod bridge;
pub mod client;
pub mod credentials;
pub mod error;
pub mod event_bus;
pub mod logging;
pub mod orchestrator;
pub mod session;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use client::{ClientEvent, ClientFactory, MessagingClient};
pub use error::SessionError;
pub use event_bus::{EventBus, NoticeKind, SessionNotice};
pub use orchestrator::{
    OrchestratorConfig, RecreatePolicy, SessionOrchestrator, SessionStatus, StartOutcome,
};
pub use session::{QrStatus, SessionId, SessionSnapshot, SessionState};
