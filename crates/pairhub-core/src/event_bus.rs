//! Lifecycle notice broadcasting.
//!
//! The orchestrator emits a [`SessionNotice`] for every lifecycle step it
//! applies; the HTTP layer forwards them to WebSocket subscribers.
//!
//! # Example
//!
//! ```rust
//! use pairhub_core::event_bus::{EventBus, NoticeKind};
//! use pairhub_core::session::SessionId;
//!
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe();
//!
//! let id = SessionId::parse("shop1").unwrap();
//! bus.emit(&id, NoticeKind::Ready);
//!
//! // In async context:
//! // let notice = rx.recv().await.unwrap();
//! ```

use crate::session::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Slow subscribers lag once this many notices are buffered.
const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoticeKind {
    Creating,
    Qr,
    Authenticated,
    Ready,
    Identity { account_id: String },
    Disconnected { reason: String },
    AuthFailed { reason: String },
    /// The entry is gone from the registry.
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionNotice {
    pub session_id: SessionId,
    #[serde(flatten)]
    pub kind: NoticeKind,
    pub at: DateTime<Utc>,
}

impl SessionNotice {
    pub fn new(session_id: SessionId, kind: NoticeKind) -> Self {
        Self {
            session_id,
            kind,
            at: Utc::now(),
        }
    }
}

pub struct EventBus {
    sender: broadcast::Sender<SessionNotice>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit a notice to all subscribers.
    ///
    /// Returns the number of subscribers that received it; notices emitted
    /// with nobody listening are dropped.
    pub fn emit(&self, session_id: &SessionId, kind: NoticeKind) -> usize {
        self.sender
            .send(SessionNotice::new(session_id.clone(), kind))
            .unwrap_or(0)
    }

    /// Past notices are not replayed to new subscribers.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotice> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
