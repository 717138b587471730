//! Ephemeral store of pairing-code images.
//!
//! Holds at most one artifact per session; every re-scan cycle replaces it.
//! Nothing here is persisted. The cache is owned by the registry and only
//! mutated under the registry lock, so an artifact can never outlive the
//! QR_PENDING state it belongs to.

use super::state::SessionId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// A pairing image for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrArtifact {
    pub session_id: SessionId,
    /// Encoded image as delivered by the collaborator (typically a data URL).
    pub image_data: String,
    pub issued_at: DateTime<Utc>,
}

/// What a caller polling for a pairing code should see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QrStatus {
    Scan {
        #[serde(rename = "qrImage")]
        image: String,
    },
    Connected,
    Initializing,
    NotFound,
}

#[derive(Debug, Default)]
pub struct QrCache {
    artifacts: HashMap<SessionId, QrArtifact>,
}

impl QrCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new artifact, replacing any previous one.
    pub fn put(&mut self, session_id: SessionId, image_data: String) {
        let artifact = QrArtifact {
            session_id: session_id.clone(),
            image_data,
            issued_at: Utc::now(),
        };
        self.artifacts.insert(session_id, artifact);
    }

    pub fn get(&self, session_id: &SessionId) -> Option<&QrArtifact> {
        self.artifacts.get(session_id)
    }

    pub fn clear(&mut self, session_id: &SessionId) -> Option<QrArtifact> {
        self.artifacts.remove(session_id)
    }

    pub fn clear_all(&mut self) {
        self.artifacts.clear();
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}
