//! Shared state for the HTTP server.

use pairhub_core::event_bus::EventBus;
use pairhub_core::SessionOrchestrator;
use std::sync::Arc;

/// Shared state available to all HTTP handlers.
#[derive(Clone)]
pub struct SharedState {
    pub orchestrator: SessionOrchestrator,
}

impl SharedState {
    pub fn new(orchestrator: SessionOrchestrator) -> Self {
        Self { orchestrator }
    }

    /// The orchestrator's notice bus, forwarded over WebSocket.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        self.orchestrator.event_bus()
    }
}
