//! SessionOrchestrator - creates, drives and tears down sessions.
//!
//! ## Architecture
//!
//! ```text
//!   request handlers ──► SessionOrchestrator ──► SessionRegistry
//!                              │    ▲
//!                     spawn    │    │ ClientEvent (per-session mpsc)
//!                              ▼    │
//!                        session task ◄── MessagingClient (bridge / fake)
//! ```
//!
//! Creation is deduplicated by an insert-if-absent on the registry that
//! happens before the first await. Each created generation gets one task
//! that instantiates the collaborator and then consumes its lifecycle events
//! in emission order until the session is torn down.

use crate::admin::{poll_identity, AdminPublisher, PollOutcome, RetryPolicy};
use crate::client::{chat_destination, ClientConnection, ClientEvent, ClientFactory, MessagingClient};
use crate::credentials::CredentialStore;
use crate::error::SessionError;
use crate::event_bus::{EventBus, NoticeKind};
use crate::session::{
    AdminIdentity, Claim, Generation, QrStatus, Rejected, SessionId, SessionRegistry,
    SessionSnapshot, SessionState, TeardownFinish, TeardownRefused, Trigger,
};
use serde::Serialize;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Reason recorded when an outside caller asks for a disconnect.
const DISCONNECT_REQUESTED: &str = "disconnect requested";

/// Whether a torn-down session is immediately created again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecreatePolicy {
    /// The collaborator reported a disconnect.
    pub on_disconnect: bool,
    /// The collaborator rejected the stored credentials.
    pub on_auth_failure: bool,
}

impl Default for RecreatePolicy {
    fn default() -> Self {
        Self {
            on_disconnect: true,
            on_auth_failure: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// One credential directory per session lives under this root.
    pub sessions_root: PathBuf,
    pub admin_endpoint: Option<String>,
    pub recreate: RecreatePolicy,
    pub identity_poll: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            sessions_root: PathBuf::from("sessions"),
            admin_endpoint: None,
            recreate: RecreatePolicy::default(),
            identity_poll: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// This call created the session.
    Created,
    /// An entry already existed; nothing was started.
    AlreadyExists(SessionState),
    /// The orchestrator has shut down.
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub ready: bool,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<AdminIdentity>,
}

/// What happens after a claimed teardown has destroyed the collaborator.
struct Cleanup {
    erase_credentials: bool,
    recreate: bool,
    admin_number: Option<String>,
}

pub struct SessionOrchestratorBuilder {
    factory: Arc<dyn ClientFactory>,
    config: OrchestratorConfig,
    event_bus: Option<Arc<EventBus>>,
    registry: Option<Arc<SessionRegistry>>,
}

impl SessionOrchestratorBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn sessions_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.sessions_root = root.into();
        self
    }

    pub fn admin_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.admin_endpoint = Some(endpoint.into());
        self
    }

    pub fn recreate(mut self, policy: RecreatePolicy) -> Self {
        self.config.recreate = policy;
        self
    }

    pub fn identity_poll(mut self, policy: RetryPolicy) -> Self {
        self.config.identity_poll = policy;
        self
    }

    /// Use an existing EventBus (shared with the HTTP layer, or for tests).
    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Use an existing SessionRegistry (for testing).
    pub fn registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> SessionOrchestrator {
        let OrchestratorConfig {
            sessions_root,
            admin_endpoint,
            recreate,
            identity_poll,
        } = self.config;

        SessionOrchestrator {
            inner: Arc::new(Inner {
                registry: self
                    .registry
                    .unwrap_or_else(|| Arc::new(SessionRegistry::new())),
                factory: self.factory,
                credentials: CredentialStore::new(sessions_root),
                publisher: AdminPublisher::new(admin_endpoint),
                event_bus: self.event_bus.unwrap_or_else(|| Arc::new(EventBus::new())),
                recreate,
                identity_poll,
            }),
        }
    }
}

struct Inner {
    registry: Arc<SessionRegistry>,
    factory: Arc<dyn ClientFactory>,
    credentials: CredentialStore,
    publisher: AdminPublisher,
    event_bus: Arc<EventBus>,
    recreate: RecreatePolicy,
    identity_poll: RetryPolicy,
}

/// Cheap to clone; all clones drive the same registry.
#[derive(Clone)]
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

impl SessionOrchestrator {
    pub fn builder(factory: Arc<dyn ClientFactory>) -> SessionOrchestratorBuilder {
        SessionOrchestratorBuilder {
            factory,
            config: OrchestratorConfig::default(),
            event_bus: None,
            registry: None,
        }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.inner.event_bus
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    /// Idempotent create. Must be called from within a tokio runtime.
    pub fn start(
        &self,
        session_id: &str,
        admin_number: Option<&str>,
    ) -> Result<StartOutcome, SessionError> {
        let id = SessionId::parse(session_id)?;
        let admin_number = admin_number
            .map(str::trim)
            .filter(|number| !number.is_empty())
            .map(str::to_string);
        Ok(self.request_create(&id, admin_number))
    }

    /// Claim the id and spawn its session task.
    ///
    /// The claim is synchronous, so a concurrent caller for the same id sees
    /// the CREATING entry and backs off.
    pub fn request_create(&self, id: &SessionId, admin_number: Option<String>) -> StartOutcome {
        match self.inner.registry.claim(id, admin_number) {
            Claim::Exists(state) => {
                log::debug!("[{}] Session already exists ({})", id, state);
                StartOutcome::AlreadyExists(state)
            }
            Claim::Closed => {
                log::info!("[{}] Shutting down; session not created", id);
                StartOutcome::ShuttingDown
            }
            Claim::Created(generation) => {
                log::info!("[{}] Creating session {}", id, generation);
                self.inner.event_bus.emit(id, NoticeKind::Creating);
                tokio::spawn(self.clone().run_session(id.clone(), generation));
                StartOutcome::Created
            }
        }
    }

    pub fn qr(&self, session_id: &str) -> Result<QrStatus, SessionError> {
        let id = SessionId::parse(session_id)?;
        Ok(self.inner.registry.qr_status(&id))
    }

    /// Readiness and identity. Falls back to asking the collaborator when a
    /// READY session has no cached identity.
    pub async fn status(&self, session_id: &str) -> Result<SessionStatus, SessionError> {
        let id = SessionId::parse(session_id)?;
        let view = self
            .inner
            .registry
            .client(&id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;

        let ready = view.state == SessionState::Ready;
        let identity = match (ready, view.identity, view.handle) {
            (true, Some(identity), _) => Some(identity),
            (true, None, Some(handle)) => match handle.info().await {
                Ok(info) => info.into_identity(),
                Err(e) => {
                    log::debug!("[{}] Identity query failed: {}", id, e);
                    None
                }
            },
            _ => None,
        };

        Ok(SessionStatus {
            ready,
            state: view.state,
            identity,
        })
    }

    pub async fn send(
        &self,
        session_id: &str,
        number: &str,
        text: &str,
    ) -> Result<(), SessionError> {
        let id = SessionId::parse(session_id)?;
        if number.trim().is_empty() {
            return Err(SessionError::Validation("number is required".to_string()));
        }
        if text.is_empty() {
            return Err(SessionError::Validation("message is required".to_string()));
        }

        let view = self
            .inner
            .registry
            .client(&id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        let handle = match (view.state, view.handle) {
            (SessionState::Ready, Some(handle)) => handle,
            (state, _) => {
                return Err(SessionError::NotReady {
                    session_id: id,
                    state,
                })
            }
        };

        let destination = chat_destination(number);
        handle
            .send_message(&destination, text)
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        log::info!("[{}] Message sent to {}", id, destination);
        Ok(())
    }

    /// Destroy the collaborator, erase the credentials and start over with a
    /// fresh unpaired session under the same id.
    ///
    /// If the fresh session fails to start the id ends up absent; callers
    /// poll and start again.
    pub async fn disconnect(&self, session_id: &str) -> Result<(), SessionError> {
        let id = SessionId::parse(session_id)?;
        let claim = match self
            .inner
            .registry
            .begin_teardown(&id, None, Trigger::Disconnect)
        {
            Ok(claim) => claim,
            Err(TeardownRefused::Missing) => return Err(SessionError::NotFound(id)),
            Err(TeardownRefused::Starting) => {
                return Err(SessionError::NotReady {
                    session_id: id,
                    state: SessionState::Creating,
                })
            }
            Err(TeardownRefused::InProgress(state)) => {
                // The running teardown picks up the logout request.
                log::info!(
                    "[{}] Teardown already in progress ({}); credentials will be erased",
                    id,
                    state
                );
                return Ok(());
            }
        };

        log::info!("[{}] Disconnecting session (was {})", id, claim.previous);
        self.inner.event_bus.emit(
            &id,
            NoticeKind::Disconnected {
                reason: DISCONNECT_REQUESTED.to_string(),
            },
        );
        if let Some(handle) = claim.handle {
            destroy_client(&id, handle).await;
        }
        self.finish_teardown(
            &id,
            claim.generation,
            Cleanup {
                erase_credentials: true,
                recreate: true,
                admin_number: claim.admin_number,
            },
        )
        .await;
        Ok(())
    }

    /// Start a session for every credential directory found on disk.
    ///
    /// Returns the ids that entered recovery.
    pub async fn recover(&self) -> Result<Vec<SessionId>, SessionError> {
        self.inner.credentials.ensure_root().await?;
        let ids = self.inner.credentials.list().await?;

        let recovered: Vec<_> = ids
            .into_iter()
            .filter(|id| self.request_create(id, None) == StartOutcome::Created)
            .collect();
        log::info!(
            "Recovering {} session(s) from {}",
            recovered.len(),
            self.inner.credentials.root().display()
        );
        Ok(recovered)
    }

    pub fn list(&self) -> Vec<SessionSnapshot> {
        self.inner.registry.list()
    }

    /// Destroy every live collaborator. Credentials stay on disk so the next
    /// boot recovers the sessions.
    pub async fn shutdown(&self) {
        let handles = self.inner.registry.drain();
        log::info!("Shutting down {} session client(s)", handles.len());

        let mut tasks = JoinSet::new();
        for (id, handle) in handles {
            self.inner.event_bus.emit(&id, NoticeKind::Removed);
            tasks.spawn(async move { destroy_client(&id, handle).await });
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                log::warn!("Client teardown task failed: {}", e);
            }
        }
    }

    async fn run_session(self, id: SessionId, generation: Generation) {
        let credential_dir = self.inner.credentials.dir_for(&id);
        let ClientConnection { client, mut events } =
            match self.inner.factory.create(&id, &credential_dir).await {
                Ok(connection) => connection,
                Err(e) => {
                    log::error!("[{}] Failed to create client: {}", id, e);
                    if self.inner.registry.abandon(&id, generation) {
                        self.inner.event_bus.emit(&id, NoticeKind::Removed);
                    }
                    return;
                }
            };

        if let Err(orphan) = self
            .inner
            .registry
            .attach(&id, generation, Arc::clone(&client))
        {
            log::info!("[{}] Session {} went away while starting", id, generation);
            destroy_client(&id, orphan).await;
            return;
        }

        while let Some(event) = events.recv().await {
            if self.handle_event(&id, generation, &client, event).await.is_break() {
                return;
            }
        }

        // The stream ended without a terminal signal.
        self.teardown(&id, generation, Trigger::Disconnect, "event stream closed".to_string())
            .await;
    }

    async fn handle_event(
        &self,
        id: &SessionId,
        generation: Generation,
        client: &Arc<dyn MessagingClient>,
        event: ClientEvent,
    ) -> ControlFlow<()> {
        let registry = &self.inner.registry;
        let applied = match event {
            ClientEvent::Qr(image) => registry.record_qr(id, generation, image).map(|_| {
                log::info!("[{}] QR code received", id);
                NoticeKind::Qr
            }),
            ClientEvent::Authenticated => registry.mark_authenticated(id, generation).map(|_| {
                log::info!("[{}] Authenticated", id);
                NoticeKind::Authenticated
            }),
            ClientEvent::Ready => registry.mark_ready(id, generation).map(|_| {
                log::info!("[{}] Client is ready", id);
                NoticeKind::Ready
            }),
            ClientEvent::Disconnected(reason) => {
                self.teardown(id, generation, Trigger::Disconnect, reason).await;
                return ControlFlow::Break(());
            }
            ClientEvent::AuthFailure(reason) => {
                self.teardown(id, generation, Trigger::AuthFailure, reason).await;
                return ControlFlow::Break(());
            }
        };

        match applied {
            Ok(kind) => {
                let ready = kind == NoticeKind::Ready;
                self.inner.event_bus.emit(id, kind);
                if ready {
                    self.spawn_identity_resolution(id.clone(), generation, Arc::clone(client));
                }
                ControlFlow::Continue(())
            }
            Err(Rejected::Ignored(state)) => {
                log::debug!("[{}] Ignoring lifecycle event in state {}", id, state);
                ControlFlow::Continue(())
            }
            Err(Rejected::Stale) => {
                log::debug!("[{}] Session {} superseded; stopping", id, generation);
                ControlFlow::Break(())
            }
        }
    }

    /// Tear down after a collaborator signal. A no-op when someone else
    /// already owns the teardown of this generation.
    async fn teardown(&self, id: &SessionId, generation: Generation, trigger: Trigger, reason: String) {
        let claim = match self.inner.registry.begin_teardown(id, Some(generation), trigger) {
            Ok(claim) => claim,
            Err(refused) => {
                log::debug!("[{}] Teardown for {} skipped: {:?}", id, generation, refused);
                return;
            }
        };

        let policy = self.inner.recreate;
        let (kind, cleanup) = match trigger {
            Trigger::AuthFailure => {
                log::warn!("[{}] Authentication failed: {}", id, reason);
                (
                    NoticeKind::AuthFailed { reason },
                    Cleanup {
                        erase_credentials: true,
                        recreate: policy.on_auth_failure,
                        admin_number: claim.admin_number,
                    },
                )
            }
            _ => {
                log::warn!("[{}] Client disconnected: {}", id, reason);
                (
                    NoticeKind::Disconnected { reason },
                    Cleanup {
                        erase_credentials: false,
                        recreate: policy.on_disconnect,
                        admin_number: claim.admin_number,
                    },
                )
            }
        };
        self.inner.event_bus.emit(id, kind);

        if let Some(handle) = claim.handle {
            destroy_client(id, handle).await;
        }
        self.finish_teardown(id, claim.generation, cleanup).await;
    }

    async fn finish_teardown(&self, id: &SessionId, generation: Generation, cleanup: Cleanup) {
        let Cleanup {
            mut erase_credentials,
            mut recreate,
            admin_number,
        } = cleanup;

        loop {
            if erase_credentials {
                match self.inner.credentials.erase(id).await {
                    Ok(true) => log::info!("[{}] Credentials erased", id),
                    Ok(false) => log::debug!("[{}] No credentials to erase", id),
                    Err(e) => log::error!("[{}] Failed to erase credentials: {}", id, e),
                }
            }

            match self
                .inner
                .registry
                .finish_teardown(id, generation, erase_credentials)
            {
                TeardownFinish::Removed => {
                    self.inner.event_bus.emit(id, NoticeKind::Removed);
                    break;
                }
                TeardownFinish::Stale => break,
                TeardownFinish::LogoutRequested => {
                    log::info!("[{}] Disconnect requested during teardown", id);
                    erase_credentials = true;
                    recreate = true;
                }
            }
        }

        if recreate {
            log::info!("[{}] Recreating session for a new pairing", id);
            self.request_create(id, admin_number);
        }
    }

    fn spawn_identity_resolution(
        &self,
        id: SessionId,
        generation: Generation,
        client: Arc<dyn MessagingClient>,
    ) {
        let this = self.clone();
        tokio::spawn(async move { this.resolve_identity(id, generation, client).await });
    }

    async fn resolve_identity(
        &self,
        id: SessionId,
        generation: Generation,
        client: Arc<dyn MessagingClient>,
    ) {
        let outcome = poll_identity(client.as_ref(), &self.inner.identity_poll).await;
        drop(client);

        let (identity, attempts) = match outcome {
            PollOutcome::Resolved { identity, attempts } => (identity, attempts),
            PollOutcome::TimedOut { attempts } => {
                log::warn!(
                    "[{}] Identity unavailable after {} attempt(s); status will query the client",
                    id,
                    attempts
                );
                return;
            }
        };

        if !self
            .inner
            .registry
            .record_identity(&id, generation, identity.clone())
        {
            log::debug!("[{}] Session moved on before identity was cached", id);
            return;
        }
        log::info!(
            "[{}] Admin identity {} resolved after {} attempt(s)",
            id,
            identity.account_id,
            attempts
        );
        self.inner.event_bus.emit(
            &id,
            NoticeKind::Identity {
                account_id: identity.account_id.clone(),
            },
        );

        match self.inner.publisher.publish(&id, &identity).await {
            Ok(true) => log::info!("[{}] Admin number published", id),
            Ok(false) => log::debug!("[{}] No admin endpoint configured", id),
            Err(e) => log::error!("[{}] Failed to publish admin number: {}", id, e),
        }
    }
}

/// Best-effort teardown of a collaborator instance.
async fn destroy_client(id: &SessionId, client: Arc<dyn MessagingClient>) {
    if let Err(e) = client.destroy().await {
        log::warn!("[{}] Teardown error ignored: {}", id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::Backoff;
    use crate::client::ClientInfo;
    use crate::testing::{eventually, FakeClient, FakeClientFactory};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    struct Harness {
        orchestrator: SessionOrchestrator,
        factory: Arc<FakeClientFactory>,
        dir: TempDir,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_policy(RecreatePolicy::default())
        }

        fn with_policy(recreate: RecreatePolicy) -> Self {
            let dir = tempdir().unwrap();
            let factory = FakeClientFactory::new();
            let orchestrator = SessionOrchestrator::builder(factory.clone())
                .sessions_root(dir.path())
                .recreate(recreate)
                .identity_poll(RetryPolicy {
                    max_attempts: 3,
                    delay: Duration::from_millis(1),
                    backoff: Backoff::Fixed,
                })
                .build();
            Self {
                orchestrator,
                factory,
                dir,
            }
        }

        fn state(&self, raw: &str) -> Option<SessionState> {
            self.orchestrator
                .registry()
                .snapshot(&SessionId::parse(raw).unwrap())
                .map(|snapshot| snapshot.state)
        }

        /// Wait for the `n`th instance of `raw` and return it.
        async fn instance(&self, raw: &str, n: usize) -> Arc<FakeClient> {
            assert!(
                eventually(|| self.factory.instances(raw) >= n).await,
                "instance {n} of {raw} never created"
            );
            self.factory.latest(raw).unwrap()
        }

        async fn wait_for_state(&self, raw: &str, state: SessionState) {
            assert!(
                eventually(|| self.state(raw) == Some(state)).await,
                "{raw} never reached {state}, last seen {:?}",
                self.state(raw)
            );
        }

        /// Start `raw` and drive it to READY with a resolvable identity.
        async fn ready(&self, raw: &str) -> Arc<FakeClient> {
            self.factory.set_initial_info(identity_info());
            self.orchestrator.start(raw, Some("62811")).unwrap();
            let client = self.instance(raw, self.factory.instances(raw) + 1).await;
            client.emit(ClientEvent::Ready).await;
            self.wait_for_state(raw, SessionState::Ready).await;
            client
        }
    }

    fn identity_info() -> ClientInfo {
        ClientInfo {
            account_id: Some("6281100".to_string()),
            display_name: Some("Shop".to_string()),
            battery_level: Some(80),
        }
    }

    mod start {
        use super::*;

        #[tokio::test]
        async fn concurrent_starts_create_one_instance() {
            let h = Harness::new();
            h.factory.set_create_delay(Duration::from_millis(50));

            let mut tasks = JoinSet::new();
            for _ in 0..16 {
                let orchestrator = h.orchestrator.clone();
                tasks.spawn(async move { orchestrator.start("shop1", None).unwrap() });
            }
            let mut created = 0;
            while let Some(outcome) = tasks.join_next().await {
                if outcome.unwrap() == StartOutcome::Created {
                    created += 1;
                }
            }

            assert_eq!(created, 1);
            h.instance("shop1", 1).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(h.factory.instances("shop1"), 1);
            assert_eq!(h.orchestrator.list().len(), 1);
        }

        #[tokio::test]
        async fn second_start_reports_existing_state() {
            let h = Harness::new();
            h.ready("shop1").await;

            assert_eq!(
                h.orchestrator.start("shop1", None).unwrap(),
                StartOutcome::AlreadyExists(SessionState::Ready)
            );
            assert_eq!(h.factory.instances("shop1"), 1);
        }

        #[tokio::test]
        async fn uses_credential_dir_under_root() {
            let h = Harness::new();
            h.orchestrator.start("shop1", None).unwrap();
            h.instance("shop1", 1).await;

            assert_eq!(
                h.factory.credential_dir("shop1").unwrap(),
                h.dir.path().join("shop1")
            );
        }

        #[tokio::test]
        async fn invalid_ids_are_rejected() {
            let h = Harness::new();
            assert!(matches!(
                h.orchestrator.start("", None),
                Err(SessionError::Validation(_))
            ));
            assert!(matches!(
                h.orchestrator.start("../etc", None),
                Err(SessionError::Validation(_))
            ));
            assert!(h.orchestrator.list().is_empty());
        }

        #[tokio::test]
        async fn create_failure_removes_entry() {
            let h = Harness::new();
            let mut notices = h.orchestrator.event_bus().subscribe();
            h.factory.fail_next_create();

            h.orchestrator.start("shop1", None).unwrap();
            assert!(eventually(|| h.state("shop1").is_none()).await);
            assert_eq!(notices.recv().await.unwrap().kind, NoticeKind::Creating);
            assert_eq!(notices.recv().await.unwrap().kind, NoticeKind::Removed);

            // A later start tries again.
            assert_eq!(
                h.orchestrator.start("shop1", None).unwrap(),
                StartOutcome::Created
            );
            h.instance("shop1", 1).await;
        }
    }

    mod pairing {
        use super::*;

        #[tokio::test]
        async fn qr_status_follows_pairing() {
            let h = Harness::new();
            h.factory.set_initial_info(identity_info());
            h.orchestrator.start("shop1", Some("62811")).unwrap();

            assert_eq!(h.orchestrator.qr("shop1").unwrap(), QrStatus::Initializing);

            let client = h.instance("shop1", 1).await;
            client.emit(ClientEvent::Qr("data:image/png;base64,AAA".to_string())).await;
            assert!(
                eventually(|| h.orchestrator.qr("shop1").unwrap()
                    == QrStatus::Scan {
                        image: "data:image/png;base64,AAA".to_string()
                    })
                .await
            );

            client.emit(ClientEvent::Authenticated).await;
            client.emit(ClientEvent::Ready).await;
            assert!(eventually(|| h.orchestrator.qr("shop1").unwrap() == QrStatus::Connected).await);
            assert!(h.orchestrator.registry().qr(&SessionId::parse("shop1").unwrap()).is_none());

            assert!(
                eventually(|| h
                    .orchestrator
                    .list()
                    .first()
                    .map_or(false, |s| s.identity.is_some()))
                .await
            );
            let status = h.orchestrator.status("shop1").await.unwrap();
            assert!(status.ready);
            assert_eq!(status.identity.unwrap().account_id, "6281100");
        }

        #[tokio::test]
        async fn unknown_session_qr_is_not_found() {
            let h = Harness::new();
            assert_eq!(h.orchestrator.qr("ghost").unwrap(), QrStatus::NotFound);
        }

        #[tokio::test]
        async fn notices_trace_the_lifecycle() {
            let h = Harness::new();
            let mut notices = h.orchestrator.event_bus().subscribe();
            let client = h.ready("shop1").await;
            drop(client);

            let mut kinds = Vec::new();
            while kinds.len() < 3 {
                kinds.push(notices.recv().await.unwrap().kind);
            }
            assert_eq!(
                kinds,
                vec![
                    NoticeKind::Creating,
                    NoticeKind::Ready,
                    NoticeKind::Identity {
                        account_id: "6281100".to_string()
                    },
                ]
            );
        }

        #[tokio::test]
        async fn identity_is_polled_at_most_once_per_connection() {
            let h = Harness::new();
            let client = h.ready("shop1").await;
            assert!(eventually(|| client.info_calls() == 1).await);

            for _ in 0..3 {
                h.orchestrator.status("shop1").await.unwrap();
            }
            assert_eq!(client.info_calls(), 1);
        }
    }

    mod status {
        use super::*;

        #[tokio::test]
        async fn unknown_session_is_not_found() {
            let h = Harness::new();
            assert!(matches!(
                h.orchestrator.status("ghost").await,
                Err(SessionError::NotFound(_))
            ));
        }

        #[tokio::test]
        async fn pending_session_is_not_ready() {
            let h = Harness::new();
            h.orchestrator.start("shop1", None).unwrap();

            let status = h.orchestrator.status("shop1").await.unwrap();
            assert!(!status.ready);
            assert!(status.identity.is_none());
        }

        #[tokio::test]
        async fn falls_back_to_client_when_polling_timed_out() {
            let h = Harness::new();
            h.orchestrator.start("shop1", None).unwrap();
            let client = h.instance("shop1", 1).await;
            client.emit(ClientEvent::Ready).await;
            // Three empty answers exhaust the poll.
            assert!(eventually(|| client.info_calls() == 3).await);

            let status = h.orchestrator.status("shop1").await.unwrap();
            assert!(status.ready);
            assert!(status.identity.is_none());

            client.set_info(identity_info());
            let status = h.orchestrator.status("shop1").await.unwrap();
            assert_eq!(status.identity.unwrap().account_id, "6281100");
        }
    }

    mod send {
        use super::*;

        #[tokio::test]
        async fn delivers_to_chat_address() {
            let h = Harness::new();
            let client = h.ready("shop1").await;

            h.orchestrator.send("shop1", "62811000", "hello").await.unwrap();
            assert_eq!(
                client.sent(),
                vec![("62811000@c.us".to_string(), "hello".to_string())]
            );
        }

        #[tokio::test]
        async fn unknown_session_is_not_found() {
            let h = Harness::new();
            assert!(matches!(
                h.orchestrator.send("ghost", "62811", "hi").await,
                Err(SessionError::NotFound(_))
            ));
        }

        #[tokio::test]
        async fn pairing_session_is_not_ready() {
            let h = Harness::new();
            h.orchestrator.start("shop1", None).unwrap();
            let client = h.instance("shop1", 1).await;
            client.emit(ClientEvent::Qr("qr".to_string())).await;
            h.wait_for_state("shop1", SessionState::QrPending).await;

            let result = h.orchestrator.send("shop1", "62811", "hi").await;
            assert!(matches!(
                result,
                Err(SessionError::NotReady {
                    state: SessionState::QrPending,
                    ..
                })
            ));
            assert!(client.sent().is_empty());
        }

        #[tokio::test]
        async fn transport_failure_keeps_session_ready() {
            let h = Harness::new();
            let client = h.ready("shop1").await;
            client.fail_sends(true);

            let result = h.orchestrator.send("shop1", "62811", "hi").await;
            assert!(matches!(result, Err(SessionError::Transport(_))));
            assert_eq!(h.state("shop1"), Some(SessionState::Ready));
        }

        #[tokio::test]
        async fn missing_fields_are_validation_errors() {
            let h = Harness::new();
            h.ready("shop1").await;

            assert!(matches!(
                h.orchestrator.send("shop1", " ", "hi").await,
                Err(SessionError::Validation(_))
            ));
            assert!(matches!(
                h.orchestrator.send("shop1", "62811", "").await,
                Err(SessionError::Validation(_))
            ));
        }
    }

    mod collaborator_signals {
        use super::*;

        #[tokio::test]
        async fn disconnect_recreates_session() {
            let h = Harness::new();
            let first = h.ready("shop1").await;
            std::fs::create_dir_all(h.dir.path().join("shop1")).unwrap();

            first.emit(ClientEvent::Disconnected("NAVIGATION".to_string())).await;

            let second = h.instance("shop1", 2).await;
            assert!(first.is_destroyed());
            assert!(!second.is_destroyed());
            h.wait_for_state("shop1", SessionState::Creating).await;
            // Credentials survive a plain disconnect.
            assert!(h.dir.path().join("shop1").is_dir());

            let status = h.orchestrator.status("shop1").await.unwrap();
            assert!(!status.ready);
            assert!(status.identity.is_none());
            let snapshot = &h.orchestrator.list()[0];
            assert_eq!(snapshot.admin_number.as_deref(), Some("62811"));
        }

        #[tokio::test]
        async fn disconnect_without_recreate_removes_session() {
            let h = Harness::with_policy(RecreatePolicy {
                on_disconnect: false,
                on_auth_failure: false,
            });
            let client = h.ready("shop1").await;

            client.emit(ClientEvent::Disconnected("LOGOUT".to_string())).await;

            assert!(eventually(|| h.state("shop1").is_none()).await);
            assert!(client.is_destroyed());
            assert_eq!(h.orchestrator.qr("shop1").unwrap(), QrStatus::NotFound);
            assert_eq!(h.factory.instances("shop1"), 1);
        }

        #[tokio::test]
        async fn closed_stream_counts_as_disconnect() {
            let h = Harness::new();
            let first = h.ready("shop1").await;

            first.close();

            h.instance("shop1", 2).await;
            h.wait_for_state("shop1", SessionState::Creating).await;
        }

        #[tokio::test]
        async fn auth_failure_removes_session_and_credentials() {
            let h = Harness::new();
            h.orchestrator.start("shop1", None).unwrap();
            let client = h.instance("shop1", 1).await;
            std::fs::create_dir_all(h.dir.path().join("shop1").join("Default")).unwrap();
            client.emit(ClientEvent::Qr("qr".to_string())).await;
            h.wait_for_state("shop1", SessionState::QrPending).await;

            client.emit(ClientEvent::AuthFailure("bad credentials".to_string())).await;

            assert!(eventually(|| h.state("shop1").is_none()).await);
            assert!(client.is_destroyed());
            assert!(!h.dir.path().join("shop1").exists());
            assert_eq!(h.orchestrator.qr("shop1").unwrap(), QrStatus::NotFound);
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(h.factory.instances("shop1"), 1);
        }

        #[tokio::test]
        async fn auth_failure_recreates_when_configured() {
            let h = Harness::with_policy(RecreatePolicy {
                on_disconnect: true,
                on_auth_failure: true,
            });
            h.orchestrator.start("shop1", None).unwrap();
            let client = h.instance("shop1", 1).await;

            client.emit(ClientEvent::AuthFailure("bad credentials".to_string())).await;

            h.instance("shop1", 2).await;
            h.wait_for_state("shop1", SessionState::Creating).await;
        }

        #[tokio::test]
        async fn teardown_errors_do_not_block_cleanup() {
            let h = Harness::with_policy(RecreatePolicy {
                on_disconnect: false,
                on_auth_failure: false,
            });
            let client = h.ready("shop1").await;
            client.fail_destroy(true);

            client.emit(ClientEvent::Disconnected("CONFLICT".to_string())).await;
            assert!(eventually(|| h.state("shop1").is_none()).await);
        }

        #[tokio::test]
        async fn sessions_fail_independently() {
            let h = Harness::with_policy(RecreatePolicy {
                on_disconnect: false,
                on_auth_failure: false,
            });
            let shop1 = h.ready("shop1").await;
            let shop2 = h.ready("shop2").await;

            shop1.emit(ClientEvent::Disconnected("LOGOUT".to_string())).await;

            assert!(eventually(|| h.state("shop1").is_none()).await);
            assert_eq!(h.state("shop2"), Some(SessionState::Ready));
            assert!(!shop2.is_destroyed());
        }
    }

    mod disconnect {
        use super::*;

        #[tokio::test]
        async fn unknown_session_is_not_found() {
            let h = Harness::new();
            assert!(matches!(
                h.orchestrator.disconnect("ghost").await,
                Err(SessionError::NotFound(_))
            ));
        }

        #[tokio::test]
        async fn erases_credentials_and_starts_fresh() {
            let h = Harness::new();
            let first = h.ready("shop1").await;
            assert!(eventually(|| h
                .orchestrator
                .list()
                .first()
                .map_or(false, |s| s.identity.is_some()))
            .await);
            std::fs::create_dir_all(h.dir.path().join("shop1").join("Default")).unwrap();

            h.orchestrator.disconnect("shop1").await.unwrap();

            assert!(first.is_destroyed());
            assert!(!h.dir.path().join("shop1").exists());
            assert_eq!(h.state("shop1"), Some(SessionState::Creating));
            let status = h.orchestrator.status("shop1").await.unwrap();
            assert!(!status.ready);
            assert!(status.identity.is_none());

            let second = h.instance("shop1", 2).await;
            second.emit(ClientEvent::Qr("fresh".to_string())).await;
            assert!(
                eventually(|| h.orchestrator.qr("shop1").unwrap()
                    == QrStatus::Scan {
                        image: "fresh".to_string()
                    })
                .await
            );
        }

        #[tokio::test]
        async fn starting_session_is_not_ready() {
            let h = Harness::new();
            h.factory.set_create_delay(Duration::from_millis(200));
            h.orchestrator.start("shop1", None).unwrap();

            assert!(matches!(
                h.orchestrator.disconnect("shop1").await,
                Err(SessionError::NotReady {
                    state: SessionState::Creating,
                    ..
                })
            ));
            assert_eq!(h.state("shop1"), Some(SessionState::Creating));
        }

        #[tokio::test]
        async fn teardown_error_is_ignored() {
            let h = Harness::new();
            let first = h.ready("shop1").await;
            first.fail_destroy(true);

            h.orchestrator.disconnect("shop1").await.unwrap();
            h.instance("shop1", 2).await;
        }

        #[tokio::test]
        async fn during_collaborator_teardown_still_erases_credentials() {
            let h = Harness::new();
            let first = h.ready("shop1").await;
            first.set_destroy_delay(Duration::from_millis(300));
            std::fs::create_dir_all(h.dir.path().join("shop1").join("Default")).unwrap();

            first.emit(ClientEvent::Disconnected("phone offline".to_string())).await;
            h.wait_for_state("shop1", SessionState::Disconnected).await;

            h.orchestrator.disconnect("shop1").await.unwrap();

            // Recreation only happens once the credentials are gone.
            h.instance("shop1", 2).await;
            assert!(first.is_destroyed());
            assert!(!h.dir.path().join("shop1").exists());
            h.wait_for_state("shop1", SessionState::Creating).await;
        }

        #[tokio::test]
        async fn during_collaborator_teardown_recreates_regardless_of_policy() {
            let h = Harness::with_policy(RecreatePolicy {
                on_disconnect: false,
                on_auth_failure: false,
            });
            let first = h.ready("shop1").await;
            first.set_destroy_delay(Duration::from_millis(200));
            std::fs::create_dir_all(h.dir.path().join("shop1")).unwrap();

            first.emit(ClientEvent::Disconnected("phone offline".to_string())).await;
            h.wait_for_state("shop1", SessionState::Disconnected).await;
            h.orchestrator.disconnect("shop1").await.unwrap();

            h.instance("shop1", 2).await;
            assert!(!h.dir.path().join("shop1").exists());
        }

        #[tokio::test]
        async fn late_events_from_old_instance_are_ignored() {
            let h = Harness::new();
            let first = h.ready("shop1").await;
            h.orchestrator.disconnect("shop1").await.unwrap();
            h.instance("shop1", 2).await;

            // The old stream is closed; nothing it sends can land.
            assert!(!first.emit(ClientEvent::Ready).await);
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(h.state("shop1"), Some(SessionState::Creating));
        }
    }

    mod recovery {
        use super::*;

        #[tokio::test]
        async fn starts_one_session_per_credential_dir() {
            let h = Harness::new();
            for name in ["shop1", "shop2", "shop3"] {
                std::fs::create_dir_all(h.dir.path().join(name)).unwrap();
            }
            std::fs::write(h.dir.path().join("README"), "not a session").unwrap();

            let recovered = h.orchestrator.recover().await.unwrap();

            let names: Vec<_> = recovered.iter().map(|id| id.to_string()).collect();
            assert_eq!(names, vec!["shop1", "shop2", "shop3"]);
            assert!(eventually(|| h.factory.total_instances() == 3).await);
            assert_eq!(h.orchestrator.list().len(), 3);
        }

        #[tokio::test]
        async fn creates_missing_root() {
            let dir = tempdir().unwrap();
            let root = dir.path().join("sessions");
            let orchestrator = SessionOrchestrator::builder(FakeClientFactory::new())
                .sessions_root(&root)
                .build();

            assert!(orchestrator.recover().await.unwrap().is_empty());
            assert!(root.is_dir());
        }

        #[tokio::test]
        async fn skips_sessions_already_running() {
            let h = Harness::new();
            std::fs::create_dir_all(h.dir.path().join("shop1")).unwrap();
            h.orchestrator.start("shop1", None).unwrap();

            assert!(h.orchestrator.recover().await.unwrap().is_empty());
            h.instance("shop1", 1).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(h.factory.instances("shop1"), 1);
        }
    }

    #[tokio::test]
    async fn shutdown_destroys_every_client() {
        let h = Harness::new();
        let shop1 = h.ready("shop1").await;
        let shop2 = h.ready("shop2").await;
        std::fs::create_dir_all(h.dir.path().join("shop1")).unwrap();

        h.orchestrator.shutdown().await;

        assert!(shop1.is_destroyed());
        assert!(shop2.is_destroyed());
        assert!(h.orchestrator.list().is_empty());
        // Nothing comes back and credentials stay for the next boot.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.factory.total_instances(), 2);
        assert!(h.dir.path().join("shop1").is_dir());
    }

    #[tokio::test]
    async fn shutdown_stops_pending_recreation() {
        let h = Harness::new();
        let client = h.ready("shop1").await;
        client.set_destroy_delay(Duration::from_millis(200));
        client.emit(ClientEvent::Disconnected("phone offline".to_string())).await;
        h.wait_for_state("shop1", SessionState::Disconnected).await;

        h.orchestrator.shutdown().await;

        assert!(eventually(|| client.is_destroyed()).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.factory.instances("shop1"), 1);
        assert!(h.orchestrator.list().is_empty());
        assert_eq!(
            h.orchestrator.start("shop1", None).unwrap(),
            StartOutcome::ShuttingDown
        );
    }
}
