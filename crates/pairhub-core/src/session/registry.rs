//! SessionRegistry - single source of truth for session lifecycle state.
//!
//! Entries, their collaborator handles, cached identities and QR artifacts
//! all live behind one lock, so every public operation is atomic with
//! respect to the others. Entries carry a [`Generation`]; operations coming
//! from a collaborator instance name the generation they belong to and are
//! rejected once that instance has been superseded or torn down.

use super::qr_cache::{QrArtifact, QrCache, QrStatus};
use super::state::{AdminIdentity, SessionId, SessionSnapshot, SessionState, Trigger};
use crate::client::MessagingClient;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Identifies one collaborator lifetime under a session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Generation(u64);

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Result of an insert-if-absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The caller owns creation of this generation.
    Created(Generation),
    /// An entry already exists; nothing was changed.
    Exists(SessionState),
    /// The registry has been drained for shutdown.
    Closed,
}

/// Why a lifecycle update was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    /// The entry is gone or belongs to a newer generation.
    Stale,
    /// The trigger has no effect in the current state.
    Ignored(SessionState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownRefused {
    Missing,
    /// Another caller already claimed the teardown.
    InProgress(SessionState),
    /// The collaborator is still being created; there is nothing to destroy yet.
    Starting,
}

/// What became of an entry handed to [`SessionRegistry::finish_teardown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownFinish {
    Removed,
    /// The entry is gone or belongs to a newer generation.
    Stale,
    /// An outside disconnect arrived while the teardown was running. The
    /// entry stays until the caller has erased the credentials and calls
    /// again with `credentials_erased` set.
    LogoutRequested,
}

/// Everything the tearing-down caller needs once the entry is marked terminal.
pub struct TeardownClaim {
    pub generation: Generation,
    pub previous: SessionState,
    pub handle: Option<Arc<dyn MessagingClient>>,
    pub admin_number: Option<String>,
}

/// Read-only view used by request handlers that talk to the collaborator.
pub struct ClientView {
    pub state: SessionState,
    pub handle: Option<Arc<dyn MessagingClient>>,
    pub identity: Option<AdminIdentity>,
}

struct SessionEntry {
    generation: Generation,
    state: SessionState,
    handle: Option<Arc<dyn MessagingClient>>,
    admin_identity: Option<AdminIdentity>,
    admin_number: Option<String>,
    created_at: DateTime<Utc>,
    /// Set when an explicit disconnect lands on an entry that is already
    /// being torn down.
    logout_requested: bool,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<SessionId, SessionEntry>,
    qr: QrCache,
    closed: bool,
}

impl RegistryInner {
    fn live_entry(
        &mut self,
        session_id: &SessionId,
        generation: Generation,
    ) -> Result<&mut SessionEntry, Rejected> {
        self.entries
            .get_mut(session_id)
            .filter(|entry| entry.generation == generation)
            .ok_or(Rejected::Stale)
    }

    fn snapshot(&self, session_id: &SessionId, entry: &SessionEntry) -> SessionSnapshot {
        SessionSnapshot {
            session_id: session_id.clone(),
            state: entry.state,
            admin_number: entry.admin_number.clone(),
            identity: entry.admin_identity.clone(),
            has_qr: self.qr.get(session_id).is_some(),
            created_at: entry.created_at,
        }
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
    next_generation: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a CREATING entry unless one already exists.
    ///
    /// Entries mid-teardown count as existing: their collaborator still owns
    /// the credential directory. Nothing is created once [`drain`](Self::drain)
    /// has run.
    pub fn claim(&self, session_id: &SessionId, admin_number: Option<String>) -> Claim {
        let mut inner = self.lock();
        if inner.closed {
            return Claim::Closed;
        }
        if let Some(entry) = inner.entries.get(session_id) {
            return Claim::Exists(entry.state);
        }

        let generation = Generation(self.next_generation.fetch_add(1, Ordering::Relaxed));
        inner.entries.insert(
            session_id.clone(),
            SessionEntry {
                generation,
                state: SessionState::Creating,
                handle: None,
                admin_identity: None,
                admin_number,
                created_at: Utc::now(),
                logout_requested: false,
            },
        );
        Claim::Created(generation)
    }

    /// Attach the collaborator created for `generation`.
    ///
    /// Hands the client back when the entry was superseded or torn down in
    /// the meantime; the caller must destroy it.
    pub fn attach(
        &self,
        session_id: &SessionId,
        generation: Generation,
        handle: Arc<dyn MessagingClient>,
    ) -> Result<(), Arc<dyn MessagingClient>> {
        let mut inner = self.lock();
        match inner.live_entry(session_id, generation) {
            Ok(entry) if !entry.state.is_terminal() => {
                entry.handle = Some(handle);
                Ok(())
            }
            _ => Err(handle),
        }
    }

    /// Drop an entry whose collaborator could not be created.
    pub fn abandon(&self, session_id: &SessionId, generation: Generation) -> bool {
        let mut inner = self.lock();
        if inner.live_entry(session_id, generation).is_err() {
            return false;
        }
        inner.entries.remove(session_id);
        inner.qr.clear(session_id);
        true
    }

    /// Store a new pairing image and move to QR_PENDING.
    pub fn record_qr(
        &self,
        session_id: &SessionId,
        generation: Generation,
        image_data: String,
    ) -> Result<SessionState, Rejected> {
        let mut inner = self.lock();
        let entry = inner.live_entry(session_id, generation)?;
        let next = entry
            .state
            .next(Trigger::Qr)
            .ok_or(Rejected::Ignored(entry.state))?;
        entry.state = next;
        inner.qr.put(session_id.clone(), image_data);
        Ok(next)
    }

    /// The pairing code has been consumed; retire it.
    pub fn mark_authenticated(
        &self,
        session_id: &SessionId,
        generation: Generation,
    ) -> Result<SessionState, Rejected> {
        self.advance(session_id, generation, Trigger::Authenticated)
    }

    pub fn mark_ready(
        &self,
        session_id: &SessionId,
        generation: Generation,
    ) -> Result<SessionState, Rejected> {
        self.advance(session_id, generation, Trigger::Ready)
    }

    fn advance(
        &self,
        session_id: &SessionId,
        generation: Generation,
        trigger: Trigger,
    ) -> Result<SessionState, Rejected> {
        let mut inner = self.lock();
        let entry = inner.live_entry(session_id, generation)?;
        let next = entry
            .state
            .next(trigger)
            .filter(|state| !state.is_terminal())
            .ok_or(Rejected::Ignored(entry.state))?;
        entry.state = next;
        inner.qr.clear(session_id);
        Ok(next)
    }

    /// Cache the identity read after READY. Set at most once per generation.
    pub fn record_identity(
        &self,
        session_id: &SessionId,
        generation: Generation,
        identity: AdminIdentity,
    ) -> bool {
        let mut inner = self.lock();
        match inner.live_entry(session_id, generation) {
            Ok(entry)
                if entry.state == SessionState::Ready && entry.admin_identity.is_none() =>
            {
                entry.admin_identity = Some(identity);
                true
            }
            _ => false,
        }
    }

    /// Mark the entry terminal and take ownership of its collaborator.
    ///
    /// `expected` restricts the teardown to one generation; `None` tears down
    /// whatever is registered (explicit disconnect requests). Outside requests
    /// are refused until the collaborator has been attached, so a replacement
    /// never overlaps an instance that is still starting. An outside request
    /// that finds a teardown already running marks the entry so that teardown
    /// erases the credentials too. The QR artifact and cached identity are
    /// cleared in the same step.
    pub fn begin_teardown(
        &self,
        session_id: &SessionId,
        expected: Option<Generation>,
        trigger: Trigger,
    ) -> Result<TeardownClaim, TeardownRefused> {
        let mut inner = self.lock();
        let entry = inner
            .entries
            .get_mut(session_id)
            .filter(|entry| expected.map_or(true, |generation| entry.generation == generation))
            .ok_or(TeardownRefused::Missing)?;

        let previous = entry.state;
        let Some(next) = previous.next(trigger).filter(|state| state.is_terminal()) else {
            if expected.is_none() {
                entry.logout_requested = true;
            }
            return Err(TeardownRefused::InProgress(previous));
        };
        if expected.is_none() && entry.handle.is_none() {
            return Err(TeardownRefused::Starting);
        }

        entry.state = next;
        entry.admin_identity = None;
        let claim = TeardownClaim {
            generation: entry.generation,
            previous,
            handle: entry.handle.take(),
            admin_number: entry.admin_number.clone(),
        };
        inner.qr.clear(session_id);
        Ok(claim)
    }

    /// Remove an entry once its teardown has completed.
    ///
    /// Refuses with [`TeardownFinish::LogoutRequested`] while an outside
    /// disconnect is waiting for credentials the caller has not erased.
    pub fn finish_teardown(
        &self,
        session_id: &SessionId,
        generation: Generation,
        credentials_erased: bool,
    ) -> TeardownFinish {
        let mut inner = self.lock();
        match inner.live_entry(session_id, generation) {
            Err(_) => return TeardownFinish::Stale,
            Ok(entry) if entry.logout_requested && !credentials_erased => {
                return TeardownFinish::LogoutRequested
            }
            Ok(_) => {}
        }
        inner.entries.remove(session_id);
        inner.qr.clear(session_id);
        TeardownFinish::Removed
    }

    pub fn qr_status(&self, session_id: &SessionId) -> QrStatus {
        let inner = self.lock();
        if let Some(artifact) = inner.qr.get(session_id) {
            return QrStatus::Scan {
                image: artifact.image_data.clone(),
            };
        }
        match inner.entries.get(session_id) {
            Some(entry) if entry.state == SessionState::Ready => QrStatus::Connected,
            Some(entry) if !entry.state.is_terminal() => QrStatus::Initializing,
            _ => QrStatus::NotFound,
        }
    }

    pub fn qr(&self, session_id: &SessionId) -> Option<QrArtifact> {
        self.lock().qr.get(session_id).cloned()
    }

    pub fn client(&self, session_id: &SessionId) -> Option<ClientView> {
        let inner = self.lock();
        inner.entries.get(session_id).map(|entry| ClientView {
            state: entry.state,
            handle: entry.handle.clone(),
            identity: entry.admin_identity.clone(),
        })
    }

    pub fn snapshot(&self, session_id: &SessionId) -> Option<SessionSnapshot> {
        let inner = self.lock();
        inner
            .entries
            .get(session_id)
            .map(|entry| inner.snapshot(session_id, entry))
    }

    /// All entries, ordered by session id.
    pub fn list(&self) -> Vec<SessionSnapshot> {
        let inner = self.lock();
        let mut snapshots: Vec<_> = inner
            .entries
            .iter()
            .map(|(id, entry)| inner.snapshot(id, entry))
            .collect();
        snapshots.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        snapshots
    }

    /// Empty the registry for shutdown, returning the handles that still need
    /// destroying. Later claims are refused.
    pub fn drain(&self) -> Vec<(SessionId, Arc<dyn MessagingClient>)> {
        let mut inner = self.lock();
        inner.closed = true;
        inner.qr.clear_all();
        inner
            .entries
            .drain()
            .filter_map(|(id, entry)| entry.handle.map(|handle| (id, handle)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
