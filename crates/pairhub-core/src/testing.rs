//! Scriptable in-memory collaborator for tests.
//!
//! [`FakeClientFactory`] records every instance it creates so tests can
//! assert on instance counts, inject lifecycle events and inspect sends.

use crate::client::{
    ClientConnection, ClientError, ClientEvent, ClientFactory, ClientInfo, MessagingClient,
    EVENT_CHANNEL_CAPACITY,
};
use crate::session::SessionId;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub struct FakeClient {
    session_id: SessionId,
    info: Mutex<ClientInfo>,
    info_calls: AtomicUsize,
    sent: Mutex<Vec<(String, String)>>,
    fail_send: AtomicBool,
    fail_destroy: AtomicBool,
    destroy_delay: Mutex<Duration>,
    destroyed: AtomicBool,
    events: Mutex<Option<mpsc::Sender<ClientEvent>>>,
}

impl FakeClient {
    pub fn new(session_id: SessionId) -> (Arc<Self>, mpsc::Receiver<ClientEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let client = Arc::new(Self {
            session_id,
            info: Mutex::new(ClientInfo::default()),
            info_calls: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            fail_send: AtomicBool::new(false),
            fail_destroy: AtomicBool::new(false),
            destroy_delay: Mutex::new(Duration::ZERO),
            destroyed: AtomicBool::new(false),
            events: Mutex::new(Some(tx)),
        });
        (client, rx)
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Deliver a lifecycle event. Returns false once the stream is closed.
    pub async fn emit(&self, event: ClientEvent) -> bool {
        let sender = self.events.lock().unwrap().clone();
        match sender {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Close the event stream without an explicit signal.
    pub fn close(&self) {
        self.events.lock().unwrap().take();
    }

    pub fn set_info(&self, info: ClientInfo) {
        *self.info.lock().unwrap() = info;
    }

    pub fn info_calls(&self) -> usize {
        self.info_calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    pub fn fail_destroy(&self, fail: bool) {
        self.fail_destroy.store(fail, Ordering::SeqCst);
    }

    /// Make `destroy` take this long, like a browser that is slow to exit.
    pub fn set_destroy_delay(&self, delay: Duration) {
        *self.destroy_delay.lock().unwrap() = delay;
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessagingClient for FakeClient {
    async fn info(&self) -> Result<ClientInfo, ClientError> {
        self.info_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.info.lock().unwrap().clone())
    }

    async fn send_message(&self, destination: &str, text: &str) -> Result<(), ClientError> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(ClientError::Transport("send rejected".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((destination.to_string(), text.to_string()));
        Ok(())
    }

    async fn destroy(&self) -> Result<(), ClientError> {
        let delay = *self.destroy_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.destroyed.store(true, Ordering::SeqCst);
        self.close();
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(ClientError::Teardown("browser did not exit".to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeClientFactory {
    instances: Mutex<Vec<(PathBuf, Arc<FakeClient>)>>,
    create_delay: Mutex<Duration>,
    fail_next: AtomicBool,
    initial_info: Mutex<ClientInfo>,
}

impl FakeClientFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Slow down creation to widen race windows.
    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = delay;
    }

    pub fn fail_next_create(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Info reported by instances created from now on.
    pub fn set_initial_info(&self, info: ClientInfo) {
        *self.initial_info.lock().unwrap() = info;
    }

    /// Number of instances ever created for `session_id`.
    pub fn instances(&self, session_id: &str) -> usize {
        self.instances
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, client)| client.session_id().as_str() == session_id)
            .count()
    }

    pub fn total_instances(&self) -> usize {
        self.instances.lock().unwrap().len()
    }

    /// Most recent instance for `session_id`.
    pub fn latest(&self, session_id: &str) -> Option<Arc<FakeClient>> {
        self.instances
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(_, client)| client.session_id().as_str() == session_id)
            .map(|(_, client)| Arc::clone(client))
    }

    pub fn credential_dir(&self, session_id: &str) -> Option<PathBuf> {
        self.instances
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(_, client)| client.session_id().as_str() == session_id)
            .map(|(dir, _)| dir.clone())
    }
}

#[async_trait]
impl ClientFactory for FakeClientFactory {
    async fn create(
        &self,
        session_id: &SessionId,
        credential_dir: &Path,
    ) -> Result<ClientConnection, ClientError> {
        let delay = *self.create_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ClientError::Spawn("browser failed to launch".to_string()));
        }

        let (client, events) = FakeClient::new(session_id.clone());
        client.set_info(self.initial_info.lock().unwrap().clone());
        self.instances
            .lock()
            .unwrap()
            .push((credential_dir.to_path_buf(), Arc::clone(&client)));

        Ok(ClientConnection { client, events })
    }
}

/// Poll `check` until it holds or roughly two seconds pass.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
