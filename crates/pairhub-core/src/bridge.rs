//! Process-backed messaging client.
//!
//! Each session runs one bridge process that owns the actual messaging
//! connection. The bridge is spawned as
//! `{program} {args..} --session <id> --data-dir <credential dir>` and speaks
//! newline-delimited JSON:
//!
//! - stdout carries lifecycle messages tagged by `type`
//!   (`qr`, `authenticated`, `ready`, `disconnected`, `auth_failure`) and
//!   `response` messages answering requests by `id`.
//! - stdin receives requests `{"id":N,"method":"info"|"send"|"destroy",...}`.
//! - stderr is forwarded to the log at warn level.
//!
//! A bridge that exits without being asked to is reported as a disconnect.
//!
//! On Unix every bridge leads its own process group. Teardown closes stdin,
//! gives the bridge a grace period to exit and then kills the whole group,
//! so helpers it started (a browser, typically) go down with it. `destroy`
//! returns only once the bridge has been reaped.

use crate::client::{
    ClientConnection, ClientError, ClientEvent, ClientFactory, ClientInfo, MessagingClient,
    EVENT_CHANNEL_CAPACITY,
};
use crate::logging::{log_line, open_log_file, LogHandle};
use crate::session::SessionId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(3);
/// How long a killed bridge may take to be reaped.
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Reason reported when the bridge process goes away on its own.
pub const EXIT_REASON: &str = "bridge exited";

/// How to launch bridge processes.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub program: String,
    /// Extra arguments placed before the session arguments.
    pub args: Vec<String>,
    /// Directory for per-session traffic logs. Disabled when `None`.
    pub log_dir: Option<PathBuf>,
    pub request_timeout: Duration,
    /// Time a bridge gets to exit on its own after `destroy` before it is killed.
    pub shutdown_grace: Duration,
}

impl BridgeConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            log_dir: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeMessage {
    Qr {
        image: String,
    },
    Authenticated,
    Ready,
    Disconnected {
        #[serde(default)]
        reason: String,
    },
    AuthFailure {
        #[serde(default)]
        reason: String,
    },
    Response {
        id: u64,
        #[serde(flatten)]
        reply: Reply,
    },
}

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    result: serde_json::Value,
    #[serde(default)]
    error: Option<String>,
}

impl Reply {
    fn into_result(self) -> Result<serde_json::Value, ClientError> {
        if self.ok {
            Ok(self.result)
        } else {
            Err(ClientError::Transport(
                self.error.unwrap_or_else(|| "request failed".to_string()),
            ))
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "method", rename_all = "snake_case")]
enum Request<'a> {
    Info,
    Send { to: &'a str, text: &'a str },
    Destroy,
}

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    id: u64,
    #[serde(flatten)]
    request: Request<'a>,
}

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// A running bridge process bound to one session.
pub struct BridgeClient {
    session_id: SessionId,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    pending: PendingReplies,
    next_id: AtomicU64,
    destroying: Arc<AtomicBool>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    /// Flips to true once the process has been reaped.
    exited: watch::Receiver<bool>,
    log: LogHandle,
    request_timeout: Duration,
    shutdown_grace: Duration,
}

impl BridgeClient {
    fn start(
        session_id: SessionId,
        mut child: Child,
        log: LogHandle,
        config: &BridgeConfig,
    ) -> Result<ClientConnection, ClientError> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClientError::Spawn("Failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClientError::Spawn("Failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ClientError::Spawn("Failed to capture stderr".to_string()))?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let destroying = Arc::new(AtomicBool::new(false));

        tokio::spawn(forward_stderr(session_id.clone(), stderr, log.clone()));
        tokio::spawn(
            StdoutReader {
                session_id: session_id.clone(),
                events: events_tx,
                pending: Arc::clone(&pending),
                destroying: Arc::clone(&destroying),
                exited: exited_tx,
                log: log.clone(),
            }
            .run(child, stdout, kill_rx),
        );

        let client = Arc::new(Self {
            session_id,
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            pending,
            next_id: AtomicU64::new(1),
            destroying,
            kill: Mutex::new(Some(kill_tx)),
            exited: exited_rx,
            log,
            request_timeout: config.request_timeout,
            shutdown_grace: config.shutdown_grace,
        });

        Ok(ClientConnection {
            client,
            events: events_rx,
        })
    }

    async fn write_line(&self, line: &str) -> Result<(), ClientError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(ClientError::Closed)?;
        log_line(&self.log, "OUT", line);
        stdin
            .write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| ClientError::Transport(format!("Failed to write to bridge: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| ClientError::Transport(format!("Failed to flush bridge stdin: {e}")))
    }

    async fn request(&self, request: Request<'_>) -> Result<serde_json::Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = serde_json::to_string(&Envelope { id, request })
            .map_err(|e| ClientError::Protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);

        if let Err(e) = self.write_line(&line).await {
            self.forget(id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => reply.into_result(),
            // Reader dropped the sender: the process is gone.
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.forget(id);
                Err(ClientError::Transport(format!(
                    "request {id} timed out after {:?}",
                    self.request_timeout
                )))
            }
        }
    }

    fn forget(&self, id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn kill(&self) {
        let sender = self
            .kill
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }

    /// True when the process is reaped within `limit`.
    async fn wait_for_exit(&self, limit: Duration) -> bool {
        let mut exited = self.exited.clone();
        // An error means the reader is gone, and it only stops after reaping.
        let reaped = tokio::time::timeout(limit, exited.wait_for(|done| *done))
            .await
            .is_ok();
        reaped
    }
}

#[async_trait]
impl MessagingClient for BridgeClient {
    async fn info(&self) -> Result<ClientInfo, ClientError> {
        let value = self.request(Request::Info).await?;
        if value.is_null() {
            return Ok(ClientInfo::default());
        }
        serde_json::from_value(value).map_err(|e| ClientError::Protocol(e.to_string()))
    }

    async fn send_message(&self, destination: &str, text: &str) -> Result<(), ClientError> {
        self.request(Request::Send {
            to: destination,
            text,
        })
        .await
        .map(|_| ())
    }

    async fn destroy(&self) -> Result<(), ClientError> {
        if self.destroying.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let result = self.request(Request::Destroy).await;
        self.stdin.lock().await.take();

        if !self.wait_for_exit(self.shutdown_grace).await {
            log::info!(
                "[{}] Bridge still running after {:?}; killing it",
                self.session_id,
                self.shutdown_grace
            );
            self.kill();
            if !self.wait_for_exit(KILL_TIMEOUT).await {
                return Err(ClientError::Teardown(format!(
                    "bridge did not exit within {:?} of being killed",
                    KILL_TIMEOUT
                )));
            }
        }

        match result {
            Ok(_) | Err(ClientError::Closed) => Ok(()),
            Err(e) => Err(ClientError::Teardown(e.to_string())),
        }
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.destroying.store(true, Ordering::SeqCst);
        self.kill();
    }
}

struct StdoutReader {
    session_id: SessionId,
    events: mpsc::Sender<ClientEvent>,
    pending: PendingReplies,
    destroying: Arc<AtomicBool>,
    exited: watch::Sender<bool>,
    log: LogHandle,
}

impl StdoutReader {
    async fn run(self, mut child: Child, stdout: ChildStdout, mut kill_rx: oneshot::Receiver<()>) {
        let mut lines = BufReader::new(stdout).lines();
        let mut killed = false;

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.handle_line(&line).await,
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("[{}] Failed to read bridge stdout: {}", self.session_id, e);
                        break;
                    }
                },
                _ = &mut kill_rx, if !killed => {
                    killed = true;
                    self.terminate(&mut child);
                }
            }
        }

        let status = if killed {
            child.wait().await
        } else {
            tokio::select! {
                status = child.wait() => status,
                _ = &mut kill_rx => {
                    self.terminate(&mut child);
                    child.wait().await
                }
            }
        };
        match status {
            Ok(status) => log::info!("[{}] Bridge exited: {}", self.session_id, status),
            Err(e) => log::warn!("[{}] Failed to reap bridge: {}", self.session_id, e),
        }
        let _ = self.exited.send(true);

        // Outstanding requests resolve to Closed.
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        if !self.destroying.load(Ordering::SeqCst) {
            let _ = self
                .events
                .send(ClientEvent::Disconnected(EXIT_REASON.to_string()))
                .await;
        }
    }

    /// Kill the bridge and everything in its process group.
    fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                // The bridge leads its own group, so the group id is its pid.
                let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
                if rc != 0 {
                    log::debug!(
                        "[{}] Failed to kill process group {}: {}",
                        self.session_id,
                        pid,
                        std::io::Error::last_os_error()
                    );
                }
            }
        }
        if let Err(e) = child.start_kill() {
            log::debug!("[{}] Bridge already gone: {}", self.session_id, e);
        }
    }

    async fn handle_line(&self, line: &str) {
        log_line(&self.log, "IN", line);

        let message = match serde_json::from_str::<BridgeMessage>(line) {
            Ok(message) => message,
            Err(e) => {
                log::debug!("[{}] Ignoring bridge output ({}): {}", self.session_id, e, line);
                return;
            }
        };

        let event = match message {
            BridgeMessage::Response { id, reply } => {
                let waiter = self
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(reply);
                    }
                    None => log::debug!("[{}] Response for unknown request {}", self.session_id, id),
                }
                return;
            }
            BridgeMessage::Qr { image } => ClientEvent::Qr(image),
            BridgeMessage::Authenticated => ClientEvent::Authenticated,
            BridgeMessage::Ready => ClientEvent::Ready,
            BridgeMessage::Disconnected { reason } => ClientEvent::Disconnected(reason),
            BridgeMessage::AuthFailure { reason } => ClientEvent::AuthFailure(reason),
        };

        if self.events.send(event).await.is_err() {
            log::debug!("[{}] Event receiver gone", self.session_id);
        }
    }
}

async fn forward_stderr(session_id: SessionId, stderr: ChildStderr, log: LogHandle) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        log_line(&log, "ERR", &line);
        log::warn!("[{}] bridge: {}", session_id, line);
    }
}

/// Spawns one bridge process per session.
pub struct BridgeClientFactory {
    config: BridgeConfig,
}

impl BridgeClientFactory {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ClientFactory for BridgeClientFactory {
    async fn create(
        &self,
        session_id: &SessionId,
        credential_dir: &Path,
    ) -> Result<ClientConnection, ClientError> {
        tokio::fs::create_dir_all(credential_dir).await.map_err(|e| {
            ClientError::Spawn(format!(
                "Cannot create credential directory {}: {e}",
                credential_dir.display()
            ))
        })?;

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .arg("--session")
            .arg(session_id.as_str())
            .arg("--data-dir")
            .arg(credential_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .map_err(|e| ClientError::Spawn(format!("{}: {e}", self.config.program)))?;
        log::info!(
            "[{}] Spawned bridge {} (pid {:?})",
            session_id,
            self.config.program,
            child.id()
        );

        let log = open_log_file(self.config.log_dir.as_deref(), session_id);
        BridgeClient::start(session_id.clone(), child, log, &self.config)
    }
}
