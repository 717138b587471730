//! pairhub - multi-session messaging gateway daemon.
//!
//! Recovers the sessions found under the sessions directory, serves the HTTP
//! API and destroys every session client on Ctrl+C.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use pairhub_core::admin::{Backoff, RetryPolicy};
use pairhub_core::bridge::{BridgeClientFactory, BridgeConfig};
use pairhub_core::{OrchestratorConfig, RecreatePolicy, SessionOrchestrator};
use pairhub_http::SharedState;

/// pairhub daemon - one messaging account connection per session id
#[derive(Parser, Debug)]
#[command(name = "pairhub")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to bind the HTTP server to
    #[arg(long, env = "PAIRHUB_HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port for the HTTP server
    #[arg(long, env = "PAIRHUB_PORT", default_value_t = 3000)]
    port: u16,

    /// Directory holding one credential directory per session
    #[arg(long, env = "PAIRHUB_SESSIONS_DIR", default_value = "sessions")]
    sessions_dir: PathBuf,

    /// URL receiving `{session_id, admin_number}` once a session's identity is known
    #[arg(long, env = "PAIRHUB_ADMIN_ENDPOINT")]
    admin_endpoint: Option<String>,

    /// Helper program speaking the bridge protocol
    #[arg(long, env = "PAIRHUB_BRIDGE_PROGRAM", default_value = "pairhub-bridge")]
    bridge_program: String,

    /// Extra argument passed to the bridge program (repeatable)
    #[arg(
        long = "bridge-arg",
        env = "PAIRHUB_BRIDGE_ARGS",
        value_delimiter = ',',
        allow_hyphen_values = true
    )]
    bridge_args: Vec<String>,

    /// Append per-session bridge traffic to `{log_dir}/{session_id}.log`
    #[arg(long, env = "PAIRHUB_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Identity lookups after a session becomes ready
    #[arg(long, env = "PAIRHUB_IDENTITY_ATTEMPTS", default_value_t = 5)]
    identity_attempts: u32,

    /// Delay between identity lookups, in milliseconds
    #[arg(long, env = "PAIRHUB_IDENTITY_DELAY_MS", default_value_t = 1000)]
    identity_delay_ms: u64,

    /// Double the identity lookup delay after every attempt, up to this many milliseconds
    #[arg(long, env = "PAIRHUB_IDENTITY_MAX_DELAY_MS")]
    identity_max_delay_ms: Option<u64>,

    /// Leave a session absent after the client disconnects
    #[arg(long, env = "PAIRHUB_NO_RECREATE_ON_DISCONNECT")]
    no_recreate_on_disconnect: bool,

    /// Start a fresh pairing after an authentication failure
    #[arg(long, env = "PAIRHUB_RECREATE_ON_AUTH_FAILURE")]
    recreate_on_auth_failure: bool,

    /// Skip restoring sessions from the sessions directory at startup
    #[arg(long, env = "PAIRHUB_NO_RECOVER")]
    no_recover: bool,
}

impl Args {
    fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    fn bridge_config(&self) -> BridgeConfig {
        let config = BridgeConfig::new(&self.bridge_program).args(self.bridge_args.clone());
        match &self.log_dir {
            Some(dir) => config.log_dir(dir),
            None => config,
        }
    }

    fn orchestrator_config(&self) -> OrchestratorConfig {
        let backoff = match self.identity_max_delay_ms {
            Some(max) => Backoff::Exponential {
                max: Duration::from_millis(max),
            },
            None => Backoff::Fixed,
        };
        OrchestratorConfig {
            sessions_root: self.sessions_dir.clone(),
            admin_endpoint: self.admin_endpoint.clone(),
            recreate: RecreatePolicy {
                on_disconnect: !self.no_recreate_on_disconnect,
                on_auth_failure: self.recreate_on_auth_failure,
            },
            identity_poll: RetryPolicy {
                max_attempts: self.identity_attempts.max(1),
                delay: Duration::from_millis(self.identity_delay_ms),
                backoff,
            },
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    log::debug!("Starting with {:?}", args);

    let factory = Arc::new(BridgeClientFactory::new(args.bridge_config()));
    let orchestrator = SessionOrchestrator::builder(factory)
        .config(args.orchestrator_config())
        .build();

    if args.no_recover {
        log::info!("Session recovery disabled");
    } else {
        match orchestrator.recover().await {
            Ok(ids) => {
                for id in ids {
                    log::info!("[{}] Restoring session", id);
                }
            }
            Err(e) => log::error!("Session recovery failed: {}", e),
        }
    }

    let state = Arc::new(SharedState::new(orchestrator.clone()));
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
        }
    };

    if let Err(e) = pairhub_http::serve(state, args.addr(), shutdown).await {
        log::error!("HTTP server error: {}", e);
    }

    orchestrator.shutdown().await;
    log::info!("pairhub stopped");
}
