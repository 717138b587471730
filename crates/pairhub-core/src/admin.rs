//! Admin identity resolution and publishing.
//!
//! After a session reaches READY the collaborator may still report an
//! incomplete identity for a short while, so it is polled under a bounded
//! [`RetryPolicy`]. A resolved identity is forwarded to the configured admin
//! endpoint as `{session_id, admin_number}`. Publishing is best-effort: one
//! attempt, failures are reported to the caller for logging only.

use crate::client::MessagingClient;
use crate::session::{AdminIdentity, SessionId};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    /// Doubles the delay after every attempt, capped at `max`.
    Exponential { max: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Delay to wait after the given 1-based attempt failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential { max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.delay.saturating_mul(factor).min(max)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(1),
            backoff: Backoff::Fixed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Resolved {
        identity: AdminIdentity,
        attempts: u32,
    },
    TimedOut {
        attempts: u32,
    },
}

/// Poll the collaborator until it reports a complete identity or the policy
/// is exhausted. Always makes at least one attempt.
pub async fn poll_identity(client: &dyn MessagingClient, policy: &RetryPolicy) -> PollOutcome {
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        match client.info().await {
            Ok(info) => {
                if let Some(identity) = info.into_identity() {
                    return PollOutcome::Resolved { identity, attempts: attempt };
                }
                log::debug!("Identity incomplete on attempt {attempt}/{max_attempts}");
            }
            Err(e) => log::debug!("Identity query failed on attempt {attempt}/{max_attempts}: {e}"),
        }

        if attempt < max_attempts {
            tokio::time::sleep(policy.delay_after(attempt)).await;
        }
    }

    PollOutcome::TimedOut {
        attempts: max_attempts,
    }
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Admin endpoint responded with status {0}")]
    Status(u16),

    #[error("Admin endpoint unreachable: {0}")]
    Network(String),

    #[error("Publish task failed: {0}")]
    Join(String),
}

#[derive(Debug, Serialize)]
struct AdminRecord {
    session_id: String,
    admin_number: String,
}

/// Forwards resolved identities to the external admin-number endpoint.
#[derive(Debug, Clone, Default)]
pub struct AdminPublisher {
    endpoint: Option<String>,
}

impl AdminPublisher {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            endpoint: endpoint.filter(|url| !url.trim().is_empty()),
        }
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// POST `{session_id, admin_number}` once.
    ///
    /// Returns `Ok(false)` when no endpoint is configured.
    pub async fn publish(
        &self,
        session_id: &SessionId,
        identity: &AdminIdentity,
    ) -> Result<bool, PublishError> {
        let Some(url) = self.endpoint.clone() else {
            return Ok(false);
        };
        let record = AdminRecord {
            session_id: session_id.to_string(),
            admin_number: identity.account_id.clone(),
        };

        // ureq is blocking; keep it off the async workers.
        let result = tokio::task::spawn_blocking(move || {
            ureq::post(&url)
                .timeout(PUBLISH_TIMEOUT)
                .send_json(&record)
                .map(|_| ())
        })
        .await
        .map_err(|e| PublishError::Join(e.to_string()))?;

        match result {
            Ok(()) => Ok(true),
            Err(ureq::Error::Status(code, _)) => Err(PublishError::Status(code)),
            Err(ureq::Error::Transport(transport)) => {
                Err(PublishError::Network(transport.to_string()))
            }
        }
    }
}
