//! Session state, the lifecycle registry and the pairing-code cache.
//!
//! The registry is the only shared mutable structure in the crate. Request
//! handlers and per-session event tasks both go through it.

mod qr_cache;
mod registry;
mod state;

pub use qr_cache::{QrArtifact, QrCache, QrStatus};
pub use registry::{
    Claim, ClientView, Generation, Rejected, SessionRegistry, TeardownClaim, TeardownFinish,
    TeardownRefused,
};
pub use state::{AdminIdentity, SessionId, SessionSnapshot, SessionState, Trigger};
