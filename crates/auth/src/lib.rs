//! Credential lifecycle: device-flow login, long-lived credential storage,
//! and the cached short-lived session token used for backend chat calls.

pub mod error;
pub mod manager;
pub mod store;

pub use {
    error::AuthError,
    manager::{
        AuthEndpoints, CredentialManager, DeviceAuthorization, PollOutcome, SessionToken,
    },
    store::CredentialStore,
};
