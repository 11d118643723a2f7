use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(
        "not authenticated — no credential configured, cached, or available from the gh CLI"
    )]
    NotAuthenticated,

    #[error("no long-lived credential available for token exchange")]
    CredentialMissing,

    #[error("credential lacks the required entitlement")]
    Unauthenticated,

    #[error("device authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("no device authorization in progress")]
    NoPendingAuthorization,

    #[error("token exchange failed: HTTP {status}: {body}")]
    Exchange { status: u16, body: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AuthError>;
