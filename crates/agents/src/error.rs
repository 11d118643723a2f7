use {medulla_auth::AuthError, thiserror::Error};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("chat backend returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("chat backend unreachable: {0}")]
    Unavailable(#[source] anyhow::Error),

    #[error("malformed backend response: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, ChatError>;
