use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("'{0}' is not a valid origin, expected owner/repo")]
    InvalidOrigin(String),

    #[error("origin '{0}' is not connected")]
    NotConnected(String),

    #[error("capability '{id}' not found in manifest for '{origin}'")]
    UnknownCapability { origin: String, id: String },

    #[error("failed to load capability source {path}: {source}")]
    LoadFailure {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("could not fetch manifest for '{origin}': {source}")]
    ManifestUnavailable {
        origin: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("could not fetch source for '{id}' from '{origin}': {source}")]
    SourceUnavailable {
        origin: String,
        id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to persist origin table: {0}")]
    Persist(#[source] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RegistryError>;
