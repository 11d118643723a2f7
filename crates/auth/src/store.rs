use std::path::PathBuf;

use {
    secrecy::{ExposeSecret, Secret},
    tracing::{debug, info, warn},
};

use crate::error::Result;

/// File-based storage for the single long-lived credential at
/// `<data_dir>/credential`.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self {
            path: medulla_config::data_dir().join("credential"),
        }
    }

    /// Create a store at a specific path (useful for testing).
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn load(&self) -> Option<Secret<String>> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "credential file not found");
                return None;
            },
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "credential file read failed");
                return None;
            },
        };
        let token = data.trim();
        if token.is_empty() {
            return None;
        }
        Some(Secret::new(token.to_string()))
    }

    pub fn save(&self, credential: &Secret<String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, credential.expose_secret())?;

        // Readable by the host's file permissions only.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!(path = %self.path.display(), "credential saved");
        Ok(())
    }

    pub fn delete(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}
