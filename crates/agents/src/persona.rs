//! System persona.
//!
//! The system prompt comes from `persona.md` in the config directory; a
//! missing or empty file falls back to the default. Read per turn so edits
//! apply without a restart.

use std::path::Path;

use tracing::debug;

pub const DEFAULT_PERSONA: &str = "You are a helpful AI assistant.";

const PERSONA_FILE: &str = "persona.md";

/// Load the persona from the config directory.
pub fn load_persona() -> String {
    persona_from(&medulla_config::config_dir())
}

/// Load the persona from an explicit directory.
pub fn persona_from(dir: &Path) -> String {
    let path = dir.join(PERSONA_FILE);
    match std::fs::read_to_string(&path) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().to_string(),
        Ok(_) => DEFAULT_PERSONA.to_string(),
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %path.display(), error = %e, "could not read persona file");
            }
            DEFAULT_PERSONA.to_string()
        },
    }
}
