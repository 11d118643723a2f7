//! Durable origin table.
//!
//! Connected origins and their enabled capability ids are written to
//! `origins.json` under the data directory so a restart can restore them.
//! Writes go through a temp file and rename so a crash never leaves a
//! half-written table.

use std::{collections::BTreeMap, path::PathBuf};

use {
    serde::{Deserialize, Serialize},
    tracing::warn,
};

use crate::error::{RegistryError, Result};

const FILE_VERSION: u32 = 1;

/// On-disk shape of the origin table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginsFile {
    pub version: u32,
    #[serde(default)]
    pub origins: BTreeMap<String, OriginRecord>,
}

impl Default for OriginsFile {
    fn default() -> Self {
        Self {
            version: FILE_VERSION,
            origins: BTreeMap::new(),
        }
    }
}

/// Persisted state for one connected origin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OriginRecord {
    #[serde(default)]
    pub enabled: Vec<String>,
}

/// Reads and writes the origin table.
pub struct OriginStore {
    path: PathBuf,
}

impl Default for OriginStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OriginStore {
    pub fn new() -> Self {
        Self {
            path: medulla_config::data_dir().join("origins.json"),
        }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the table. A missing or unreadable file yields the empty table
    /// so startup is never blocked by a damaged file.
    pub fn load(&self) -> OriginsFile {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return OriginsFile::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "could not read origin table");
                return OriginsFile::default();
            },
        };
        match serde_json::from_str(&raw) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "origin table is corrupt, starting empty");
                OriginsFile::default()
            },
        }
    }

    /// Persist the table atomically.
    pub fn save(&self, file: &OriginsFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RegistryError::Persist(e.into()))?;
        }
        let json =
            serde_json::to_string_pretty(file).map_err(|e| RegistryError::Persist(e.into()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| RegistryError::Persist(e.into()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| RegistryError::Persist(e.into()))?;
        Ok(())
    }
}
