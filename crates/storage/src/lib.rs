//! Local JSON-file storage satisfying the durable key/value contract that
//! capabilities depend on.
//!
//! Documents are namespaced by an optional scope identifier: `None` maps to a
//! `shared/` namespace, any other scope to its own directory. Capability
//! processes receive the storage root via `MEDULLA_STORAGE_DIR` and operate
//! on the same files.

use std::path::{Component, Path, PathBuf};

use {anyhow::Context, serde_json::Value, tracing::debug};

/// Shared-namespace directory used when no scope is given.
const SHARED_SCOPE: &str = "shared";

/// File-backed storage rooted at a single directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
    share: String,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            share: "memory".to_string(),
        }
    }

    /// Use a different document name than the default `memory`.
    pub fn with_share(root: impl Into<PathBuf>, share: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            share: share.into(),
        }
    }

    /// Default storage root under the data directory.
    pub fn default_root() -> PathBuf {
        medulla_config::data_dir().join("storage")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, scope: Option<&str>) -> anyhow::Result<PathBuf> {
        let ns = match scope {
            Some(s) => {
                validate_component(s)?;
                s
            },
            None => SHARED_SCOPE,
        };
        Ok(self.root.join(ns).join(format!("{}.json", self.share)))
    }

    /// Read the scoped document. Missing or unparseable files read as `{}`.
    pub fn read(&self, scope: Option<&str>) -> anyhow::Result<Value> {
        let path = self.document_path(scope)?;
        match std::fs::read_to_string(&path) {
            Ok(data) => Ok(serde_json::from_str(&data).unwrap_or_else(|_| Value::Object(Default::default()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Value::Object(Default::default()))
            },
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }

    /// Write the scoped document, creating the namespace directory if needed.
    pub fn write(&self, data: &Value, scope: Option<&str>) -> anyhow::Result<()> {
        let path = self.document_path(scope)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        std::fs::write(&path, serialized).with_context(|| format!("write {}", path.display()))?;
        debug!(path = %path.display(), "storage document written");
        Ok(())
    }

    // ── File-level operations ────────────────────────────────────────────

    pub fn read_file(&self, rel: &str) -> anyhow::Result<Option<String>> {
        let path = self.resolve(rel)?;
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }

    pub fn write_file(&self, rel: &str, content: &str) -> anyhow::Result<()> {
        let path = self.resolve(rel)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content).with_context(|| format!("write {}", path.display()))
    }

    pub fn list_files(&self, rel: &str) -> anyhow::Result<Vec<String>> {
        let path = self.resolve(rel)?;
        let mut names = Vec::new();
        let entries = match std::fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e).with_context(|| format!("list {}", path.display())),
        };
        for entry in entries {
            names.push(entry?.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    /// Delete a file; returns whether it existed.
    pub fn delete_file(&self, rel: &str) -> anyhow::Result<bool> {
        let path = self.resolve(rel)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("delete {}", path.display())),
        }
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.resolve(rel).map(|p| p.exists()).unwrap_or(false)
    }

    /// Resolve a relative path inside the root, rejecting traversal.
    fn resolve(&self, rel: &str) -> anyhow::Result<PathBuf> {
        let rel_path = Path::new(rel);
        for component in rel_path.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {},
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    anyhow::bail!("path escapes storage root: {rel}");
                },
            }
        }
        Ok(self.root.join(rel_path))
    }
}

fn validate_component(s: &str) -> anyhow::Result<()> {
    if s.is_empty() || s.contains(['/', '\\']) || s == ".." {
        anyhow::bail!("invalid scope identifier: {s:?}");
    }
    Ok(())
}
