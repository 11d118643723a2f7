use std::{collections::HashMap, sync::Arc};

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tracing::warn,
};

/// A named, schema-described unit the orchestration loop may invoke.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Unique key among all active capabilities.
    fn name(&self) -> &str;
    /// Natural-language description the backend uses to choose it.
    fn description(&self) -> &str;
    /// JSON schema of accepted named arguments.
    fn parameters_schema(&self) -> serde_json::Value;
    async fn execute(&self, args: serde_json::Value) -> anyhow::Result<serde_json::Value>;
}

/// A set of active capabilities keyed by name.
///
/// Values are `Arc<dyn Capability>` so snapshots are cheap to clone: an
/// in-flight turn keeps the set it started with even while another request
/// installs or uninstalls capabilities.
#[derive(Clone, Default)]
pub struct CapabilitySet {
    caps: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a capability. On a name collision the new instance wins.
    pub fn insert(&mut self, cap: Arc<dyn Capability>) {
        let name = cap.name().to_string();
        if self.caps.insert(name.clone(), cap).is_some() {
            warn!(capability = %name, "capability name collision, last loaded wins");
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.caps.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&dyn Capability> {
        self.caps.get(name).map(|c| c.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.caps.contains_key(name)
    }

    /// Merge another set into this one; the other set's entries win.
    pub fn merge(&mut self, other: CapabilitySet) {
        for cap in other.caps.into_values() {
            self.insert(cap);
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.caps.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.caps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }

    /// Capability menu offered to the backend: `{name, description, parameters}`.
    pub fn schemas(&self) -> Vec<serde_json::Value> {
        self.caps
            .values()
            .map(|c| {
                serde_json::json!({
                    "name": c.name(),
                    "description": c.description(),
                    "parameters": c.parameters_schema(),
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = self.names();
        names.sort();
        f.debug_struct("CapabilitySet").field("names", &names).finish()
    }
}


/// An origin's declared list of available capabilities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OriginManifest {
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub capabilities: Vec<ManifestEntry>,
}

impl OriginManifest {
    pub fn find(&self, id: &str) -> Option<&ManifestEntry> {
        self.capabilities.iter().find(|e| e.id == id)
    }
}

/// One fetchable capability in an origin's manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub filename: String,
    /// Direct download URL; derived from the origin when absent.
    #[serde(default)]
    pub url: Option<String>,
}

/// Caller-facing view of one manifest capability with its enabled flag.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilitySummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub enabled: bool,
}
