//! The capability registry.
//!
//! Tracks the local capability directory, connected remote origins, and
//! which remote capabilities are enabled. [`CapabilityRegistry::active`]
//! returns an owned snapshot, so an in-flight turn keeps the capabilities it
//! started with while connect, toggle, and disconnect run concurrently.
//!
//! Every mutation persists the origin table; [`CapabilityRegistry::restore`]
//! replays it at startup, best effort per origin, without rewriting the
//! table.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use {
    medulla_config::Settings,
    tokio::sync::RwLock,
    tracing::{info, warn},
};

use crate::{
    error::{RegistryError, Result},
    loader::Loader,
    origin::{OriginClient, normalize_origin},
    persist::{OriginRecord, OriginStore, OriginsFile},
    types::{Capability, CapabilitySet, CapabilitySummary, ManifestEntry, OriginManifest},
};

/// Result of a capability enable/disable request.
#[derive(Debug)]
pub enum ToggleOutcome {
    /// Enabled; lists the capability names the file declared.
    Enabled { capabilities: Vec<String> },
    Disabled,
    /// The capability was already in the requested state.
    Unchanged,
}

/// One connected origin and its capability listing.
#[derive(Debug, Clone)]
pub struct OriginStatus {
    pub origin: String,
    pub capabilities: Vec<CapabilitySummary>,
}

#[derive(Default)]
struct ConnectedOrigin {
    manifest: OriginManifest,
    enabled: HashSet<String>,
    /// Capability names loaded per enabled manifest id.
    installed: HashMap<String, Vec<String>>,
}

impl ConnectedOrigin {
    fn summaries(&self) -> Vec<CapabilitySummary> {
        self.manifest
            .capabilities
            .iter()
            .map(|entry| CapabilitySummary {
                id: entry.id.clone(),
                name: entry.name.clone(),
                description: entry.description.clone(),
                enabled: self.enabled.contains(&entry.id),
            })
            .collect()
    }
}

pub struct CapabilityRegistry {
    loader: Loader,
    client: OriginClient,
    store: OriginStore,
    capabilities_dir: PathBuf,
    /// Where downloaded remote capability files live, one subdirectory per
    /// origin.
    remote_dir: PathBuf,
    /// Memoized local scan; `None` until first use or after a reload.
    local: RwLock<Option<CapabilitySet>>,
    remote: RwLock<CapabilitySet>,
    origins: RwLock<HashMap<String, ConnectedOrigin>>,
}

impl CapabilityRegistry {
    pub fn new(settings: &Settings) -> Self {
        Self {
            loader: Loader::new(settings),
            client: OriginClient::new(),
            store: OriginStore::new(),
            capabilities_dir: settings.capabilities_dir.clone(),
            remote_dir: medulla_config::data_dir().join("remote"),
            local: RwLock::new(None),
            remote: RwLock::new(CapabilitySet::new()),
            origins: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_loader(mut self, loader: Loader) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_client(mut self, client: OriginClient) -> Self {
        self.client = client;
        self
    }

    pub fn with_store(mut self, store: OriginStore) -> Self {
        self.store = store;
        self
    }

    pub fn with_capabilities_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.capabilities_dir = dir.into();
        self
    }

    pub fn with_remote_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.remote_dir = dir.into();
        self
    }

    /// Snapshot of every active capability: the local directory scan merged
    /// with enabled remote capabilities. Remote entries win name collisions.
    pub async fn active(&self) -> CapabilitySet {
        let mut set = self.local_set().await;
        set.merge(self.remote.read().await.clone());
        set
    }

    /// Drop the memoized local scan and rescan the capability directory.
    pub async fn reload(&self) -> usize {
        let set = self.scan_local().await;
        let count = set.len();
        *self.local.write().await = Some(set);
        count
    }

    /// Connect an origin (or refresh one already connected).
    ///
    /// Fetches the manifest, records the origin, persists the table, and
    /// returns the capability listing. Nothing is enabled by connecting.
    pub async fn connect_origin(&self, spec: &str) -> Result<Vec<CapabilitySummary>> {
        let origin = normalize_origin(spec)
            .ok_or_else(|| RegistryError::InvalidOrigin(spec.to_string()))?;
        let manifest = self.client.fetch_manifest(&origin).await.map_err(|e| {
            RegistryError::ManifestUnavailable {
                origin: origin.clone(),
                source: e,
            }
        })?;

        let mut origins = self.origins.write().await;
        let state = origins.entry(origin.clone()).or_default();

        // On refresh, drop enabled entries the manifest no longer lists.
        let vanished: Vec<String> = state
            .enabled
            .iter()
            .filter(|id| manifest.find(id).is_none())
            .cloned()
            .collect();
        if !vanished.is_empty() {
            let mut remote = self.remote.write().await;
            for id in &vanished {
                state.enabled.remove(id);
                for name in state.installed.remove(id).unwrap_or_default() {
                    remote.remove(&name);
                }
            }
            warn!(origin = %origin, dropped = vanished.len(), "manifest refresh removed enabled capabilities");
        }

        state.manifest = manifest;
        let summaries = state.summaries();
        info!(origin = %origin, capabilities = summaries.len(), "connected origin");
        self.persist(&origins)?;
        Ok(summaries)
    }

    /// Disconnect an origin, unloading its capabilities and deleting its
    /// downloaded files.
    pub async fn disconnect_origin(&self, origin: &str) -> Result<()> {
        let mut origins = self.origins.write().await;
        let state = origins
            .remove(origin)
            .ok_or_else(|| RegistryError::NotConnected(origin.to_string()))?;

        {
            let mut remote = self.remote.write().await;
            for names in state.installed.values() {
                for name in names {
                    remote.remove(name);
                }
            }
        }

        let dir = self.origin_dir(origin);
        if dir.is_dir()
            && let Err(e) = std::fs::remove_dir_all(&dir)
        {
            warn!(origin = %origin, error = %e, "could not remove downloaded capability files");
        }

        info!(origin = %origin, "disconnected origin");
        self.persist(&origins)?;
        Ok(())
    }

    /// Enable or disable one capability on a connected origin.
    ///
    /// Enabling downloads the file, loads it, and merges its declarations
    /// into the active set. Disabling removes them and deletes the file.
    /// Either way the origin table is persisted.
    pub async fn set_capability_enabled(
        &self,
        origin: &str,
        id: &str,
        enabled: bool,
    ) -> Result<ToggleOutcome> {
        let mut origins = self.origins.write().await;
        let state = origins
            .get_mut(origin)
            .ok_or_else(|| RegistryError::NotConnected(origin.to_string()))?;
        let entry = state
            .manifest
            .find(id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownCapability {
                origin: origin.to_string(),
                id: id.to_string(),
            })?;

        if enabled == state.enabled.contains(id) {
            return Ok(ToggleOutcome::Unchanged);
        }

        let outcome = if enabled {
            let loaded = self.install(origin, &entry).await?;
            let names: Vec<String> = loaded.iter().map(|c| c.name().to_string()).collect();
            {
                let mut remote = self.remote.write().await;
                for cap in loaded {
                    remote.insert(cap);
                }
            }
            state.installed.insert(id.to_string(), names.clone());
            state.enabled.insert(id.to_string());
            info!(origin = %origin, id, capabilities = ?names, "enabled capability");
            ToggleOutcome::Enabled {
                capabilities: names,
            }
        } else {
            let names = state.installed.remove(id).unwrap_or_default();
            {
                let mut remote = self.remote.write().await;
                for name in &names {
                    remote.remove(name);
                }
            }
            state.enabled.remove(id);
            if let Err(e) = std::fs::remove_file(self.install_path(origin, &entry))
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(origin = %origin, id, error = %e, "could not remove capability file");
            }
            info!(origin = %origin, id, "disabled capability");
            ToggleOutcome::Disabled
        };

        self.persist(&origins)?;
        Ok(outcome)
    }

    /// Connected origins with their capability listings, sorted by origin.
    pub async fn list_origins(&self) -> Vec<OriginStatus> {
        let origins = self.origins.read().await;
        let mut statuses: Vec<OriginStatus> = origins
            .iter()
            .map(|(origin, state)| OriginStatus {
                origin: origin.clone(),
                capabilities: state.summaries(),
            })
            .collect();
        statuses.sort_by(|a, b| a.origin.cmp(&b.origin));
        statuses
    }

    /// Replay the persisted origin table at startup.
    ///
    /// Best effort per origin: an unreachable origin or a capability that
    /// fails to load is logged and skipped, and the table is left untouched
    /// so a later restart can try again. Returns the number of capabilities
    /// brought back.
    pub async fn restore(&self) -> usize {
        let table = self.store.load();
        let mut restored = 0;
        for (origin, record) in table.origins {
            let manifest = match self.client.fetch_manifest(&origin).await {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!(origin = %origin, error = %e, "could not restore origin");
                    continue;
                },
            };
            let mut state = ConnectedOrigin {
                manifest,
                ..Default::default()
            };
            for id in record.enabled {
                // Keep the id enabled even when the load fails so the next
                // persist does not silently drop it.
                state.enabled.insert(id.clone());
                let Some(entry) = state.manifest.find(&id).cloned() else {
                    warn!(origin = %origin, id, "enabled capability missing from manifest");
                    continue;
                };
                match self.install(&origin, &entry).await {
                    Ok(loaded) => {
                        let names: Vec<String> =
                            loaded.iter().map(|c| c.name().to_string()).collect();
                        restored += names.len();
                        let mut remote = self.remote.write().await;
                        for cap in loaded {
                            remote.insert(cap);
                        }
                        state.installed.insert(id, names);
                    },
                    Err(e) => {
                        warn!(origin = %origin, id, error = %e, "could not restore capability");
                    },
                }
            }
            self.origins.write().await.insert(origin, state);
        }
        info!(restored, "restored remote capabilities");
        restored
    }

    /// Download, write, and load one manifest entry.
    async fn install(
        &self,
        origin: &str,
        entry: &ManifestEntry,
    ) -> Result<Vec<Arc<dyn Capability>>> {
        let source = self.client.fetch_source(origin, entry).await.map_err(|e| {
            RegistryError::SourceUnavailable {
                origin: origin.to_string(),
                id: entry.id.clone(),
                source: e,
            }
        })?;
        let path = self.install_path(origin, entry);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, source)?;
        self.loader.load_file(&path).await
    }

    async fn local_set(&self) -> CapabilitySet {
        if let Some(set) = self.local.read().await.clone() {
            return set;
        }
        let mut guard = self.local.write().await;
        if let Some(set) = guard.as_ref() {
            return set.clone();
        }
        let set = self.scan_local().await;
        *guard = Some(set.clone());
        set
    }

    async fn scan_local(&self) -> CapabilitySet {
        match self.loader.load_dir(&self.capabilities_dir).await {
            Ok(set) => set,
            Err(e) => {
                warn!(dir = %self.capabilities_dir.display(), error = %e, "local capability scan failed");
                CapabilitySet::new()
            },
        }
    }

    fn origin_dir(&self, origin: &str) -> PathBuf {
        self.remote_dir.join(origin.replace('/', "__"))
    }

    /// Downloaded file location. Only the file name component of the
    /// manifest's filename is used, so a manifest cannot write outside the
    /// origin's directory.
    fn install_path(&self, origin: &str, entry: &ManifestEntry) -> PathBuf {
        let file_name = Path::new(&entry.filename)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.py", entry.id));
        self.origin_dir(origin).join(file_name)
    }

    fn persist(&self, origins: &HashMap<String, ConnectedOrigin>) -> Result<()> {
        let mut file = OriginsFile::default();
        for (origin, state) in origins {
            let mut enabled: Vec<String> = state.enabled.iter().cloned().collect();
            enabled.sort();
            file.origins.insert(origin.clone(), OriginRecord { enabled });
        }
        self.store.save(&file)
    }
}
