//! Directory resolution and environment-driven settings.
//!
//! Directories resolve in order: programmatic override (`set_data_dir` /
//! `set_config_dir`), `MEDULLA_DATA_DIR` / `MEDULLA_CONFIG_DIR`, then the
//! platform defaults (`~/.medulla`, `~/.config/medulla`).

use std::{
    path::PathBuf,
    sync::{OnceLock, RwLock},
};

fn data_dir_override() -> &'static RwLock<Option<PathBuf>> {
    static OVERRIDE: OnceLock<RwLock<Option<PathBuf>>> = OnceLock::new();
    OVERRIDE.get_or_init(|| RwLock::new(None))
}

fn config_dir_override() -> &'static RwLock<Option<PathBuf>> {
    static OVERRIDE: OnceLock<RwLock<Option<PathBuf>>> = OnceLock::new();
    OVERRIDE.get_or_init(|| RwLock::new(None))
}

/// Override the data directory for this process (used by tests).
pub fn set_data_dir(path: PathBuf) {
    if let Ok(mut guard) = data_dir_override().write() {
        *guard = Some(path);
    }
}

/// Clear a previous [`set_data_dir`] override.
pub fn clear_data_dir() {
    if let Ok(mut guard) = data_dir_override().write() {
        *guard = None;
    }
}

/// Override the config directory for this process (used by tests).
pub fn set_config_dir(path: PathBuf) {
    if let Ok(mut guard) = config_dir_override().write() {
        *guard = Some(path);
    }
}

/// Clear a previous [`set_config_dir`] override.
pub fn clear_config_dir() {
    if let Ok(mut guard) = config_dir_override().write() {
        *guard = None;
    }
}

/// Returns the data directory (`~/.medulla` by default).
///
/// Holds persisted state owned by this process: the cached credential,
/// the origin table, downloaded remote capabilities, and local storage.
pub fn data_dir() -> PathBuf {
    if let Ok(guard) = data_dir_override().read()
        && let Some(path) = guard.as_ref()
    {
        return path.clone();
    }
    if let Some(dir) = std::env::var_os("MEDULLA_DATA_DIR") {
        return PathBuf::from(dir);
    }
    directories::BaseDirs::new()
        .map(|d| d.home_dir().join(".medulla"))
        .unwrap_or_else(|| PathBuf::from(".medulla"))
}

/// Returns the config directory (`~/.config/medulla` by default).
pub fn config_dir() -> PathBuf {
    if let Ok(guard) = config_dir_override().read()
        && let Some(path) = guard.as_ref()
    {
        return path.clone();
    }
    if let Some(dir) = std::env::var_os("MEDULLA_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    directories::ProjectDirs::from("", "", "medulla")
        .map(|d| d.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".config/medulla"))
}

/// Runtime settings read from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Chat model id sent to the backend.
    pub model: String,
    /// Directory tree scanned for local capability files.
    pub capabilities_dir: PathBuf,
    /// Interpreter used to run capability programs.
    pub interpreter: String,
    /// Command prefix used to install a missing package, split on whitespace.
    pub install_command: Vec<String>,
}

impl Settings {
    pub fn from_env() -> Self {
        let model =
            std::env::var("MEDULLA_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let capabilities_dir = std::env::var_os("MEDULLA_CAPABILITIES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir().join("capabilities"));
        let interpreter = std::env::var("MEDULLA_INTERPRETER")
            .unwrap_or_else(|_| DEFAULT_INTERPRETER.to_string());
        let install_command = std::env::var("MEDULLA_INSTALL_COMMAND")
            .map(|raw| raw.split_whitespace().map(str::to_string).collect())
            .unwrap_or_else(|_| default_install_command());
        Self {
            model,
            capabilities_dir,
            interpreter,
            install_command,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            capabilities_dir: data_dir().join("capabilities"),
            interpreter: DEFAULT_INTERPRETER.to_string(),
            install_command: default_install_command(),
        }
    }
}

const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_INTERPRETER: &str = "python3";

fn default_install_command() -> Vec<String> {
    ["python3", "-m", "pip", "install", "-q"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
