//! Loading capability files from disk.
//!
//! A capability file is any program whose file stem ends in `_cap`
//! (`weather_cap.py`). Loading asks the file to describe itself; when the
//! describe run fails because a package is missing, the loader installs the
//! package and retries exactly once. A file that still fails contributes
//! nothing: declarations are never partially loaded.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
    time::Duration,
};

use {
    anyhow::{Context, bail},
    async_trait::async_trait,
    medulla_config::Settings,
    regex::Regex,
    tokio::process::Command,
    tracing::{debug, info, warn},
};

use crate::{
    error::{RegistryError, Result},
    process::{CapabilityDeclaration, DescribeError, ProcessCapability, describe_program},
    types::{Capability, CapabilitySet},
};

/// Declarations some runtimes emit for their abstract base; never loadable.
const PLACEHOLDER_NAME: &str = "BasicCapability";

const INSTALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Installs a missing package into the capability interpreter's environment.
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    async fn install(&self, package: &str) -> anyhow::Result<()>;
}

/// Runs a configured command with the package name appended.
pub struct CommandInstaller {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandInstaller {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            timeout: INSTALL_TIMEOUT,
        }
    }
}

#[async_trait]
impl PackageInstaller for CommandInstaller {
    async fn install(&self, package: &str) -> anyhow::Result<()> {
        let Some((program, args)) = self.command.split_first() else {
            bail!("install command is empty");
        };
        info!(package, command = %self.command.join(" "), "installing missing package");

        let child = Command::new(program)
            .args(args)
            .arg(package)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn install command: {program}"))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .with_context(|| format!("install of '{package}' timed out after {:?}", self.timeout))?
            .with_context(|| format!("install of '{package}' failed to complete"))?;

        if !output.status.success() {
            bail!(
                "install of '{package}' exited with code {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Extract the installable package behind a missing-module failure.
///
/// Matches the interpreter's `No module named 'name'` message, keeps the
/// top-level segment of a dotted module path, and maps import names whose
/// distribution is published under a different name.
pub fn missing_package(stderr: &str) -> Option<String> {
    static MISSING_MODULE: OnceLock<Regex> = OnceLock::new();
    let re = MISSING_MODULE.get_or_init(|| {
        #[allow(clippy::expect_used)]
        Regex::new(r"No module named '([^']+)'").expect("static regex")
    });
    let captured = re.captures(stderr)?.get(1)?.as_str();
    let module = captured.split('.').next()?;
    let package = match module {
        "PIL" => "Pillow",
        "bs4" => "beautifulsoup4",
        "cv2" => "opencv-python",
        "sklearn" => "scikit-learn",
        "yaml" => "pyyaml",
        "docx" => "python-docx",
        "pptx" => "python-pptx",
        "dotenv" => "python-dotenv",
        other => other,
    };
    Some(package.to_string())
}

/// True for files the discovery scan treats as capability programs.
pub fn is_capability_file(path: &Path) -> bool {
    path.is_file()
        && path
            .file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|stem| stem.ends_with("_cap"))
}

/// Loads capability files into live [`ProcessCapability`] instances.
pub struct Loader {
    interpreter: String,
    installer: Arc<dyn PackageInstaller>,
    spawn_timeout: Duration,
    child_env: HashMap<String, String>,
}

impl Loader {
    pub fn new(settings: &Settings) -> Self {
        Self {
            interpreter: settings.interpreter.clone(),
            installer: Arc::new(CommandInstaller::new(settings.install_command.clone())),
            spawn_timeout: crate::process::DEFAULT_SPAWN_TIMEOUT,
            child_env: default_child_env(),
        }
    }

    pub fn with_installer(mut self, installer: Arc<dyn PackageInstaller>) -> Self {
        self.installer = installer;
        self
    }

    pub fn with_spawn_timeout(mut self, timeout: Duration) -> Self {
        self.spawn_timeout = timeout;
        self
    }

    pub fn with_child_env(mut self, env: HashMap<String, String>) -> Self {
        self.child_env = env;
        self
    }

    /// Load every capability a file declares.
    ///
    /// When the describe run reports a missing package the loader installs
    /// it and retries, once. Any remaining failure fails the whole file.
    pub async fn load_file(&self, path: &Path) -> Result<Vec<Arc<dyn Capability>>> {
        let declarations = match self.describe(path).await {
            Ok(declarations) => declarations,
            Err(DescribeError::Failed { code, stderr }) => {
                let Some(package) = missing_package(&stderr) else {
                    return Err(load_failure(path, DescribeError::Failed { code, stderr }));
                };
                info!(
                    path = %path.display(),
                    package,
                    "capability file needs a missing package, installing and retrying"
                );
                self.installer
                    .install(&package)
                    .await
                    .map_err(|e| load_failure_any(path, e))?;
                self.describe(path).await.map_err(|e| load_failure(path, e))?
            },
            Err(e) => return Err(load_failure(path, e)),
        };

        let mut capabilities: Vec<Arc<dyn Capability>> = Vec::new();
        for declaration in declarations {
            if !usable(&declaration) {
                debug!(path = %path.display(), name = %declaration.name, "skipping declaration");
                continue;
            }
            capabilities.push(Arc::new(
                ProcessCapability::new(
                    declaration,
                    self.interpreter.clone(),
                    path.to_path_buf(),
                    self.child_env.clone(),
                )
                .with_timeout(self.spawn_timeout),
            ));
        }
        Ok(capabilities)
    }

    /// Scan a directory tree for capability files and load each one.
    ///
    /// A missing directory yields an empty set. A file that fails to load is
    /// logged and skipped so one broken capability cannot block the rest.
    pub async fn load_dir(&self, dir: &Path) -> Result<CapabilitySet> {
        let mut set = CapabilitySet::new();
        if !dir.is_dir() {
            debug!(dir = %dir.display(), "capability directory does not exist");
            return Ok(set);
        }
        for path in capability_files(dir)? {
            match self.load_file(&path).await {
                Ok(capabilities) => {
                    for cap in capabilities {
                        set.insert(cap);
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to load capability file");
                },
            }
        }
        info!(dir = %dir.display(), count = set.len(), "loaded local capabilities");
        Ok(set)
    }

    async fn describe(
        &self,
        path: &Path,
    ) -> std::result::Result<Vec<CapabilityDeclaration>, DescribeError> {
        describe_program(
            &self.interpreter,
            &path.to_path_buf(),
            self.spawn_timeout,
            &self.child_env,
        )
        .await
    }
}

/// Environment handed to every capability program.
pub fn default_child_env() -> HashMap<String, String> {
    let data = medulla_config::data_dir();
    HashMap::from([
        (
            "MEDULLA_STORAGE_DIR".to_string(),
            data.join("storage").to_string_lossy().into_owned(),
        ),
        ("MEDULLA_DATA_DIR".to_string(), data.to_string_lossy().into_owned()),
    ])
}

fn usable(declaration: &CapabilityDeclaration) -> bool {
    !declaration.name.is_empty() && declaration.name != PLACEHOLDER_NAME
}

fn capability_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if is_capability_file(&path) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

fn load_failure(path: &Path, source: DescribeError) -> RegistryError {
    RegistryError::LoadFailure {
        path: path.to_path_buf(),
        source: source.into(),
    }
}

fn load_failure_any(path: &Path, source: anyhow::Error) -> RegistryError {
    RegistryError::LoadFailure {
        path: path.to_path_buf(),
        source,
    }
}
