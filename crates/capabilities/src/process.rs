//! Out-of-process capability programs.
//!
//! A capability file is a standalone program the host never evaluates in
//! process. The host speaks a fixed JSON contract with it:
//!
//! - `<interpreter> <file> --describe` → stdout JSON array of
//!   `{"name", "description", "parameters"}` declarations
//! - invoke: `{"capability": name, "arguments": {...}}` on stdin →
//!   `{"result": ...}` or `{"error": "..."}` on stdout
//! - non-zero exit or timeout → error (contained by the caller)
//!
//! Programs receive `MEDULLA_STORAGE_DIR` and `MEDULLA_DATA_DIR` in their
//! environment so they can reach shared state without linking against the
//! host.

use std::{collections::HashMap, path::PathBuf, time::Duration};

use {
    anyhow::{Context, Result, bail},
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    serde_json::Value,
    thiserror::Error,
    tokio::{io::AsyncWriteExt, process::Command},
    tracing::debug,
};

use crate::types::Capability;

/// Default wall-clock budget for a single capability spawn.
pub const DEFAULT_SPAWN_TIMEOUT: Duration = Duration::from_secs(30);

/// One capability declaration from a program's `--describe` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityDeclaration {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object")]
    pub parameters: Value,
}

fn empty_object() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// Why a `--describe` run produced no declarations.
#[derive(Debug, Error)]
pub enum DescribeError {
    #[error("capability program exited with code {code}: {stderr}")]
    Failed { code: i32, stderr: String },

    #[error("capability program timed out after {0:?}")]
    Timeout(Duration),

    #[error("describe output is not a declaration array: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("failed to run capability program: {0}")]
    Spawn(#[source] anyhow::Error),
}

/// Invoke response expected on a capability program's stdout.
#[derive(Debug, Deserialize)]
struct InvokeResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Ask a capability program to describe itself.
///
/// Runs `<interpreter> <program> --describe` and parses stdout as a JSON
/// array of [`CapabilityDeclaration`]s. The stderr of a failed run is kept
/// in the error so callers can inspect it.
pub async fn describe_program(
    interpreter: &str,
    program: &PathBuf,
    timeout: Duration,
    env: &HashMap<String, String>,
) -> std::result::Result<Vec<CapabilityDeclaration>, DescribeError> {
    debug!(program = %program.display(), interpreter, "describing capability program");

    let child = Command::new(interpreter)
        .arg(program)
        .arg("--describe")
        .envs(env)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {interpreter} {}", program.display()))
        .map_err(DescribeError::Spawn)?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| DescribeError::Timeout(timeout))?
        .context("capability program failed to complete")
        .map_err(DescribeError::Spawn)?;

    if !output.status.success() {
        return Err(DescribeError::Failed {
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(stdout.trim()).map_err(DescribeError::Parse)
}

/// A capability backed by a program on disk.
///
/// Each invocation spawns a fresh process; nothing is cached between calls.
pub struct ProcessCapability {
    name: String,
    description: String,
    parameters: Value,
    interpreter: String,
    program: PathBuf,
    timeout: Duration,
    env: HashMap<String, String>,
}

impl ProcessCapability {
    pub fn new(
        declaration: CapabilityDeclaration,
        interpreter: impl Into<String>,
        program: impl Into<PathBuf>,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            name: declaration.name,
            description: declaration.description,
            parameters: declaration.parameters,
            interpreter: interpreter.into(),
            program: program.into(),
            timeout: DEFAULT_SPAWN_TIMEOUT,
            env,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

#[async_trait]
impl Capability for ProcessCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.parameters.clone()
    }

    async fn execute(&self, args: Value) -> Result<Value> {
        let request = serde_json::to_string(&serde_json::json!({
            "capability": self.name,
            "arguments": args,
        }))
        .context("failed to serialize capability request")?;

        debug!(
            capability = %self.name,
            program = %self.program.display(),
            "spawning capability program"
        );

        let mut child = Command::new(&self.interpreter)
            .arg(&self.program)
            .envs(&self.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .with_context(|| {
                format!("failed to spawn {} {}", self.interpreter, self.program.display())
            })?;

        // Write the request to stdin (ignore broken pipe if the program
        // answers without reading it).
        if let Some(mut stdin) = child.stdin.take()
            && let Err(e) = stdin.write_all(request.as_bytes()).await
            && e.kind() != std::io::ErrorKind::BrokenPipe
        {
            return Err(e.into());
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .with_context(|| {
                format!("capability '{}' timed out after {:?}", self.name, self.timeout)
            })?
            .with_context(|| format!("capability '{}' failed to complete", self.name))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            bail!(
                "capability '{}' exited with code {}: {}",
                self.name,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let response: InvokeResponse = serde_json::from_str(stdout.trim()).with_context(|| {
            format!("capability '{}' produced non-JSON output", self.name)
        })?;

        if let Some(message) = response.error {
            bail!("{message}");
        }
        match response.result {
            Some(value) => Ok(value),
            None => bail!("capability '{}' returned neither result nor error", self.name),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_script(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    fn declaration(name: &str) -> CapabilityDeclaration {
        CapabilityDeclaration {
            name: name.into(),
            description: "test".into(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
        }
    }

    #[tokio::test]
    async fn describe_parses_declaration_array() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            &dir,
            "weather_cap.sh",
            r#"if [ "$1" = "--describe" ]; then
  echo '[{"name":"Weather","description":"Get weather","parameters":{"type":"object","properties":{"city":{"type":"string"}},"required":["city"]}}]'
  exit 0
fi
"#,
        );
        let decls = describe_program("sh", &script, Duration::from_secs(5), &HashMap::new())
            .await
            .unwrap();
        assert_eq!(decls.len(), 1);
        assert_eq!(decls[0].name, "Weather");
        assert_eq!(decls[0].parameters["required"][0], "city");
    }

    #[tokio::test]
    async fn describe_failure_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            &dir,
            "broken_cap.sh",
            "echo \"No module named 'pandas'\" >&2; exit 1\n",
        );
        let err = describe_program("sh", &script, Duration::from_secs(5), &HashMap::new())
            .await
            .unwrap_err();
        match err {
            DescribeError::Failed { code, stderr } => {
                assert_eq!(code, 1);
                assert!(stderr.contains("No module named 'pandas'"));
            },
            other => panic!("expected Failed, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn describe_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "slow_cap.sh", "sleep 60\n");
        let err = describe_program("sh", &script, Duration::from_millis(100), &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DescribeError::Timeout(_)));
    }

    #[tokio::test]
    async fn execute_returns_result_value() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            &dir,
            "echo_cap.sh",
            r#"cat > /dev/null
echo '{"result":"Sunny in Seattle, 72F"}'
"#,
        );
        let cap = ProcessCapability::new(declaration("Weather"), "sh", script, HashMap::new());
        let value = cap.execute(serde_json::json!({"city": "Seattle"})).await.unwrap();
        assert_eq!(value, serde_json::json!("Sunny in Seattle, 72F"));
    }

    #[tokio::test]
    async fn execute_receives_request_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            &dir,
            "stdin_cap.sh",
            r#"INPUT=$(cat)
CITY=$(echo "$INPUT" | grep -o '"city":"[^"]*"' | head -1 | cut -d'"' -f4)
echo "{\"result\":\"got $CITY\"}"
"#,
        );
        let cap = ProcessCapability::new(declaration("Weather"), "sh", script, HashMap::new());
        let value = cap.execute(serde_json::json!({"city": "Reykjavik"})).await.unwrap();
        assert_eq!(value, serde_json::json!("got Reykjavik"));
    }

    #[tokio::test]
    async fn execute_surfaces_declared_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            &dir,
            "err_cap.sh",
            r#"cat > /dev/null
echo '{"error":"city not found"}'
"#,
        );
        let cap = ProcessCapability::new(declaration("Weather"), "sh", script, HashMap::new());
        let err = cap.execute(serde_json::json!({"city": "Atlantis"})).await.unwrap_err();
        assert_eq!(err.to_string(), "city not found");
    }

    #[tokio::test]
    async fn execute_rejects_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "crash_cap.sh", "echo 'boom' >&2; exit 3\n");
        let cap = ProcessCapability::new(declaration("Crash"), "sh", script, HashMap::new());
        let err = cap.execute(serde_json::json!({})).await.unwrap_err();
        assert!(err.to_string().contains("code 3"));
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn execute_passes_environment() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            &dir,
            "env_cap.sh",
            r#"cat > /dev/null
echo "{\"result\":\"$MEDULLA_STORAGE_DIR\"}"
"#,
        );
        let mut env = HashMap::new();
        env.insert("MEDULLA_STORAGE_DIR".to_string(), "/tmp/medulla-store".to_string());
        let cap = ProcessCapability::new(declaration("Env"), "sh", script, env);
        let value = cap.execute(serde_json::json!({})).await.unwrap();
        assert_eq!(value, serde_json::json!("/tmp/medulla-store"));
    }

    #[tokio::test]
    async fn execute_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "hang_cap.sh", "sleep 60\n");
        let cap = ProcessCapability::new(declaration("Hang"), "sh", script, HashMap::new())
            .with_timeout(Duration::from_millis(100));
        let err = cap.execute(serde_json::json!({})).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
