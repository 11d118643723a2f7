//! Device-flow login and session-token exchange.
//!
//! The long-lived credential resolves from the environment, the credential
//! store, or the `gh` CLI. It is exchanged for a short-lived session token
//! which is cached process-wide and refreshed when a caller observes it
//! within 60 seconds of expiry. Device-flow polling is driven entirely by
//! external calls — one network poll per [`CredentialManager::poll_device_authorization`].

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use {
    secrecy::{ExposeSecret, Secret},
    tokio::sync::Mutex,
    tracing::{debug, info, warn},
};

use crate::{
    error::{AuthError, Result},
    store::CredentialStore,
};

/// GitHub OAuth app client ID for Copilot (VS Code's public client ID).
const CLIENT_ID: &str = "Iv1.b507a08c87ecfe98";

const DEVICE_CODE_URL: &str = "https://github.com/login/device/code";
const DEVICE_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const SESSION_TOKEN_URL: &str = "https://api.github.com/copilot_internal/v2/token";
const DEFAULT_API_ENDPOINT: &str = "https://api.individual.githubcopilot.com";

/// The chat API rejects requests without `Editor-Version`.
const EDITOR_VERSION: &str = "vscode/1.96.2";

/// Tokens this close to expiry are refreshed instead of returned.
const EXPIRY_SKEW_SECS: u64 = 60;

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);
const DEVICE_TIMEOUT: Duration = Duration::from_secs(10);
const HOST_AGENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Endpoints used by the credential manager, overridable for tests.
#[derive(Debug, Clone)]
pub struct AuthEndpoints {
    pub device_code_url: String,
    pub device_token_url: String,
    pub session_token_url: String,
}

impl Default for AuthEndpoints {
    fn default() -> Self {
        Self {
            device_code_url: DEVICE_CODE_URL.to_string(),
            device_token_url: DEVICE_TOKEN_URL.to_string(),
            session_token_url: SESSION_TOKEN_URL.to_string(),
        }
    }
}

/// Short-lived credential for backend chat calls.
#[derive(Clone)]
pub struct SessionToken {
    pub token: Secret<String>,
    pub endpoint: String,
    /// Unix timestamp when the token expires.
    pub expires_at: u64,
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionToken")
            .field("token", &"[REDACTED]")
            .field("endpoint", &self.endpoint)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// User-facing half of a started device authorization.
#[derive(Debug, Clone)]
pub struct DeviceAuthorization {
    pub user_code: String,
    pub verification_uri: String,
    /// Seconds the caller should wait between polls.
    pub interval: u64,
}

/// Outcome of a single device-authorization poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Pending,
    Complete,
}

/// In-progress device authorization. At most one exists; starting a new
/// login replaces it.
struct PendingAuthorization {
    device_code: String,
    expires_at: u64,
}

// ── Wire formats ─────────────────────────────────────────────────────────────

#[derive(Debug, serde::Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    #[serde(default = "default_interval")]
    interval: u64,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_interval() -> u64 {
    5
}

fn default_expires_in() -> u64 {
    900
}

#[derive(Debug, serde::Deserialize)]
struct DeviceTokenResponse {
    access_token: Option<String>,
    error: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct SessionTokenResponse {
    token: Option<String>,
    expires_at: Option<u64>,
    #[serde(default)]
    endpoints: SessionEndpoints,
}

#[derive(Debug, Default, serde::Deserialize)]
struct SessionEndpoints {
    api: Option<String>,
}

// ── Manager ──────────────────────────────────────────────────────────────────

/// Owns the device-authorization flow and the cached session token.
pub struct CredentialManager {
    client: reqwest::Client,
    endpoints: AuthEndpoints,
    store: CredentialStore,
    /// Credential supplied by the environment, captured at construction.
    configured: Option<Secret<String>>,
    /// Whether to fall back to the host's `gh` CLI.
    host_agent: bool,
    session: Mutex<Option<SessionToken>>,
    pending: Mutex<Option<PendingAuthorization>>,
}

impl CredentialManager {
    pub fn new() -> Self {
        Self::with_endpoints(AuthEndpoints::default())
    }

    pub fn with_endpoints(endpoints: AuthEndpoints) -> Self {
        let configured = std::env::var("MEDULLA_GITHUB_TOKEN")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .map(Secret::new);
        Self {
            client: reqwest::Client::new(),
            endpoints,
            store: CredentialStore::new(),
            configured,
            host_agent: true,
            session: Mutex::new(None),
            pending: Mutex::new(None),
        }
    }

    /// Replace the credential store (useful for testing).
    pub fn with_store(mut self, store: CredentialStore) -> Self {
        self.store = store;
        self
    }

    /// Override the environment-supplied credential.
    pub fn with_configured_credential(mut self, credential: Option<String>) -> Self {
        self.configured = credential.map(Secret::new);
        self
    }

    /// Disable the `gh` CLI fallback (useful for testing).
    pub fn without_host_agent(mut self) -> Self {
        self.host_agent = false;
        self
    }

    // ── Long-lived credential ────────────────────────────────────────────

    /// Resolve the long-lived credential: explicit configuration, then the
    /// persisted file, then the host's `gh` CLI.
    pub async fn long_lived_credential(&self) -> Result<Secret<String>> {
        if let Some(configured) = &self.configured {
            return Ok(configured.clone());
        }
        if let Some(stored) = self.store.load() {
            return Ok(stored);
        }
        if self.host_agent
            && let Some(token) = host_agent_credential().await
        {
            return Ok(token);
        }
        Err(AuthError::NotAuthenticated)
    }

    // ── Session token ────────────────────────────────────────────────────

    /// Return the cached session token, or exchange the long-lived
    /// credential for a fresh one.
    ///
    /// The cache lock is held across the exchange so concurrent callers
    /// observe a consistent token/endpoint pair and a stale cache triggers
    /// exactly one refresh.
    pub async fn session_token(&self) -> Result<SessionToken> {
        let mut session = self.session.lock().await;

        if let Some(token) = session.as_ref()
            && unix_now() + EXPIRY_SKEW_SECS < token.expires_at
        {
            return Ok(token.clone());
        }

        let credential = match self.long_lived_credential().await {
            Ok(c) => c,
            Err(AuthError::NotAuthenticated) => return Err(AuthError::CredentialMissing),
            Err(e) => return Err(e),
        };

        let token = self.exchange(&credential).await?;
        info!(
            endpoint = %token.endpoint,
            expires_in = token.expires_at.saturating_sub(unix_now()),
            "session token refreshed"
        );
        *session = Some(token.clone());
        Ok(token)
    }

    async fn exchange(&self, credential: &Secret<String>) -> Result<SessionToken> {
        // Device-flow tokens (`ghu_` prefix) use "token" auth, others "Bearer".
        let prefix = if credential.expose_secret().starts_with("ghu_") {
            "token"
        } else {
            "Bearer"
        };

        let resp = self
            .client
            .get(&self.endpoints.session_token_url)
            .header(
                "Authorization",
                format!("{prefix} {}", credential.expose_secret()),
            )
            .header("Accept", "application/json")
            .header("Editor-Version", EDITOR_VERSION)
            .timeout(EXCHANGE_TIMEOUT)
            .send()
            .await?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::NOT_FOUND
        {
            return Err(AuthError::Unauthenticated);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::Exchange {
                status: status.as_u16(),
                body,
            });
        }

        let body: SessionTokenResponse = resp.json().await?;
        let Some(token) = body.token else {
            return Err(AuthError::Unauthenticated);
        };

        Ok(SessionToken {
            token: Secret::new(token),
            endpoint: body
                .endpoints
                .api
                .unwrap_or_else(|| DEFAULT_API_ENDPOINT.to_string()),
            expires_at: body.expires_at.unwrap_or_else(|| unix_now() + 600),
        })
    }

    // ── Device authorization ─────────────────────────────────────────────

    /// Begin a device authorization, replacing any prior pending flow.
    pub async fn start_device_authorization(&self) -> Result<DeviceAuthorization> {
        let resp = self
            .client
            .post(&self.endpoints.device_code_url)
            .header("Accept", "application/json")
            .form(&[("client_id", CLIENT_ID), ("scope", "read:user")])
            .timeout(DEVICE_TIMEOUT)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::Exchange {
                status: status.as_u16(),
                body,
            });
        }

        let body: DeviceCodeResponse = resp.json().await?;
        debug!(user_code = %body.user_code, "device authorization started");

        let mut pending = self.pending.lock().await;
        if pending.is_some() {
            warn!("abandoning previous pending device authorization");
        }
        *pending = Some(PendingAuthorization {
            device_code: body.device_code,
            expires_at: unix_now() + body.expires_in,
        });

        Ok(DeviceAuthorization {
            user_code: body.user_code,
            verification_uri: body.verification_uri,
            interval: body.interval,
        })
    }

    /// Perform one poll of the pending device authorization. The caller is
    /// responsible for re-polling at the advertised interval.
    pub async fn poll_device_authorization(&self) -> Result<PollOutcome> {
        let mut pending = self.pending.lock().await;
        let Some(auth) = pending.as_ref() else {
            return Err(AuthError::NoPendingAuthorization);
        };

        if unix_now() > auth.expires_at {
            *pending = None;
            return Err(AuthError::AuthorizationFailed(
                "login expired — please try again".to_string(),
            ));
        }

        let resp = self
            .client
            .post(&self.endpoints.device_token_url)
            .header("Accept", "application/json")
            .form(&[
                ("client_id", CLIENT_ID),
                ("device_code", auth.device_code.as_str()),
                ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
            ])
            .timeout(DEVICE_TIMEOUT)
            .send()
            .await?;

        let body: DeviceTokenResponse = resp.json().await?;

        if let Some(token) = body.access_token {
            self.store.save(&Secret::new(token))?;
            *pending = None;
            info!("device authorization complete");
            return Ok(PollOutcome::Complete);
        }

        match body.error.as_deref() {
            Some("authorization_pending") | Some("slow_down") => Ok(PollOutcome::Pending),
            Some("expired_token") => {
                *pending = None;
                Err(AuthError::AuthorizationFailed(
                    "login expired — please try again".to_string(),
                ))
            },
            Some(err) => {
                *pending = None;
                Err(AuthError::AuthorizationFailed(err.to_string()))
            },
            None => Ok(PollOutcome::Pending),
        }
    }
}

impl Default for CredentialManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Ask the host's `gh` CLI for a token.
async fn host_agent_credential() -> Option<Secret<String>> {
    let output = tokio::time::timeout(
        HOST_AGENT_TIMEOUT,
        tokio::process::Command::new("gh")
            .args(["auth", "token"])
            .output(),
    )
    .await
    .ok()?
    .ok()?;

    if !output.status.success() {
        return None;
    }
    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if token.is_empty() {
        return None;
    }
    debug!("credential resolved from gh CLI");
    Some(Secret::new(token))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use axum::{Router, extract::Request, routing::{get, post}};

    /// Start a mock HTTP server and return its base URL.
    async fn start_mock(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn manager_for(base: &str, dir: &std::path::Path) -> CredentialManager {
        CredentialManager::with_endpoints(AuthEndpoints {
            device_code_url: format!("{base}/device/code"),
            device_token_url: format!("{base}/token"),
            session_token_url: format!("{base}/session"),
        })
        .with_store(CredentialStore::with_path(dir.join("credential")))
        .with_configured_credential(None)
        .without_host_agent()
    }

    fn session_response(expires_in: u64) -> serde_json::Value {
        serde_json::json!({
            "token": "sess_abc",
            "expires_at": unix_now() + expires_in,
            "endpoints": { "api": "https://api.example.com" }
        })
    }

    #[tokio::test]
    async fn session_token_cached_within_window() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/session",
            get(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { axum::Json(session_response(3600)) }
            }),
        );
        let base = start_mock(app).await;
        let tmp = tempfile::tempdir().unwrap();
        let manager =
            manager_for(&base, tmp.path()).with_configured_credential(Some("ghp_x".into()));

        let first = manager.session_token().await.unwrap();
        let second = manager.session_token().await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(
            first.token.expose_secret(),
            second.token.expose_secret()
        );
        assert_eq!(first.endpoint, second.endpoint);
        assert_eq!(first.endpoint, "https://api.example.com");
    }

    #[tokio::test]
    async fn session_token_refreshed_when_expiring_soon() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        // Expires inside the 60s skew window, so every call re-exchanges.
        let app = Router::new().route(
            "/session",
            get(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { axum::Json(session_response(30)) }
            }),
        );
        let base = start_mock(app).await;
        let tmp = tempfile::tempdir().unwrap();
        let manager =
            manager_for(&base, tmp.path()).with_configured_credential(Some("ghp_x".into()));

        manager.session_token().await.unwrap();
        manager.session_token().await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exchange_auth_prefix_depends_on_credential_kind() {
        let seen: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(vec![]));
        let seen_clone = seen.clone();
        let app = Router::new().route(
            "/session",
            get(move |req: Request| {
                let seen = seen_clone.clone();
                async move {
                    let auth = req
                        .headers()
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    seen.lock().unwrap().push(auth);
                    axum::Json(session_response(30))
                }
            }),
        );
        let base = start_mock(app).await;
        let tmp = tempfile::tempdir().unwrap();

        let manager =
            manager_for(&base, tmp.path()).with_configured_credential(Some("ghu_dev".into()));
        manager.session_token().await.unwrap();
        let manager =
            manager_for(&base, tmp.path()).with_configured_credential(Some("ghp_pat".into()));
        manager.session_token().await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], "token ghu_dev");
        assert_eq!(seen[1], "Bearer ghp_pat");
    }

    #[tokio::test]
    async fn exchange_without_entitlement_is_unauthenticated() {
        let app = Router::new().route(
            "/session",
            get(|| async { (axum::http::StatusCode::UNAUTHORIZED, "no copilot") }),
        );
        let base = start_mock(app).await;
        let tmp = tempfile::tempdir().unwrap();
        let manager =
            manager_for(&base, tmp.path()).with_configured_credential(Some("ghp_x".into()));

        let err = manager.session_token().await.unwrap_err();
        assert!(matches!(err, AuthError::Unauthenticated));
    }

    #[tokio::test]
    async fn session_token_without_credential_is_credential_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager_for("http://127.0.0.1:1", tmp.path());

        let err = manager.session_token().await.unwrap_err();
        assert!(matches!(err, AuthError::CredentialMissing));
    }

    #[tokio::test]
    async fn credential_resolution_prefers_configured_then_store() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredentialStore::with_path(tmp.path().join("credential"));
        store.save(&Secret::new("stored_tok".to_string())).unwrap();

        let manager = manager_for("http://127.0.0.1:1", tmp.path())
            .with_configured_credential(Some("env_tok".into()));
        assert_eq!(
            manager.long_lived_credential().await.unwrap().expose_secret(),
            "env_tok"
        );

        let manager = manager_for("http://127.0.0.1:1", tmp.path());
        assert_eq!(
            manager.long_lived_credential().await.unwrap().expose_secret(),
            "stored_tok"
        );
    }

    fn device_code_response() -> serde_json::Value {
        serde_json::json!({
            "device_code": "dc_123",
            "user_code": "ABCD-1234",
            "verification_uri": "https://github.com/login/device",
            "interval": 5,
            "expires_in": 900
        })
    }

    #[tokio::test]
    async fn device_flow_pending_then_complete_persists_credential() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = polls.clone();
        let app = Router::new()
            .route(
                "/device/code",
                post(|| async { axum::Json(device_code_response()) }),
            )
            .route(
                "/token",
                post(move || {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            axum::Json(serde_json::json!({"error": "authorization_pending"}))
                        } else {
                            axum::Json(serde_json::json!({"access_token": "ghu_fresh"}))
                        }
                    }
                }),
            );
        let base = start_mock(app).await;
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager_for(&base, tmp.path());

        let auth = manager.start_device_authorization().await.unwrap();
        assert_eq!(auth.user_code, "ABCD-1234");
        assert_eq!(auth.interval, 5);

        assert_eq!(
            manager.poll_device_authorization().await.unwrap(),
            PollOutcome::Pending
        );
        assert_eq!(
            manager.poll_device_authorization().await.unwrap(),
            PollOutcome::Complete
        );

        // Credential persisted and resolvable without configuration.
        assert_eq!(
            manager.long_lived_credential().await.unwrap().expose_secret(),
            "ghu_fresh"
        );

        // Pending flow consumed.
        let err = manager.poll_device_authorization().await.unwrap_err();
        assert!(matches!(err, AuthError::NoPendingAuthorization));
    }

    #[tokio::test]
    async fn device_flow_denied_clears_pending() {
        let app = Router::new()
            .route(
                "/device/code",
                post(|| async { axum::Json(device_code_response()) }),
            )
            .route(
                "/token",
                post(|| async { axum::Json(serde_json::json!({"error": "access_denied"})) }),
            );
        let base = start_mock(app).await;
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager_for(&base, tmp.path());

        manager.start_device_authorization().await.unwrap();
        let err = manager.poll_device_authorization().await.unwrap_err();
        assert!(matches!(err, AuthError::AuthorizationFailed(ref e) if e == "access_denied"));

        let err = manager.poll_device_authorization().await.unwrap_err();
        assert!(matches!(err, AuthError::NoPendingAuthorization));
    }

    #[tokio::test]
    async fn poll_without_pending_flow_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager_for("http://127.0.0.1:1", tmp.path());
        let err = manager.poll_device_authorization().await.unwrap_err();
        assert!(matches!(err, AuthError::NoPendingAuthorization));
    }

    #[tokio::test]
    async fn restarting_login_replaces_pending_flow() {
        let codes = Arc::new(AtomicUsize::new(0));
        let counter = codes.clone();
        let seen_device_codes: Arc<std::sync::Mutex<Vec<String>>> =
            Arc::new(std::sync::Mutex::new(vec![]));
        let seen = seen_device_codes.clone();

        let app = Router::new()
            .route(
                "/device/code",
                post(move || {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        axum::Json(serde_json::json!({
                            "device_code": format!("dc_{n}"),
                            "user_code": format!("CODE-{n}"),
                            "verification_uri": "https://github.com/login/device"
                        }))
                    }
                }),
            )
            .route(
                "/token",
                post(move |body: String| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().unwrap().push(body);
                        axum::Json(serde_json::json!({"error": "authorization_pending"}))
                    }
                }),
            );
        let base = start_mock(app).await;
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager_for(&base, tmp.path());

        manager.start_device_authorization().await.unwrap();
        manager.start_device_authorization().await.unwrap();
        manager.poll_device_authorization().await.unwrap();

        // The poll uses the second flow's device code.
        let seen = seen_device_codes.lock().unwrap();
        assert!(seen[0].contains("dc_1"), "got: {}", seen[0]);
    }
}
