//! Remote capability origins.
//!
//! An origin is a GitHub-hosted repository of capability files, identified
//! by its canonical `owner/repo` form. Its manifest is resolved in three
//! steps: `manifest.json` at the repository root, then
//! `capabilities/index.json`, then a contents-API listing filtered to
//! capability files.

use std::time::Duration;

use {
    anyhow::{Context, Result, bail},
    serde::Deserialize,
    tracing::debug,
};

use crate::types::{ManifestEntry, OriginManifest};

const DEFAULT_RAW_BASE: &str = "https://raw.githubusercontent.com";
const DEFAULT_API_BASE: &str = "https://api.github.com";
const DEFAULT_BRANCH: &str = "main";

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Base URLs for origin fetches, overridable for tests.
#[derive(Debug, Clone)]
pub struct OriginEndpoints {
    pub raw_base: String,
    pub api_base: String,
}

impl Default for OriginEndpoints {
    fn default() -> Self {
        Self {
            raw_base: DEFAULT_RAW_BASE.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }
}

/// Reduce an origin spec to its canonical `owner/repo` form.
///
/// Accepts bare `owner/repo`, `github.com/owner/repo`, and full HTTP URLs
/// with or without a `.git` suffix. Returns `None` when no owner/repo pair
/// can be extracted.
pub fn normalize_origin(spec: &str) -> Option<String> {
    let mut rest = spec.trim().trim_end_matches('/');
    for prefix in ["https://", "http://"] {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
        }
    }
    if let Some(stripped) = rest.strip_prefix("github.com/") {
        rest = stripped;
    }
    rest = rest.trim_end_matches(".git");

    let mut parts = rest.split('/');
    let owner = parts.next()?;
    let repo = parts.next()?;
    if owner.is_empty() || repo.is_empty() || parts.next().is_some() {
        return None;
    }
    let valid = |s: &str| {
        s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    if !valid(owner) || !valid(repo) {
        return None;
    }
    Some(format!("{owner}/{repo}"))
}

/// One file in a contents-API directory listing.
#[derive(Debug, Deserialize)]
struct ContentsItem {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    download_url: Option<String>,
}

/// Fetches manifests and capability sources from an origin.
pub struct OriginClient {
    client: reqwest::Client,
    endpoints: OriginEndpoints,
}

impl Default for OriginClient {
    fn default() -> Self {
        Self::new()
    }
}

impl OriginClient {
    pub fn new() -> Self {
        Self::with_endpoints(OriginEndpoints::default())
    }

    pub fn with_endpoints(endpoints: OriginEndpoints) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints,
        }
    }

    /// Resolve an origin's manifest.
    ///
    /// Entries come back normalized: every entry has an id, a display name,
    /// and a concrete download URL.
    pub async fn fetch_manifest(&self, origin: &str) -> Result<OriginManifest> {
        let raw = format!("{}/{origin}/{DEFAULT_BRANCH}", self.endpoints.raw_base);

        if let Some(text) = self.fetch_text(&format!("{raw}/manifest.json")).await?
            && let Some(entries) = parse_entries(&text)
        {
            debug!(origin, "resolved manifest from manifest.json");
            return Ok(finalize(origin, &raw, entries));
        }

        if let Some(text) = self.fetch_text(&format!("{raw}/capabilities/index.json")).await?
            && let Some(entries) = parse_entries(&text)
        {
            debug!(origin, "resolved manifest from capabilities/index.json");
            return Ok(finalize(origin, &format!("{raw}/capabilities"), entries));
        }

        let listing_url = format!("{}/repos/{origin}/contents", self.endpoints.api_base);
        let Some(text) = self.fetch_text(&listing_url).await? else {
            bail!("origin '{origin}' has no manifest and no listable contents");
        };
        let items: Vec<ContentsItem> =
            serde_json::from_str(&text).context("contents listing is not a file array")?;
        let entries = items
            .into_iter()
            .filter(|item| item.kind == "file" && is_capability_filename(&item.name))
            .map(|item| {
                let id = stem(&item.name);
                ManifestEntry {
                    name: id.clone(),
                    id,
                    description: String::new(),
                    filename: item.name,
                    url: item.download_url,
                }
            })
            .collect();
        debug!(origin, "resolved manifest from contents listing");
        Ok(finalize(origin, &raw, entries))
    }

    /// Download one capability file's source text.
    pub async fn fetch_source(&self, origin: &str, entry: &ManifestEntry) -> Result<String> {
        let url = entry
            .url
            .as_deref()
            .with_context(|| format!("entry '{}' has no download URL", entry.id))?;
        let response = self
            .client
            .get(url)
            .header("User-Agent", "medulla")
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;
        if !response.status().is_success() {
            bail!("fetch of '{}' from '{origin}' returned {}", entry.id, response.status());
        }
        Ok(response.text().await?)
    }

    /// GET a URL, mapping 404 to `None` so callers can fall through.
    async fn fetch_text(&self, url: &str) -> Result<Option<String>> {
        let response = self
            .client
            .get(url)
            .header("User-Agent", "medulla")
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            bail!("request to {url} returned {}", response.status());
        }
        Ok(Some(response.text().await?))
    }
}

fn is_capability_filename(name: &str) -> bool {
    stem(name).ends_with("_cap")
}

fn stem(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((stem, _)) => stem.to_string(),
        None => filename.to_string(),
    }
}

/// Accept both `{"capabilities": [...]}` objects and bare entry arrays.
fn parse_entries(text: &str) -> Option<Vec<ManifestEntry>> {
    if let Ok(manifest) = serde_json::from_str::<OriginManifest>(text)
        && !manifest.capabilities.is_empty()
    {
        return Some(manifest.capabilities);
    }
    if let Ok(entries) = serde_json::from_str::<Vec<ManifestEntry>>(text)
        && !entries.is_empty()
    {
        return Some(entries);
    }
    None
}

fn finalize(origin: &str, base_url: &str, mut entries: Vec<ManifestEntry>) -> OriginManifest {
    for entry in &mut entries {
        if entry.id.is_empty() {
            entry.id = stem(&entry.filename);
        }
        if entry.name.is_empty() {
            entry.name = entry.id.clone();
        }
        if entry.url.is_none() && !entry.filename.is_empty() {
            entry.url = Some(format!("{base_url}/{}", entry.filename));
        }
    }
    entries.retain(|e| !e.id.is_empty() && e.url.is_some());
    OriginManifest {
        origin: origin.to_string(),
        capabilities: entries,
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use {
        axum::{Router, extract::State, http::StatusCode, routing::get},
        tokio::net::TcpListener,
    };

    use super::*;

    #[test]
    fn normalize_accepts_common_forms() {
        for spec in [
            "acme/tools",
            "acme/tools/",
            "github.com/acme/tools",
            "https://github.com/acme/tools",
            "https://github.com/acme/tools.git",
            "http://github.com/acme/tools/",
        ] {
            assert_eq!(normalize_origin(spec).as_deref(), Some("acme/tools"), "spec: {spec}");
        }
    }

    #[test]
    fn normalize_rejects_garbage() {
        for spec in ["", "acme", "acme/tools/extra", "a b/c", "https://example.com"] {
            assert_eq!(normalize_origin(spec), None, "spec: {spec}");
        }
    }

    /// Mock origin host serving raw files and a contents listing.
    #[derive(Clone, Default)]
    struct MockOrigin {
        manifest_json: Option<String>,
        index_json: Option<String>,
        contents_json: Option<String>,
        file_body: String,
    }

    async fn serve(origin: Arc<MockOrigin>) -> String {
        async fn raw_manifest(State(o): State<Arc<MockOrigin>>) -> (StatusCode, String) {
            match &o.manifest_json {
                Some(body) => (StatusCode::OK, body.clone()),
                None => (StatusCode::NOT_FOUND, String::new()),
            }
        }
        async fn raw_index(State(o): State<Arc<MockOrigin>>) -> (StatusCode, String) {
            match &o.index_json {
                Some(body) => (StatusCode::OK, body.clone()),
                None => (StatusCode::NOT_FOUND, String::new()),
            }
        }
        async fn contents(State(o): State<Arc<MockOrigin>>) -> (StatusCode, String) {
            match &o.contents_json {
                Some(body) => (StatusCode::OK, body.clone()),
                None => (StatusCode::NOT_FOUND, String::new()),
            }
        }
        async fn file(State(o): State<Arc<MockOrigin>>) -> String {
            o.file_body.clone()
        }

        let app = Router::new()
            .route("/acme/tools/main/manifest.json", get(raw_manifest))
            .route("/acme/tools/main/capabilities/index.json", get(raw_index))
            .route("/repos/acme/tools/contents", get(contents))
            .route("/acme/tools/main/weather_cap.py", get(file))
            .route("/acme/tools/main/capabilities/weather_cap.py", get(file))
            .with_state(origin);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client_for(base: &str) -> OriginClient {
        OriginClient::with_endpoints(OriginEndpoints {
            raw_base: base.to_string(),
            api_base: base.to_string(),
        })
    }

    #[tokio::test]
    async fn manifest_json_is_preferred() {
        let base = serve(Arc::new(MockOrigin {
            manifest_json: Some(
                r#"{"capabilities":[{"id":"weather_cap","name":"Weather","description":"wx","filename":"weather_cap.py"}]}"#
                    .into(),
            ),
            ..Default::default()
        }))
        .await;

        let manifest = client_for(&base).fetch_manifest("acme/tools").await.unwrap();
        assert_eq!(manifest.origin, "acme/tools");
        assert_eq!(manifest.capabilities.len(), 1);
        let entry = &manifest.capabilities[0];
        assert_eq!(entry.id, "weather_cap");
        assert_eq!(
            entry.url.as_deref().unwrap(),
            format!("{base}/acme/tools/main/weather_cap.py")
        );
    }

    #[tokio::test]
    async fn falls_back_to_capabilities_index() {
        let base = serve(Arc::new(MockOrigin {
            index_json: Some(r#"[{"id":"weather_cap","filename":"weather_cap.py"}]"#.into()),
            ..Default::default()
        }))
        .await;

        let manifest = client_for(&base).fetch_manifest("acme/tools").await.unwrap();
        assert_eq!(manifest.capabilities.len(), 1);
        let entry = &manifest.capabilities[0];
        assert_eq!(entry.name, "weather_cap");
        assert_eq!(
            entry.url.as_deref().unwrap(),
            format!("{base}/acme/tools/main/capabilities/weather_cap.py")
        );
    }

    #[tokio::test]
    async fn falls_back_to_contents_listing() {
        let base = serve(Arc::new(MockOrigin {
            contents_json: Some(
                r#"[
                    {"name":"weather_cap.py","type":"file","download_url":"DOWNLOAD"},
                    {"name":"README.md","type":"file","download_url":"IGNORED"},
                    {"name":"docs","type":"dir","download_url":null}
                ]"#
                .into(),
            ),
            ..Default::default()
        }))
        .await;

        let manifest = client_for(&base).fetch_manifest("acme/tools").await.unwrap();
        assert_eq!(manifest.capabilities.len(), 1);
        let entry = &manifest.capabilities[0];
        assert_eq!(entry.id, "weather_cap");
        assert_eq!(entry.url.as_deref(), Some("DOWNLOAD"));
    }

    #[tokio::test]
    async fn errors_when_nothing_resolves() {
        let base = serve(Arc::new(MockOrigin::default())).await;
        let err = client_for(&base).fetch_manifest("acme/tools").await.unwrap_err();
        assert!(err.to_string().contains("no manifest"));
    }

    #[tokio::test]
    async fn fetch_source_downloads_entry() {
        let base = serve(Arc::new(MockOrigin {
            file_body: "print('hello')".into(),
            ..Default::default()
        }))
        .await;

        let entry = ManifestEntry {
            id: "weather_cap".into(),
            name: "Weather".into(),
            description: String::new(),
            filename: "weather_cap.py".into(),
            url: Some(format!("{base}/acme/tools/main/weather_cap.py")),
        };
        let source = client_for(&base).fetch_source("acme/tools", &entry).await.unwrap();
        assert_eq!(source, "print('hello')");
    }
}
