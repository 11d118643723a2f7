//! Copilot chat backend.
//!
//! Speaks the OpenAI-compatible `/chat/completions` API against the endpoint
//! named by the session token. The API rejects requests without
//! `Editor-Version`.

use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    medulla_auth::CredentialManager,
    secrecy::ExposeSecret,
    tracing::{debug, warn},
};

use crate::{
    error::{ChatError, Result},
    model::{CapabilityCall, ChatBackend, ChatMessage, CompletionResponse, Usage},
};

const EDITOR_VERSION: &str = "vscode/1.96.2";
const USER_AGENT: &str = "GitHubCopilotChat/0.26.7";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct CopilotBackend {
    model: String,
    client: reqwest::Client,
    auth: Arc<CredentialManager>,
}

impl CopilotBackend {
    pub fn new(model: impl Into<String>, auth: Arc<CredentialManager>) -> Self {
        Self {
            model: model.into(),
            client: reqwest::Client::new(),
            auth,
        }
    }
}

/// Wrap capability schemas in the function-tool envelope the API expects.
fn to_openai_capabilities(capabilities: &[serde_json::Value]) -> Vec<serde_json::Value> {
    capabilities
        .iter()
        .map(|c| {
            serde_json::json!({
                "type": "function",
                "function": {
                    "name": c["name"],
                    "description": c["description"],
                    "parameters": c["parameters"],
                }
            })
        })
        .collect()
}

fn parse_capability_calls(message: &serde_json::Value) -> Vec<CapabilityCall> {
    message["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let id = call["id"].as_str()?.to_string();
                    let name = call["function"]["name"].as_str()?.to_string();
                    let args_str = call["function"]["arguments"].as_str().unwrap_or("{}");
                    let arguments =
                        serde_json::from_str(args_str).unwrap_or(serde_json::json!({}));
                    Some(CapabilityCall {
                        id,
                        name,
                        arguments,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl ChatBackend for CopilotBackend {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        capabilities: &[serde_json::Value],
    ) -> Result<CompletionResponse> {
        let session = self.auth.session_token().await?;

        let wire: Vec<serde_json::Value> = messages.iter().map(|m| m.to_openai_value()).collect();
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": wire,
        });
        if !capabilities.is_empty() {
            body["tools"] = serde_json::Value::Array(to_openai_capabilities(capabilities));
        }

        debug!(
            model = %self.model,
            messages_count = messages.len(),
            capabilities_count = capabilities.len(),
            "chat completion request"
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", session.endpoint))
            .header("Authorization", format!("Bearer {}", session.token.expose_secret()))
            .header("content-type", "application/json")
            .header("Editor-Version", EDITOR_VERSION)
            .header("User-Agent", USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChatError::Unavailable(e.into()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "chat backend error");
            return Err(ChatError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ChatError::Malformed(e.to_string()))?;

        let message = &parsed["choices"][0]["message"];
        if message.is_null() {
            return Err(ChatError::Malformed("response has no choices".to_string()));
        }

        Ok(CompletionResponse {
            text: message["content"].as_str().map(|s| s.to_string()),
            capability_calls: parse_capability_calls(message),
            usage: Usage {
                input_tokens: parsed["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                output_tokens: parsed["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
            },
        })
    }
}
