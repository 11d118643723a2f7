use async_trait::async_trait;

use crate::error::Result;

/// Typed chat message for the backend interface.
///
/// Only contains backend-relevant fields, so transport metadata can never
/// leak into API requests.
#[derive(Debug, Clone)]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: Option<String>,
        capability_calls: Vec<CapabilityCall>,
    },
    CapabilityResult {
        call_id: String,
        content: String,
    },
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: Some(content.into()),
            capability_calls: vec![],
        }
    }

    pub fn assistant_with_calls(content: Option<String>, calls: Vec<CapabilityCall>) -> Self {
        Self::Assistant {
            content,
            capability_calls: calls,
        }
    }

    pub fn capability_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::CapabilityResult {
            call_id: call_id.into(),
            content: content.into(),
        }
    }

    /// Convert to the OpenAI-compatible wire format the backend speaks.
    #[must_use]
    pub fn to_openai_value(&self) -> serde_json::Value {
        match self {
            ChatMessage::System { content } => {
                serde_json::json!({ "role": "system", "content": content })
            },
            ChatMessage::User { content } => {
                serde_json::json!({ "role": "user", "content": content })
            },
            ChatMessage::Assistant {
                content,
                capability_calls,
            } => {
                if capability_calls.is_empty() {
                    serde_json::json!({
                        "role": "assistant",
                        "content": content.as_deref().unwrap_or(""),
                    })
                } else {
                    let calls: Vec<serde_json::Value> = capability_calls
                        .iter()
                        .map(|call| {
                            serde_json::json!({
                                "id": call.id,
                                "type": "function",
                                "function": {
                                    "name": call.name,
                                    "arguments": call.arguments.to_string(),
                                }
                            })
                        })
                        .collect();
                    let mut msg = serde_json::json!({
                        "role": "assistant",
                        "tool_calls": calls,
                    });
                    if let Some(text) = content {
                        msg["content"] = serde_json::Value::String(text.clone());
                    }
                    msg
                }
            },
            ChatMessage::CapabilityResult { call_id, content } => {
                serde_json::json!({
                    "role": "tool",
                    "tool_call_id": call_id,
                    "content": content,
                })
            },
        }
    }
}

/// Convert caller-supplied history values to typed messages.
///
/// Only `user`, `assistant`, and `tool` entries are forwarded. The system
/// prompt is owned by the turn runner, so caller-supplied `system` entries
/// are dropped; anything without a recognized role is skipped with a warning
/// so a malformed history item cannot poison the whole turn.
pub fn values_to_chat_messages(values: &[serde_json::Value]) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(values.len());
    for (i, val) in values.iter().enumerate() {
        let Some(role) = val["role"].as_str() else {
            tracing::warn!(index = i, "skipping history entry with missing role");
            continue;
        };
        match role {
            "user" => {
                messages.push(ChatMessage::user(val["content"].as_str().unwrap_or("")));
            },
            "assistant" => {
                messages.push(ChatMessage::assistant(val["content"].as_str().unwrap_or("")));
            },
            "tool" => {
                messages.push(ChatMessage::capability_result(
                    val["tool_call_id"].as_str().unwrap_or(""),
                    val["content"].as_str().unwrap_or(""),
                ));
            },
            "system" => {
                tracing::warn!(index = i, "dropping caller-supplied system entry");
            },
            other => {
                tracing::warn!(index = i, role = other, "skipping history entry with unknown role");
            },
        }
    }
    messages
}

/// A capability invocation requested by the backend.
#[derive(Debug, Clone)]
pub struct CapabilityCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Response from one backend completion call.
#[derive(Debug)]
pub struct CompletionResponse {
    pub text: Option<String>,
    pub capability_calls: Vec<CapabilityCall>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Chat completion backend.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Model identifier (e.g. "gpt-4o").
    fn model(&self) -> &str;

    /// One completion over the given messages, offered the given capability
    /// schemas. An empty schema slice means the backend must answer in text.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        capabilities: &[serde_json::Value],
    ) -> Result<CompletionResponse>;
}
