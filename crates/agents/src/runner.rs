//! The orchestration loop.
//!
//! A turn sends the persona, history, and user message to the backend along
//! with the active capability menu. When the backend requests capability
//! calls they run sequentially, each result (or contained error) is appended
//! as a message, and the backend decides again. A turn is capped at
//! [`MAX_CAPABILITY_ROUNDS`] decide/execute round trips; on exhaustion the
//! turn ends with whatever text the last decision carried, even if empty.

use std::{path::PathBuf, sync::Arc};

use {
    medulla_capabilities::{CapabilityRegistry, CapabilitySet},
    tracing::{debug, info, warn},
    uuid::Uuid,
};

use crate::{
    error::Result,
    model::{ChatBackend, ChatMessage, Usage, values_to_chat_messages},
    persona::{load_persona, persona_from},
};

/// Capability rounds allowed per turn.
pub const MAX_CAPABILITY_ROUNDS: u32 = 3;

/// One incoming chat turn.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub message: String,
    /// Absent on the first turn of a conversation.
    pub session_id: Option<String>,
    /// Prior messages in OpenAI wire form, as the caller stored them.
    pub history: Vec<serde_json::Value>,
}

/// Outcome of one turn.
#[derive(Debug)]
pub struct TurnOutput {
    pub reply: String,
    pub session_id: String,
    /// Capability rounds executed.
    pub rounds: u32,
    /// One `[Name] result-or-error` line per invocation, in execution order.
    pub invocations: Vec<String>,
    pub usage: Usage,
}

pub struct Orchestrator {
    backend: Arc<dyn ChatBackend>,
    registry: Arc<CapabilityRegistry>,
    persona_dir: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn ChatBackend>, registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            backend,
            registry,
            persona_dir: None,
        }
    }

    pub fn with_persona_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.persona_dir = Some(dir.into());
        self
    }

    fn persona(&self) -> String {
        match &self.persona_dir {
            Some(dir) => persona_from(dir),
            None => load_persona(),
        }
    }

    /// Run one turn to completion.
    pub async fn run_turn(&self, request: TurnRequest) -> Result<TurnOutput> {
        let session_id = request
            .session_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let active = self.registry.active().await;
        let menu = active.schemas();

        info!(
            session = %session_id,
            model = self.backend.model(),
            capabilities = menu.len(),
            "starting turn"
        );

        let mut messages = vec![ChatMessage::system(self.persona())];
        messages.extend(values_to_chat_messages(&request.history));
        messages.push(ChatMessage::user(request.message));

        let mut invocations = Vec::new();
        let mut usage = Usage::default();
        let mut last_text: Option<String> = None;

        for round in 1..=MAX_CAPABILITY_ROUNDS {
            let response = self.backend.complete(&messages, &menu).await?;
            usage.input_tokens = usage.input_tokens.saturating_add(response.usage.input_tokens);
            usage.output_tokens =
                usage.output_tokens.saturating_add(response.usage.output_tokens);

            if response.capability_calls.is_empty() {
                let reply = response.text.unwrap_or_default();
                info!(session = %session_id, rounds = round - 1, "turn complete");
                return Ok(TurnOutput {
                    reply,
                    session_id,
                    rounds: round - 1,
                    invocations,
                    usage,
                });
            }

            let calls = response.capability_calls;
            last_text = response.text.clone();
            messages.push(ChatMessage::assistant_with_calls(response.text, calls.clone()));

            for call in calls {
                let content = match active.get(&call.name) {
                    None => {
                        warn!(session = %session_id, capability = %call.name, "unknown capability requested");
                        format!("ERROR: unknown capability '{}'", call.name)
                    },
                    Some(capability) => {
                        match capability.execute(call.arguments.clone()).await {
                            Ok(value) => {
                                let rendered = render_result(&value);
                                info!(
                                    session = %session_id,
                                    capability = %call.name,
                                    "capability returned"
                                );
                                debug!(capability = %call.name, result = %rendered, "capability result");
                                rendered
                            },
                            Err(e) => {
                                warn!(
                                    session = %session_id,
                                    capability = %call.name,
                                    error = %e,
                                    "capability failed"
                                );
                                format!("ERROR: {e}")
                            },
                        }
                    },
                };
                invocations.push(format!("[{}] {content}", call.name));
                messages.push(ChatMessage::capability_result(call.id, content));
            }
        }

        // Cap exhausted: the last decision still wanted more rounds. Return
        // its text rather than deciding a fourth time.
        warn!(
            session = %session_id,
            rounds = MAX_CAPABILITY_ROUNDS,
            "capability round cap reached, ending turn"
        );
        Ok(TurnOutput {
            reply: last_text.unwrap_or_default(),
            session_id,
            rounds: MAX_CAPABILITY_ROUNDS,
            invocations,
            usage,
        })
    }

    /// Snapshot of the active capability set, for callers that list it.
    pub async fn active_capabilities(&self) -> CapabilitySet {
        self.registry.active().await
    }
}

/// Capability results travel as message text; strings stay bare, everything
/// else is serialized.
fn render_result(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
