//! Chat orchestration: the backend interface, the Copilot backend, and the
//! bounded capability loop.

pub mod copilot;
pub mod error;
pub mod model;
pub mod persona;
pub mod runner;

pub use {
    copilot::CopilotBackend,
    error::ChatError,
    model::{CapabilityCall, ChatBackend, ChatMessage, CompletionResponse, Usage},
    persona::{DEFAULT_PERSONA, load_persona},
    runner::{MAX_CAPABILITY_ROUNDS, Orchestrator, TurnOutput, TurnRequest},
};
