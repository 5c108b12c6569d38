//! Conversation with the external reasoning engine.
//!
//! Provides a trait-based interface over engines plus the driver that runs one turn:
//! - [`AssistantsEngine`]: assistants-style REST API (threads, messages, runs)
//! - [`ScriptedEngine`]: in-process engine for offline development and tests
//! - [`ConversationDriver`]: thread continuity, active-run recovery, polling

pub mod assistants;
pub mod driver;
pub mod engine;
pub mod scripted;

pub use assistants::AssistantsEngine;
pub use driver::{ConversationDriver, DriverConfig, DriverReply};
pub use engine::{
    EngineError, EngineResult, NewMessage, ReasoningEngine, RunFailure, RunId, RunState, RunStatus,
};
pub use scripted::ScriptedEngine;
