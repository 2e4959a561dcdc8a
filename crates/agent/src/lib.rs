//! Intake agent - LLM adapters and the intake loop
//!
//! This crate connects the deterministic intake core to the outside world:
//! - Extracts field values from supplier replies (`extraction`)
//! - Writes clarification questions for missing fields (`clarification`)
//! - Talks to OpenAI-compatible and Ollama chat endpoints (`llm`)
//! - Drives inbound messages through extract, merge, plan and commit (`runtime`)
//!
//! # Safety Principle
//!
//! The LLM is strictly a translator. It never decides whether a record is
//! complete or which action to take. Those decisions are made by the core
//! planner from the merged record alone.

pub mod clarification;
pub mod extraction;
pub mod llm;
pub mod runtime;

pub use clarification::LlmClarificationGenerator;
pub use extraction::LlmExtractionOracle;
pub use llm::{HttpLlmClient, LlmClient, LlmError};
pub use runtime::{
    BatchReport, DeliveryOutcome, IntakeComponents, IntakeLoop, IntakeSettings, IntakeStats,
    ItemOutcome,
};
