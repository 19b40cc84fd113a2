pub mod types;
pub mod prompt;
pub mod validation;
pub mod orchestrator;

pub use types::*;
pub use prompt::{frame_for, Enforcement};
pub use validation::{validate, Validated, ValidationError};
pub use orchestrator::*;

use serde::Serialize;
use thiserror::Error;

use crate::inference_gate::GateError;
use crate::pipeline::generation::{GenerationError, Stage};
use crate::pipeline::session::SessionError;

/// Why one attempt at a stage was rejected.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptFailure {
    /// 1-based.
    pub attempt: u32,
    pub temperature: f32,
    pub decode_path: String,
    pub repairs_attempted: Vec<String>,
    /// At most 200 characters of the raw model output.
    pub raw_excerpt: String,
    pub reason: String,
}

fn last_reason(attempts: &[AttemptFailure]) -> &str {
    attempts.last().map(|a| a.reason.as_str()).unwrap_or("no attempts")
}

#[derive(Error, Debug)]
pub enum ClassificationError {
    #[error("Prompt is empty")]
    EmptyPrompt,

    #[error("{stage} failed after {} attempts: {}", .attempts.len(), last_reason(.attempts))]
    Exhausted {
        stage: Stage,
        attempts: Vec<AttemptFailure>,
    },

    #[error("{stage} generation failed: {source}")]
    Generation {
        stage: Stage,
        source: GenerationError,
    },

    #[error("Model session unavailable: {0}")]
    Session(#[from] SessionError),

    #[error("Inference gate error: {0}")]
    Gate(#[from] GateError),
}

impl ClassificationError {
    /// Stable machine-readable name for the failure envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmptyPrompt => "empty_prompt",
            Self::Exhausted { .. } => "classification_failed",
            Self::Generation { .. } => "generation_failed",
            Self::Session(_) => "model_unavailable",
            Self::Gate(_) => "internal",
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Exhausted { stage, .. } | Self::Generation { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub fn attempts(&self) -> &[AttemptFailure] {
        match self {
            Self::Exhausted { attempts, .. } => attempts,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(attempt: u32, reason: &str) -> AttemptFailure {
        AttemptFailure {
            attempt,
            temperature: if attempt == 1 { 0.1 } else { 0.0 },
            decode_path: "unconstrained".into(),
            repairs_attempted: vec!["missing_closing_braces".into()],
            raw_excerpt: "{\"suggested".into(),
            reason: reason.into(),
        }
    }

    #[test]
    fn exhausted_error_names_stage_and_last_reason() {
        let err = ClassificationError::Exhausted {
            stage: Stage::ActionSelection,
            attempts: vec![failure(1, "unparseable"), failure(2, "suggested_actions is missing or empty")],
        };
        let message = err.to_string();
        assert!(message.contains("action_selection"));
        assert!(message.contains("2 attempts"));
        assert!(message.contains("suggested_actions is missing"));
        assert_eq!(err.kind(), "classification_failed");
        assert_eq!(err.stage(), Some(Stage::ActionSelection));
        assert_eq!(err.attempts().len(), 2);
    }

    #[test]
    fn session_errors_convert() {
        let err: ClassificationError = SessionError::NoTiersConfigured.into();
        assert_eq!(err.kind(), "model_unavailable");
        assert!(err.attempts().is_empty());
    }
}
