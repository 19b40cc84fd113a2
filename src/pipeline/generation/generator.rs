//! Constrained Generator.
//!
//! Resolves the schema contract for a request and decodes under its
//! grammar. When no contract exists, the contract cannot be compiled, or
//! the constrained decode fails for a non-transport reason, it decodes
//! once more without a grammar and says so in the result.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use super::grammar::SchemaAutomaton;
use super::schema::{SchemaRegistry, Specificity};
use super::types::{GenerationConfig, GenerationRequest, InferenceBackend};
use super::GenerationError;

/// Appended to unconstrained prompts; the model continues inside the object.
pub const OBJECT_SEED: &str = "{";

/// Rough prompt sizing without a tokenizer.
const CHARS_PER_TOKEN: usize = 4;

/// Why a decode ran without a grammar.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FallbackReason {
    NoSchema,
    SchemaUnsupported(String),
    ConstraintFailed(String),
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSchema => write!(f, "no schema contract"),
            Self::SchemaUnsupported(reason) => write!(f, "schema unsupported: {reason}"),
            Self::ConstraintFailed(reason) => write!(f, "constrained decode failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DecodePath {
    Constrained { specificity: Specificity },
    Unconstrained { reason: FallbackReason },
}

impl DecodePath {
    pub fn is_constrained(&self) -> bool {
        matches!(self, Self::Constrained { .. })
    }

    pub fn specificity(&self) -> Option<Specificity> {
        match self {
            Self::Constrained { specificity } => Some(*specificity),
            Self::Unconstrained { .. } => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Constrained { .. } => "constrained",
            Self::Unconstrained { .. } => "unconstrained",
        }
    }
}

/// Text produced by one generation call.
#[derive(Debug, Clone)]
pub struct GeneratedText {
    /// Raw decoded text. On the unconstrained path this is the model's
    /// continuation after the object seed, which the repair engine's
    /// wrapper step restores.
    pub text: String,
    pub path: DecodePath,
    pub output_tokens: u32,
    pub input_tokens: Option<u32>,
    pub elapsed_ms: u64,
    pub warnings: Vec<String>,
}

pub struct ConstrainedGenerator {
    registry: Arc<SchemaRegistry>,
    context_ceiling: u32,
}

impl ConstrainedGenerator {
    pub fn new(registry: Arc<SchemaRegistry>, context_ceiling: u32) -> Self {
        Self {
            registry,
            context_ceiling,
        }
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn generate(
        &self,
        backend: &dyn InferenceBackend,
        request: &GenerationRequest,
    ) -> Result<GeneratedText, GenerationError> {
        let started = Instant::now();
        let _span = tracing::info_span!(
            "generate",
            stage = %request.stage(),
            action = request.action_name().unwrap_or("-"),
            software = request.software().unwrap_or("-"),
            batch = request.is_batch(),
        )
        .entered();

        let mut config = request.config().clone();
        let mut warnings = config.clamp_to_ceiling(self.context_ceiling);
        let prompt = self.fit_prompt(request, &config, &mut warnings);

        let contract = if request.is_batch() {
            self.registry.resolve_batch(request.stage())
        } else {
            self.registry.resolve(request.stage(), request.action_name(), request.software())
        };

        let reason = match contract {
            None => FallbackReason::NoSchema,
            Some(contract) => match contract.grammar() {
                Err(e) => FallbackReason::SchemaUnsupported(e.to_string()),
                Ok(grammar) => {
                    let mut automaton = SchemaAutomaton::new(grammar);
                    match backend.decode(&prompt, &config, Some(&mut automaton)) {
                        Ok(decoded) if automaton.is_complete() => {
                            let path = DecodePath::Constrained {
                                specificity: contract.specificity(),
                            };
                            tracing::info!(
                                specificity = %contract.specificity(),
                                output_tokens = decoded.output_tokens,
                                "Constrained decode complete"
                            );
                            return Ok(GeneratedText {
                                text: decoded.text,
                                path,
                                output_tokens: decoded.output_tokens,
                                input_tokens: decoded.input_tokens,
                                elapsed_ms: started.elapsed().as_millis() as u64,
                                warnings,
                            });
                        }
                        Ok(decoded) => FallbackReason::ConstraintFailed(
                            GenerationError::Incomplete {
                                output_tokens: decoded.output_tokens,
                            }
                            .to_string(),
                        ),
                        Err(e) if e.is_transport() => return Err(e),
                        Err(e) => FallbackReason::ConstraintFailed(e.to_string()),
                    }
                }
            },
        };

        if reason != FallbackReason::NoSchema {
            tracing::warn!(%reason, "Falling back to unconstrained decode");
        } else {
            tracing::debug!("No schema contract, decoding unconstrained");
        }

        let seeded = format!("{prompt}{OBJECT_SEED}");
        let decoded = backend.decode(&seeded, &config, None)?;

        Ok(GeneratedText {
            text: decoded.text,
            path: DecodePath::Unconstrained { reason },
            output_tokens: decoded.output_tokens,
            input_tokens: decoded.input_tokens,
            elapsed_ms: started.elapsed().as_millis() as u64,
            warnings,
        })
    }

    /// Frame the prompt body, truncating it to the input budget.
    fn fit_prompt(
        &self,
        request: &GenerationRequest,
        config: &GenerationConfig,
        warnings: &mut Vec<String>,
    ) -> String {
        let frame = request.frame();
        let budget = config.input_budget(self.context_ceiling) as usize * CHARS_PER_TOKEN;
        let available = budget.saturating_sub(frame.overhead_chars());

        let body = request.prompt();
        let body_chars = body.chars().count();
        let body = if body_chars > available {
            let message = format!(
                "prompt truncated from ~{} to ~{} tokens",
                body_chars / CHARS_PER_TOKEN,
                available / CHARS_PER_TOKEN
            );
            tracing::warn!(body_chars, available, "Prompt exceeds input budget, truncating");
            warnings.push(message);
            truncate_chars(body, available)
        } else {
            body
        };

        format!("{}{}{}", frame.prefix, body, frame.suffix)
    }
}

/// Longest prefix of `text` holding at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
