//! In-process backends for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::grammar::SchemaAutomaton;
use super::types::{Decoded, GenerationConfig, InferenceBackend};
use super::GenerationError;

/// One recorded `decode` call.
#[derive(Debug, Clone)]
pub struct DecodeCall {
    pub prompt: String,
    pub temperature: f32,
    pub max_new_tokens: u32,
    pub constrained: bool,
}

enum Scripted {
    Text(String),
    Unreachable,
}

/// Returns scripted responses in order, repeating the last one.
///
/// Constrained calls feed the scripted text through the automaton, so a
/// non-conforming script fails the constrained path the way a real
/// decoder leaving the grammar would.
pub struct MockBackend {
    model: String,
    responses: Vec<Scripted>,
    next: AtomicUsize,
    calls: Mutex<Vec<DecodeCall>>,
    supports_constraints: bool,
    output_tokens: Option<u32>,
}

impl MockBackend {
    pub fn new(responses: &[&str]) -> Self {
        Self {
            model: "mock-mixtral".to_string(),
            responses: responses.iter().map(|r| Scripted::Text(r.to_string())).collect(),
            next: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            supports_constraints: true,
            output_tokens: None,
        }
    }

    /// Every call fails as if the server were down.
    pub fn unreachable() -> Self {
        Self {
            responses: vec![Scripted::Unreachable],
            ..Self::new(&[])
        }
    }

    /// Constrained calls fail immediately.
    pub fn without_constraints(mut self) -> Self {
        self.supports_constraints = false;
        self
    }

    pub fn with_output_tokens(mut self, tokens: u32) -> Self {
        self.output_tokens = Some(tokens);
        self
    }

    pub fn calls(&self) -> Vec<DecodeCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl InferenceBackend for MockBackend {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn decode(
        &self,
        prompt: &str,
        config: &GenerationConfig,
        constraint: Option<&mut SchemaAutomaton>,
    ) -> Result<Decoded, GenerationError> {
        self.calls.lock().unwrap().push(DecodeCall {
            prompt: prompt.to_string(),
            temperature: config.temperature,
            max_new_tokens: config.max_new_tokens,
            constrained: constraint.is_some(),
        });

        let index = self.next.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .responses
            .get(index.min(self.responses.len().saturating_sub(1)))
            .ok_or_else(|| GenerationError::ResponseParsing("no scripted response".into()))?;
        let text = match scripted {
            Scripted::Text(text) => text.clone(),
            Scripted::Unreachable => {
                return Err(GenerationError::Connection("http://mock".into()));
            }
        };

        if let Some(automaton) = constraint {
            if !self.supports_constraints {
                return Err(GenerationError::ConstraintViolated(
                    "decoder has no grammar support".into(),
                ));
            }
            automaton
                .advance(&text)
                .map_err(|e| GenerationError::ConstraintViolated(e.to_string()))?;
        }

        let output_tokens = self
            .output_tokens
            .unwrap_or((text.chars().count() / 4) as u32);
        Ok(Decoded {
            text,
            output_tokens,
            input_tokens: Some((prompt.chars().count() / 4) as u32),
        })
    }
}

/// A decoder over a small vocabulary that genuinely consults the automaton.
///
/// It walks its script piece by piece, masking pieces the automaton does
/// not admit, then closes the document greedily from the vocabulary.
pub struct ScriptedTokenBackend {
    script: Vec<String>,
    vocabulary: Vec<&'static str>,
    calls: AtomicUsize,
}

impl ScriptedTokenBackend {
    pub fn new(script: &[&str]) -> Self {
        Self {
            script: script.iter().map(|s| s.to_string()).collect(),
            vocabulary: vec!["}", "]", "\"", "null", "0", "false", ","],
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl InferenceBackend for ScriptedTokenBackend {
    fn model_name(&self) -> &str {
        "scripted"
    }

    fn decode(
        &self,
        _prompt: &str,
        config: &GenerationConfig,
        constraint: Option<&mut SchemaAutomaton>,
    ) -> Result<Decoded, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let Some(automaton) = constraint else {
            return Ok(Decoded {
                text: self.script.concat(),
                output_tokens: self.script.len() as u32,
                input_tokens: None,
            });
        };

        let mut text = String::new();
        let mut tokens = 0u32;
        for piece in &self.script {
            if tokens >= config.max_new_tokens || automaton.is_complete() {
                break;
            }
            if automaton.admits(piece) {
                automaton
                    .advance(piece)
                    .map_err(|e| GenerationError::ConstraintViolated(e.to_string()))?;
                text.push_str(piece);
                tokens += 1;
            }
        }

        while !automaton.is_complete() {
            if tokens >= config.max_new_tokens {
                return Err(GenerationError::Incomplete {
                    output_tokens: tokens,
                });
            }
            let piece = self
                .vocabulary
                .iter()
                .find(|p| automaton.admits(p))
                .ok_or_else(|| GenerationError::ConstraintViolated("no admissible token".into()))?;
            automaton
                .advance(piece)
                .map_err(|e| GenerationError::ConstraintViolated(e.to_string()))?;
            text.push_str(piece);
            tokens += 1;
        }

        Ok(Decoded {
            text,
            output_tokens: tokens,
            input_tokens: None,
        })
    }
}
