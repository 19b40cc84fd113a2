use serde::{Deserialize, Serialize};

use super::grammar::SchemaAutomaton;
use super::GenerationError;

// ═══════════════════════════════════════════════════════════
// Stage
// ═══════════════════════════════════════════════════════════

/// The generation stages of the classification pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    /// Stage 1: semantic analysis and ranked action candidates.
    #[serde(alias = "action_selection", alias = "stage_1")]
    ActionSelection,
    /// Stage 4: map the chosen action onto the target software's API body.
    #[serde(alias = "field_mapping", alias = "stage_4")]
    FieldMapping,
}

impl Stage {
    pub const ALL: [Stage; 2] = [Stage::ActionSelection, Stage::FieldMapping];

    /// Directory name under the schema root.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ActionSelection => "action_selection",
            Self::FieldMapping => "field_mapping",
        }
    }

    /// Candidates shorter than this that do not already parse are treated
    /// as truncated generations.
    pub fn min_output_chars(&self) -> usize {
        match self {
            Self::ActionSelection => 10,
            Self::FieldMapping => 50,
        }
    }

    /// Below this many output tokens the model most likely refused or stalled.
    pub fn low_token_threshold(&self) -> u32 {
        match self {
            Self::ActionSelection => 50,
            Self::FieldMapping => 100,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════
// GenerationConfig
// ═══════════════════════════════════════════════════════════

/// Sampling and budget parameters for one decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub max_new_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repetition_penalty: f32,
    /// Estimated token budget for the prompt.
    pub max_input_length: u32,
}

impl GenerationConfig {
    /// Action selection: moderate budget, low but nonzero temperature.
    pub fn action_selection() -> Self {
        Self {
            max_new_tokens: 2500,
            temperature: 0.1,
            top_p: 0.95,
            top_k: 50,
            repetition_penalty: 1.1,
            max_input_length: 29_491,
        }
    }

    /// Field mapping: larger budget, near-zero temperature.
    pub fn field_mapping() -> Self {
        Self {
            max_new_tokens: 3000,
            temperature: 0.05,
            top_p: 0.95,
            top_k: 50,
            repetition_penalty: 1.15,
            max_input_length: 29_491,
        }
    }

    /// Field mapping for several actions at once: same sampling, more room
    /// for the output.
    pub fn field_mapping_batch() -> Self {
        Self {
            max_new_tokens: 4000,
            ..Self::field_mapping()
        }
    }

    pub fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::ActionSelection => Self::action_selection(),
            Stage::FieldMapping => Self::field_mapping(),
        }
    }

    /// The same budgets decoded greedily, for the single retry.
    pub fn greedy(&self) -> Self {
        Self {
            temperature: 0.0,
            top_p: 0.9,
            top_k: 40,
            repetition_penalty: 1.2,
            ..self.clone()
        }
    }

    /// Apply caller overrides on top of these values.
    pub fn with_overrides(mut self, overrides: &GenerationOverrides) -> Self {
        if let Some(v) = overrides.max_new_tokens {
            self.max_new_tokens = v;
        }
        if let Some(v) = overrides.temperature {
            self.temperature = v;
        }
        if let Some(v) = overrides.top_p {
            self.top_p = v;
        }
        if let Some(v) = overrides.top_k {
            self.top_k = v;
        }
        if let Some(v) = overrides.repetition_penalty {
            self.repetition_penalty = v;
        }
        if let Some(v) = overrides.max_input_length {
            self.max_input_length = v;
        }
        self
    }

    /// Clamp every field into its legal range. Returns one warning per
    /// adjusted field; never fails.
    pub fn clamp_to_ceiling(&mut self, ceiling: u32) -> Vec<String> {
        let mut warnings = Vec::new();
        let reserve = input_reserve(ceiling);
        let max_output = ceiling - reserve;

        if self.max_new_tokens > max_output {
            warnings.push(format!(
                "max_new_tokens {} leaves under {reserve} prompt tokens of context ceiling {ceiling}; clamped to {max_output}",
                self.max_new_tokens
            ));
            self.max_new_tokens = max_output;
        }
        if self.max_new_tokens == 0 {
            warnings.push("max_new_tokens 0 raised to 1".to_string());
            self.max_new_tokens = 1;
        }
        if self.max_input_length > ceiling {
            warnings.push(format!(
                "max_input_length {} exceeds context ceiling {ceiling}; clamped",
                self.max_input_length
            ));
            self.max_input_length = ceiling;
        }
        if self.max_input_length == 0 {
            warnings.push(format!("max_input_length 0 raised to {reserve}"));
            self.max_input_length = reserve;
        }
        if !(0.0..=2.0).contains(&self.temperature) || self.temperature.is_nan() {
            let clamped = if self.temperature.is_nan() { 0.0 } else { self.temperature.clamp(0.0, 2.0) };
            warnings.push(format!("temperature {} clamped to {clamped}", self.temperature));
            self.temperature = clamped;
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            warnings.push(format!("top_p {} clamped to 1.0", self.top_p));
            self.top_p = 1.0;
        }

        for warning in &warnings {
            tracing::warn!(%warning, "Generation config adjusted");
        }
        warnings
    }

    /// Prompt budget left once the output budget is reserved.
    pub fn input_budget(&self, ceiling: u32) -> u32 {
        self.max_input_length
            .min(ceiling.saturating_sub(self.max_new_tokens))
    }
}

/// Prompt tokens no output budget may claim.
pub const MIN_INPUT_TOKENS: u32 = 1024;

/// Share of `ceiling` held back for the prompt: [`MIN_INPUT_TOKENS`], or
/// half of a smaller window.
fn input_reserve(ceiling: u32) -> u32 {
    MIN_INPUT_TOKENS.min(ceiling / 2)
}

/// Caller-supplied overrides; `None` keeps the stage default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOverrides {
    #[serde(default, alias = "max_tokens")]
    pub max_new_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub repetition_penalty: Option<f32>,
    #[serde(default)]
    pub max_input_length: Option<u32>,
}

// ═══════════════════════════════════════════════════════════
// GenerationRequest
// ═══════════════════════════════════════════════════════════

/// Instruction text wrapped around the prompt body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptFrame {
    pub prefix: String,
    pub suffix: String,
}

impl PromptFrame {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    pub fn overhead_chars(&self) -> usize {
        self.prefix.chars().count() + self.suffix.chars().count()
    }
}

/// One generation call. Immutable once built; the retry path derives a
/// new request instead of mutating this one.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    prompt: String,
    stage: Stage,
    action_name: Option<String>,
    software: Option<String>,
    batch: bool,
    config: GenerationConfig,
    frame: PromptFrame,
}

impl GenerationRequest {
    pub fn new(stage: Stage, prompt: impl Into<String>, config: GenerationConfig) -> Self {
        Self {
            prompt: prompt.into(),
            stage,
            action_name: None,
            software: None,
            batch: false,
            config,
            frame: PromptFrame::default(),
        }
    }

    pub fn with_target(mut self, action_name: Option<String>, software: Option<String>) -> Self {
        self.action_name = action_name;
        self.software = software;
        self
    }

    /// The request maps several actions in one document.
    pub fn with_batch(mut self, batch: bool) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_frame(mut self, frame: PromptFrame) -> Self {
        self.frame = frame;
        self
    }

    /// Same request decoded greedily.
    pub fn greedy(&self) -> Self {
        let mut next = self.clone();
        next.config = self.config.greedy();
        next
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn action_name(&self) -> Option<&str> {
        self.action_name.as_deref()
    }

    pub fn software(&self) -> Option<&str> {
        self.software.as_deref()
    }

    pub fn is_batch(&self) -> bool {
        self.batch
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    pub fn frame(&self) -> &PromptFrame {
        &self.frame
    }
}

// ═══════════════════════════════════════════════════════════
// InferenceBackend
// ═══════════════════════════════════════════════════════════

/// Raw result of one decode.
#[derive(Debug, Clone, Default)]
pub struct Decoded {
    pub text: String,
    pub output_tokens: u32,
    pub input_tokens: Option<u32>,
}

/// A loaded model that can decode text (allows mocking).
///
/// When `constraint` is given, every emitted piece must be admitted by the
/// automaton and fed into it; the decode ends once the automaton accepts.
pub trait InferenceBackend: Send + Sync {
    fn model_name(&self) -> &str;

    fn decode(
        &self,
        prompt: &str,
        config: &GenerationConfig,
        constraint: Option<&mut SchemaAutomaton>,
    ) -> Result<Decoded, GenerationError>;
}
