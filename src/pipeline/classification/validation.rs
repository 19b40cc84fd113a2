//! Stage-specific structural validation with deterministic auto-fixes.
//!
//! Recoverable defects are fixed and recorded in `auto_fixes`; suspicious
//! but legal content is recorded in `warnings`. Only defects with no safe
//! fix are returned as errors, which sends the orchestrator to its retry.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use super::types::{
    ActionType, BatchActionMapping, BatchFieldMappingResult, Charge, ClassificationResult,
    FieldMappingResult, MappingValidation, StageOutput, SuggestedAction,
};
use crate::pipeline::generation::Stage;

static SNAKE_CASE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("valid regex"));

/// Prefixes models tend to invent when no registered action fits.
const HALLUCINATION_PREFIXES: &[&str] = &[
    "super_", "advanced_", "custom_", "special_", "auto_", "smart_", "new_", "enhanced_",
    "improved_", "optimized_", "fast_",
];

const CONFIDENCE_RANGE: (f64, f64) = (0.0, 100.0);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("suggested_actions is missing or empty")]
    NoActions,

    #[error("suggested_actions[{index}] has no action name")]
    MalformedAction { index: usize },

    #[error("api_request_body is missing or not an object")]
    MissingRequestBody,

    #[error("actions is not a non-empty array")]
    NoBatchActions,

    #[error("actions[{index}] is not an object with an api_request_body object")]
    MalformedBatchAction { index: usize },
}

/// A validated stage output plus what validation changed or noticed.
#[derive(Debug, Clone)]
pub struct Validated {
    pub output: StageOutput,
    pub auto_fixes: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Default)]
struct Notes {
    auto_fixes: Vec<String>,
    warnings: Vec<String>,
}

impl Notes {
    fn fix(&mut self, stage: Stage, message: String) {
        tracing::info!(%stage, fix = %message, "Auto-fixed model output");
        self.auto_fixes.push(message);
    }

    fn warn(&mut self, stage: Stage, message: String) {
        tracing::warn!(%stage, warning = %message, "Suspicious model output");
        self.warnings.push(message);
    }
}

pub fn validate(stage: Stage, document: Map<String, Value>) -> Result<Validated, ValidationError> {
    let mut notes = Notes::default();
    let output = match stage {
        Stage::ActionSelection => {
            StageOutput::ActionSelection(validate_action_selection(document, &mut notes)?)
        }
        Stage::FieldMapping if is_batch_mapping(&document) => {
            StageOutput::FieldMappingBatch(validate_batch_mapping(document, &mut notes)?)
        }
        Stage::FieldMapping => {
            StageOutput::FieldMapping(validate_field_mapping(document, &mut notes)?)
        }
    };
    Ok(Validated {
        output,
        auto_fixes: notes.auto_fixes,
        warnings: notes.warnings,
    })
}

// ═══════════════════════════════════════════════════════════
// Action selection
// ═══════════════════════════════════════════════════════════

fn validate_action_selection(
    mut document: Map<String, Value>,
    notes: &mut Notes,
) -> Result<ClassificationResult, ValidationError> {
    let stage = Stage::ActionSelection;

    let raw_actions = match document.remove("suggested_actions") {
        Some(Value::Array(items)) if !items.is_empty() => items,
        _ => return Err(ValidationError::NoActions),
    };

    let mut actions = Vec::with_capacity(raw_actions.len());
    for (index, item) in raw_actions.into_iter().enumerate() {
        actions.push(parse_action(index, item, notes)?);
    }

    enforce_single_primary(&mut actions, notes);

    let semantic_analysis = match document.remove("semantic_analysis") {
        Some(Value::Object(map)) => map,
        _ => {
            notes.fix(stage, "semantic_analysis missing; set to {}".to_string());
            Map::new()
        }
    };

    let primary_confidence = actions
        .iter()
        .find(|a| a.action_type == ActionType::Primary)
        .map(|a| a.confidence)
        .unwrap_or(0.0);
    let overall_confidence = match document.remove("overall_confidence").as_ref().and_then(as_number) {
        Some(value) => clamp_confidence("overall_confidence", value, notes),
        None => {
            notes.fix(
                stage,
                format!("overall_confidence missing; derived {primary_confidence} from PRIMARY action"),
            );
            primary_confidence
        }
    };

    Ok(ClassificationResult {
        semantic_analysis,
        suggested_actions: actions,
        overall_confidence,
        extra: document,
    })
}

fn parse_action(
    index: usize,
    item: Value,
    notes: &mut Notes,
) -> Result<SuggestedAction, ValidationError> {
    let stage = Stage::ActionSelection;
    let Value::Object(mut fields) = item else {
        return Err(ValidationError::MalformedAction { index });
    };

    let action = match fields.remove("action") {
        Some(Value::String(name)) if !name.trim().is_empty() => name.trim().to_string(),
        _ => return Err(ValidationError::MalformedAction { index }),
    };

    let action_type = match fields.remove("action_type") {
        Some(Value::String(kind)) if kind.eq_ignore_ascii_case("primary") => ActionType::Primary,
        Some(Value::String(kind)) if kind.eq_ignore_ascii_case("secondary") => {
            ActionType::Secondary
        }
        other => {
            notes.fix(
                stage,
                format!("{action}: action_type {} treated as SECONDARY", describe(other.as_ref())),
            );
            ActionType::Secondary
        }
    };

    let confidence = match fields.remove("confidence").as_ref().and_then(as_number) {
        Some(value) => clamp_confidence(&action, value, notes),
        None => {
            notes.fix(stage, format!("{action}: confidence missing; set to 0"));
            0.0
        }
    };

    check_action_name(&action, notes);

    Ok(SuggestedAction {
        action,
        action_type,
        confidence,
        extra: fields,
    })
}

/// Exactly one PRIMARY: when the model marked zero or several, the highest
/// confidence wins (earliest on ties) and every other action is SECONDARY.
fn enforce_single_primary(actions: &mut [SuggestedAction], notes: &mut Notes) {
    let marked = actions
        .iter()
        .filter(|a| a.action_type == ActionType::Primary)
        .count();
    if marked == 1 {
        return;
    }

    let mut winner = 0;
    for (index, action) in actions.iter().enumerate() {
        if action.confidence > actions[winner].confidence {
            winner = index;
        }
    }
    for (index, action) in actions.iter_mut().enumerate() {
        action.action_type = if index == winner {
            ActionType::Primary
        } else {
            ActionType::Secondary
        };
    }

    notes.fix(
        Stage::ActionSelection,
        format!(
            "{marked} PRIMARY actions; promoted '{}' ({}) to PRIMARY",
            actions[winner].action, actions[winner].confidence
        ),
    );
}

fn clamp_confidence(field: &str, value: f64, notes: &mut Notes) -> f64 {
    let (low, high) = CONFIDENCE_RANGE;
    if (low..=high).contains(&value) {
        return value;
    }
    let clamped = value.clamp(low, high);
    notes.fix(
        Stage::ActionSelection,
        format!("{field}: confidence {value} out of range; clamped to {clamped}"),
    );
    clamped
}

fn check_action_name(action: &str, notes: &mut Notes) {
    let stage = Stage::ActionSelection;
    if !SNAKE_CASE.is_match(action) {
        notes.warn(stage, format!("action '{action}' is not snake_case"));
    }
    if let Some(prefix) = HALLUCINATION_PREFIXES.iter().find(|p| action.starts_with(*p)) {
        notes.warn(
            stage,
            format!("action '{action}' may be hallucinated (suspicious prefix '{prefix}')"),
        );
    }
}

// ═══════════════════════════════════════════════════════════
// Field mapping
// ═══════════════════════════════════════════════════════════

fn validate_field_mapping(
    mut document: Map<String, Value>,
    notes: &mut Notes,
) -> Result<FieldMappingResult, ValidationError> {
    let api_request_body = match document.remove("api_request_body") {
        Some(Value::Object(body)) => body,
        _ => return Err(ValidationError::MissingRequestBody),
    };
    Ok(complete_mapping(api_request_body, document, "", notes))
}

/// A document is a batch when it carries an `actions` list instead of a
/// root request body.
fn is_batch_mapping(document: &Map<String, Value>) -> bool {
    document.contains_key("actions") && !document.contains_key("api_request_body")
}

fn validate_batch_mapping(
    mut document: Map<String, Value>,
    notes: &mut Notes,
) -> Result<BatchFieldMappingResult, ValidationError> {
    let items = match document.remove("actions") {
        Some(Value::Array(items)) if !items.is_empty() => items,
        _ => return Err(ValidationError::NoBatchActions),
    };

    let mut actions = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        let Value::Object(mut fields) = item else {
            return Err(ValidationError::MalformedBatchAction { index });
        };
        let api_request_body = match fields.remove("api_request_body") {
            Some(Value::Object(body)) => body,
            _ => return Err(ValidationError::MalformedBatchAction { index }),
        };

        let action_index = match fields.remove("action_index").as_ref().and_then(Value::as_u64) {
            Some(position) => position as usize,
            None => {
                notes.fix(
                    Stage::FieldMapping,
                    format!("actions[{index}].action_index missing; set to {index}"),
                );
                index
            }
        };
        let action_name = match fields.remove("action_name") {
            Some(Value::String(name)) if !name.trim().is_empty() => Some(name.trim().to_string()),
            _ => None,
        };

        let scope = format!("actions[{index}].");
        actions.push(BatchActionMapping {
            action_index,
            action_name,
            mapping: complete_mapping(api_request_body, fields, &scope, notes),
        });
    }

    tracing::debug!(actions = actions.len(), "Batch mapping validated");
    Ok(BatchFieldMappingResult {
        actions,
        extra: document,
    })
}

/// Fill the optional mapping fields around a request body. `scope`
/// prefixes fix messages for batch entries.
fn complete_mapping(
    api_request_body: Map<String, Value>,
    mut document: Map<String, Value>,
    scope: &str,
    notes: &mut Notes,
) -> FieldMappingResult {
    let stage = Stage::FieldMapping;

    let lookups_required = match document.remove("lookups_required") {
        Some(Value::Array(items)) => {
            let total = items.len();
            let lookups: Vec<String> = items
                .into_iter()
                .filter_map(|item| match item {
                    Value::String(token) => Some(token),
                    _ => None,
                })
                .collect();
            if lookups.len() != total {
                notes.fix(
                    stage,
                    format!(
                        "{scope}lookups_required: dropped {} non-string entries",
                        total - lookups.len()
                    ),
                );
            }
            lookups
        }
        other => {
            notes.fix(
                stage,
                format!("{scope}lookups_required {}; set to []", describe(other.as_ref())),
            );
            Vec::new()
        }
    };

    let validation = match document.remove("validation") {
        Some(Value::Object(fields)) => mapping_validation(fields, scope, notes),
        other => {
            notes.fix(
                stage,
                format!("{scope}validation {}; filled with defaults", describe(other.as_ref())),
            );
            MappingValidation::default()
        }
    };

    FieldMappingResult {
        api_request_body,
        lookups_required,
        validation,
        extra: document,
    }
}

fn mapping_validation(
    mut fields: Map<String, Value>,
    scope: &str,
    notes: &mut Notes,
) -> MappingValidation {
    let stage = Stage::FieldMapping;
    let mut fix = |field: &str, found: Option<&Value>, default: &str| {
        notes.fix(
            stage,
            format!("{scope}validation.{field} {}; set to {default}", describe(found)),
        );
    };

    let total_amount_matches = match fields.remove("total_amount_matches") {
        Some(Value::Bool(flag)) => flag,
        other => {
            fix("total_amount_matches", other.as_ref(), "false");
            false
        }
    };

    let found = fields.remove("calculated_total");
    let calculated_total = match found.as_ref().and_then(as_number) {
        Some(total) => total,
        None => {
            fix("calculated_total", found.as_ref(), "0.0");
            0.0
        }
    };

    let all_charges_included = match fields.remove("all_charges_included") {
        Some(Value::Bool(flag)) => flag,
        other => {
            fix("all_charges_included", other.as_ref(), "false");
            false
        }
    };

    let charges_found = match fields.remove("charges_found") {
        Some(Value::Array(items)) => items.into_iter().filter_map(parse_charge).collect(),
        other => {
            fix("charges_found", other.as_ref(), "[]");
            Vec::new()
        }
    };

    let warnings = match fields.remove("warnings") {
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(text) => text,
                other => other.to_string(),
            })
            .collect(),
        other => {
            fix("warnings", other.as_ref(), "[]");
            Vec::new()
        }
    };

    MappingValidation {
        total_amount_matches,
        calculated_total,
        all_charges_included,
        charges_found,
        warnings,
        extra: fields,
    }
}

fn parse_charge(item: Value) -> Option<Charge> {
    match item {
        Value::String(label) => Some(Charge::Label(label)),
        Value::Object(fields) => {
            let description = fields.get("description")?.as_str()?.to_string();
            let amount = fields.get("amount").and_then(as_number);
            Some(Charge::Itemized {
                description,
                amount,
            })
        }
        _ => None,
    }
}

// ═══════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════

/// Numbers, or strings that hold one ("1,210.00" included).
fn as_number(value: &Value) -> Option<f64> {
    let number: Option<f64> = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    };
    number.filter(|n| n.is_finite())
}

fn describe(value: Option<&Value>) -> &'static str {
    match value {
        None | Some(Value::Null) => "missing",
        Some(_) => "malformed",
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
