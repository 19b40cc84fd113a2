use std::sync::Arc;

use serde_json::{Map, Value};
use uuid::Uuid;

use super::prompt::{frame_for, Enforcement};
use super::types::{StageContext, StageMetadata, StageOutput, ValidatedResult};
use super::validation::validate;
use super::{AttemptFailure, ClassificationError};
use crate::inference_gate::InferenceGate;
use crate::pipeline::generation::{
    truncate_chars, ConstrainedGenerator, GeneratedText, GenerationConfig, GenerationOverrides,
    GenerationRequest, RepairEngine, RepairError, SchemaRegistry, Stage,
};
use crate::pipeline::session::SessionCell;

/// Raw output excerpt carried by failures.
const MAX_EXCERPT_CHARS: usize = 200;

/// The bounded retry ladder: one configured attempt, one greedy attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Initial,
    Greedy,
}

impl Attempt {
    fn number(self) -> u32 {
        match self {
            Self::Initial => 1,
            Self::Greedy => 2,
        }
    }

    fn next(self) -> Option<Self> {
        match self {
            Self::Initial => Some(Self::Greedy),
            Self::Greedy => None,
        }
    }

    fn enforcement(self) -> Enforcement {
        match self {
            Self::Initial => Enforcement::Standard,
            Self::Greedy => Enforcement::Strict,
        }
    }

    fn request(self, base: &GenerationRequest) -> GenerationRequest {
        match self {
            Self::Initial => base.clone(),
            Self::Greedy => base.greedy(),
        }
    }
}

/// Parsed and validated output of one attempt.
struct Interpreted {
    output: StageOutput,
    repairs: Vec<String>,
    auto_fixes: Vec<String>,
    warnings: Vec<String>,
}

/// Sequences generation, repair, and validation for one stage:
/// generate → parse/repair → validate → (retry greedily once) → result
pub struct StageOrchestrator {
    generator: ConstrainedGenerator,
    sessions: Arc<SessionCell>,
    gate: Arc<InferenceGate>,
}

impl StageOrchestrator {
    pub fn new(
        generator: ConstrainedGenerator,
        sessions: Arc<SessionCell>,
        gate: Arc<InferenceGate>,
    ) -> Self {
        Self {
            generator,
            sessions,
            gate,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionCell> {
        &self.sessions
    }

    pub fn gate(&self) -> &Arc<InferenceGate> {
        &self.gate
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        self.generator.registry()
    }

    /// Run one stage to a validated result or a typed failure. Never
    /// returns an empty success.
    pub fn run_stage(
        &self,
        stage: Stage,
        prompt: &str,
        context: &StageContext,
        overrides: &GenerationOverrides,
    ) -> Result<ValidatedResult, ClassificationError> {
        let request_id = Uuid::new_v4();
        let _span = tracing::info_span!("run_stage", %stage, %request_id).entered();

        if prompt.trim().is_empty() {
            return Err(ClassificationError::EmptyPrompt);
        }

        let session = self.sessions.get_or_acquire()?;
        let batch = stage == Stage::FieldMapping && context.is_batch();
        let defaults = if batch {
            tracing::info!(actions = context.batch_actions.len(), "Batch field mapping");
            GenerationConfig::field_mapping_batch()
        } else {
            GenerationConfig::for_stage(stage)
        };
        let base = GenerationRequest::new(stage, prompt, defaults.with_overrides(overrides))
            .with_target(context.target_action(), context.target_software())
            .with_batch(batch);

        let mut failures = Vec::new();
        let mut next = Some(Attempt::Initial);

        while let Some(attempt) = next {
            let request = attempt
                .request(&base)
                .with_frame(frame_for(stage, context, attempt.enforcement()));
            let temperature = request.config().temperature;

            let generated = {
                let _turn = self.gate.acquire(stage, session.model_name())?;
                self.generator
                    .generate(session.backend(), &request)
                    .map_err(|source| ClassificationError::Generation { stage, source })?
            };

            match interpret(stage, &generated) {
                Ok(interpreted) => {
                    tracing::info!(
                        attempt = attempt.number(),
                        path = generated.path.label(),
                        repairs = interpreted.repairs.len(),
                        auto_fixes = interpreted.auto_fixes.len(),
                        "Stage complete"
                    );
                    let metadata = StageMetadata {
                        request_id,
                        stage,
                        generated_at: chrono::Utc::now().to_rfc3339(),
                        model: session.model_name().to_string(),
                        attempts: attempt.number(),
                        schema_specificity: generated.path.specificity(),
                        decode_path: generated.path.clone(),
                        repairs_applied: interpreted.repairs,
                        auto_fixes: interpreted.auto_fixes,
                        warnings: [generated.warnings.clone(), interpreted.warnings].concat(),
                        output_tokens: generated.output_tokens,
                        input_tokens: generated.input_tokens,
                        elapsed_ms: generated.elapsed_ms,
                        prompt_length: prompt.chars().count(),
                        context_provided: context.business.is_some(),
                        low_token_warning: low_token_count(stage, &generated),
                    };
                    return Ok(ValidatedResult {
                        output: interpreted.output,
                        metadata,
                    });
                }
                Err((repairs, reason)) => {
                    tracing::warn!(
                        attempt = attempt.number(),
                        temperature,
                        path = generated.path.label(),
                        %reason,
                        excerpt = %excerpt(&generated.text),
                        "Stage attempt rejected"
                    );
                    failures.push(AttemptFailure {
                        attempt: attempt.number(),
                        temperature,
                        decode_path: generated.path.label().to_string(),
                        repairs_attempted: repairs,
                        raw_excerpt: excerpt(&generated.text),
                        reason,
                    });
                    next = attempt.next();
                }
            }
        }

        tracing::error!(attempts = failures.len(), "Stage failed after greedy retry");
        Err(ClassificationError::Exhausted {
            stage,
            attempts: failures,
        })
    }
}

/// Parse (repairing only when needed) and validate one generation.
/// On failure returns the repairs tried and the reason.
fn interpret(
    stage: Stage,
    generated: &GeneratedText,
) -> Result<Interpreted, (Vec<String>, String)> {
    let (document, repairs) = parse_document(stage, generated)?;

    let validated = validate(stage, document).map_err(|e| (repairs.clone(), e.to_string()))?;
    Ok(Interpreted {
        output: validated.output,
        repairs,
        auto_fixes: validated.auto_fixes,
        warnings: validated.warnings,
    })
}

fn parse_document(
    stage: Stage,
    generated: &GeneratedText,
) -> Result<(Map<String, Value>, Vec<String>), (Vec<String>, String)> {
    // Grammar-constrained output conforms already, but may still be a
    // truncated placeholder.
    if generated.path.is_constrained() {
        let len = generated.text.trim().chars().count();
        let min = stage.min_output_chars();
        if len < min {
            return Err((Vec::new(), RepairError::TooShort { len, min }.to_string()));
        }
        if let Ok(document) = serde_json::from_str::<Map<String, Value>>(&generated.text) {
            return Ok((document, Vec::new()));
        }
        tracing::warn!("Constrained output did not parse, repairing");
    }

    match RepairEngine::for_stage(stage).repair(&generated.text) {
        Ok(outcome) => {
            if !outcome.repairs.is_empty() {
                tracing::info!(repairs = ?outcome.repairs, "Repaired model output");
            }
            let repairs = outcome.repairs.iter().map(|r| r.to_string()).collect();
            Ok((outcome.value, repairs))
        }
        Err(e) => {
            let attempted = match &e {
                RepairError::Unparseable { attempted, .. } => {
                    attempted.iter().map(|r| r.to_string()).collect()
                }
                _ => Vec::new(),
            };
            Err((attempted, e.to_string()))
        }
    }
}

fn low_token_count(stage: Stage, generated: &GeneratedText) -> bool {
    let low = generated.output_tokens < stage.low_token_threshold();
    if low {
        tracing::warn!(
            output_tokens = generated.output_tokens,
            threshold = stage.low_token_threshold(),
            "Suspiciously low output token count"
        );
    }
    low
}

fn excerpt(text: &str) -> String {
    truncate_chars(text, MAX_EXCERPT_CHARS).to_string()
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::classification::types::{ActionType, BusinessContext};
    use crate::pipeline::generation::testing::{MockBackend, ScriptedTokenBackend};
    use crate::pipeline::generation::{DecodePath, InferenceBackend, Specificity};
    use crate::pipeline::session::tests::{cell_with, tiers, FakeLoader, Outcome};
    use crate::pipeline::session::{SessionCell, SessionManager};
    use serde_json::json;
    use std::path::Path;

    fn write(root: &Path, relative: &str, body: &Value) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, serde_json::to_string_pretty(body).unwrap()).unwrap();
    }

    fn orchestrator(
        backend: Arc<dyn InferenceBackend>,
        schemas: &[(&str, Value)],
    ) -> (tempfile::TempDir, StageOrchestrator) {
        let dir = tempfile::tempdir().unwrap();
        for (relative, body) in schemas {
            write(dir.path(), relative, body);
        }
        let registry = Arc::new(SchemaRegistry::new(dir.path()));
        let orchestrator = StageOrchestrator::new(
            ConstrainedGenerator::new(registry, 32_768),
            Arc::new(cell_with(backend)),
            Arc::new(InferenceGate::new()),
        );
        (dir, orchestrator)
    }

    fn selection_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "semantic_analysis": {"type": "object"},
                "suggested_actions": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "action": {"type": "string"},
                            "action_type": {"enum": ["PRIMARY", "SECONDARY"]},
                            "confidence": {"type": "number"}
                        },
                        "required": ["action", "action_type", "confidence"]
                    }
                },
                "overall_confidence": {"type": "number"}
            },
            "required": ["semantic_analysis", "suggested_actions", "overall_confidence"],
            "additionalProperties": false
        })
    }

    fn create_bill_body() -> Value {
        json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "properties": {
                "vendor_id": {"type": "string"},
                "line_items": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "description": {"type": "string"},
                            "amount": {"type": "number"}
                        },
                        "required": ["description", "amount"]
                    }
                },
                "tax": {"type": "number"},
                "total": {"type": "number"}
            },
            "required": ["vendor_id", "line_items", "total"]
        })
    }

    const VALID_SELECTION: &str = r#"{"semantic_analysis": {"document_type": "invoice"}, "suggested_actions": [{"action": "create_bill", "action_type": "PRIMARY", "confidence": 91}, {"action": "create_vendor", "action_type": "SECONDARY", "confidence": 40}], "overall_confidence": 91}"#;

    fn no_overrides() -> GenerationOverrides {
        GenerationOverrides::default()
    }

    #[test]
    fn invoice_1210_maps_with_action_specific_schema() {
        let response = r#"{"api_request_body": {"vendor_id": "{{vendor_id}}", "line_items": [{"description": "Framing lumber", "amount": 600}, {"description": "Concrete", "amount": 300}, {"description": "Delivery", "amount": 200}], "tax": 110, "total": 1210}, "lookups_required": ["{{vendor_id}}"], "validation": {"total_amount_matches": true, "calculated_total": 1210, "all_charges_included": true, "charges_found": [{"description": "Tax", "amount": 110}], "warnings": []}}"#;
        let backend = Arc::new(MockBackend::new(&[response]).with_output_tokens(240));
        let (_dir, orchestrator) = orchestrator(
            backend.clone(),
            &[(
                "field_mapping/actions/acme_books/create_bill.json",
                create_bill_body(),
            )],
        );
        let context = StageContext {
            business: Some(BusinessContext {
                sector: Some("construction".into()),
                accounting_software: Some("acme_books".into()),
                ..Default::default()
            }),
            action_name: Some("create_bill".into()),
            ..Default::default()
        };

        let result = orchestrator
            .run_stage(
                Stage::FieldMapping,
                "[3 line items, total $1210, tax $110]",
                &context,
                &no_overrides(),
            )
            .unwrap();

        let StageOutput::FieldMapping(mapping) = &result.output else {
            panic!("expected field mapping output");
        };
        assert_eq!(mapping.validation.calculated_total, 1210.0);
        assert!(mapping.validation.total_amount_matches);
        assert_eq!(mapping.lookups_required, vec!["{{vendor_id}}"]);
        assert_eq!(result.metadata.attempts, 1);
        assert_eq!(
            result.metadata.schema_specificity,
            Some(Specificity::ActionSpecific)
        );
        assert!(result.metadata.repairs_applied.is_empty());
        assert!(result.metadata.context_provided);
        assert!(!result.metadata.low_token_warning);
        assert!(backend.calls()[0].constrained);
    }

    #[test]
    fn parseable_but_short_mapping_is_retried() {
        let full = r#"{"api_request_body": {"vendor_id": "{{vendor_id}}", "total": 1210}, "lookups_required": ["{{vendor_id}}"], "validation": {"total_amount_matches": true, "calculated_total": 1210, "all_charges_included": true, "charges_found": [], "warnings": []}}"#;
        let backend = Arc::new(MockBackend::new(&[r#"{"api_request_body": {}}"#, full]));
        let (_dir, orchestrator) = orchestrator(backend.clone(), &[]);

        let result = orchestrator
            .run_stage(
                Stage::FieldMapping,
                "Invoice 1210",
                &StageContext::default(),
                &no_overrides(),
            )
            .unwrap();

        assert_eq!(result.metadata.attempts, 2);
        assert_eq!(backend.call_count(), 2);
        assert_eq!(backend.calls()[1].temperature, 0.0);
        let StageOutput::FieldMapping(mapping) = &result.output else {
            panic!("expected field mapping output");
        };
        assert_eq!(mapping.api_request_body["total"], json!(1210));
    }

    #[test]
    fn constrained_placeholder_below_minimum_is_retried() {
        let backend = Arc::new(ScriptedTokenBackend::new(&["{\"api_request_body\": {}", "}"]));
        let (_dir, orchestrator) = orchestrator(
            backend.clone(),
            &[(
                "field_mapping/generic.json",
                json!({
                    "type": "object",
                    "properties": {"api_request_body": {"type": "object"}},
                    "required": ["api_request_body"]
                }),
            )],
        );

        let err = orchestrator
            .run_stage(
                Stage::FieldMapping,
                "Invoice 1210",
                &StageContext::default(),
                &no_overrides(),
            )
            .unwrap_err();

        let ClassificationError::Exhausted { attempts, .. } = &err else {
            panic!("unexpected error: {err:?}");
        };
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].decode_path, "constrained");
        assert!(attempts[0].reason.contains("too short"), "reason: {}", attempts[0].reason);
        assert_eq!(backend.call_count(), 2);
    }

    #[test]
    fn mapping_without_validation_is_completed() {
        let response = r#"{"api_request_body": {"vendor_id": "{{vendor_id}}", "total": 1210}, "lookups_required": ["{{vendor_id}}"]}"#;
        let backend = Arc::new(MockBackend::new(&[response]));
        let (_dir, orchestrator) = orchestrator(backend.clone(), &[]);

        let result = orchestrator
            .run_stage(
                Stage::FieldMapping,
                "Invoice 1210",
                &StageContext::default(),
                &no_overrides(),
            )
            .unwrap();

        assert_eq!(result.metadata.attempts, 1);
        assert_eq!(
            result.metadata.auto_fixes,
            vec!["validation missing; filled with defaults"]
        );
        let value = serde_json::to_value(&result.output).unwrap();
        assert_eq!(
            value["validation"],
            json!({
                "total_amount_matches": false,
                "calculated_total": 0.0,
                "all_charges_included": false,
                "charges_found": [],
                "warnings": []
            })
        );
    }

    #[test]
    fn batch_mapping_uses_batch_budget_and_contract() {
        let response = r#"{"actions": [{"action_index": 0, "action_name": "create_contact", "api_request_body": {"contact_name": "Acme Supply"}}, {"action_index": 1, "action_name": "create_bill", "api_request_body": {"vendor_id": "{{vendor_id}}", "total": 1210}, "lookups_required": ["{{vendor_id}}"]}]}"#;
        let backend = Arc::new(MockBackend::new(&[response]));
        // Single-action contracts must not constrain a batch.
        let (_dir, orchestrator) = orchestrator(
            backend.clone(),
            &[(
                "field_mapping/actions/acme_books/create_bill.json",
                create_bill_body(),
            )],
        );
        let context = StageContext {
            software: Some("acme_books".into()),
            batch_actions: vec!["create_contact".into(), "create_bill".into()],
            ..Default::default()
        };

        let result = orchestrator
            .run_stage(Stage::FieldMapping, "Invoice 1210", &context, &no_overrides())
            .unwrap();

        let calls = backend.calls();
        assert_eq!(calls.len(), 1);
        assert!(!calls[0].constrained);
        assert_eq!(calls[0].max_new_tokens, 4000);
        assert!(calls[0]
            .prompt
            .contains("Target actions: create_contact, create_bill (acme_books)"));

        let StageOutput::FieldMappingBatch(batch) = &result.output else {
            panic!("expected batch output");
        };
        assert_eq!(batch.actions.len(), 2);
        assert_eq!(batch.actions[1].action_name.as_deref(), Some("create_bill"));
        assert_eq!(batch.actions[1].mapping.lookups_required, vec!["{{vendor_id}}"]);
        assert_eq!(result.output.stage(), Stage::FieldMapping);
        // Two actions each missing validation, the first also its lookups.
        assert_eq!(result.metadata.auto_fixes.len(), 3);
    }

    #[test]
    fn unrecoverable_output_retries_once_greedily() {
        let continuation = r#""semantic_analysis": {}, "suggested_actions": [{"action": "create_bill", "action_type": "PRIMARY", "confidence": 90}], "overall_confidence": 90}"#;
        let backend = Arc::new(MockBackend::new(&["I cannot help with that request.", continuation]));
        let (_dir, orchestrator) = orchestrator(backend.clone(), &[]);

        let result = orchestrator
            .run_stage(
                Stage::ActionSelection,
                "Invoice 1210",
                &StageContext::default(),
                &no_overrides(),
            )
            .unwrap();

        let calls = backend.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].temperature, 0.1);
        assert_eq!(calls[1].temperature, 0.0);
        assert!(calls[1].prompt.contains("ABSOLUTE REQUIREMENT"));
        assert_eq!(result.metadata.attempts, 2);
        assert_eq!(result.metadata.repairs_applied, vec!["outer_wrapper"]);
    }

    #[test]
    fn second_failure_surfaces_typed_error() {
        let backend = Arc::new(MockBackend::new(&["Sorry, the document is unreadable."]));
        let (_dir, orchestrator) = orchestrator(backend.clone(), &[]);

        let err = orchestrator
            .run_stage(
                Stage::ActionSelection,
                "Invoice 1210",
                &StageContext::default(),
                &no_overrides(),
            )
            .unwrap_err();

        match &err {
            ClassificationError::Exhausted { stage, attempts } => {
                assert_eq!(*stage, Stage::ActionSelection);
                assert_eq!(attempts.len(), 2);
                assert_eq!(attempts[0].attempt, 1);
                assert_eq!(attempts[1].temperature, 0.0);
                assert!(attempts[1].raw_excerpt.starts_with("Sorry"));
                assert_eq!(attempts[1].decode_path, "unconstrained");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // Exactly one retry, never more.
        assert_eq!(backend.call_count(), 2);
    }

    #[test]
    fn validation_failure_without_fix_consumes_the_retry() {
        let backend = Arc::new(MockBackend::new(&[
            r#"{"semantic_analysis": {}, "suggested_actions": [], "overall_confidence": 0}"#,
            VALID_SELECTION,
        ]));
        let (_dir, orchestrator) = orchestrator(backend.clone(), &[]);

        let result = orchestrator
            .run_stage(
                Stage::ActionSelection,
                "Invoice 1210",
                &StageContext::default(),
                &no_overrides(),
            )
            .unwrap();

        assert_eq!(result.metadata.attempts, 2);
        assert_eq!(backend.call_count(), 2);
    }

    #[test]
    fn multiple_primaries_are_resolved_without_retry() {
        let response = r#"{"semantic_analysis": {}, "suggested_actions": [{"action": "create_bill", "action_type": "PRIMARY", "confidence": 72}, {"action": "create_expense", "action_type": "PRIMARY", "confidence": 85}], "overall_confidence": 85}"#;
        let backend = Arc::new(MockBackend::new(&[response]));
        let (_dir, orchestrator) = orchestrator(backend.clone(), &[]);

        let result = orchestrator
            .run_stage(
                Stage::ActionSelection,
                "Invoice 1210",
                &StageContext::default(),
                &no_overrides(),
            )
            .unwrap();

        let StageOutput::ActionSelection(selection) = &result.output else {
            panic!("expected action selection output");
        };
        let primaries: Vec<_> = selection
            .suggested_actions
            .iter()
            .filter(|a| a.action_type == ActionType::Primary)
            .collect();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].action, "create_expense");
        assert_eq!(result.metadata.auto_fixes.len(), 1);
        assert_eq!(backend.call_count(), 1);
    }

    #[test]
    fn constrained_path_needs_no_repair() {
        let backend = Arc::new(ScriptedTokenBackend::new(&[
            "Here is the JSON you asked for:",
            "\n",
            "{\"semantic_analysis\": {}",
            ", \"suggested_actions\": [",
            "{\"action\": \"create_bill\", \"action_type\": \"PRIMARY\", \"confidence\": 93}",
            "]",
            ", \"overall_confidence\": 93",
            "}",
            "\nLet me know if you need anything else.",
        ]));
        let (_dir, orchestrator) = orchestrator(
            backend.clone(),
            &[("action_selection/generic.json", selection_schema())],
        );

        let result = orchestrator
            .run_stage(
                Stage::ActionSelection,
                "Invoice 1210",
                &StageContext::default(),
                &no_overrides(),
            )
            .unwrap();

        assert!(result.metadata.decode_path.is_constrained());
        assert_eq!(
            result.metadata.schema_specificity,
            Some(Specificity::GenericStage)
        );
        assert!(result.metadata.repairs_applied.is_empty());
        assert!(result.metadata.auto_fixes.is_empty());
        assert_eq!(backend.call_count(), 1);
    }

    #[test]
    fn preamble_is_repaired_on_fallback_path() {
        let backend = Arc::new(MockBackend::new(&[&format!(
            "Based on the document, here is the classification: {VALID_SELECTION}"
        )]));
        let (_dir, orchestrator) = orchestrator(backend.clone(), &[]);

        let result = orchestrator
            .run_stage(
                Stage::ActionSelection,
                "Invoice 1210",
                &StageContext::default(),
                &no_overrides(),
            )
            .unwrap();

        assert!(matches!(
            result.metadata.decode_path,
            DecodePath::Unconstrained { .. }
        ));
        assert!(result
            .metadata
            .repairs_applied
            .contains(&"preamble".to_string()));
        assert_eq!(result.metadata.attempts, 1);
    }

    #[test]
    fn short_output_raises_low_token_warning() {
        let backend = Arc::new(MockBackend::new(&[VALID_SELECTION]).with_output_tokens(12));
        let (_dir, orchestrator) = orchestrator(backend, &[]);

        let result = orchestrator
            .run_stage(
                Stage::ActionSelection,
                "Invoice 1210",
                &StageContext::default(),
                &no_overrides(),
            )
            .unwrap();

        assert!(result.metadata.low_token_warning);
    }

    #[test]
    fn overrides_reach_the_decoder() {
        let backend = Arc::new(MockBackend::new(&[VALID_SELECTION]));
        let (_dir, orchestrator) = orchestrator(backend.clone(), &[]);
        let overrides = GenerationOverrides {
            temperature: Some(0.4),
            ..Default::default()
        };

        orchestrator
            .run_stage(
                Stage::ActionSelection,
                "Invoice 1210",
                &StageContext::default(),
                &overrides,
            )
            .unwrap();

        assert_eq!(backend.calls()[0].temperature, 0.4);
    }

    #[test]
    fn transport_failure_is_not_retried() {
        let backend = Arc::new(MockBackend::unreachable());
        let (_dir, orchestrator) = orchestrator(backend.clone(), &[]);

        let err = orchestrator
            .run_stage(
                Stage::FieldMapping,
                "Invoice 1210",
                &StageContext::default(),
                &no_overrides(),
            )
            .unwrap_err();

        assert!(matches!(err, ClassificationError::Generation { stage: Stage::FieldMapping, .. }));
        assert_eq!(backend.call_count(), 1);
    }

    #[test]
    fn empty_prompt_is_rejected_before_loading() {
        let loader = Arc::new(FakeLoader::new(&[Outcome::Fits]));
        let cell = SessionCell::new(SessionManager::new(loader.clone()), tiers(1));
        let orchestrator = StageOrchestrator::new(
            ConstrainedGenerator::new(Arc::new(SchemaRegistry::new("/nonexistent")), 32_768),
            Arc::new(cell),
            Arc::new(InferenceGate::new()),
        );

        let err = orchestrator
            .run_stage(
                Stage::ActionSelection,
                "   ",
                &StageContext::default(),
                &no_overrides(),
            )
            .unwrap_err();

        assert!(matches!(err, ClassificationError::EmptyPrompt));
        assert_eq!(loader.loads(0), 0);
    }

    #[test]
    fn acquisition_failure_is_fatal() {
        let loader = Arc::new(FakeLoader::new(&[Outcome::OutOfMemory, Outcome::Offloads]));
        let cell = SessionCell::new(SessionManager::new(loader), tiers(2));
        let orchestrator = StageOrchestrator::new(
            ConstrainedGenerator::new(Arc::new(SchemaRegistry::new("/nonexistent")), 32_768),
            Arc::new(cell),
            Arc::new(InferenceGate::new()),
        );

        let err = orchestrator
            .run_stage(
                Stage::ActionSelection,
                "Invoice 1210",
                &StageContext::default(),
                &no_overrides(),
            )
            .unwrap_err();

        assert!(matches!(err, ClassificationError::Session(_)));
        assert_eq!(err.kind(), "model_unavailable");
    }
}
