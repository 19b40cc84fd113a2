use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::pipeline::generation::{DecodePath, Specificity, Stage};

// ═══════════════════════════════════════════════════════════
// Inputs
// ═══════════════════════════════════════════════════════════

/// Business context supplied by the extraction side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusinessContext {
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub accounting_software: Option<String>,
    #[serde(default)]
    pub thresholds: Map<String, Value>,
}

/// Per-call context for a stage run.
#[derive(Debug, Clone, Default)]
pub struct StageContext {
    pub business: Option<BusinessContext>,
    pub action_name: Option<String>,
    pub software: Option<String>,
    /// Actions mapped together from one document, in output order.
    pub batch_actions: Vec<String>,
}

impl StageContext {
    /// More than one action is mapped in a single generation.
    pub fn is_batch(&self) -> bool {
        self.batch_actions.len() > 1
    }

    /// The single action a request targets: the explicit name, else a
    /// one-element action list.
    pub fn target_action(&self) -> Option<String> {
        match (&self.action_name, self.batch_actions.as_slice()) {
            (Some(action), _) => Some(action.clone()),
            (None, [only]) => Some(only.clone()),
            _ => None,
        }
    }

    /// Explicit software wins over the business context's.
    pub fn target_software(&self) -> Option<String> {
        self.software.clone().or_else(|| {
            self.business
                .as_ref()
                .and_then(|b| b.accounting_software.clone())
        })
    }
}

// ═══════════════════════════════════════════════════════════
// Action selection
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuggestedAction {
    pub action: String,
    pub action_type: ActionType,
    pub confidence: f64,
    /// Model-provided fields beyond the required ones (reasoning, etc.).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Validated action-selection output. Exactly one action is PRIMARY.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationResult {
    pub semantic_analysis: Map<String, Value>,
    pub suggested_actions: Vec<SuggestedAction>,
    pub overall_confidence: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ClassificationResult {
    pub fn primary(&self) -> Option<&SuggestedAction> {
        self.suggested_actions
            .iter()
            .find(|a| a.action_type == ActionType::Primary)
    }
}

// ═══════════════════════════════════════════════════════════
// Field mapping
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Charge {
    Itemized {
        description: String,
        amount: Option<f64>,
    },
    Label(String),
}

/// Arithmetic self-check of a field mapping. Every field is always present.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MappingValidation {
    pub total_amount_matches: bool,
    pub calculated_total: f64,
    pub all_charges_included: bool,
    pub charges_found: Vec<Charge>,
    pub warnings: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for MappingValidation {
    fn default() -> Self {
        Self {
            total_amount_matches: false,
            calculated_total: 0.0,
            all_charges_included: false,
            charges_found: Vec::new(),
            warnings: Vec::new(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldMappingResult {
    pub api_request_body: Map<String, Value>,
    /// Placeholder tokens the caller must resolve before posting.
    pub lookups_required: Vec<String>,
    pub validation: MappingValidation,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One entry of a batch mapping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchActionMapping {
    pub action_index: usize,
    pub action_name: Option<String>,
    #[serde(flatten)]
    pub mapping: FieldMappingResult,
}

/// Field mappings for several actions from the same document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchFieldMappingResult {
    pub actions: Vec<BatchActionMapping>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ═══════════════════════════════════════════════════════════
// Output
// ═══════════════════════════════════════════════════════════

/// Structured result of one stage, dispatched by stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StageOutput {
    ActionSelection(ClassificationResult),
    FieldMapping(FieldMappingResult),
    FieldMappingBatch(BatchFieldMappingResult),
}

impl StageOutput {
    pub fn stage(&self) -> Stage {
        match self {
            Self::ActionSelection(_) => Stage::ActionSelection,
            Self::FieldMapping(_) | Self::FieldMappingBatch(_) => Stage::FieldMapping,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageMetadata {
    pub request_id: Uuid,
    pub stage: Stage,
    /// ISO 8601.
    pub generated_at: String,
    pub model: String,
    /// 1 for a first-try success, 2 after the greedy retry.
    pub attempts: u32,
    pub decode_path: DecodePath,
    pub schema_specificity: Option<Specificity>,
    pub repairs_applied: Vec<String>,
    pub auto_fixes: Vec<String>,
    pub warnings: Vec<String>,
    pub output_tokens: u32,
    pub input_tokens: Option<u32>,
    pub elapsed_ms: u64,
    pub prompt_length: usize,
    pub context_provided: bool,
    pub low_token_warning: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidatedResult {
    pub output: StageOutput,
    pub metadata: StageMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn software_falls_back_to_business_context() {
        let context = StageContext {
            business: Some(BusinessContext {
                accounting_software: Some("acme_books".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(context.target_software().as_deref(), Some("acme_books"));

        let explicit = StageContext {
            software: Some("ledgerly".into()),
            ..context
        };
        assert_eq!(explicit.target_software().as_deref(), Some("ledgerly"));
    }

    #[test]
    fn batch_needs_more_than_one_action() {
        let single = StageContext {
            batch_actions: vec!["create_bill".into()],
            ..Default::default()
        };
        assert!(!single.is_batch());
        assert_eq!(single.target_action().as_deref(), Some("create_bill"));

        let batch = StageContext {
            batch_actions: vec!["create_contact".into(), "create_bill".into()],
            ..Default::default()
        };
        assert!(batch.is_batch());
        assert_eq!(batch.target_action(), None);
    }

    #[test]
    fn batch_entries_serialize_flat() {
        let entry = BatchActionMapping {
            action_index: 1,
            action_name: Some("create_bill".into()),
            mapping: FieldMappingResult {
                api_request_body: Map::new(),
                lookups_required: vec!["{{vendor_id}}".into()],
                validation: MappingValidation::default(),
                extra: Map::new(),
            },
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["action_index"], 1);
        assert_eq!(value["action_name"], "create_bill");
        assert_eq!(value["lookups_required"][0], "{{vendor_id}}");
        assert_eq!(value["validation"]["calculated_total"], 0.0);
        assert!(value.get("mapping").is_none());
    }

    #[test]
    fn charges_serialize_in_either_shape() {
        let charges = vec![
            Charge::Label("Shipping".into()),
            Charge::Itemized {
                description: "Tax".into(),
                amount: Some(110.0),
            },
        ];
        assert_eq!(
            serde_json::to_value(&charges).unwrap(),
            json!(["Shipping", {"description": "Tax", "amount": 110.0}])
        );
    }

    #[test]
    fn action_keeps_extra_fields_flat() {
        let mut extra = Map::new();
        extra.insert("reasoning".into(), json!("vendor invoice"));
        let action = SuggestedAction {
            action: "create_bill".into(),
            action_type: ActionType::Primary,
            confidence: 92.0,
            extra,
        };
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["action_type"], "PRIMARY");
        assert_eq!(value["reasoning"], "vendor invoice");
    }
}
