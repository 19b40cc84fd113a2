//! Schema Registry — resolves JSON-Schema contracts per (stage, action, software).
//!
//! On-disk layout under the schema root:
//!
//! ```text
//! <root>/<stage>/generic.json
//! <root>/<stage>/batch.json
//! <root>/<stage>/actions/<software>/<action>.json
//! ```
//!
//! Resolution prefers the action-and-software-specific contract, then the
//! generic stage contract, then nothing. A miss is never an error: the
//! generator simply decodes without a grammar. Multi-action requests use
//! the batch contract alone.
//!
//! Misses are cached like hits, so a file added after its first lookup
//! is only seen once `clear_cache()` runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, RwLock};

use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};

use super::grammar::{CompiledSchema, GrammarError};
use super::types::Stage;

/// Action and software names become path components.
static SAFE_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9_.-]*$").expect("valid regex"));

const KNOWN_TYPES: &[&str] = &[
    "object", "array", "string", "number", "integer", "boolean", "null",
];

/// How narrowly a contract was targeted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Specificity {
    GenericStage,
    ActionSpecific,
}

impl std::fmt::Display for Specificity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GenericStage => write!(f, "generic"),
            Self::ActionSpecific => write!(f, "action-specific"),
        }
    }
}

/// Cache key. `action_name`/`software` are `None` for generic and batch
/// contracts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SchemaKey {
    pub stage: Stage,
    pub action_name: Option<String>,
    pub software: Option<String>,
    pub batch: bool,
}

impl SchemaKey {
    pub fn generic(stage: Stage) -> Self {
        Self {
            stage,
            action_name: None,
            software: None,
            batch: false,
        }
    }

    /// Contract for one request covering several actions.
    pub fn batch(stage: Stage) -> Self {
        Self {
            batch: true,
            ..Self::generic(stage)
        }
    }

    pub fn specific(stage: Stage, action_name: &str, software: &str) -> Self {
        Self {
            stage,
            action_name: Some(action_name.to_string()),
            software: Some(software.to_string()),
            batch: false,
        }
    }

    pub fn specificity(&self) -> Specificity {
        if self.action_name.is_some() && self.software.is_some() {
            Specificity::ActionSpecific
        } else {
            Specificity::GenericStage
        }
    }

    fn relative_path(&self) -> PathBuf {
        let stage_dir = PathBuf::from(self.stage.as_str());
        if self.batch {
            return stage_dir.join("batch.json");
        }
        match (&self.action_name, &self.software) {
            (Some(action), Some(software)) => stage_dir
                .join("actions")
                .join(software)
                .join(format!("{action}.json")),
            _ => stage_dir.join("generic.json"),
        }
    }
}

/// A loaded, immutable schema contract.
#[derive(Debug)]
pub struct SchemaContract {
    pub key: SchemaKey,
    pub document: Value,
    pub source: PathBuf,
    grammar: Result<Arc<CompiledSchema>, GrammarError>,
}

impl SchemaContract {
    pub fn new(key: SchemaKey, document: Value, source: PathBuf) -> Self {
        let grammar = CompiledSchema::compile(&document).map(Arc::new);
        Self {
            key,
            document,
            source,
            grammar,
        }
    }

    pub fn specificity(&self) -> Specificity {
        self.key.specificity()
    }

    /// The compiled decoding grammar, or why the schema could not be compiled.
    pub fn grammar(&self) -> Result<Arc<CompiledSchema>, GrammarError> {
        self.grammar.clone()
    }
}

#[derive(Debug, thiserror::Error)]
enum SchemaError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not a usable JSON Schema: {0}")]
    Invalid(String),
}

// ═══════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════

/// Lazily populated, write-once-per-key contract cache. `None` records a
/// missing or rejected file.
pub struct SchemaRegistry {
    root: PathBuf,
    cache: RwLock<HashMap<SchemaKey, Option<Arc<SchemaContract>>>>,
}

impl SchemaRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Most specific contract available, or `None`.
    pub fn resolve(
        &self,
        stage: Stage,
        action_name: Option<&str>,
        software: Option<&str>,
    ) -> Option<Arc<SchemaContract>> {
        if let (Some(action), Some(software)) = (action_name, software) {
            if is_safe_key(action) && is_safe_key(software) {
                if let Some(contract) = self.lookup(SchemaKey::specific(stage, action, software)) {
                    return Some(contract);
                }
                tracing::debug!(
                    stage = %stage,
                    action,
                    software,
                    "No action-specific schema; trying generic"
                );
            } else {
                tracing::warn!(
                    stage = %stage,
                    action,
                    software,
                    "Unsafe schema key ignored"
                );
            }
        }

        let contract = self.lookup(SchemaKey::generic(stage));
        if contract.is_none() {
            tracing::warn!(
                stage = %stage,
                root = %self.root.display(),
                "No schema found; generation will be unconstrained"
            );
        }
        contract
    }

    /// Batch contract for `stage`, or `None`. Never falls back to the
    /// single-action contracts, whose shape differs.
    pub fn resolve_batch(&self, stage: Stage) -> Option<Arc<SchemaContract>> {
        let contract = self.lookup(SchemaKey::batch(stage));
        if contract.is_none() {
            tracing::warn!(
                stage = %stage,
                root = %self.root.display(),
                "No batch schema found; generation will be unconstrained"
            );
        }
        contract
    }

    /// Load the generic contract of every stage and the field-mapping batch
    /// contract. Returns how many were found.
    pub fn preload(&self) -> usize {
        Stage::ALL
            .iter()
            .map(|stage| SchemaKey::generic(*stage))
            .chain(std::iter::once(SchemaKey::batch(Stage::FieldMapping)))
            .filter(|key| self.lookup(key.clone()).is_some())
            .count()
    }

    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
    }

    /// Number of contracts loaded; cached misses do not count.
    pub fn cached_count(&self) -> usize {
        self.cache
            .read()
            .map(|c| c.values().filter(|entry| entry.is_some()).count())
            .unwrap_or(0)
    }

    fn lookup(&self, key: SchemaKey) -> Option<Arc<SchemaContract>> {
        if let Ok(cache) = self.cache.read() {
            if let Some(entry) = cache.get(&key) {
                return entry.clone();
            }
        }

        let loaded = self.load(&key).map(Arc::new);

        // First writer wins; concurrent loaders of the same key share it.
        match self.cache.write() {
            Ok(mut cache) => cache.entry(key).or_insert(loaded).clone(),
            Err(_) => loaded,
        }
    }

    fn load(&self, key: &SchemaKey) -> Option<SchemaContract> {
        let path = self.root.join(key.relative_path());
        if !path.is_file() {
            tracing::debug!(path = %path.display(), "Schema file absent");
            return None;
        }

        let contract = match load_contract(key, &path) {
            Ok(contract) => contract,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Schema file rejected");
                return None;
            }
        };

        if let Err(e) = &contract.grammar {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Schema cannot drive constrained decoding"
            );
        }
        tracing::info!(
            stage = %key.stage,
            specificity = %key.specificity(),
            batch = key.batch,
            path = %path.display(),
            "Schema loaded"
        );
        Some(contract)
    }
}

fn is_safe_key(value: &str) -> bool {
    SAFE_KEY.is_match(value)
}

fn load_contract(key: &SchemaKey, path: &Path) -> Result<SchemaContract, SchemaError> {
    let raw = std::fs::read_to_string(path)?;
    let document: Value = serde_json::from_str(&raw)?;
    check_schema(&document)?;

    let document = match (key.stage, key.specificity()) {
        (Stage::FieldMapping, Specificity::ActionSpecific) => wrap_field_mapping(document),
        _ => document,
    };
    Ok(SchemaContract::new(key.clone(), document, path.to_path_buf()))
}

/// Minimal structural check of a draft-7 document.
fn check_schema(document: &Value) -> Result<(), SchemaError> {
    let obj = document
        .as_object()
        .ok_or_else(|| SchemaError::Invalid("root must be an object".into()))?;

    match obj.get("type") {
        None => {}
        Some(Value::String(ty)) if KNOWN_TYPES.contains(&ty.as_str()) => {}
        Some(Value::Array(types))
            if types
                .iter()
                .all(|t| t.as_str().is_some_and(|t| KNOWN_TYPES.contains(&t))) => {}
        Some(other) => {
            return Err(SchemaError::Invalid(format!("unknown type {other}")));
        }
    }

    if let Some(props) = obj.get("properties") {
        let props = props
            .as_object()
            .ok_or_else(|| SchemaError::Invalid("`properties` must be an object".into()))?;
        for (name, sub) in props {
            if !(sub.is_object() || sub.is_boolean()) {
                return Err(SchemaError::Invalid(format!(
                    "property '{name}' is not a schema"
                )));
            }
        }
    }
    Ok(())
}

/// Action-specific field-mapping files describe only the API request body.
/// Wrap them in the full stage envelope so the decoder produces
/// `{api_request_body, lookups_required, validation}`.
fn wrap_field_mapping(mut body: Value) -> Value {
    if body
        .pointer("/properties/api_request_body")
        .is_some()
    {
        return body;
    }

    let mut envelope = json!({
        "type": "object",
        "properties": {
            "api_request_body": Value::Null,
            "lookups_required": {"type": "array", "items": {"type": "string"}},
            "validation": validation_schema()
        },
        "required": ["api_request_body", "lookups_required", "validation"],
        "additionalProperties": false
    });

    // Local refs stay valid once their definitions move to the envelope root.
    if let Some(obj) = body.as_object_mut() {
        for defs in ["definitions", "$defs"] {
            if let Some(value) = obj.remove(defs) {
                envelope[defs] = value;
            }
        }
        obj.remove("$schema");
    }
    envelope["properties"]["api_request_body"] = body;
    envelope
}

fn validation_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "total_amount_matches": {"type": "boolean"},
            "calculated_total": {"type": "number"},
            "all_charges_included": {"type": "boolean"},
            "charges_found": {
                "type": "array",
                "items": {
                    "anyOf": [
                        {"type": "string"},
                        {
                            "type": "object",
                            "properties": {
                                "description": {"type": "string"},
                                "amount": {"type": ["number", "null"]}
                            },
                            "required": ["description"],
                            "additionalProperties": false
                        }
                    ]
                }
            },
            "warnings": {"type": "array", "items": {"type": "string"}}
        },
        "required": [
            "total_amount_matches",
            "calculated_total",
            "all_charges_included",
            "charges_found",
            "warnings"
        ],
        "additionalProperties": false
    })
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
