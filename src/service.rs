//! External contract of the core.
//!
//! A request names a stage, carries the already-extracted document text
//! and optional sampling overrides, and gets back either
//! `{ success: true, output, metadata }` or a typed failure report.
//! The host layer talks to the core through JSON lines on stdin/stdout.

use std::io::{BufRead, Write};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{CoreConfig, APP_VERSION};
use crate::inference_gate::{ActiveOperation, InferenceGate};
use crate::pipeline::classification::{
    AttemptFailure, BusinessContext, ClassificationError, StageContext, StageMetadata,
    StageOrchestrator, StageOutput,
};
use crate::pipeline::generation::{
    ConstrainedGenerator, GenerationOverrides, SchemaRegistry, Stage,
};
use crate::pipeline::session::ollama_loader::OllamaLoader;
use crate::pipeline::session::{
    LoadError, SessionCell, SessionError, SessionManager, SessionState,
};

// ═══════════════════════════════════════════════════════════
// Request / response
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct CoreRequest {
    pub prompt: String,
    pub stage: Stage,
    #[serde(default)]
    pub action_name: Option<String>,
    #[serde(default)]
    pub software: Option<String>,
    /// Several actions mapped in one field-mapping call.
    #[serde(default)]
    pub actions: Vec<String>,
    /// Business context from the extraction side.
    #[serde(default)]
    pub context: Option<BusinessContext>,
    #[serde(default, alias = "max_new_tokens")]
    pub max_tokens: Option<u32>,
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

impl CoreRequest {
    pub fn new(stage: Stage, prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            stage,
            action_name: None,
            software: None,
            actions: Vec::new(),
            context: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
            top_k: None,
            repetition_penalty: None,
            max_input_length: None,
        }
    }

    pub fn overrides(&self) -> GenerationOverrides {
        GenerationOverrides {
            max_new_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            repetition_penalty: self.repetition_penalty,
            max_input_length: self.max_input_length,
        }
    }

    pub fn stage_context(&self) -> StageContext {
        StageContext {
            business: self.context.clone(),
            action_name: self.action_name.clone(),
            software: self.software.clone(),
            batch_actions: self.actions.clone(),
        }
    }
}

/// Diagnosable failure handed back to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub kind: String,
    pub stage: Option<Stage>,
    pub message: String,
    pub attempts: Vec<AttemptFailure>,
}

impl FailureReport {
    fn new(kind: &str, stage: Option<Stage>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            stage,
            message: message.into(),
            attempts: Vec::new(),
        }
    }
}

impl From<ClassificationError> for FailureReport {
    fn from(err: ClassificationError) -> Self {
        Self {
            kind: err.kind().to_string(),
            stage: err.stage(),
            message: err.to_string(),
            attempts: err.attempts().to_vec(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CoreResponse {
    Success {
        success: bool,
        output: StageOutput,
        metadata: StageMetadata,
    },
    Failure {
        success: bool,
        error: FailureReport,
    },
}

impl CoreResponse {
    fn failed(error: FailureReport) -> Self {
        Self::Failure {
            success: false,
            error,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// One line of host input.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HostCommand {
    Generate(CoreRequest),
    Health,
}

// ═══════════════════════════════════════════════════════════
// Health
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// "ok", "not_loaded", or "unavailable".
    pub status: &'static str,
    pub version: &'static str,
    pub session: SessionState,
    pub current_operation: Option<ActiveOperation>,
    pub waiting: u64,
    pub cached_schemas: usize,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Cannot build model loader: {0}")]
    Loader(#[from] LoadError),
}

// ═══════════════════════════════════════════════════════════
// CoreService
// ═══════════════════════════════════════════════════════════

pub struct CoreService {
    orchestrator: Arc<StageOrchestrator>,
    request_timeout: Duration,
}

impl CoreService {
    pub fn new(orchestrator: StageOrchestrator, request_timeout: Duration) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            request_timeout,
        }
    }

    /// Wire the Ollama-backed session, the schema registry, and the gate.
    /// Nothing is loaded yet; see [`CoreService::warm_up`].
    pub fn from_config(config: &CoreConfig) -> Result<Self, ServiceError> {
        let loader = OllamaLoader::new(
            &config.ollama_url,
            &config.model_name,
            config.context_window,
            config.request_timeout_secs,
        )?;
        let sessions = SessionCell::new(
            SessionManager::new(Arc::new(loader)),
            config.memory_tiers.clone(),
        );
        let registry = Arc::new(SchemaRegistry::new(config.schema_dir.clone()));
        let generator = ConstrainedGenerator::new(registry, config.context_window);

        tracing::info!(
            url = %config.ollama_url,
            model = %config.model_name,
            schema_dir = %config.schema_dir.display(),
            tiers = config.memory_tiers.len(),
            "Core service configured"
        );

        Ok(Self::new(
            StageOrchestrator::new(generator, Arc::new(sessions), Arc::new(InferenceGate::new())),
            Duration::from_secs(config.request_timeout_secs),
        ))
    }

    /// Acquire the model session and load the generic stage schemas.
    pub fn warm_up(&self) -> Result<(), SessionError> {
        let schemas = self.orchestrator.registry().preload();
        let session = self.orchestrator.sessions().get_or_acquire()?;
        tracing::info!(
            model = %session.model_name(),
            tier = %session.tier(),
            schemas,
            "Core warmed up"
        );
        Ok(())
    }

    pub fn handle(&self, request: CoreRequest) -> CoreResponse {
        run_request(&self.orchestrator, &request)
    }

    /// Stop waiting after `timeout`. The generation keeps running on its
    /// worker thread and its result is dropped.
    pub fn handle_with_timeout(&self, request: CoreRequest, timeout: Duration) -> CoreResponse {
        let stage = request.stage;
        let orchestrator = Arc::clone(&self.orchestrator);
        let (tx, rx) = mpsc::channel();

        thread::spawn(move || {
            let response = run_request(&orchestrator, &request);
            if tx.send(response).is_err() {
                tracing::info!(%stage, "Caller gave up; discarding late result");
            }
        });

        match rx.recv_timeout(timeout) {
            Ok(response) => response,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(%stage, timeout_ms = timeout.as_millis() as u64, "Request timed out");
                CoreResponse::failed(FailureReport::new(
                    "timeout",
                    Some(stage),
                    format!("No result within {}s", timeout.as_secs_f64()),
                ))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => CoreResponse::failed(
                FailureReport::new("internal", Some(stage), "Worker thread ended without a result"),
            ),
        }
    }

    pub fn health(&self) -> HealthReport {
        let session = self.orchestrator.sessions().state();
        let status = match &session {
            SessionState::Loaded { .. } => "ok",
            SessionState::Unloaded => "not_loaded",
            SessionState::Failed { .. } => "unavailable",
        };
        let gate = self.orchestrator.gate();
        HealthReport {
            status,
            version: APP_VERSION,
            session,
            current_operation: gate.current_operation(),
            waiting: gate.waiting(),
            cached_schemas: self.orchestrator.registry().cached_count(),
        }
    }

    /// Answer one host line.
    pub fn dispatch(&self, line: &str) -> serde_json::Value {
        let command = match serde_json::from_str::<HostCommand>(line) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(error = %e, "Rejected host command");
                let report = FailureReport::new("invalid_request", None, e.to_string());
                return to_json(&CoreResponse::failed(report));
            }
        };
        match command {
            HostCommand::Generate(request) => {
                to_json(&self.handle_with_timeout(request, self.request_timeout))
            }
            HostCommand::Health => to_json(&self.health()),
        }
    }

    /// Serve JSON lines until `input` closes. Blank lines are skipped.
    pub fn serve<R: BufRead, W: Write>(&self, input: R, mut output: W) -> std::io::Result<()> {
        for line in input.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let response = self.dispatch(&line);
            writeln!(output, "{response}")?;
            output.flush()?;
        }
        Ok(())
    }
}

fn run_request(orchestrator: &StageOrchestrator, request: &CoreRequest) -> CoreResponse {
    match orchestrator.run_stage(
        request.stage,
        &request.prompt,
        &request.stage_context(),
        &request.overrides(),
    ) {
        Ok(result) => CoreResponse::Success {
            success: true,
            output: result.output,
            metadata: result.metadata,
        },
        Err(e) => {
            tracing::error!(kind = e.kind(), error = %e, "Request failed");
            CoreResponse::failed(e.into())
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        serde_json::json!({
            "success": false,
            "error": {"kind": "internal", "message": format!("Serialization failed: {e}")}
        })
    })
}
