//! Model Session Manager.
//!
//! Acquires the single loaded model under a GPU memory budget. Tiers are
//! tried strictly in order, most conservative first:
//!
//! ```text
//! Unloaded → Probing(tier_i) → Loaded
//!                            → Probing(tier_i+1)
//!                            → Failed
//! ```
//!
//! A tier succeeds only when the placement report shows every component on
//! the accelerator. Offloaded weights fail the tier closed; there is no
//! degraded mode.

pub mod ollama_loader;

pub use ollama_loader::OllamaLoader;

use std::sync::{Arc, OnceLock};

use serde::Serialize;
use thiserror::Error;

use crate::pipeline::generation::InferenceBackend;

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// A GPU memory ceiling under which the whole model must fit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryTier {
    pub label: String,
    pub max_gpu_bytes: u64,
}

impl MemoryTier {
    pub fn new(label: &str, max_gpu_bytes: u64) -> Self {
        Self {
            label: label.to_string(),
            max_gpu_bytes,
        }
    }
}

impl std::fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Accelerator,
    Cpu,
    /// Weights never materialized.
    Meta,
    Disk,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlacementEntry {
    pub component: String,
    pub device: Device,
    pub bytes: u64,
}

/// Where the loader put each component of the model.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DevicePlacement {
    pub entries: Vec<PlacementEntry>,
}

impl DevicePlacement {
    /// Components not on the accelerator.
    pub fn offloaded(&self) -> Vec<&PlacementEntry> {
        self.entries
            .iter()
            .filter(|e| e.device != Device::Accelerator)
            .collect()
    }

    /// An empty report proves nothing and counts as not accelerated.
    pub fn is_fully_accelerated(&self) -> bool {
        !self.entries.is_empty() && self.offloaded().is_empty()
    }
}

/// Memory report after acquisition, for operational alerting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryTelemetry {
    pub tier: String,
    pub allocated_bytes: u64,
    pub reserved_bytes: u64,
    pub free_bytes: u64,
}

/// What a loader hands back for one tier.
pub struct LoadedModel {
    pub backend: Arc<dyn InferenceBackend>,
    pub placement: DevicePlacement,
    pub telemetry: MemoryTelemetry,
}

// ═══════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════

/// Loader-level failure for one tier.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The model does not fit under this tier; the next tier may.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// The loader itself is broken; no tier can help.
    #[error("Loader backend failure: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierFailure {
    pub tier: String,
    pub reason: String,
}

fn summarize(failures: &[TierFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.tier, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Fatal acquisition outcome. `Clone` so the process can memoize it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("No memory tiers configured")]
    NoTiersConfigured,

    #[error("Model does not fit on the accelerator under any memory tier ({})", summarize(.failures))]
    AllTiersExhausted { failures: Vec<TierFailure> },

    #[error("Model loader failed under tier {tier}: {reason}")]
    LoaderFailure { tier: String, reason: String },
}

// ═══════════════════════════════════════════════════════════
// ModelLoader
// ═══════════════════════════════════════════════════════════

/// Loads the model under a memory ceiling (allows mocking).
pub trait ModelLoader: Send + Sync {
    fn load(&self, tier: &MemoryTier) -> Result<LoadedModel, LoadError>;

    /// Free whatever a failed `load` left behind. Best effort.
    fn release(&self, tier: &MemoryTier);
}

// ═══════════════════════════════════════════════════════════
// ModelSession
// ═══════════════════════════════════════════════════════════

/// The loaded model. Exactly one per process.
pub struct ModelSession {
    backend: Arc<dyn InferenceBackend>,
    tier: MemoryTier,
    placement: DevicePlacement,
    telemetry: MemoryTelemetry,
    acquired_at: String,
}

impl ModelSession {
    pub fn new(tier: MemoryTier, loaded: LoadedModel) -> Self {
        Self {
            backend: loaded.backend,
            tier,
            placement: loaded.placement,
            telemetry: loaded.telemetry,
            acquired_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn backend(&self) -> &dyn InferenceBackend {
        self.backend.as_ref()
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    pub fn tier(&self) -> &MemoryTier {
        &self.tier
    }

    pub fn placement(&self) -> &DevicePlacement {
        &self.placement
    }

    pub fn telemetry(&self) -> &MemoryTelemetry {
        &self.telemetry
    }

    pub fn acquired_at(&self) -> &str {
        &self.acquired_at
    }
}

impl std::fmt::Debug for ModelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSession")
            .field("model", &self.model_name())
            .field("tier", &self.tier.label)
            .field("telemetry", &self.telemetry)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════
// SessionManager
// ═══════════════════════════════════════════════════════════

pub struct SessionManager {
    loader: Arc<dyn ModelLoader>,
}

impl SessionManager {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self { loader }
    }

    /// Try `tiers` in order and stop at the first that fits entirely on
    /// the accelerator.
    pub fn acquire(&self, tiers: &[MemoryTier]) -> Result<ModelSession, SessionError> {
        let _span = tracing::info_span!("acquire_session", tiers = tiers.len()).entered();

        if tiers.is_empty() {
            return Err(SessionError::NoTiersConfigured);
        }

        let mut failures = Vec::new();
        for (index, tier) in tiers.iter().enumerate() {
            tracing::info!(tier = %tier, index, max_gpu_bytes = tier.max_gpu_bytes, "Probing memory tier");

            let reason = match self.loader.load(tier) {
                Ok(loaded) if loaded.placement.is_fully_accelerated() => {
                    let session = ModelSession::new(tier.clone(), loaded);
                    let t = session.telemetry();
                    tracing::info!(
                        tier = %tier,
                        model = session.model_name(),
                        allocated_bytes = t.allocated_bytes,
                        reserved_bytes = t.reserved_bytes,
                        free_bytes = t.free_bytes,
                        "Model session acquired"
                    );
                    return Ok(session);
                }
                Ok(loaded) => offload_reason(&loaded.placement),
                Err(LoadError::OutOfMemory(detail)) => format!("out of memory: {detail}"),
                Err(LoadError::Backend(reason)) => {
                    tracing::error!(tier = %tier, %reason, "Model loader failed");
                    self.loader.release(tier);
                    return Err(SessionError::LoaderFailure {
                        tier: tier.label.clone(),
                        reason,
                    });
                }
            };

            tracing::warn!(tier = %tier, %reason, "Memory tier rejected");
            self.loader.release(tier);
            failures.push(TierFailure {
                tier: tier.label.clone(),
                reason,
            });
        }

        tracing::error!(attempted = failures.len(), "All memory tiers exhausted");
        Err(SessionError::AllTiersExhausted { failures })
    }
}

fn offload_reason(placement: &DevicePlacement) -> String {
    let offloaded = placement.offloaded();
    if placement.entries.is_empty() {
        return "loader reported no placement".to_string();
    }
    let parts: Vec<String> = offloaded
        .iter()
        .map(|e| format!("{} on {:?}", e.component, e.device))
        .collect();
    format!("offloaded off the accelerator: {}", parts.join(", "))
}

// ═══════════════════════════════════════════════════════════
// SessionCell — lazy, at-most-once acquisition
// ═══════════════════════════════════════════════════════════

/// Observable session state, for health reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Unloaded,
    Loaded {
        model: String,
        tier: String,
        telemetry: MemoryTelemetry,
        acquired_at: String,
    },
    Failed {
        error: String,
    },
}

/// Holds the process's session once acquired. A failed acquisition is
/// memoized too; only a restart retries it.
pub struct SessionCell {
    manager: Option<SessionManager>,
    tiers: Vec<MemoryTier>,
    slot: OnceLock<Result<Arc<ModelSession>, SessionError>>,
}

impl SessionCell {
    pub fn new(manager: SessionManager, tiers: Vec<MemoryTier>) -> Self {
        Self {
            manager: Some(manager),
            tiers,
            slot: OnceLock::new(),
        }
    }

    /// A cell around an already-acquired session.
    pub fn preloaded(session: ModelSession) -> Self {
        let slot = OnceLock::new();
        let _ = slot.set(Ok(Arc::new(session)));
        Self {
            manager: None,
            tiers: Vec::new(),
            slot,
        }
    }

    /// Return the session, acquiring it on first use. Concurrent first
    /// callers block until the single acquisition finishes.
    pub fn get_or_acquire(&self) -> Result<Arc<ModelSession>, SessionError> {
        self.slot
            .get_or_init(|| match &self.manager {
                Some(manager) => manager.acquire(&self.tiers).map(Arc::new),
                None => Err(SessionError::NoTiersConfigured),
            })
            .clone()
    }

    /// The session if it has already been acquired.
    pub fn get(&self) -> Option<Arc<ModelSession>> {
        self.slot.get().and_then(|r| r.as_ref().ok().cloned())
    }

    pub fn state(&self) -> SessionState {
        match self.slot.get() {
            None => SessionState::Unloaded,
            Some(Ok(session)) => SessionState::Loaded {
                model: session.model_name().to_string(),
                tier: session.tier().label.clone(),
                telemetry: session.telemetry().clone(),
                acquired_at: session.acquired_at().to_string(),
            },
            Some(Err(e)) => SessionState::Failed {
                error: e.to_string(),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
