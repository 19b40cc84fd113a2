//! Accelerator placement for a loaded model.
//!
//! The inference server reports, per resident model, its total size and how
//! many of those bytes live in VRAM (`/api/ps`). Anything not in VRAM is
//! held in host memory, which is exactly the silent offload the session
//! manager refuses to accept.

use serde::{Deserialize, Serialize};

use crate::pipeline::session::{
    Device, DevicePlacement, MemoryTelemetry, MemoryTier, PlacementEntry,
};

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// GPU placement classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuTier {
    /// All model bytes in VRAM.
    FullGpu,
    /// Some bytes in VRAM, rest in host memory.
    PartialGpu,
    /// No VRAM allocated.
    CpuOnly,
}

impl std::fmt::Display for GpuTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FullGpu => write!(f, "Full GPU"),
            Self::PartialGpu => write!(f, "Partial GPU"),
            Self::CpuOnly => write!(f, "CPU only"),
        }
    }
}

/// One entry of the server's running-model list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningModelInfo {
    pub name: String,
    #[serde(default)]
    pub model: String,
    pub size: u64,
    #[serde(default)]
    pub size_vram: u64,
}

/// Where one resident model's bytes live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub model: String,
    /// Bytes held in VRAM. 0 = CPU-only.
    pub vram_bytes: u64,
    /// Total bytes the model occupies.
    pub total_model_bytes: u64,
    /// ISO 8601 timestamp when the report was read.
    pub detected_at: String,
}

impl HardwareProfile {
    pub fn gpu_tier(&self) -> GpuTier {
        if self.total_model_bytes == 0 || self.vram_bytes == 0 {
            GpuTier::CpuOnly
        } else if self.vram_bytes >= self.total_model_bytes {
            GpuTier::FullGpu
        } else {
            GpuTier::PartialGpu
        }
    }

    /// Placement report in session terms.
    pub fn placement(&self) -> DevicePlacement {
        let host_bytes = self.total_model_bytes.saturating_sub(self.vram_bytes);
        let mut entries = Vec::new();
        if self.vram_bytes > 0 {
            entries.push(PlacementEntry {
                component: format!("{} (vram)", self.model),
                device: Device::Accelerator,
                bytes: self.vram_bytes,
            });
        }
        if host_bytes > 0 {
            entries.push(PlacementEntry {
                component: format!("{} (host)", self.model),
                device: Device::Cpu,
                bytes: host_bytes,
            });
        }
        DevicePlacement { entries }
    }

    /// Memory report against the tier the model was loaded under.
    pub fn telemetry(&self, tier: &MemoryTier) -> MemoryTelemetry {
        MemoryTelemetry {
            tier: tier.label.clone(),
            allocated_bytes: self.vram_bytes,
            reserved_bytes: self.total_model_bytes,
            free_bytes: tier.max_gpu_bytes.saturating_sub(self.vram_bytes),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Detection
// ═══════════════════════════════════════════════════════════

/// Find `model` in a running-model report.
///
/// Returns `None` when the model is not resident.
pub fn profile_for(model: &str, running: &[RunningModelInfo]) -> Option<HardwareProfile> {
    let _span = tracing::info_span!("hardware_detect", model).entered();

    let Some(info) = running.iter().find(|m| same_model(m, model)) else {
        tracing::warn!(resident = running.len(), "Model not found in running-model report");
        return None;
    };

    let profile = HardwareProfile {
        model: model.to_string(),
        vram_bytes: info.size_vram,
        total_model_bytes: info.size,
        detected_at: chrono::Utc::now().to_rfc3339(),
    };

    tracing::info!(
        gpu_tier = %profile.gpu_tier(),
        vram_mb = info.size_vram / 1_000_000,
        total_mb = info.size / 1_000_000,
        "Hardware profile detected"
    );

    Some(profile)
}

/// Names without a tag resolve to `:latest` on the server.
fn same_model(info: &RunningModelInfo, wanted: &str) -> bool {
    let tagged = if wanted.contains(':') {
        wanted.to_string()
    } else {
        format!("{wanted}:latest")
    };
    [info.name.as_str(), info.model.as_str()]
        .iter()
        .any(|name| *name == wanted || *name == tagged)
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
