use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{
    Device, DevicePlacement, LoadError, LoadedModel, MemoryTelemetry, MemoryTier, ModelLoader,
    PlacementEntry,
};
use crate::hardware::{self, RunningModelInfo};
use crate::pipeline::generation::ollama::{check_status, http_client, send_error};
use crate::pipeline::generation::{GenerationError, OllamaBackend};

/// Forces every layer onto the GPU; the server errors instead of offloading.
const ALL_LAYERS: u32 = 999;

/// Keep the model resident until explicitly released.
const KEEP_FOREVER: i64 = -1;
const UNLOAD_NOW: i64 = 0;

/// Error fragments the server and the CUDA runtime use for allocation failures.
const OOM_MARKERS: &[&str] = &[
    "out of memory",
    "cudamalloc",
    "insufficient memory",
    "requires more system memory",
    "unable to allocate",
];

/// Loads the model into the Ollama server with all layers on the GPU and
/// verifies the placement through `/api/ps`.
pub struct OllamaLoader {
    base_url: String,
    model: String,
    num_ctx: u32,
    timeout_secs: u64,
    client: reqwest::blocking::Client,
}

impl OllamaLoader {
    pub fn new(
        base_url: &str,
        model: &str,
        num_ctx: u32,
        timeout_secs: u64,
    ) -> Result<Self, LoadError> {
        let client = http_client(timeout_secs).map_err(|e| LoadError::Backend(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            num_ctx,
            timeout_secs,
            client,
        })
    }

    fn post_generate(&self, keep_alive: i64) -> Result<(), GenerationError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = LoadRequest {
            model: &self.model,
            prompt: "",
            stream: false,
            keep_alive,
            options: LoadOptions {
                num_ctx: self.num_ctx,
                num_gpu: ALL_LAYERS,
            },
        };
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| send_error(e, &self.base_url, self.timeout_secs))?;
        check_status(response)?;
        Ok(())
    }

    fn backend(&self) -> Result<OllamaBackend, LoadError> {
        OllamaBackend::new(&self.base_url, &self.model, self.timeout_secs, self.num_ctx)
            .map_err(|e| LoadError::Backend(e.to_string()))
    }

    fn running_models(&self) -> Result<Vec<RunningModelInfo>, GenerationError> {
        let url = format!("{}/api/ps", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| send_error(e, &self.base_url, self.timeout_secs))?;
        let parsed: PsResponse = check_status(response)?
            .json()
            .map_err(|e| GenerationError::ResponseParsing(e.to_string()))?;
        Ok(parsed.models)
    }
}

/// Request body for loading or unloading via /api/generate
#[derive(Serialize)]
struct LoadRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    keep_alive: i64,
    options: LoadOptions,
}

#[derive(Serialize)]
struct LoadOptions {
    num_ctx: u32,
    num_gpu: u32,
}

/// Response body from Ollama /api/ps
#[derive(Deserialize)]
struct PsResponse {
    #[serde(default)]
    models: Vec<RunningModelInfo>,
}

impl ModelLoader for OllamaLoader {
    fn load(&self, tier: &MemoryTier) -> Result<LoadedModel, LoadError> {
        self.post_generate(KEEP_FOREVER)
            .map_err(classify_load_error)?;

        let running = self
            .running_models()
            .map_err(|e| LoadError::Backend(e.to_string()))?;

        let Some(profile) = hardware::profile_for(&self.model, &running) else {
            return Ok(LoadedModel {
                backend: Arc::new(self.backend()?),
                placement: DevicePlacement {
                    entries: vec![PlacementEntry {
                        component: self.model.clone(),
                        device: Device::Meta,
                        bytes: 0,
                    }],
                },
                telemetry: MemoryTelemetry {
                    tier: tier.label.clone(),
                    allocated_bytes: 0,
                    reserved_bytes: 0,
                    free_bytes: tier.max_gpu_bytes,
                },
            });
        };

        if profile.vram_bytes > tier.max_gpu_bytes {
            return Err(LoadError::OutOfMemory(format!(
                "model holds {} bytes of VRAM, tier {} allows {}",
                profile.vram_bytes, tier.label, tier.max_gpu_bytes
            )));
        }

        Ok(LoadedModel {
            backend: Arc::new(self.backend()?),
            placement: profile.placement(),
            telemetry: profile.telemetry(tier),
        })
    }

    fn release(&self, tier: &MemoryTier) {
        match self.post_generate(UNLOAD_NOW) {
            Ok(()) => tracing::info!(tier = %tier, model = %self.model, "Released model"),
            Err(e) => tracing::warn!(tier = %tier, error = %e, "Model release failed"),
        }
    }
}

fn is_out_of_memory(message: &str) -> bool {
    let lower = message.to_lowercase();
    OOM_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Allocation failures let the next tier try; everything else is fatal.
fn classify_load_error(e: GenerationError) -> LoadError {
    match e {
        GenerationError::Api { ref body, .. } if is_out_of_memory(body) => {
            LoadError::OutOfMemory(body.clone())
        }
        other => LoadError::Backend(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_allocation_failures() {
        assert!(is_out_of_memory("CUDA error: out of memory"));
        assert!(is_out_of_memory("cudaMalloc failed: out of memory"));
        assert!(is_out_of_memory(
            "model requires more system memory (30.1 GiB) than is available (24.0 GiB)"
        ));
        assert!(!is_out_of_memory("model 'mixtral' not found"));
    }

    #[test]
    fn oom_api_errors_allow_next_tier() {
        let err = classify_load_error(GenerationError::Api {
            status: 500,
            body: "llama runner process has terminated: cudaMalloc failed".into(),
        });
        assert!(matches!(err, LoadError::OutOfMemory(_)));
    }

    #[test]
    fn other_errors_are_fatal() {
        let err = classify_load_error(GenerationError::Api {
            status: 404,
            body: "model 'mixtral' not found, try pulling it first".into(),
        });
        assert!(matches!(err, LoadError::Backend(_)));

        let err = classify_load_error(GenerationError::Connection("http://localhost:11434".into()));
        assert!(matches!(err, LoadError::Backend(_)));
    }

    #[test]
    fn load_request_pins_all_layers_to_gpu() {
        let body = LoadRequest {
            model: "mixtral",
            prompt: "",
            stream: false,
            keep_alive: KEEP_FOREVER,
            options: LoadOptions {
                num_ctx: 32_768,
                num_gpu: ALL_LAYERS,
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["keep_alive"], -1);
        assert_eq!(json["options"]["num_gpu"], 999);
    }

    #[test]
    fn ps_response_tolerates_missing_models() {
        let parsed: PsResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.models.is_empty());
    }

    #[test]
    fn unreachable_server_is_a_loader_failure() {
        let loader = OllamaLoader::new("http://127.0.0.1:9/", "mixtral", 2048, 5).unwrap();
        let err = loader
            .load(&MemoryTier::new("20GiB", 20 * 1024 * 1024 * 1024))
            .err()
            .unwrap();
        assert!(matches!(err, LoadError::Backend(_)));
    }
}
