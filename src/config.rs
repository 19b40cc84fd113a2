use std::path::PathBuf;

use crate::pipeline::session::MemoryTier;

/// Application-level constants
pub const APP_NAME: &str = "LedgerLens";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Hard context limit of the served model (Mixtral 8x7B: 32k tokens).
pub const MODEL_CONTEXT_CEILING: u32 = 32_768;

const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "mixtral:8x7b-instruct-v0.1-q4_K_M";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 600;

/// Conservative first. Mixtral Q4 needs ~16-17 GB with activations.
const DEFAULT_MEMORY_TIERS: &str = "20GiB,22GiB,23.5GiB";

/// Default tracing filter when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "ledgerlens=info,warn"
}

/// Get the application data directory (~/LedgerLens/)
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_NAME)
}

/// Default location of the JSON-Schema contracts.
pub fn default_schema_dir() -> PathBuf {
    app_data_dir().join("schemas")
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {reason}")]
    InvalidValue { var: &'static str, reason: String },

    #[error("Invalid memory size '{0}' (expected e.g. 20GiB, 512MiB, 24GB)")]
    InvalidMemorySize(String),
}

/// Runtime configuration supplied by the deployment layer through the environment.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub ollama_url: String,
    pub model_name: String,
    pub schema_dir: PathBuf,
    /// Ordered most conservative first.
    pub memory_tiers: Vec<MemoryTier>,
    pub context_window: u32,
    pub request_timeout_secs: u64,
    /// Acquire the model session at startup instead of on first request.
    pub eager_load: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            model_name: DEFAULT_MODEL.to_string(),
            schema_dir: default_schema_dir(),
            memory_tiers: parse_memory_tiers(DEFAULT_MEMORY_TIERS).unwrap_or_default(),
            context_window: MODEL_CONTEXT_CEILING,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            eager_load: false,
        }
    }
}

impl CoreConfig {
    /// Build the configuration from `LEDGERLENS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`CoreConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("LEDGERLENS_OLLAMA_URL") {
            config.ollama_url = url.trim_end_matches('/').to_string();
        }
        if let Some(model) = lookup("LEDGERLENS_MODEL") {
            config.model_name = model;
        }
        if let Some(dir) = lookup("LEDGERLENS_SCHEMA_DIR") {
            config.schema_dir = PathBuf::from(dir);
        }
        if let Some(tiers) = lookup("LEDGERLENS_MEMORY_TIERS") {
            config.memory_tiers = parse_memory_tiers(&tiers)?;
        }
        if let Some(ctx) = lookup("LEDGERLENS_CONTEXT_WINDOW") {
            let parsed: u32 = ctx.trim().parse().map_err(|_| ConfigError::InvalidValue {
                var: "LEDGERLENS_CONTEXT_WINDOW",
                reason: format!("'{ctx}' is not a positive integer"),
            })?;
            config.context_window = parsed.clamp(1, MODEL_CONTEXT_CEILING);
        }
        if let Some(secs) = lookup("LEDGERLENS_REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs =
                secs.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    var: "LEDGERLENS_REQUEST_TIMEOUT_SECS",
                    reason: format!("'{secs}' is not a number of seconds"),
                })?;
        }
        if let Some(eager) = lookup("LEDGERLENS_EAGER_LOAD") {
            config.eager_load = matches!(eager.trim().to_lowercase().as_str(), "1" | "true" | "yes");
        }

        Ok(config)
    }
}

/// Parse a comma-separated list of GPU memory ceilings into ordered tiers.
pub fn parse_memory_tiers(raw: &str) -> Result<Vec<MemoryTier>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Ok(MemoryTier::new(s, parse_memory_size(s)?)))
        .collect()
}

/// Parse a human-readable memory size ("23.5GiB", "512MiB", "24GB", "1024").
pub fn parse_memory_size(raw: &str) -> Result<u64, ConfigError> {
    let s = raw.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| ConfigError::InvalidMemorySize(raw.to_string()))?;

    let multiplier: f64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1.0,
        "kb" => 1e3,
        "kib" => 1024.0,
        "mb" => 1e6,
        "mib" => 1024.0 * 1024.0,
        "gb" => 1e9,
        "gib" => 1024.0 * 1024.0 * 1024.0,
        _ => return Err(ConfigError::InvalidMemorySize(raw.to_string())),
    };

    if value <= 0.0 {
        return Err(ConfigError::InvalidMemorySize(raw.to_string()));
    }
    Ok((value * multiplier) as u64)
}
