use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::grammar::SchemaAutomaton;
use super::types::{Decoded, GenerationConfig, InferenceBackend};
use super::GenerationError;

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Build the blocking HTTP client shared by the backend and the loader.
pub(crate) fn http_client(timeout_secs: u64) -> Result<reqwest::blocking::Client, GenerationError> {
    reqwest::blocking::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| GenerationError::Http(e.to_string()))
}

pub(crate) fn send_error(e: reqwest::Error, base_url: &str, timeout_secs: u64) -> GenerationError {
    if e.is_connect() {
        GenerationError::Connection(base_url.to_string())
    } else if e.is_timeout() {
        GenerationError::Http(format!("Request timed out after {timeout_secs}s"))
    } else {
        GenerationError::Http(e.to_string())
    }
}

/// Turn a non-success status into `GenerationError::Api`.
pub(crate) fn check_status(
    response: reqwest::blocking::Response,
) -> Result<reqwest::blocking::Response, GenerationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(GenerationError::Api {
        status: status.as_u16(),
        body,
    })
}

/// Streaming Ollama client for one loaded model.
///
/// Prompts are sent with `raw: true`; instruction framing is done by the
/// caller. A constrained decode passes the schema as `format` and
/// re-checks every streamed chunk against the automaton.
pub struct OllamaBackend {
    base_url: String,
    model: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
    num_ctx: u32,
}

impl OllamaBackend {
    pub fn new(
        base_url: &str,
        model: &str,
        timeout_secs: u64,
        num_ctx: u32,
    ) -> Result<Self, GenerationError> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: http_client(timeout_secs)?,
            timeout_secs,
            num_ctx,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Request body for Ollama /api/generate
#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    raw: bool,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a Value>,
    options: DecodeOptions,
}

#[derive(Serialize)]
struct DecodeOptions {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    repeat_penalty: f32,
    num_predict: u32,
    num_ctx: u32,
}

/// One NDJSON line of a streaming /api/generate response
#[derive(Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    eval_count: Option<u32>,
    prompt_eval_count: Option<u32>,
    error: Option<String>,
}

fn request_body<'a>(
    model: &'a str,
    prompt: &'a str,
    config: &GenerationConfig,
    num_ctx: u32,
    format: Option<&'a Value>,
) -> GenerateRequest<'a> {
    GenerateRequest {
        model,
        prompt,
        raw: true,
        stream: true,
        format,
        options: DecodeOptions {
            temperature: config.temperature,
            top_p: config.top_p,
            top_k: config.top_k,
            repeat_penalty: config.repetition_penalty,
            num_predict: config.max_new_tokens,
            num_ctx,
        },
    }
}

impl InferenceBackend for OllamaBackend {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn decode(
        &self,
        prompt: &str,
        config: &GenerationConfig,
        mut constraint: Option<&mut SchemaAutomaton>,
    ) -> Result<Decoded, GenerationError> {
        let url = format!("{}/api/generate", self.base_url);
        let schema = constraint.as_ref().map(|a| Arc::clone(a.schema()));
        let body = request_body(
            &self.model,
            prompt,
            config,
            self.num_ctx,
            schema.as_ref().map(|s| s.document()),
        );

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| send_error(e, &self.base_url, self.timeout_secs))?;
        let status = response.status().as_u16();
        let response = check_status(response)?;

        let mut decoded = Decoded::default();
        let mut chunks = 0u32;
        for line in BufReader::new(response).lines() {
            let line = line.map_err(|e| GenerationError::Http(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let chunk: GenerateChunk = serde_json::from_str(&line)
                .map_err(|e| GenerationError::ResponseParsing(e.to_string()))?;
            if let Some(message) = chunk.error {
                return Err(GenerationError::Api {
                    status,
                    body: message,
                });
            }

            // Dropping the response on violation closes the stream.
            if let Some(automaton) = constraint.as_deref_mut() {
                automaton
                    .advance(&chunk.response)
                    .map_err(|e| GenerationError::ConstraintViolated(e.to_string()))?;
            }
            decoded.text.push_str(&chunk.response);
            chunks += 1;

            if chunk.done {
                decoded.output_tokens = chunk.eval_count.unwrap_or(chunks);
                decoded.input_tokens = chunk.prompt_eval_count;
                break;
            }
        }

        tracing::debug!(
            model = %self.model,
            output_tokens = decoded.output_tokens,
            constrained = schema.is_some(),
            "Decode finished"
        );
        Ok(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn constructor_trims_trailing_slash() {
        let backend = OllamaBackend::new("http://localhost:11434/", "mixtral", 60, 32_768).unwrap();
        assert_eq!(backend.base_url(), "http://localhost:11434");
        assert_eq!(backend.model_name(), "mixtral");
    }

    #[test]
    fn request_body_carries_schema_only_when_constrained() {
        let config = GenerationConfig::field_mapping();
        let schema = json!({"type": "object"});

        let unconstrained =
            serde_json::to_value(request_body("m", "p", &config, 4096, None)).unwrap();
        assert!(unconstrained.get("format").is_none());
        assert_eq!(unconstrained["raw"], json!(true));
        assert_eq!(unconstrained["options"]["num_predict"], json!(3000));
        assert_eq!(unconstrained["options"]["num_ctx"], json!(4096));

        let constrained =
            serde_json::to_value(request_body("m", "p", &config, 4096, Some(&schema))).unwrap();
        assert_eq!(constrained["format"], schema);
    }

    #[test]
    fn stream_chunks_parse() {
        let chunk: GenerateChunk =
            serde_json::from_str(r#"{"model":"m","response":"{\"a\"","done":false}"#).unwrap();
        assert_eq!(chunk.response, "{\"a\"");
        assert!(!chunk.done);

        let last: GenerateChunk = serde_json::from_str(
            r#"{"response":"","done":true,"eval_count":42,"prompt_eval_count":900}"#,
        )
        .unwrap();
        assert!(last.done);
        assert_eq!(last.eval_count, Some(42));
    }

    #[test]
    fn unreachable_server_is_a_transport_error() {
        let backend = OllamaBackend::new("http://127.0.0.1:9", "mixtral", 5, 2048).unwrap();
        let err = backend
            .decode("prompt", &GenerationConfig::action_selection(), None)
            .unwrap_err();
        assert!(err.is_transport(), "unexpected error: {err}");
    }
}
