pub mod types;
pub mod grammar;
pub mod schema;
pub mod repair;
pub mod ollama;
pub mod generator;

#[cfg(test)]
pub mod testing;

pub use types::*;
pub use grammar::{CompiledSchema, GrammarError, SchemaAutomaton};
pub use schema::{SchemaContract, SchemaKey, SchemaRegistry, Specificity};
pub use repair::{RepairEngine, RepairError, RepairOutcome, RepairRule};
pub use ollama::OllamaBackend;
pub use generator::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Inference server is not reachable at {0}")]
    Connection(String),

    #[error("Inference server returned an error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("HTTP client error: {0}")]
    Http(String),

    #[error("Response parsing error: {0}")]
    ResponseParsing(String),

    #[error("Decoder left the schema grammar: {0}")]
    ConstraintViolated(String),

    #[error("Generation stopped before the document was complete ({output_tokens} tokens)")]
    Incomplete { output_tokens: u32 },
}

impl GenerationError {
    /// The server could not be talked to at all. Falling back to another
    /// decoding mode cannot help with these.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Http(_))
    }
}
