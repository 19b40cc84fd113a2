pub mod generation; // Schema registry, constrained decoding, JSON repair
pub mod session; // Model session acquisition across memory tiers
pub mod classification; // Stage types, validation, orchestration
