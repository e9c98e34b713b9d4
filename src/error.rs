use thiserror::Error;

/// Failure taxonomy for the pipeline. Every kind is fatal; nothing is retried
/// automatically, since each run is expensive and operator-supervised.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Non-success status or an explicit error field from an external service.
    #[error("upstream service error: {0}")]
    Upstream(String),

    /// Response body was not the JSON shape the caller asked for. Carries the
    /// raw text so the operator can see what the model actually said.
    #[error("failed to parse model output ({detail}): {raw}")]
    Parse { detail: String, raw: String },

    /// A check that runs before any network call, e.g. a missing lora file.
    #[error("precondition failed: {0}")]
    Precondition(String),
}
