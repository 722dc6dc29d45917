use thiserror::Error;

/// Failure of a generation or refinement call.
///
/// A model answer whose JSON says `needs_input` or `error` is not one of
/// these; see `Interpretation::semantic_issue`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GenerationError {
    /// Caller precondition violated; nothing was sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("image model call failed: {0}")]
    Upstream(String),

    #[error("the model response did not contain an image")]
    NoImageReturned,

    #[error("the model returned invalid JSON: {message}")]
    MalformedJson { raw: String, message: String },
}

impl GenerationError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Upstream(_) => "upstream_error",
            Self::NoImageReturned => "no_image_returned",
            Self::MalformedJson { .. } => "malformed_json",
        }
    }
}
