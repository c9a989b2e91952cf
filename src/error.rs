/// The single error currency for fallible orchestration-core APIs. Every
/// variant corresponds to one of the error kinds named for the core: each
/// carries enough context for a human-readable sentence without a raw
/// debug dump.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("cancelled")]
    Cancelled,

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("tool call invalid: {0}")]
    Validation(#[from] ValidationError),

    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("loop detected: pattern repeated {count} times ({pattern:?})")]
    LoopDetected { pattern: String, count: u32 },

    #[error("failed to parse model output: {0}")]
    Parse(String),

    #[error("iteration cap reached ({0} iterations)")]
    ResourceExhausted(u32),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// A short taxonomy tag for user-visible surfacing, per the error-handling
    /// design: a tag plus a human-readable sentence, never a stack trace.
    pub fn tag(&self) -> &'static str {
        match self {
            OrchestratorError::Cancelled => "Cancelled",
            OrchestratorError::Timeout(_) => "Timeout",
            OrchestratorError::Validation(_) => "ValidationError",
            OrchestratorError::AuthorizationDenied(_) => "AuthorizationDenied",
            OrchestratorError::Provider(_) => "ProviderError",
            OrchestratorError::RateLimited { .. } => "RateLimited",
            OrchestratorError::LoopDetected { .. } => "LoopDetected",
            OrchestratorError::Parse(_) => "ParseError",
            OrchestratorError::ResourceExhausted(_) => "ResourceExhausted",
            OrchestratorError::Internal(_) => "Internal",
        }
    }
}

/// A malformed tool call, carrying enough detail to drive the rewrite path.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("tool '{tool_name}' is not available (not in request.tools)")]
    NotWhitelisted { tool_name: String },

    #[error("unknown tool '{tool_name}'")]
    UnknownTool { tool_name: String },

    #[error("tool '{tool_name}' is missing required parameter '{missing_param}'")]
    MissingParam {
        tool_name: String,
        missing_param: String,
    },

    #[error("tool '{tool_name}' parameter '{missing_param}' has the wrong type")]
    WrongType {
        tool_name: String,
        missing_param: String,
    },
}

impl ValidationError {
    pub fn tool_name(&self) -> &str {
        match self {
            ValidationError::NotWhitelisted { tool_name }
            | ValidationError::UnknownTool { tool_name }
            | ValidationError::MissingParam { tool_name, .. }
            | ValidationError::WrongType { tool_name, .. } => tool_name,
        }
    }

    pub fn missing_param(&self) -> Option<&str> {
        match self {
            ValidationError::MissingParam { missing_param, .. }
            | ValidationError::WrongType { missing_param, .. } => Some(missing_param),
            _ => None,
        }
    }
}

/// The LLM transport boundary's own error enum — kept separate from
/// `OrchestratorError` the way the inference boundary is kept separate from
/// the orchestration boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("API returned {status}: {body}")]
    ApiError { status: u16, body: String },

    #[error("rate limited")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl ProviderError {
    /// 4xx other than 429 are fatal and never retried; everything else may be.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::ApiError { status, .. } => *status == 429 || *status >= 500,
            ProviderError::RateLimited { .. } => true,
            ProviderError::Request(_) => true,
            ProviderError::Parse(_) => false,
        }
    }
}
