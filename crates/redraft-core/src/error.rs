use thiserror::Error;

#[derive(Debug, Error)]
pub enum RedraftError {
    // Generation service errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    #[error("LLM provider not supported: {0}")]
    UnsupportedProvider(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    #[error("Structured output did not match schema: {0}")]
    SchemaViolation(String),

    // Search service errors
    #[error("Search request failed: {0}")]
    Search(String),

    // Graph construction and dispatch errors
    #[error("Graph configuration error: {0}")]
    GraphConfig(String),

    #[error("Bound violation: {0}")]
    BoundViolation(String),

    #[error("State invariant violated by {node}: {message}")]
    InvariantViolation { node: String, message: String },

    #[error("Invalid run input: {0}")]
    InvalidInput(String),

    // Durable execution errors
    #[error("Unit {unit} timed out after {timeout_secs}s")]
    UnitTimeout { unit: String, timeout_secs: u64 },

    #[error("Unit {unit} failed on attempt {attempt}: {message}")]
    RetryableUnitFailure {
        unit: String,
        attempt: u32,
        message: String,
    },

    #[error("Run {run_id} failed at unit {unit} after {attempts} attempts: {message}")]
    TerminalRunFailure {
        run_id: String,
        unit: String,
        attempts: u32,
        message: String,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Run cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RedraftError {
    /// Errors raised by an external collaborator (generation or search).
    pub fn is_service_failure(&self) -> bool {
        matches!(
            self,
            Self::LlmRequest(_)
                | Self::LlmStream(_)
                | Self::LlmParse(_)
                | Self::SchemaViolation(_)
                | Self::Search(_)
                | Self::UnsupportedProvider(_)
        )
    }

    /// Whether a durable unit of work may be attempted again after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UnsupportedProvider(_) => false,
            Self::UnitTimeout { .. } | Self::RetryableUnitFailure { .. } => true,
            other => other.is_service_failure(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RedraftError>;
