use thiserror::Error;

#[derive(Debug, Error)]
pub enum SluiceError {
    // Pipeline definition errors
    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("Pipeline contains a cycle through step: {step}")]
    CycleDetected { step: String },

    #[error("Step not found: {0}")]
    StepNotFound(String),

    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    // Adapter errors
    #[error("Adapter failed: {step}: {message}")]
    AdapterFailed { step: String, message: String },

    #[error("Circuit open for {key}")]
    CircuitOpen { key: String },

    // Hook errors
    #[error("Hook failed at {stage}: {message}")]
    Hook { stage: String, message: String },

    #[error("Script error on line {line}: {message}")]
    Script { line: usize, message: String },

    // Run errors
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Gate not found: {run_id}/{step}")]
    GateNotFound { run_id: String, step: String },

    #[error("Run {run_id} is {status} and cannot be {action}")]
    InvalidRunState {
        run_id: String,
        status: String,
        action: String,
    },

    #[error("Run cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Notification errors
    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("Webhook target rejected: {0}")]
    Ssrf(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SluiceError {
    pub fn adapter(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AdapterFailed {
            step: step.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the failed operation can plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::CircuitOpen { .. }
                | Self::Cancelled
                | Self::Config(_)
                | Self::InvalidPipeline(_)
                | Self::Ssrf(_)
                | Self::Json(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SluiceError>;
