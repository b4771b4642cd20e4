use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    // Planning errors
    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    /// Flow-level policy veto. Terminal for the context it was raised for.
    #[error("Flow denied: {flow}")]
    FlowDenied { flow: String },

    #[error("Unknown stage kind: {0}")]
    UnknownStageKind(String),

    #[error("Invalid config for stage {stage}: {message}")]
    InvalidStageConfig { stage: String, message: String },

    #[error("Policy evaluation failed: {0}")]
    PolicyEvaluation(String),

    #[error("Cached plan is stale: {key}")]
    PlanStale { key: String },

    // Execution errors
    #[error("Stage processing failed: {stage}: {message}")]
    StageProcessing { stage: String, message: String },

    #[error("Invalid transition: cannot {action} while {status}")]
    InvalidTransition { action: String, status: String },

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("Blueprint error: {0}")]
    Blueprint(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Whether this error must be treated as a denial by callers that
    /// fail closed.
    pub fn is_denial(&self) -> bool {
        matches!(self, Self::FlowDenied { .. } | Self::PolicyEvaluation(_))
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
