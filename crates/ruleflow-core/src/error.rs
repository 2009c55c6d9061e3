use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleflowError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("invalid rule '{name}': {reason}")]
    InvalidRule { name: String, reason: String },

    #[error("expression error at offset {offset}: {message}")]
    Expression { offset: usize, message: String },

    #[error("expression evaluation failed: {0}")]
    Evaluation(String),

    #[error("script '{name}' failed: {message}")]
    Script { name: String, message: String },

    #[error("missing required parameter '{param}' for action '{action}'")]
    MissingParameter { action: String, param: String },

    #[error("action handler already registered: {0}")]
    DuplicateHandler(String),

    #[error("tracker request failed: {0}")]
    Tracker(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rule store error: {0}")]
    Store(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RuleflowError {
    pub fn evaluation(message: impl Into<String>) -> Self {
        Self::Evaluation(message.into())
    }

    pub fn tracker(message: impl Into<String>) -> Self {
        Self::Tracker(message.into())
    }
}

pub type Result<T> = std::result::Result<T, RuleflowError>;
