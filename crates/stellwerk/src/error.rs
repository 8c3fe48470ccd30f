use thiserror::Error;

/// Errors that can occur in the stellwerk scheduling layer.
#[derive(Debug, Error)]
pub enum StellwerkError {
    #[error("invalid work item: {0}")]
    InvalidWorkItem(String),

    #[error("no live worker units available")]
    WorkerUnavailable,

    #[error("worker unit {unit} failed: {reason}")]
    WorkerFailure { unit: usize, reason: String },

    #[error("unknown worker unit {0}")]
    UnknownUnit(usize),

    #[error("cancelled before completion")]
    Cancelled,

    #[error("job failed: {0}")]
    JobFailed(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),
}
