use crate::config::ConfigError;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, LookoutError>;

#[derive(Debug, thiserror::Error)]
pub enum LookoutError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("\"{name}\" is not a registered plugin; known plugins are {known}")]
    UnknownPlugin { name: String, known: String },

    #[error("unknown record class \"{0}\"")]
    UnknownRecordClass(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
